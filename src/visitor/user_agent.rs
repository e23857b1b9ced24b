//! User-agent decomposition into the attributes routing rules match on.

use regex::Regex;
use std::sync::LazyLock;
use woothee::parser::Parser;

/// In-app browsers woothee reports as plain Safari/Chrome webviews.
const IN_APP_BROWSERS: &[(&str, &str)] = &[
    ("FBAN/", "Facebook"),
    ("FBAV/", "Facebook"),
    ("FB_IAB", "Facebook"),
    ("Instagram", "Instagram"),
    ("Twitter", "Twitter"),
    ("LinkedInApp", "LinkedIn"),
    ("MicroMessenger", "WeChat"),
    ("Line/", "Line"),
    ("Snapchat", "Snapchat"),
    ("Pinterest", "Pinterest"),
];

const DEVICE_MAKES: &[(&str, &str)] = &[
    ("iPhone", "Apple"),
    ("iPad", "Apple"),
    ("iPod", "Apple"),
    ("Macintosh", "Apple"),
    ("SM-", "Samsung"),
    ("Samsung", "Samsung"),
    ("Pixel", "Google"),
    ("Nexus", "Google"),
    ("HUAWEI", "Huawei"),
    ("Redmi", "Xiaomi"),
    ("Xiaomi", "Xiaomi"),
    ("ONEPLUS", "OnePlus"),
    ("OnePlus", "OnePlus"),
    ("moto", "Motorola"),
];

static IOS_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:iPhone OS|CPU OS|iOS)[ /](\d+(?:[._]\d+)*)").expect("valid regex")
});

static ANDROID_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Android[ /](\d+(?:\.\d+)*)").expect("valid regex"));

/// Attributes derived from a `User-Agent` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAgentInfo {
    /// Device family: iPhone, iPad, iPod, Android, Macintosh, Windows, Linux, ...
    pub platform: Option<String>,
    /// Normalized OS name: iOS, Android, macOS, Windows, ...
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub make: Option<String>,
    pub browser: Option<String>,
    pub mobile: bool,
    pub is_bot: bool,
}

impl UserAgentInfo {
    pub fn parse(user_agent: &str) -> Self {
        let parser = Parser::new();
        let result = parser.parse(user_agent).unwrap_or_default();

        let known = |value: &str| -> Option<String> {
            (!value.is_empty() && value != "UNKNOWN").then(|| value.to_string())
        };

        let raw_os = known(result.os).or_else(|| sniff_platform(user_agent).map(str::to_string));
        let platform = raw_os.as_deref().map(platform_for);
        let os = raw_os.as_deref().map(normalize_os);

        let os_version = known(&*result.os_version)
            .or_else(|| sniff_os_version(user_agent, os.as_deref()))
            .map(|v| v.replace('_', "."));

        let browser = IN_APP_BROWSERS
            .iter()
            .find(|(needle, _)| user_agent.contains(needle))
            .map(|(_, name)| name.to_string())
            .or_else(|| known(result.name));

        let make = DEVICE_MAKES
            .iter()
            .find(|(needle, _)| user_agent.contains(needle))
            .map(|(_, make)| make.to_string());

        let mobile = matches!(result.category, "smartphone" | "mobilephone")
            || user_agent.contains("Mobile")
            || matches!(platform.as_deref(), Some("iPhone" | "iPod" | "Android"));

        Self {
            platform,
            os,
            os_version,
            make,
            browser,
            mobile,
            is_bot: result.category == "crawler",
        }
    }

    /// `major.minor` of the OS version, which survives minor app/browser UA differences.
    pub fn os_version_prefix(&self) -> Option<String> {
        self.os_version.as_deref().map(|version| {
            version
                .split('.')
                .take(2)
                .collect::<Vec<_>>()
                .join(".")
        })
    }
}

/// Native app HTTP stacks (CFNetwork, okhttp) often escape woothee
fn sniff_platform(user_agent: &str) -> Option<&'static str> {
    ["iPhone", "iPad", "iPod", "Android"]
        .into_iter()
        .find(|needle| user_agent.contains(needle))
}

fn sniff_os_version(user_agent: &str, os: Option<&str>) -> Option<String> {
    let pattern = match os {
        Some("iOS") => &*IOS_VERSION,
        Some("Android") => &*ANDROID_VERSION,
        _ => return None,
    };
    pattern
        .captures(user_agent)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

fn platform_for(raw_os: &str) -> String {
    match raw_os {
        "Mac OSX" | "Mac OS Classic" => "Macintosh".to_string(),
        os if os.starts_with("Windows") => "Windows".to_string(),
        os => os.to_string(),
    }
}

fn normalize_os(raw_os: &str) -> String {
    match raw_os {
        "iPhone" | "iPad" | "iPod" | "iOS" => "iOS".to_string(),
        "Mac OSX" | "Mac OS Classic" => "macOS".to_string(),
        os if os.starts_with("Windows") => "Windows".to_string(),
        os => os.to_string(),
    }
}
