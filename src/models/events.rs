//! Telemetry events handed to the event sink.

use serde::{Deserialize, Serialize};

use super::ShortUrl;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributionEvent {
    Decode(DecodeEvent),
    Install(LaunchEvent),
    AppOpen(LaunchEvent),
    Link(LinkEvent),
}

impl AttributionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AttributionEvent::Decode(_) => "decode",
            AttributionEvent::Install(_) => "install",
            AttributionEvent::AppOpen(_) => "app_open",
            AttributionEvent::Link(_) => "link",
        }
    }
}

/// Campaign fields copied from the short url for event enrichment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub origin: Option<String>,
    pub app_key: Option<String>,
    pub campaign_key: Option<String>,
}

impl From<&ShortUrl> for Campaign {
    fn from(url: &ShortUrl) -> Self {
        Self {
            origin: url.origin.clone(),
            app_key: url.app_key.clone(),
            campaign_key: url.campaign_key.clone(),
        }
    }
}

/// How an install or app open was tied back to a click.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionPath {
    Fingerprint,
    BrowserSwitch,
    Referred,
    Deeplink,
}

/// One short-link visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeEvent {
    pub short_code: String,
    pub context: String,
    /// True when the context was minted on this visit
    pub cookied: bool,
    pub visit_count: u64,
    pub destination: String,
    pub render_inline: bool,
    pub matched_rule: Option<String>,
    pub deeplink: Option<String>,
    #[serde(flatten)]
    pub campaign: Campaign,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub country_code: Option<String>,
    pub timestamp: i64,
}

/// An install or an app open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchEvent {
    pub app_url_scheme: String,
    pub app_context: String,
    pub source_context: Option<String>,
    pub source_application: Option<String>,
    pub short_code: Option<String>,
    pub deeplink: Option<String>,
    pub path: AttributionPath,
    #[serde(flatten)]
    pub campaign: Campaign,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEvent {
    pub context1: String,
    pub context2: String,
    pub app_url_scheme: String,
    pub short_code: Option<String>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = AttributionEvent::Link(LinkEvent {
            context1: "a".into(),
            context2: "b".into(),
            app_url_scheme: "myapp".into(),
            short_code: Some("abc123".into()),
            timestamp: 1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "link");
        assert_eq!(json["context2"], "b");
        assert_eq!(event.kind(), "link");
    }

    #[test]
    fn test_campaign_flattened_into_launch_event() {
        let mut url = ShortUrl::new("abc", "https://example.com");
        url.campaign_key = Some("spring".into());
        let event = LaunchEvent {
            app_url_scheme: "myapp".into(),
            app_context: "app".into(),
            source_context: None,
            source_application: None,
            short_code: Some("abc".into()),
            deeplink: None,
            path: AttributionPath::BrowserSwitch,
            campaign: Campaign::from(&url),
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["campaign_key"], "spring");
        assert_eq!(json["path"], "browser_switch");
    }
}
