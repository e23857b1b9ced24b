pub mod linking;
pub mod resolver;

pub use linking::{is_fresh, LinkingEngine};
pub use resolver::{
    inject_context_params, interstitial_path, mint_context, Action, CookieState, Harvest,
    RedirectKind, RedirectResolver, Resolution, ResolveError,
};

use serde::{Deserialize, Serialize};

use crate::models::{AppOpen, FingerprintedVisit};

/// What an app reports about a launch. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchReport {
    pub source_context: Option<String>,
    pub source_application: Option<String>,
    pub short_code: Option<String>,
    pub deeplink: Option<String>,
}

impl LaunchReport {
    /// Launch report reconstructed from an accepted fingerprint match.
    pub fn from_visit(visit: &FingerprintedVisit) -> Self {
        Self {
            source_context: Some(visit.context.clone()),
            source_application: None,
            short_code: Some(visit.short_code.clone()),
            deeplink: visit.deeplink.clone(),
        }
    }

    pub fn into_app_open(self, scheme: &str, app_context: &str, now: i64) -> AppOpen {
        let blank_to_none = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        AppOpen {
            app_url_scheme: scheme.to_string(),
            context: app_context.to_string(),
            app_context: app_context.to_string(),
            source_context: blank_to_none(self.source_context),
            source_application: blank_to_none(self.source_application),
            short_code: blank_to_none(self.short_code),
            deeplink: blank_to_none(self.deeplink),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_accepts_partial_body() {
        let report: LaunchReport = serde_json::from_str(r#"{"short_code":"abc"}"#).unwrap();
        let open = report.into_app_open("myapp", "app-1", 5);
        assert_eq!(open.short_code.as_deref(), Some("abc"));
        assert_eq!(open.context, "app-1");
        assert!(open.source_context.is_none());
    }

    #[test]
    fn test_blank_fields_are_dropped() {
        let report = LaunchReport {
            source_context: Some("  ".into()),
            ..Default::default()
        };
        assert!(report.into_app_open("myapp", "a", 1).source_context.is_none());
    }
}
