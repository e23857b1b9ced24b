use serde::{Deserialize, Serialize};

/// A short code together with the routing rules that decide where each visitor lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortUrl {
    pub id: String,
    /// Fallback URL used when no rule matches
    pub destination: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub app_key: Option<String>,
    #[serde(default)]
    pub campaign_key: Option<String>,
    #[serde(default)]
    pub install_ttl_seconds: i64,
    #[serde(default)]
    pub created: i64,
}

impl ShortUrl {
    pub fn new(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            rules: Vec::new(),
            origin: None,
            app_key: None,
            campaign_key: None,
            install_ttl_seconds: 0,
            created: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// App schemes whose install state is needed to evaluate `match_installed` criteria,
    /// including those declared on nested special rules.
    pub fn installed_schemes(&self) -> Vec<String> {
        let mut schemes = Vec::new();
        collect_installed_schemes(&self.rules, None, &mut schemes);
        schemes
    }
}

fn collect_installed_schemes(
    rules: &[RoutingRule],
    parent_scheme: Option<&str>,
    out: &mut Vec<String>,
) {
    for rule in rules {
        let scheme = rule.app_scheme().or(parent_scheme);
        if rule.match_installed.is_some() {
            if let Some(scheme) = scheme {
                if !out.iter().any(|s| s == scheme) {
                    out.push(scheme.to_string());
                }
            }
        }
        collect_installed_schemes(&rule.special, scheme, out);
    }
}

/// One routing rule: optional match criteria plus the action taken for matching visitors.
///
/// Every criterion is optional; `special` holds more specific sub-rules whose action
/// fields override this rule's when they match the same visitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRule {
    pub id: Option<String>,

    pub match_platform: Option<String>,
    pub match_os: Option<String>,
    pub match_make: Option<String>,
    pub match_browser: Option<String>,
    pub match_mobile: Option<String>,
    pub match_referrer: Option<String>,
    pub match_installed: Option<String>,

    pub app_url_scheme: Option<String>,
    pub app_store_url: Option<String>,
    /// Deep link into the app
    pub destination: Option<String>,
    pub content_source_url: Option<String>,
    pub send_to_interstitial: Option<bool>,
    pub no_app_store_redirect: Option<bool>,
    pub is_android_intent_filter: Option<bool>,
    pub app_open_ttl_days: Option<u32>,

    pub special: Vec<RoutingRule>,
}

fn specified(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl RoutingRule {
    pub fn app_scheme(&self) -> Option<&str> {
        specified(&self.app_url_scheme)
    }

    pub fn app_store(&self) -> Option<&str> {
        specified(&self.app_store_url)
    }

    pub fn content_source(&self) -> Option<&str> {
        specified(&self.content_source_url)
    }

    pub fn sends_to_interstitial(&self) -> bool {
        self.send_to_interstitial.unwrap_or(false)
    }

    pub fn skips_app_store(&self) -> bool {
        self.no_app_store_redirect.unwrap_or(false)
    }

    pub fn is_intent_filter(&self) -> bool {
        self.is_android_intent_filter.unwrap_or(false)
    }

    /// Freshness window for app opens, in seconds. An unset TTL is never fresh.
    pub fn app_open_ttl_secs(&self) -> i64 {
        i64::from(self.app_open_ttl_days.unwrap_or(0)) * 86_400
    }

    /// The configured deep link, or the bare `scheme://` when only a scheme is known.
    pub fn deep_link(&self) -> Option<String> {
        if let Some(destination) = specified(&self.destination) {
            return Some(destination.to_string());
        }
        self.app_scheme().map(|scheme| format!("{scheme}://"))
    }

    /// Apply a matched special rule on top of this one, field by field.
    ///
    /// Action fields set on `special` win; unset ones fall back to `self`. Match criteria
    /// and the special list itself are not carried into the result.
    pub fn overlay(&self, special: &RoutingRule) -> RoutingRule {
        fn pick<T: Clone>(over: &Option<T>, base: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }

        RoutingRule {
            id: pick(&special.id, &self.id),
            app_url_scheme: pick(&special.app_url_scheme, &self.app_url_scheme),
            app_store_url: pick(&special.app_store_url, &self.app_store_url),
            destination: pick(&special.destination, &self.destination),
            content_source_url: pick(&special.content_source_url, &self.content_source_url),
            send_to_interstitial: pick(&special.send_to_interstitial, &self.send_to_interstitial),
            no_app_store_redirect: pick(
                &special.no_app_store_redirect,
                &self.no_app_store_redirect,
            ),
            is_android_intent_filter: pick(
                &special.is_android_intent_filter,
                &self.is_android_intent_filter,
            ),
            app_open_ttl_days: pick(&special.app_open_ttl_days, &self.app_open_ttl_days),
            special: Vec::new(),
            ..self.without_special()
        }
    }

    pub(crate) fn without_special(&self) -> RoutingRule {
        RoutingRule {
            special: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_special_fields() {
        let parent = RoutingRule {
            match_os: Some("iOS".into()),
            app_url_scheme: Some("myapp".into()),
            app_store_url: Some("https://apps.apple.com/x".into()),
            destination: Some("myapp://home".into()),
            app_open_ttl_days: Some(7),
            ..Default::default()
        };
        let special = RoutingRule {
            match_browser: Some("Facebook".into()),
            send_to_interstitial: Some(true),
            destination: Some("myapp://fb".into()),
            ..Default::default()
        };

        let merged = parent.overlay(&special);
        assert_eq!(merged.destination.as_deref(), Some("myapp://fb"));
        assert_eq!(merged.send_to_interstitial, Some(true));
        assert_eq!(merged.app_store_url.as_deref(), Some("https://apps.apple.com/x"));
        assert_eq!(merged.app_open_ttl_days, Some(7));
        assert_eq!(merged.match_os.as_deref(), Some("iOS"));
        assert!(merged.match_browser.is_none());
    }

    #[test]
    fn test_deep_link_falls_back_to_scheme() {
        let rule = RoutingRule {
            app_url_scheme: Some("myapp".into()),
            destination: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(rule.deep_link().as_deref(), Some("myapp://"));
        assert_eq!(RoutingRule::default().deep_link(), None);
    }

    #[test]
    fn test_installed_schemes_walks_specials() {
        let url = ShortUrl::new("abc", "https://example.com").with_rule(RoutingRule {
            app_url_scheme: Some("one".into()),
            match_installed: Some("true".into()),
            special: vec![RoutingRule {
                app_url_scheme: Some("two".into()),
                match_installed: Some("false".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(url.installed_schemes(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_installed_schemes_inherit_parent_scheme() {
        let url = ShortUrl::new("abc", "https://example.com").with_rule(RoutingRule {
            match_os: Some("iOS".into()),
            app_url_scheme: Some("myapp".into()),
            special: vec![RoutingRule {
                match_installed: Some("true".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(url.installed_schemes(), vec!["myapp".to_string()]);
    }

    #[test]
    fn test_rule_deserializes_with_missing_fields() {
        let rule: RoutingRule =
            serde_json::from_str(r#"{"match_os":"iOS","app_open_ttl_days":3}"#).unwrap();
        assert_eq!(rule.match_os.as_deref(), Some("iOS"));
        assert_eq!(rule.app_open_ttl_secs(), 3 * 86_400);
        assert!(rule.special.is_empty());
    }
}
