//! Routing rule evaluation.
//!
//! Every criterion a rule carries is recorded as an explicit `{criterion, expected, actual}`
//! check. A rule matches when at least one criterion is expected and every check agrees.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::RoutingRule;
use crate::visitor::VisitorAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    Platform,
    Os,
    Make,
    Browser,
    Mobile,
    Referrer,
    Installed,
}

impl Criterion {
    pub const ALL: [Criterion; 7] = [
        Criterion::Platform,
        Criterion::Os,
        Criterion::Make,
        Criterion::Browser,
        Criterion::Mobile,
        Criterion::Referrer,
        Criterion::Installed,
    ];

    fn pattern<'r>(&self, rule: &'r RoutingRule) -> Option<&'r str> {
        let raw = match self {
            Criterion::Platform => &rule.match_platform,
            Criterion::Os => &rule.match_os,
            Criterion::Make => &rule.match_make,
            Criterion::Browser => &rule.match_browser,
            Criterion::Mobile => &rule.match_mobile,
            Criterion::Referrer => &rule.match_referrer,
            Criterion::Installed => &rule.match_installed,
        };
        raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriterionCheck {
    pub criterion: Criterion,
    pub expected: bool,
    pub actual: bool,
}

/// Evaluate every criterion of `rule` against the visitor.
pub fn evaluate(rule: &RoutingRule, visitor: &VisitorAttributes) -> Vec<CriterionCheck> {
    evaluate_with_scheme(rule, visitor, rule.app_scheme())
}

pub fn rule_matches(rule: &RoutingRule, visitor: &VisitorAttributes) -> bool {
    all_agree(&evaluate(rule, visitor))
}

/// `scheme` is the app scheme `match_installed` is checked against. Specials without
/// one of their own use their parent's.
fn evaluate_with_scheme(
    rule: &RoutingRule,
    visitor: &VisitorAttributes,
    scheme: Option<&str>,
) -> Vec<CriterionCheck> {
    Criterion::ALL
        .iter()
        .map(|&criterion| match criterion.pattern(rule) {
            None => CriterionCheck {
                criterion,
                expected: false,
                actual: false,
            },
            Some(pattern) => CriterionCheck {
                criterion,
                expected: true,
                actual: criterion_holds(criterion, pattern, scheme, visitor),
            },
        })
        .collect()
}

fn all_agree(checks: &[CriterionCheck]) -> bool {
    checks.iter().any(|check| check.expected)
        && checks.iter().all(|check| check.expected == check.actual)
}

fn criterion_holds(
    criterion: Criterion,
    pattern: &str,
    scheme: Option<&str>,
    visitor: &VisitorAttributes,
) -> bool {
    match criterion {
        Criterion::Platform => pattern_matches(pattern, visitor.platform.as_deref()),
        Criterion::Os => pattern_matches(pattern, visitor.os.as_deref()),
        Criterion::Make => pattern_matches(pattern, visitor.make.as_deref()),
        Criterion::Browser => pattern_matches(pattern, visitor.browser.as_deref()),
        Criterion::Referrer => pattern_matches(pattern, visitor.referrer.as_deref()),
        Criterion::Mobile => parse_bool(pattern).is_some_and(|want| visitor.mobile == want),
        Criterion::Installed => {
            let Some(scheme) = scheme else {
                return false;
            };
            match (parse_bool(pattern), visitor.installed.get(scheme)) {
                (Some(want), Some(installed)) => want == installed,
                _ => false,
            }
        }
    }
}

/// Case-insensitive unanchored regex search; an invalid pattern falls back to equality.
fn pattern_matches(pattern: &str, value: Option<&str>) -> bool {
    let Some(value) = value else {
        return false;
    };
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(value),
        Err(_) => pattern.eq_ignore_ascii_case(value),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// What happens when a rule matches but none of its specials do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialFallback {
    /// Keep the parent rule
    #[default]
    Parent,
    /// Reject the parent and keep scanning its siblings
    NextRule,
}

impl FromStr for SpecialFallback {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parent" => Ok(SpecialFallback::Parent),
            "next_rule" | "next-rule" => Ok(SpecialFallback::NextRule),
            other => anyhow::bail!(
                "invalid special rule fallback '{other}', expected 'parent' or 'next_rule'"
            ),
        }
    }
}

impl fmt::Display for SpecialFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialFallback::Parent => write!(f, "parent"),
            SpecialFallback::NextRule => write!(f, "next_rule"),
        }
    }
}

/// The rule that won selection, with any matching special already merged in.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRule {
    /// Explicit rule id, or the position path (`"1"`, `"1.0"`) of the deciding rule
    pub id: String,
    pub rule: RoutingRule,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMatcher {
    fallback: SpecialFallback,
}

impl RuleMatcher {
    pub fn new(fallback: SpecialFallback) -> Self {
        Self { fallback }
    }

    /// First matching rule in list order, or `None` when the short url's own
    /// destination applies.
    pub fn select_rule(
        &self,
        rules: &[RoutingRule],
        visitor: &VisitorAttributes,
    ) -> Option<MatchedRule> {
        self.select_in(rules, visitor, None, None)
    }

    fn select_in(
        &self,
        rules: &[RoutingRule],
        visitor: &VisitorAttributes,
        parent_path: Option<&str>,
        parent_scheme: Option<&str>,
    ) -> Option<MatchedRule> {
        for (index, rule) in rules.iter().enumerate() {
            let scheme = rule.app_scheme().or(parent_scheme);
            if !all_agree(&evaluate_with_scheme(rule, visitor, scheme)) {
                continue;
            }

            let path = match parent_path {
                Some(parent) => format!("{parent}.{index}"),
                None => index.to_string(),
            };
            let plain = || MatchedRule {
                id: rule.id.clone().unwrap_or_else(|| path.clone()),
                rule: rule.without_special(),
            };

            if rule.special.is_empty() {
                return Some(plain());
            }

            match self.select_in(&rule.special, visitor, Some(&path), scheme) {
                Some(special) => {
                    return Some(MatchedRule {
                        id: special.id,
                        rule: rule.overlay(&special.rule),
                    })
                }
                None => match self.fallback {
                    SpecialFallback::Parent => return Some(plain()),
                    SpecialFallback::NextRule => continue,
                },
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iphone() -> VisitorAttributes {
        VisitorAttributes {
            platform: Some("iPhone".into()),
            os: Some("iOS".into()),
            os_version: Some("17.1".into()),
            make: Some("Apple".into()),
            browser: Some("Safari".into()),
            mobile: true,
            ..Default::default()
        }
    }

    fn ios_rule() -> RoutingRule {
        RoutingRule {
            match_os: Some("ios".into()),
            app_url_scheme: Some("myapp".into()),
            app_store_url: Some("https://apps.apple.com/app/id1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_rule_without_criteria_never_matches() {
        let rule = RoutingRule {
            app_store_url: Some("https://apps.apple.com/app/id1".into()),
            ..Default::default()
        };
        assert!(!rule_matches(&rule, &iphone()));
        assert!(evaluate(&rule, &iphone()).iter().all(|c| !c.expected));
    }

    #[test]
    fn test_flipping_one_attribute_flips_result() {
        let rule = RoutingRule {
            match_mobile: Some("true".into()),
            ..ios_rule()
        };
        let visitor = iphone();
        assert!(rule_matches(&rule, &visitor));

        let desktop = VisitorAttributes {
            mobile: false,
            ..visitor.clone()
        };
        assert!(!rule_matches(&rule, &desktop));

        let android = VisitorAttributes {
            os: Some("Android".into()),
            ..visitor
        };
        assert!(!rule_matches(&rule, &android));
    }

    #[test]
    fn test_pattern_is_case_insensitive_regex() {
        let rule = RoutingRule {
            match_browser: Some("^(facebook|instagram)$".into()),
            ..Default::default()
        };
        let visitor = VisitorAttributes {
            browser: Some("Instagram".into()),
            ..Default::default()
        };
        assert!(rule_matches(&rule, &visitor));

        let broken = RoutingRule {
            match_make: Some("Apple(".into()),
            ..Default::default()
        };
        let apple = VisitorAttributes {
            make: Some("apple(".into()),
            ..Default::default()
        };
        assert!(rule_matches(&broken, &apple));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let rule = RoutingRule {
            match_referrer: Some("twitter".into()),
            ..Default::default()
        };
        assert!(!rule_matches(&rule, &iphone()));
    }

    #[test]
    fn test_installed_requires_scheme_and_known_state() {
        let mut visitor = iphone();
        let rule = RoutingRule {
            match_installed: Some("yes".into()),
            ..ios_rule()
        };
        // Unknown install state
        assert!(!rule_matches(&rule, &visitor));

        visitor.installed.set("myapp", true);
        assert!(rule_matches(&rule, &visitor));

        let no_scheme = RoutingRule {
            app_url_scheme: None,
            ..rule.clone()
        };
        assert!(!rule_matches(&no_scheme, &visitor));

        let not_installed = RoutingRule {
            match_installed: Some("0".into()),
            ..rule
        };
        assert!(!rule_matches(&not_installed, &visitor));
    }

    #[test]
    fn test_selection_is_first_match_in_order() {
        let rules = vec![
            RoutingRule {
                match_os: Some("Android".into()),
                ..Default::default()
            },
            RoutingRule {
                id: Some("ios-main".into()),
                ..ios_rule()
            },
            RoutingRule {
                match_mobile: Some("true".into()),
                ..Default::default()
            },
        ];
        let matcher = RuleMatcher::default();
        for _ in 0..3 {
            let matched = matcher.select_rule(&rules, &iphone()).unwrap();
            assert_eq!(matched.id, "ios-main");
        }

        let windows = VisitorAttributes {
            os: Some("Windows".into()),
            ..Default::default()
        };
        assert!(matcher.select_rule(&rules, &windows).is_none());
    }

    fn rule_with_special() -> Vec<RoutingRule> {
        vec![
            RoutingRule {
                destination: Some("myapp://home".into()),
                special: vec![RoutingRule {
                    match_browser: Some("Facebook".into()),
                    send_to_interstitial: Some(true),
                    ..Default::default()
                }],
                ..ios_rule()
            },
            RoutingRule {
                match_mobile: Some("true".into()),
                destination: Some("https://m.example.com".into()),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_special_overrides_parent_fields() {
        let visitor = VisitorAttributes {
            browser: Some("Facebook".into()),
            ..iphone()
        };
        let matched = RuleMatcher::default()
            .select_rule(&rule_with_special(), &visitor)
            .unwrap();
        assert_eq!(matched.id, "0.0");
        assert!(matched.rule.sends_to_interstitial());
        assert_eq!(matched.rule.destination.as_deref(), Some("myapp://home"));
        assert!(matched.rule.special.is_empty());
    }

    #[test]
    fn test_unmatched_special_parent_strategy() {
        let matched = RuleMatcher::new(SpecialFallback::Parent)
            .select_rule(&rule_with_special(), &iphone())
            .unwrap();
        assert_eq!(matched.id, "0");
        assert!(!matched.rule.sends_to_interstitial());
    }

    #[test]
    fn test_unmatched_special_next_rule_strategy() {
        let matched = RuleMatcher::new(SpecialFallback::NextRule)
            .select_rule(&rule_with_special(), &iphone())
            .unwrap();
        assert_eq!(matched.id, "1");
        assert_eq!(
            matched.rule.destination.as_deref(),
            Some("https://m.example.com")
        );
    }

    #[test]
    fn test_nested_specials_resolve_recursively() {
        let rules = vec![RoutingRule {
            special: vec![RoutingRule {
                match_mobile: Some("true".into()),
                app_open_ttl_days: Some(3),
                special: vec![RoutingRule {
                    id: Some("fb-in-app".into()),
                    match_browser: Some("facebook".into()),
                    no_app_store_redirect: Some(true),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..ios_rule()
        }];
        let visitor = VisitorAttributes {
            browser: Some("Facebook".into()),
            ..iphone()
        };
        let matched = RuleMatcher::default().select_rule(&rules, &visitor).unwrap();
        assert_eq!(matched.id, "fb-in-app");
        assert_eq!(matched.rule.app_open_ttl_days, Some(3));
        assert!(matched.rule.skips_app_store());
        assert_eq!(matched.rule.app_scheme(), Some("myapp"));
    }

    #[test]
    fn test_special_checks_install_against_parent_scheme() {
        let rules = vec![RoutingRule {
            destination: Some("myapp://promo".into()),
            special: vec![RoutingRule {
                id: Some("installed".into()),
                match_installed: Some("true".into()),
                no_app_store_redirect: Some(true),
                ..Default::default()
            }],
            ..ios_rule()
        }];
        let matcher = RuleMatcher::new(SpecialFallback::Parent);

        let mut visitor = iphone();
        assert_eq!(matcher.select_rule(&rules, &visitor).unwrap().id, "0");

        visitor.installed.set("myapp", true);
        let matched = matcher.select_rule(&rules, &visitor).unwrap();
        assert_eq!(matched.id, "installed");
        assert!(matched.rule.skips_app_store());
        assert_eq!(matched.rule.deep_link().as_deref(), Some("myapp://promo"));

        // Evaluated on its own the special has no scheme to check
        assert!(!rule_matches(&rules[0].special[0], &visitor));
    }

    #[test]
    fn test_special_fallback_parsing() {
        assert_eq!(
            "next_rule".parse::<SpecialFallback>().unwrap(),
            SpecialFallback::NextRule
        );
        assert_eq!(
            "Parent".parse::<SpecialFallback>().unwrap(),
            SpecialFallback::Parent
        );
        assert!("sibling".parse::<SpecialFallback>().is_err());
    }
}
