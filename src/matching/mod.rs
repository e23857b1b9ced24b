pub mod fingerprint;
pub mod rules;

pub use fingerprint::{spawn_visit_pruning, FingerprintMatch, FingerprintMatcher};
pub use rules::{
    evaluate, rule_matches, Criterion, CriterionCheck, MatchedRule, RuleMatcher, SpecialFallback,
};
