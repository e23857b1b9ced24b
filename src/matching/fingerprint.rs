//! Probabilistic identity recovery from fingerprinted visits.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::models::{Fingerprint, FingerprintedVisit};
use crate::storage::{AttributionStore, StorageResult};

const NETWORK_WEIGHT: f64 = 0.40;

/// Weights of the optional components; only components known on both sides count.
const COMPONENT_WEIGHTS: [(Component, f64); 7] = [
    (Component::Os, 0.15),
    (Component::OsVersion, 0.15),
    (Component::Asn, 0.10),
    (Component::City, 0.08),
    (Component::Make, 0.05),
    (Component::Region, 0.04),
    (Component::Country, 0.03),
];

#[derive(Debug, Clone, Copy)]
enum Component {
    Os,
    OsVersion,
    Asn,
    City,
    Make,
    Region,
    Country,
}

impl Component {
    /// `None` when either side lacks the component
    fn agrees(&self, a: &Fingerprint, b: &Fingerprint) -> Option<bool> {
        fn same_text(a: &Option<String>, b: &Option<String>) -> Option<bool> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.eq_ignore_ascii_case(b)),
                _ => None,
            }
        }

        match self {
            Component::Os => same_text(&a.os, &b.os),
            Component::OsVersion => same_text(&a.os_version, &b.os_version),
            Component::Asn => match (a.asn, b.asn) {
                (Some(x), Some(y)) => Some(x == y),
                _ => None,
            },
            Component::City => same_text(&a.city, &b.city),
            Component::Make => same_text(&a.make, &b.make),
            Component::Region => same_text(&a.region, &b.region),
            Component::Country => same_text(&a.country_code, &b.country_code),
        }
    }
}

/// Similarity in `[0, 1]`: matched weight over the weight of comparable components.
///
/// The network component is always comparable, so two fingerprints from different
/// networks can never reach a typical acceptance threshold.
pub fn score(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let same_network = a.ip_version == b.ip_version && !a.network.is_empty() && a.network == b.network;
    let mut matched = if same_network { NETWORK_WEIGHT } else { 0.0 };
    let mut comparable = NETWORK_WEIGHT;

    for (component, weight) in COMPONENT_WEIGHTS {
        if let Some(agrees) = component.agrees(a, b) {
            comparable += weight;
            if agrees {
                matched += weight;
            }
        }
    }

    matched / comparable
}

#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintMatch {
    /// Best score among the candidates, 0 when there were none
    pub score: f64,
    /// The accepted visit, if the best candidate passed both thresholds
    pub visit: Option<FingerprintedVisit>,
}

pub struct FingerprintMatcher {
    store: Arc<dyn AttributionStore>,
    min_matching_score: f64,
    window_secs: i64,
    candidate_limit: usize,
}

impl FingerprintMatcher {
    pub fn new(
        store: Arc<dyn AttributionStore>,
        min_matching_score: f64,
        expiration_minutes: i64,
        candidate_limit: usize,
    ) -> Self {
        Self {
            store,
            min_matching_score,
            window_secs: expiration_minutes * 60,
            candidate_limit,
        }
    }

    pub fn accepts(&self, score: f64, visit_timestamp: i64, now: i64) -> bool {
        score > self.min_matching_score && now - visit_timestamp < self.window_secs
    }

    /// Score `fingerprint` against recent visits that could have led to `scheme`.
    pub async fn match_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        scheme: &str,
        now: i64,
    ) -> StorageResult<FingerprintMatch> {
        let candidates = self
            .store
            .recent_fingerprinted_visits(now - self.window_secs, self.candidate_limit)
            .await?;

        // Newest first, so a strict comparison leaves ties with the most recent visit
        let mut best: Option<(f64, FingerprintedVisit)> = None;
        for visit in candidates {
            if visit
                .app_url_scheme
                .as_deref()
                .is_some_and(|visit_scheme| visit_scheme != scheme)
            {
                continue;
            }
            let candidate_score = score(fingerprint, &visit.fingerprint);
            if best
                .as_ref()
                .is_none_or(|(best_score, _)| candidate_score > *best_score)
            {
                best = Some((candidate_score, visit));
            }
        }

        Ok(match best {
            Some((best_score, visit)) if self.accepts(best_score, visit.timestamp, now) => {
                FingerprintMatch {
                    score: best_score,
                    visit: Some(visit),
                }
            }
            Some((best_score, _)) => FingerprintMatch {
                score: best_score,
                visit: None,
            },
            None => FingerprintMatch {
                score: 0.0,
                visit: None,
            },
        })
    }

    /// Delete visits that have left the matching window and can never be accepted.
    pub async fn prune_expired(&self, now: i64) -> StorageResult<u64> {
        self.store
            .prune_fingerprinted_visits(now - self.window_secs)
            .await
    }
}

/// Prune expired visits every `every` until the runtime shuts down.
pub fn spawn_visit_pruning(
    matcher: Arc<FingerprintMatcher>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match matcher.prune_expired(chrono::Utc::now().timestamp()).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "pruned expired fingerprinted visits"),
                Err(err) => error!(error = %err, "failed to prune fingerprinted visits"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn fingerprint(network: &str) -> Fingerprint {
        Fingerprint {
            network: network.to_string(),
            ip_version: 4,
            country_code: Some("US".into()),
            region: Some("California".into()),
            city: Some("San Jose".into()),
            asn: Some(7922),
            platform: Some("iPhone".into()),
            os: Some("iOS".into()),
            os_version: Some("17.1".into()),
            make: Some("Apple".into()),
        }
    }

    fn visit(context: &str, fp: Fingerprint, scheme: Option<&str>, timestamp: i64) -> FingerprintedVisit {
        FingerprintedVisit {
            fingerprint: fp,
            context: context.to_string(),
            short_code: "abc".into(),
            deeplink: Some("myapp://promo".into()),
            referrer: None,
            app_url_scheme: scheme.map(str::to_string),
            timestamp,
        }
    }

    fn matcher(store: Arc<dyn AttributionStore>) -> FingerprintMatcher {
        FingerprintMatcher::new(store, 0.8, 2, 500)
    }

    #[test]
    fn test_identical_fingerprints_score_one() {
        let fp = fingerprint("net");
        assert!((score(&fp, &fp) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_different_network_caps_score() {
        assert!(score(&fingerprint("a"), &fingerprint("b")) <= 0.6 + 1e-9);
    }

    #[test]
    fn test_unknown_components_are_ignored() {
        let full = fingerprint("net");
        let sparse = Fingerprint {
            network: "net".into(),
            ip_version: 4,
            os: Some("iOS".into()),
            ..Default::default()
        };
        assert!((score(&full, &sparse) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_boundary() {
        let m = matcher(Arc::new(MemoryStore::new()));
        assert!(!m.accepts(0.79, 1_000, 1_030));
        assert!(m.accepts(0.81, 1_000, 1_030));
        // Outside the window even a perfect score is rejected
        assert!(!m.accepts(1.0, 1_000, 1_000 + 121));
        assert!(!m.accepts(1.0, 1_000, 1_000 + 120));
    }

    #[tokio::test]
    async fn test_best_recent_match_wins() {
        let store = Arc::new(MemoryStore::new());
        let now = 10_000;
        store
            .save_fingerprinted_visit(&visit("older", fingerprint("net"), Some("myapp"), now - 60))
            .await
            .unwrap();
        store
            .save_fingerprinted_visit(&visit("newer", fingerprint("net"), None, now - 30))
            .await
            .unwrap();
        store
            .save_fingerprinted_visit(&visit("other-net", fingerprint("x"), Some("myapp"), now - 10))
            .await
            .unwrap();

        let result = matcher(store)
            .match_fingerprint(&fingerprint("net"), "myapp", now)
            .await
            .unwrap();
        assert_eq!(result.visit.unwrap().context, "newer");
        assert!((result.score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_other_scheme_and_stale_visits_ignored() {
        let store = Arc::new(MemoryStore::new());
        let now = 10_000;
        store
            .save_fingerprinted_visit(&visit("stale", fingerprint("net"), Some("myapp"), now - 600))
            .await
            .unwrap();
        store
            .save_fingerprinted_visit(&visit("other", fingerprint("net"), Some("otherapp"), now - 5))
            .await
            .unwrap();

        let result = matcher(store)
            .match_fingerprint(&fingerprint("net"), "myapp", now)
            .await
            .unwrap();
        assert!(result.visit.is_none());
        assert_eq!(result.score, 0.0);
    }

    #[tokio::test]
    async fn test_prune_drops_only_expired_visits() {
        let store = Arc::new(MemoryStore::new());
        let now = 10_000;
        for (context, timestamp) in [("stale", now - 600), ("edge", now - 120), ("live", now - 5)] {
            store
                .save_fingerprinted_visit(&visit(context, fingerprint("net"), None, timestamp))
                .await
                .unwrap();
        }

        let removed = matcher(store.clone()).prune_expired(now).await.unwrap();
        assert_eq!(removed, 1);
        let left = store.recent_fingerprinted_visits(0, 10).await.unwrap();
        let contexts: Vec<_> = left.iter().map(|v| v.context.as_str()).collect();
        assert_eq!(contexts, vec!["live", "edge"]);
    }

    #[tokio::test]
    async fn test_background_pruning() {
        let store = Arc::new(MemoryStore::new());
        let now = chrono::Utc::now().timestamp();
        for (context, timestamp) in [("stale", now - 3_600), ("live", now)] {
            store
                .save_fingerprinted_visit(&visit(context, fingerprint("net"), None, timestamp))
                .await
                .unwrap();
        }

        let task = spawn_visit_pruning(
            Arc::new(matcher(store.clone())),
            Duration::from_millis(10),
        );
        let mut left = Vec::new();
        for _ in 0..100 {
            left = store.recent_fingerprinted_visits(0, 10).await.unwrap();
            if left.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].context, "live");
    }
}
