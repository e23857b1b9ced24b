//! Attribution state: installs, app opens, cross-context links and fingerprinted visits.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Most recent app open observed for `(app_url_scheme, context)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AppOpen {
    pub app_url_scheme: String,
    /// Context this record is stored under
    pub context: String,
    /// Context the app reported for itself
    pub app_context: String,
    pub source_context: Option<String>,
    pub source_application: Option<String>,
    pub short_code: Option<String>,
    pub deeplink: Option<String>,
    pub timestamp: i64,
}

impl AppOpen {
    /// Copy of this record stored under a different context.
    pub fn keyed_to(&self, context: &str) -> AppOpen {
        AppOpen {
            context: context.to_string(),
            ..self.clone()
        }
    }
}

/// Expiring marker that the app identified by `app_url_scheme` was installed under `context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Install {
    pub app_url_scheme: String,
    pub context: String,
    pub installed_at: i64,
    pub expires_at: i64,
}

impl Install {
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Undirected association between two contexts held by the same physical user.
///
/// Contexts are stored in sorted order so `(a, b)` and `(b, a)` address the same link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Link {
    pub context1: String,
    pub context2: String,
    pub app_url_scheme: String,
    pub short_code: Option<String>,
    pub created: i64,
}

impl Link {
    pub fn new(
        a: &str,
        b: &str,
        app_url_scheme: &str,
        short_code: Option<&str>,
        created: i64,
    ) -> Self {
        let (context1, context2) = Self::key(a, b);
        Self {
            context1,
            context2,
            app_url_scheme: app_url_scheme.to_string(),
            short_code: short_code.map(str::to_string),
            created,
        }
    }

    pub fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }
}

/// Coarse, cookie-free signature of a request's origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 hex digest of the anonymized client network prefix
    pub network: String,
    pub ip_version: u8,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub platform: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub make: Option<String>,
}

/// A click recorded with its fingerprint, used for deferred attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintedVisit {
    pub fingerprint: Fingerprint,
    pub context: String,
    pub short_code: String,
    pub deeplink: Option<String>,
    pub referrer: Option<String>,
    /// Scheme of the rule that matched the click, if any
    pub app_url_scheme: Option<String>,
    pub timestamp: i64,
}
