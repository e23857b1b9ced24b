use anyhow::{bail, Context};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::matching::SpecialFallback;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub redirect_server: ServerConfig,
    pub cache: CacheConfig,
    pub attribution: AttributionConfig,
    pub cookies: CookieConfig,
    pub visitor: VisitorConfig,
    pub events: EventsConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_secs: u64,
}

/// Knobs of the attribution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Fingerprint matches must score strictly above this
    pub min_matching_score: f64,
    pub fingerprint_expiration_minutes: i64,
    pub fingerprint_candidate_limit: usize,
    /// How often expired fingerprinted visits are deleted; 0 disables pruning
    pub visit_prune_interval_secs: u64,
    /// Used when the short url does not carry its own install TTL
    pub default_install_ttl_secs: i64,
    pub content_fetch_timeout_ms: u64,
    pub background_timeout_ms: u64,
    /// Fallback URL for unknown short codes; `{url}` is replaced with the requested URL
    pub not_found_template: Option<String>,
    pub special_fallback: SpecialFallback,
    pub interstitial_timeout_ms: u64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            min_matching_score: 0.8,
            fingerprint_expiration_minutes: 2,
            fingerprint_candidate_limit: 500,
            visit_prune_interval_secs: 300,
            default_install_ttl_secs: 30 * 86_400,
            content_fetch_timeout_ms: 3_000,
            background_timeout_ms: 5_000,
            not_found_template: None,
            special_fallback: SpecialFallback::Parent,
            interstitial_timeout_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    pub max_age_days: i64,
    pub domain: Option<String>,
    pub secure: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            max_age_days: 730,
            domain: None,
            secure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket address only
    None,
    /// Forwarded / X-Forwarded-For, validated against the trust settings
    Standard,
    /// CF-Connecting-IP
    Cloudflare,
}

/// How visitor attributes and fingerprints are derived from a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorConfig {
    pub geoip_city_db_path: Option<String>,
    pub geoip_asn_db_path: Option<String>,
    pub trusted_proxy_mode: TrustedProxyMode,
    pub trusted_proxies: Vec<IpNet>,
    pub num_trusted_proxies: Option<usize>,
}

impl Default for VisitorConfig {
    fn default() -> Self {
        Self {
            geoip_city_db_path: None,
            geoip_asn_db_path: None,
            trusted_proxy_mode: TrustedProxyMode::None,
            trusted_proxies: Vec::new(),
            num_trusted_proxies: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSinkKind {
    Log,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub sink: EventSinkKind,
    pub sink_url: Option<String>,
    pub buffer_size: usize,
    pub publish_timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sink: EventSinkKind::Log,
            sink_url: None,
            buffer_size: 10_000,
            publish_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Anything but `json` means text.
    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let backend = match lookup("DATABASE_BACKEND")
            .unwrap_or_else(|| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => DatabaseBackend::Memory,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, memory"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database = DatabaseConfig {
            backend,
            url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./tether.db?mode=rwc".to_string()),
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
        };

        let api_server = ServerConfig {
            host: lookup("API_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "API_PORT", 8080)?,
        };

        let redirect_server = ServerConfig {
            host: lookup("REDIRECT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&lookup, "REDIRECT_PORT", 3000)?,
        };

        let cache = CacheConfig {
            max_entries: parse_or(&lookup, "CACHE_MAX_ENTRIES", 10_000)?,
            ttl_secs: parse_or(&lookup, "CACHE_TTL_SECS", 300)?,
        };

        let defaults = AttributionConfig::default();
        let special_fallback = match lookup("SPECIAL_RULE_FALLBACK") {
            Some(value) => value.parse::<SpecialFallback>()?,
            None => defaults.special_fallback,
        };
        let min_matching_score =
            parse_or(&lookup, "MIN_MATCHING_SCORE", defaults.min_matching_score)?;
        if !(0.0..=1.0).contains(&min_matching_score) {
            bail!("MIN_MATCHING_SCORE must be between 0 and 1, got {min_matching_score}");
        }
        let attribution = AttributionConfig {
            min_matching_score,
            fingerprint_expiration_minutes: parse_or(
                &lookup,
                "FINGERPRINT_EXPIRATION_MINUTES",
                defaults.fingerprint_expiration_minutes,
            )?,
            fingerprint_candidate_limit: parse_or(
                &lookup,
                "FINGERPRINT_CANDIDATE_LIMIT",
                defaults.fingerprint_candidate_limit,
            )?,
            visit_prune_interval_secs: parse_or(
                &lookup,
                "VISIT_PRUNE_INTERVAL_SECS",
                defaults.visit_prune_interval_secs,
            )?,
            default_install_ttl_secs: parse_or(
                &lookup,
                "DEFAULT_INSTALL_TTL_SECS",
                defaults.default_install_ttl_secs,
            )?,
            content_fetch_timeout_ms: parse_or(
                &lookup,
                "CONTENT_FETCH_TIMEOUT_MS",
                defaults.content_fetch_timeout_ms,
            )?,
            background_timeout_ms: parse_or(
                &lookup,
                "BACKGROUND_TIMEOUT_MS",
                defaults.background_timeout_ms,
            )?,
            not_found_template: lookup("NOT_FOUND_TEMPLATE").filter(|t| !t.trim().is_empty()),
            special_fallback,
            interstitial_timeout_ms: parse_or(
                &lookup,
                "INTERSTITIAL_TIMEOUT_MS",
                defaults.interstitial_timeout_ms,
            )?,
        };

        let cookies = CookieConfig {
            max_age_days: parse_or(&lookup, "COOKIE_MAX_AGE_DAYS", 730)?,
            domain: lookup("COOKIE_DOMAIN").filter(|d| !d.trim().is_empty()),
            secure: lookup("COOKIE_SECURE")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        };

        let trusted_proxy_mode = match lookup("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "none" => TrustedProxyMode::None,
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies = lookup("TRUSTED_PROXIES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpNet>()
                    .with_context(|| format!("invalid CIDR in TRUSTED_PROXIES: '{s}'"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let num_trusted_proxies = match lookup("NUM_TRUSTED_PROXIES") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid value for NUM_TRUSTED_PROXIES: '{raw}'"))?,
            ),
            None => None,
        };

        let visitor = VisitorConfig {
            geoip_city_db_path: lookup("GEOIP_CITY_DB_PATH"),
            geoip_asn_db_path: lookup("GEOIP_ASN_DB_PATH"),
            trusted_proxy_mode,
            trusted_proxies,
            num_trusted_proxies,
        };

        let sink = match lookup("EVENT_SINK")
            .unwrap_or_else(|| "log".to_string())
            .to_lowercase()
            .as_str()
        {
            "http" => EventSinkKind::Http,
            "log" => EventSinkKind::Log,
            other => {
                tracing::warn!(
                    "Unknown EVENT_SINK '{other}', falling back to 'log'. Supported values: log, http"
                );
                EventSinkKind::Log
            }
        };
        let sink_url = lookup("EVENT_SINK_URL");
        if sink == EventSinkKind::Http && sink_url.is_none() {
            bail!("EVENT_SINK_URL must be set when EVENT_SINK=http");
        }
        let event_defaults = EventsConfig::default();
        let events = EventsConfig {
            sink,
            sink_url,
            buffer_size: parse_or(&lookup, "EVENT_BUFFER_SIZE", event_defaults.buffer_size)?,
            publish_timeout_ms: parse_or(
                &lookup,
                "EVENT_PUBLISH_TIMEOUT_MS",
                event_defaults.publish_timeout_ms,
            )?,
        };

        let log_format = LogFormat::from_value(lookup("LOG_FORMAT").as_deref());

        Ok(Config {
            database,
            api_server,
            redirect_server,
            cache,
            attribution,
            cookies,
            visitor,
            events,
            log_format,
        })
    }
}
