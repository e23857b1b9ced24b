//! Per-request visitor inspection: attributes for rule matching and fingerprints for
//! cookie-free attribution.

pub mod geoip;
pub mod ip_extractor;
pub mod user_agent;

pub use geoip::{GeoIpService, GeoLocation};
pub use ip_extractor::{anonymize_ip, extract_client_ip};
pub use user_agent::UserAgentInfo;

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::VisitorConfig;
use crate::models::Fingerprint;

/// Known install state per app url scheme. A scheme that is absent is unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallState(HashMap<String, bool>);

impl InstallState {
    pub fn set(&mut self, scheme: &str, installed: bool) {
        self.0.insert(scheme.to_string(), installed);
    }

    pub fn get(&self, scheme: &str) -> Option<bool> {
        self.0.get(scheme).copied()
    }
}

/// Everything a routing rule can match on.
#[derive(Debug, Clone, Default)]
pub struct VisitorAttributes {
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub make: Option<String>,
    pub browser: Option<String>,
    pub mobile: bool,
    /// Crawler user agent; its clicks are never kept for fingerprint matching
    pub is_bot: bool,
    pub referrer: Option<String>,
    pub installed: InstallState,
}

impl VisitorAttributes {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let info = UserAgentInfo::parse(user_agent);
        Self {
            user_agent: Some(user_agent.to_string()).filter(|ua| !ua.is_empty()),
            platform: info.platform,
            os: info.os,
            os_version: info.os_version,
            make: info.make,
            browser: info.browser,
            mobile: info.mobile,
            is_bot: info.is_bot,
            referrer: None,
            installed: InstallState::default(),
        }
    }

    pub fn with_referrer(mut self, referrer: Option<String>) -> Self {
        self.referrer = referrer.filter(|r| !r.is_empty());
        self
    }
}

/// Derives visitor attributes and fingerprints from request headers.
#[derive(Clone)]
pub struct VisitorInspector {
    geoip: GeoIpService,
    config: VisitorConfig,
}

impl VisitorInspector {
    pub fn new(geoip: GeoIpService, config: VisitorConfig) -> Self {
        Self { geoip, config }
    }

    pub fn attributes(&self, headers: &HeaderMap) -> VisitorAttributes {
        VisitorAttributes::from_user_agent(header_str(headers, header::USER_AGENT).unwrap_or(""))
            .with_referrer(header_str(headers, header::REFERER).map(str::to_string))
    }

    pub fn client_ip(&self, headers: &HeaderMap, socket_ip: IpAddr) -> IpAddr {
        extract_client_ip(headers, socket_ip, &self.config)
    }

    pub fn fingerprint(&self, headers: &HeaderMap, socket_ip: IpAddr) -> Fingerprint {
        let ip = self.client_ip(headers, socket_ip);
        let info = UserAgentInfo::parse(header_str(headers, header::USER_AGENT).unwrap_or(""));
        fingerprint_of(ip, &info, self.geoip.lookup(ip))
    }
}

/// Build a fingerprint from an address and parsed user agent. The raw address is hashed.
pub fn fingerprint_of(ip: IpAddr, info: &UserAgentInfo, location: GeoLocation) -> Fingerprint {
    let prefix = anonymize_ip(ip);
    Fingerprint {
        network: format!("{:x}", Sha256::digest(prefix.to_string().as_bytes())),
        ip_version: if ip.is_ipv4() { 4 } else { 6 },
        country_code: location.country_code,
        region: location.region,
        city: location.city,
        asn: location.asn,
        platform: info.platform.clone(),
        os: info.os.clone(),
        os_version: info.os_version_prefix(),
        make: info.make.clone(),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_same_prefix_same_network() {
        let info = UserAgentInfo::default();
        let a = fingerprint_of("203.0.113.7".parse().unwrap(), &info, GeoLocation::default());
        let b = fingerprint_of("203.0.113.200".parse().unwrap(), &info, GeoLocation::default());
        let c = fingerprint_of("203.0.114.7".parse().unwrap(), &info, GeoLocation::default());
        assert_eq!(a.network, b.network);
        assert_ne!(a.network, c.network);
        assert_eq!(a.network.len(), 64);
        assert!(!a.network.contains("203"));
    }

    #[test]
    fn test_attributes_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
            ),
        );
        headers.insert(header::REFERER, HeaderValue::from_static("https://news.example/"));

        let inspector = VisitorInspector::new(GeoIpService::default(), VisitorConfig::default());
        let attrs = inspector.attributes(&headers);
        assert_eq!(attrs.os.as_deref(), Some("iOS"));
        assert_eq!(attrs.referrer.as_deref(), Some("https://news.example/"));
        assert!(attrs.mobile);
        assert_eq!(attrs.installed.get("myapp"), None);
        assert!(!attrs.is_bot);
    }

    #[test]
    fn test_crawler_is_flagged() {
        let attrs = VisitorAttributes::from_user_agent(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        );
        assert!(attrs.is_bot);
    }
}
