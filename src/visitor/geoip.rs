//! Coarse IP geolocation using MaxMind GeoLite2/GeoIP2 MMDB files.

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// The parts of a location that are stable enough to fingerprint on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
}

/// GeoIP lookups against optional City and ASN databases.
///
/// Both databases are optional; a service with neither returns empty locations, and
/// fingerprints then fall back to network and user-agent components.
#[derive(Clone, Default)]
pub struct GeoIpService {
    city_reader: Option<Arc<Reader<Mmap>>>,
    asn_reader: Option<Arc<Reader<Mmap>>>,
}

impl GeoIpService {
    pub fn new(city_path: Option<&str>, asn_path: Option<&str>) -> Result<Self> {
        let city_reader = match city_path {
            Some(path) => Some(Arc::new(
                unsafe { Reader::open_mmap(path) }
                    .with_context(|| format!("Failed to open GeoIP City database at {}", path))?,
            )),
            None => None,
        };

        let asn_reader = match asn_path {
            Some(path) => Some(Arc::new(
                unsafe { Reader::open_mmap(path) }
                    .with_context(|| format!("Failed to open GeoIP ASN database at {}", path))?,
            )),
            None => None,
        };

        Ok(Self {
            city_reader,
            asn_reader,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.city_reader.is_some() || self.asn_reader.is_some()
    }

    pub fn lookup(&self, ip: IpAddr) -> GeoLocation {
        let mut location = GeoLocation::default();

        if let Some(ref reader) = self.city_reader {
            if let Ok(result) = reader.lookup(ip) {
                if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                    location.country_code = city.country.iso_code.map(|s| s.to_string());
                    location.region = city
                        .subdivisions
                        .first()
                        .and_then(|subdivision| subdivision.names.english)
                        .map(|s| s.to_string());
                    location.city = city.city.names.english.map(|s| s.to_string());
                } else if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
                    location.country_code = country.country.iso_code.map(|s| s.to_string());
                }
            }
        }

        if let Some(ref reader) = self.asn_reader {
            if let Ok(result) = reader.lookup(ip) {
                if let Ok(Some(asn)) = result.decode::<geoip2::Asn>() {
                    location.asn = asn.autonomous_system_number;
                }
            }
        }

        location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_path_is_an_error() {
        assert!(GeoIpService::new(Some("/nonexistent/path.mmdb"), None).is_err());
    }

    #[test]
    fn test_no_databases_yields_empty_locations() {
        let service = GeoIpService::new(None, None).unwrap();
        assert!(!service.is_enabled());
        assert_eq!(
            service.lookup("8.8.8.8".parse().unwrap()),
            GeoLocation::default()
        );
    }
}
