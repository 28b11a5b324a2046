//! GeoIP lookup module using MaxMind GeoLite2 database

use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

use crate::directory::{Region, RegionResolver};

/// Preferred language for region names.
const NAME_LOCALE: &str = "en";

/// GeoIP reader wrapper
pub struct GeoIp {
    reader: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading the database if available
    pub fn new(database_path: &str) -> Self {
        let path = Path::new(database_path);

        if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            return Self { reader: None };
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded: {}", database_path);
                Self { reader: Some(reader) }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database: {}", e);
                Self { reader: None }
            }
        }
    }

    /// Resolver that knows no addresses.
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    /// Look up an IP address and return its region
    pub fn lookup(&self, ip: &str) -> Option<Region> {
        let reader = self.reader.as_ref()?;

        let ip_addr: IpAddr = ip.parse().ok()?;

        if is_private_ip(&ip_addr) {
            return None;
        }

        let city: geoip2::City = reader.lookup(ip_addr).ok()?;

        let country = city
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get(NAME_LOCALE).copied())
            .unwrap_or_default();
        let province = city
            .subdivisions
            .as_ref()
            .and_then(|subdivisions| subdivisions.first())
            .and_then(|s| s.names.as_ref())
            .and_then(|names| names.get(NAME_LOCALE).copied())
            .unwrap_or_default();
        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get(NAME_LOCALE).copied())
            .unwrap_or_default();

        Some(Region::new(country, province, city_name))
    }

    /// Check if the GeoIP database is loaded
    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }
}

impl RegionResolver for GeoIp {
    fn resolve(&self, ip: &str) -> Region {
        self.lookup(ip).unwrap_or_default()
    }
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_resolves_to_empty_region() {
        let geoip = GeoIp::new("/nonexistent/GeoLite2-City.mmdb");
        assert!(!geoip.is_available());
        assert_eq!(geoip.resolve("8.8.8.8"), Region::default());
    }

    #[test]
    fn disabled_resolver_knows_no_addresses() {
        let geoip = GeoIp::disabled();
        assert!(!geoip.is_available());
        assert!(geoip.lookup("8.8.8.8").is_none());
    }

    #[test]
    fn private_ranges_are_detected() {
        assert!(is_private_ip(&"10.1.2.3".parse().unwrap()));
        assert!(is_private_ip(&"127.0.0.1".parse().unwrap()));
        assert!(!is_private_ip(&"8.8.8.8".parse().unwrap()));
    }
}
