//! IP geolocation via a memory-mapped MaxMind-format database.
//!
//! The database path is configured; an absent or unreadable file is
//! non-fatal and every lookup then resolves to empty fields. Results are
//! cached per address for the process lifetime. Private, link-local and
//! loopback addresses short-circuit to empty without touching the reader.

use std::net::IpAddr;
use std::path::Path;

use dashmap::DashMap;
use maxminddb::Mmap;
use serde::Deserialize;
use tracing::{info, warn};

/// Resolved location fields. All empty for non-public addresses or when no
/// database is loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub asn_org: Option<String>,
}

// Lenient record shape: works against City, Country and ASN databases,
// whichever the operator dropped at the configured path.
#[derive(Deserialize)]
struct GeoRecord<'a> {
    #[serde(borrow)]
    country: Option<CountryRecord<'a>>,
    #[serde(borrow)]
    city: Option<NamesRecord<'a>>,
    autonomous_system_number: Option<u32>,
    #[serde(borrow)]
    autonomous_system_organization: Option<&'a str>,
}

#[derive(Deserialize)]
struct CountryRecord<'a> {
    #[serde(borrow)]
    iso_code: Option<&'a str>,
}

#[derive(Deserialize)]
struct NamesRecord<'a> {
    #[serde(borrow)]
    names: Option<std::collections::BTreeMap<&'a str, &'a str>>,
}

pub struct GeoLookup {
    reader: Option<maxminddb::Reader<Mmap>>,
    cache: DashMap<IpAddr, GeoInfo>,
}

impl GeoLookup {
    /// Open the database at `path`. `None` or a missing file produces a
    /// lookup that always returns empty fields.
    pub fn open(path: Option<&str>) -> Self {
        let reader = match path {
            Some(p) if Path::new(p).exists() => match maxminddb::Reader::open_mmap(p) {
                Ok(r) => {
                    info!(path = %p, "Geo database loaded");
                    Some(r)
                }
                Err(e) => {
                    warn!(path = %p, error = %e, "Failed to open geo database; lookups disabled");
                    None
                }
            },
            Some(p) => {
                warn!(path = %p, "Geo database not found; lookups disabled");
                None
            }
            None => None,
        };
        Self {
            reader,
            cache: DashMap::new(),
        }
    }

    /// A lookup that never resolves anything (tests, geo disabled).
    pub fn disabled() -> Self {
        Self {
            reader: None,
            cache: DashMap::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.reader.is_some()
    }

    /// Resolve an address to {country, city, asn}. Cached for the process
    /// lifetime; non-public addresses always resolve empty.
    pub fn lookup(&self, addr: IpAddr) -> GeoInfo {
        if !is_public(addr) {
            return GeoInfo::default();
        }
        if let Some(hit) = self.cache.get(&addr) {
            return hit.clone();
        }

        let info = match &self.reader {
            Some(reader) => match reader.lookup::<GeoRecord>(addr) {
                Ok(rec) => GeoInfo {
                    country: rec.country.and_then(|c| c.iso_code).map(str::to_string),
                    city: rec
                        .city
                        .and_then(|c| c.names)
                        .and_then(|n| n.get("en").copied())
                        .map(str::to_string),
                    asn: rec.autonomous_system_number,
                    asn_org: rec.autonomous_system_organization.map(str::to_string),
                },
                Err(_) => GeoInfo::default(),
            },
            None => GeoInfo::default(),
        };

        self.cache.insert(addr, info.clone());
        info
    }
}

/// True when the address can plausibly appear in a public geo database.
pub fn is_public(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                // CGNAT range 100.64.0.0/10.
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64))
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (seg0 & 0xFE00) == 0xFC00
                || (seg0 & 0xFFC0) == 0xFE80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_not_public() {
        for addr in [
            "10.0.0.5",
            "192.168.1.1",
            "172.16.0.9",
            "127.0.0.1",
            "169.254.1.1",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fd00::1",
        ] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(!is_public(ip), "{addr} should not be public");
        }
    }

    #[test]
    fn public_ranges_are_public() {
        for addr in ["8.8.8.8", "93.184.216.34", "2001:4860:4860::8888"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(is_public(ip), "{addr} should be public");
        }
    }

    #[test]
    fn missing_database_resolves_empty() {
        let geo = GeoLookup::open(Some("/nonexistent/GeoLite2-City.mmdb"));
        assert!(!geo.is_loaded());
        let info = geo.lookup("8.8.8.8".parse().unwrap());
        assert_eq!(info, GeoInfo::default());
    }

    #[test]
    fn private_address_short_circuits() {
        let geo = GeoLookup::disabled();
        let info = geo.lookup("192.168.1.50".parse().unwrap());
        assert!(info.country.is_none());
        assert!(info.asn.is_none());
    }
}
