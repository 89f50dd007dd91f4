//! MAC address vendor lookup (OUI — Organizationally Unique Identifier).
//!
//! Embeds a trimmed vendor prefix table at compile time: one line per entry,
//! `HEXPREFIX\tVendorName`. Covers the vendors that matter for device
//! classification on a typical monitored segment; unknown prefixes simply
//! return `None`.

use std::collections::HashMap;
use std::sync::OnceLock;

static OUI_RAW: &str = include_str!("oui_db.tsv");

static OUI_DB: OnceLock<HashMap<[u8; 3], &'static str>> = OnceLock::new();

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Collect the first six hex digits of a MAC string, tolerating `:`/`-`/`.`
/// separators or none at all.
fn oui_prefix(mac: &str) -> Option<[u8; 3]> {
    let mut digits = [0u8; 6];
    let mut n = 0;
    for b in mac.bytes() {
        if b.is_ascii_hexdigit() {
            if n == 6 {
                break;
            }
            digits[n] = b;
            n += 1;
        }
    }
    if n < 6 {
        return None;
    }
    Some([
        (hex_nibble(digits[0])? << 4) | hex_nibble(digits[1])?,
        (hex_nibble(digits[2])? << 4) | hex_nibble(digits[3])?,
        (hex_nibble(digits[4])? << 4) | hex_nibble(digits[5])?,
    ])
}

fn parse_db() -> HashMap<[u8; 3], &'static str> {
    let mut map = HashMap::new();
    for line in OUI_RAW.lines() {
        let Some((hex, vendor)) = line.split_once('\t') else {
            continue;
        };
        let vendor = vendor.trim();
        if vendor.is_empty() {
            continue;
        }
        if let Some(prefix) = oui_prefix(hex.trim()) {
            map.insert(prefix, vendor);
        }
    }
    map
}

/// Look up the vendor for a MAC address string.
pub fn lookup(mac: &str) -> Option<&'static str> {
    let prefix = oui_prefix(mac)?;
    OUI_DB.get_or_init(parse_db).get(&prefix).copied()
}

/// Look up the vendor for raw MAC bytes.
pub fn lookup_bytes(mac: &[u8; 6]) -> Option<&'static str> {
    let prefix = [mac[0], mac[1], mac[2]];
    OUI_DB.get_or_init(parse_db).get(&prefix).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_accepts_common_formats() {
        assert_eq!(oui_prefix("b8:27:eb:12:34:56"), Some([0xB8, 0x27, 0xEB]));
        assert_eq!(oui_prefix("B8-27-EB-12-34-56"), Some([0xB8, 0x27, 0xEB]));
        assert_eq!(oui_prefix("b827.eb12.3456"), Some([0xB8, 0x27, 0xEB]));
        assert_eq!(oui_prefix("b827eb123456"), Some([0xB8, 0x27, 0xEB]));
        assert_eq!(oui_prefix("b8:27"), None);
    }

    #[test]
    fn raspberry_pi_resolves() {
        let vendor = lookup("b8:27:eb:aa:bb:cc").expect("known prefix");
        assert!(vendor.contains("Raspberry"), "got {vendor}");
        assert_eq!(lookup("B8:27:EB:AA:BB:CC"), Some(vendor));
    }

    #[test]
    fn bytes_and_string_agree() {
        assert_eq!(
            lookup_bytes(&[0xB8, 0x27, 0xEB, 0x00, 0x00, 0x01]),
            lookup("b8:27:eb:00:00:01")
        );
    }

    #[test]
    fn unknown_prefix_is_none() {
        assert_eq!(lookup("ff:ff:ff:ff:ff:ff"), None);
    }

    #[test]
    fn db_parses_every_line() {
        let db = OUI_DB.get_or_init(parse_db);
        assert_eq!(db.len(), OUI_RAW.lines().filter(|l| !l.is_empty()).count());
    }
}
