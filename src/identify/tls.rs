//! TLS ClientHello extraction: SNI (server_name) and ALPN.
//!
//! Walks exactly as much of the record as needed and bails with `None` on
//! anything that does not look like a ClientHello.

const RECORD_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXT_SERVER_NAME: u16 = 0;
const EXT_ALPN: u16 = 16;

/// True when the payload starts like a TLS handshake record.
pub fn looks_like_tls(payload: &[u8]) -> bool {
    payload.len() >= 3 && payload[0] == RECORD_TYPE_HANDSHAKE && payload[1] == 0x03
}

/// Extract the SNI hostname from a ClientHello, if present.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    find_extension(payload, EXT_SERVER_NAME).and_then(|ext| {
        // server_name_list: len(2), entry: type(1)=host_name, len(2), bytes.
        if ext.len() < 5 || ext[2] != 0 {
            return None;
        }
        let name_len = u16::from_be_bytes([ext[3], ext[4]]) as usize;
        let name = ext.get(5..5 + name_len)?;
        let name = std::str::from_utf8(name).ok()?;
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    })
}

/// Extract the first ALPN protocol from a ClientHello, if present.
pub fn extract_alpn(payload: &[u8]) -> Option<String> {
    find_extension(payload, EXT_ALPN).and_then(|ext| {
        // protocol_name_list: len(2), entry: len(1), bytes.
        if ext.len() < 3 {
            return None;
        }
        let first_len = ext[2] as usize;
        let proto = ext.get(3..3 + first_len)?;
        let proto = std::str::from_utf8(proto).ok()?;
        if proto.is_empty() {
            None
        } else {
            Some(proto.to_string())
        }
    })
}

/// Locate an extension body inside a ClientHello.
fn find_extension(payload: &[u8], wanted: u16) -> Option<&[u8]> {
    // TLS record header: type(1), version(2), length(2).
    if payload.len() < 5 || payload[0] != RECORD_TYPE_HANDSHAKE {
        return None;
    }
    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    let record = payload.get(5..5 + record_len.min(payload.len() - 5))?;

    // Handshake header: type(1), length(3).
    if record.len() < 4 || record[0] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let mut pos = 4;

    // client_version(2) + random(32).
    pos += 34;
    // session_id.
    let sid_len = *record.get(pos)? as usize;
    pos += 1 + sid_len;
    // cipher_suites.
    let cs_len = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2 + cs_len;
    // compression_methods.
    let comp_len = *record.get(pos)? as usize;
    pos += 1 + comp_len;

    // extensions block.
    let ext_total = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2;
    let ext_end = (pos + ext_total).min(record.len());

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([record[pos], record[pos + 1]]);
        let ext_len = u16::from_be_bytes([record[pos + 2], record[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > ext_end {
            return None;
        }
        if ext_type == wanted {
            return Some(&record[pos..pos + ext_len]);
        }
        pos += ext_len;
    }
    None
}


#[cfg(test)]
mod tests {
    use super::testutil::build_client_hello;
    use super::*;

    #[test]
    fn extracts_sni() {
        let hello = build_client_hello(Some("example.com"), &[]);
        assert!(looks_like_tls(&hello));
        assert_eq!(extract_sni(&hello).as_deref(), Some("example.com"));
        assert_eq!(extract_alpn(&hello), None);
    }

    #[test]
    fn extracts_first_alpn() {
        let hello = build_client_hello(Some("example.com"), &["h2", "http/1.1"]);
        assert_eq!(extract_alpn(&hello).as_deref(), Some("h2"));
    }

    #[test]
    fn no_extensions_yields_none() {
        let hello = build_client_hello(None, &[]);
        assert_eq!(extract_sni(&hello), None);
        assert_eq!(extract_alpn(&hello), None);
    }

    #[test]
    fn rejects_non_handshake_records() {
        let mut hello = build_client_hello(Some("example.com"), &[]);
        hello[0] = 23; // application data
        assert_eq!(extract_sni(&hello), None);
    }

    #[test]
    fn rejects_truncated_hello() {
        let hello = build_client_hello(Some("example.com"), &[]);
        for cut in [3, 10, 40] {
            assert_eq!(extract_sni(&hello[..cut]), None);
        }
    }
}
