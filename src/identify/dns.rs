//! DNS message parsing.
//!
//! Enough of RFC 1035 to track answers: question name and type, response
//! code, and A/AAAA answer addresses. Compression pointers are followed
//! with a jump budget so a hostile packet cannot loop the parser.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const MAX_NAME_JUMPS: usize = 16;
const MAX_NAME_LEN: usize = 255;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;

/// A parsed DNS message, reduced to what flow enrichment needs.
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub is_response: bool,
    pub query_name: Option<String>,
    pub query_type: Option<u16>,
    pub response_code: u8,
    /// Addresses from A/AAAA answer records.
    pub addresses: Vec<IpAddr>,
}

/// Human name for a query type.
pub fn qtype_str(qtype: u16) -> &'static str {
    match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        65 => "HTTPS",
        255 => "ANY",
        _ => "OTHER",
    }
}

/// Human name for a response code.
pub fn rcode_str(rcode: u8) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "OTHER",
    }
}

/// Parse a DNS message (UDP payload). Returns `None` on malformed input.
pub fn parse(buf: &[u8]) -> Option<DnsMessage> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let is_response = flags & 0x8000 != 0;
    let response_code = (flags & 0x000F) as u8;
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;

    let mut pos = HEADER_LEN;
    let mut query_name = None;
    let mut query_type = None;

    for i in 0..qdcount {
        let (name, next) = read_name(buf, pos)?;
        if buf.len() < next + 4 {
            return None;
        }
        let qtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
        if i == 0 {
            query_name = Some(name);
            query_type = Some(qtype);
        }
        pos = next + 4;
    }

    let mut addresses = Vec::new();
    for _ in 0..ancount {
        let (_owner, next) = read_name(buf, pos)?;
        if buf.len() < next + 10 {
            return None;
        }
        let rtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
        let rdlength = u16::from_be_bytes([buf[next + 8], buf[next + 9]]) as usize;
        let rdata_start = next + 10;
        if buf.len() < rdata_start + rdlength {
            return None;
        }
        let rdata = &buf[rdata_start..rdata_start + rdlength];
        match rtype {
            TYPE_A if rdlength == 4 => {
                addresses.push(IpAddr::V4(Ipv4Addr::new(
                    rdata[0], rdata[1], rdata[2], rdata[3],
                )));
            }
            TYPE_AAAA if rdlength == 16 => {
                let bytes: [u8; 16] = rdata.try_into().ok()?;
                addresses.push(IpAddr::V6(Ipv6Addr::from(bytes)));
            }
            _ => {}
        }
        pos = rdata_start + rdlength;
    }

    Some(DnsMessage {
        is_response,
        query_name,
        query_type,
        response_code,
        addresses,
    })
}

/// Read a (possibly compressed) domain name starting at `pos`.
/// Returns the dotted name and the offset just past it in the original
/// (unjumped) stream.
fn read_name(buf: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut jumps = 0;
    let mut end_after_jump = None;

    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer: two bytes, jump to the target offset.
            let low = *buf.get(pos + 1)? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if end_after_jump.is_none() {
                end_after_jump = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_NAME_JUMPS || target >= buf.len() {
                return None;
            }
            pos = target;
            continue;
        }
        if len > 63 {
            return None;
        }
        let label = buf.get(pos + 1..pos + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        pos += 1 + len;
    }

    Some((name, end_after_jump.unwrap_or(pos)))
}

#[cfg(test)]
pub mod testutil {
    //! Hand-built DNS wire messages for tests.

    use super::*;

    fn push_name(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    /// Build an A-record response: `name` resolves to `addrs`.
    pub fn build_a_response(name: &str, addrs: &[Ipv4Addr], rcode: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1234u16.to_be_bytes()); // id
        buf.extend_from_slice(&(0x8180u16 | rcode as u16).to_be_bytes()); // QR + RD + RA
        buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        buf.extend_from_slice(&(addrs.len() as u16).to_be_bytes()); // ancount
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());

        push_name(&mut buf, name);
        buf.extend_from_slice(&TYPE_A.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // class IN

        for addr in addrs {
            // Compression pointer back to the question name at offset 12.
            buf.extend_from_slice(&[0xC0, 0x0C]);
            buf.extend_from_slice(&TYPE_A.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&300u32.to_be_bytes()); // ttl
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&addr.octets());
        }
        buf
    }

    /// Build a plain query (no answers).
    pub fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x4321u16.to_be_bytes());
        buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        push_name(&mut buf, name);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn parses_a_response_with_compression() {
        let msg = build_a_response(
            "cdn.example.net",
            &[Ipv4Addr::new(203, 0, 113, 7), Ipv4Addr::new(203, 0, 113, 8)],
            0,
        );
        let parsed = parse(&msg).expect("should parse");
        assert!(parsed.is_response);
        assert_eq!(parsed.query_name.as_deref(), Some("cdn.example.net"));
        assert_eq!(parsed.query_type, Some(TYPE_A));
        assert_eq!(parsed.response_code, 0);
        assert_eq!(
            parsed.addresses,
            vec![
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8)),
            ]
        );
    }

    #[test]
    fn parses_query() {
        let msg = build_query("example.com", TYPE_AAAA);
        let parsed = parse(&msg).expect("should parse");
        assert!(!parsed.is_response);
        assert_eq!(parsed.query_name.as_deref(), Some("example.com"));
        assert_eq!(parsed.query_type, Some(TYPE_AAAA));
        assert!(parsed.addresses.is_empty());
    }

    #[test]
    fn nxdomain_rcode_survives() {
        let msg = build_a_response("no.such.host", &[], 3);
        let parsed = parse(&msg).expect("should parse");
        assert_eq!(parsed.response_code, 3);
        assert_eq!(rcode_str(parsed.response_code), "NXDOMAIN");
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(parse(&[0u8; 5]).is_none());
    }

    #[test]
    fn pointer_loop_is_bounded() {
        // Header + a name that is a pointer to itself.
        let mut buf = vec![0u8; HEADER_LEN];
        buf[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount = 1
        buf.push(0xC0);
        buf.push(HEADER_LEN as u8); // points at itself
        buf.extend_from_slice(&[0, 1, 0, 1]);
        assert!(parse(&buf).is_none());
    }

    #[test]
    fn qtype_names() {
        assert_eq!(qtype_str(1), "A");
        assert_eq!(qtype_str(28), "AAAA");
        assert_eq!(qtype_str(12), "PTR");
        assert_eq!(qtype_str(999), "OTHER");
    }
}
