//! Application classification from payload bytes and port numbers.
//!
//! Three layers, cheapest first: banner fingerprints (server greeting
//! prefixes), protocol signatures for non-TLS traffic, and a well-known
//! port table as the fallback.

/// Server banner prefixes, matched against the first payload bytes of
/// either direction. Port-qualified entries only match on that port.
pub fn fingerprint_banner(payload: &[u8], port: u16) -> Option<&'static str> {
    if payload.is_empty() {
        return None;
    }
    if payload.starts_with(b"SSH-") {
        return Some("SSH");
    }
    if payload.starts_with(b"PRI * HTTP/2.0\r\n") {
        return Some("HTTP/2");
    }
    if payload.starts_with(b"RTSP/1.0") || payload.starts_with(b"DESCRIBE ") {
        return Some("RTSP");
    }
    if payload.starts_with(b"220 ") || payload.starts_with(b"220-") {
        return match port {
            21 => Some("FTP"),
            25 | 587 | 465 => Some("SMTP"),
            _ => None,
        };
    }
    if payload.starts_with(b"+OK") && port == 110 {
        return Some("POP3");
    }
    if payload.starts_with(b"* OK") && port == 143 {
        return Some("IMAP");
    }
    if payload.starts_with(b"HTTP/1.") {
        return Some("HTTP");
    }
    None
}

/// Protocol signatures for non-TLS traffic.
pub fn classify_signature(payload: &[u8], port: u16) -> Option<&'static str> {
    if payload.is_empty() {
        return None;
    }
    if payload.len() > 20 && payload[0] == 0x13 && payload[1..20].starts_with(b"BitTorrent protoco") {
        return Some("BitTorrent");
    }
    if payload.starts_with(b"M-SEARCH * HTTP/1.1") || payload.starts_with(b"NOTIFY * HTTP/1.1") {
        return Some("SSDP");
    }
    if payload.starts_with(b"REGISTER sip:")
        || payload.starts_with(b"INVITE sip:")
        || payload.starts_with(b"SIP/2.0")
    {
        return Some("SIP");
    }
    if port == 123 && payload.len() >= 48 {
        let version = (payload[0] >> 3) & 0x07;
        if (1..=4).contains(&version) {
            return Some("NTP");
        }
    }
    if (port == 1883 || port == 8883) && payload[0] >> 4 == 1 {
        return Some("MQTT");
    }
    None
}

/// Well-known service name for a port; the lowest-priority naming source.
pub fn well_known_service(port: u16) -> Option<&'static str> {
    let name = match port {
        20 | 21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 | 587 => "SMTP",
        53 => "DNS",
        67 | 68 => "DHCP",
        80 | 8080 => "HTTP",
        110 => "POP3",
        123 => "NTP",
        143 => "IMAP",
        161 | 162 => "SNMP",
        443 | 8443 => "HTTPS",
        445 => "SMB",
        465 => "SMTPS",
        514 => "Syslog",
        636 => "LDAPS",
        853 => "DNS-over-TLS",
        993 => "IMAPS",
        995 => "POP3S",
        1194 => "OpenVPN",
        1433 => "MSSQL",
        1883 => "MQTT",
        3306 => "MySQL",
        3389 => "RDP",
        5060 | 5061 => "SIP",
        5222 | 5223 => "XMPP",
        5353 => "mDNS",
        5432 => "PostgreSQL",
        6379 => "Redis",
        8883 => "MQTT",
        27017 => "MongoDB",
        51820 => "WireGuard",
        _ => return None,
    };
    Some(name)
}

/// Map an ALPN token to a service name.
pub fn alpn_application(alpn: &str) -> Option<&'static str> {
    match alpn {
        "h2" => Some("HTTP/2"),
        "h3" => Some("HTTP/3"),
        "http/1.1" | "http/1.0" => Some("HTTPS"),
        "dot" => Some("DNS-over-TLS"),
        "smtp" => Some("SMTP"),
        "imap" => Some("IMAP"),
        _ => None,
    }
}
