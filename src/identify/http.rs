//! Plain-text HTTP request extraction: method, URL, Host, User-Agent.

/// Fields pulled from the first bytes of an HTTP request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Parse an HTTP/1.x request from a payload prefix. Returns `None` unless
/// the payload starts with a known method and a well-formed request line.
pub fn extract(payload: &[u8]) -> Option<HttpRequest> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;

    let mut parts = request_line.split(' ');
    let method = parts.next()?;
    if !METHODS.contains(&method) {
        return None;
    }
    let url = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }

    let mut req = HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        host: None,
        user_agent: None,
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            req.host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("user-agent") {
            req.user_agent = Some(value.to_string());
        }
    }

    Some(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_headers() {
        let payload = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8.0\r\n\r\n";
        let req = extract(payload).expect("should parse");
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(req.user_agent.as_deref(), Some("curl/8.0"));
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let payload = b"POST /api HTTP/1.1\r\nhost: api.example.net\r\nUSER-AGENT: app/1.0\r\n\r\n";
        let req = extract(payload).unwrap();
        assert_eq!(req.host.as_deref(), Some("api.example.net"));
        assert_eq!(req.user_agent.as_deref(), Some("app/1.0"));
    }

    #[test]
    fn truncated_header_block_still_parses() {
        // Request line complete, headers cut mid-stream.
        let payload = b"GET / HTTP/1.1\r\nHost: exam";
        let req = extract(payload).unwrap();
        assert_eq!(req.method, "GET");
        // The partial Host header has no colon-terminated value issue but no
        // trailing CRLF either; it still parses as a complete line fragment.
        assert_eq!(req.host.as_deref(), Some("exam"));
    }

    #[test]
    fn rejects_non_http() {
        assert!(extract(b"SSH-2.0-OpenSSH_9.3\r\n").is_none());
        assert!(extract(b"NONSENSE / HTTP/1.1\r\n").is_none());
        assert!(extract(b"GET /\r\n").is_none()); // missing version
        assert!(extract(&[0x16, 0x03, 0x01, 0x00]).is_none());
    }
}
