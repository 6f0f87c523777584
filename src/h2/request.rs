//! Parses the caller's HTTP/1.1-style raw request bytes into the pieces the
//! HTTP/2 engine needs to re-emit as frames (spec §4.8 "Request encoding").

use crate::error::Error;

const DROPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
];

pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub authority: String,
    pub scheme: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn parse_request(raw: &[u8], default_authority: &str, default_scheme: &str) -> Result<ParsedRequest, Error> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| Error::protocol("encode", "request missing blank line terminating headers"))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|e| Error::protocol("encode", "request head is not valid UTF-8").with_cause(e))?;
    let body = raw[header_end..].to_vec();

    let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| Error::protocol("encode", "request missing request line"))?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::protocol("encode", "request line missing method"))?
        .to_string();
    let path = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::protocol("encode", "request line missing target"))?
        .to_string();

    let mut headers = Vec::new();
    let mut authority = default_authority.to_string();
    let mut scheme = default_scheme.to_string();

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            authority = value.to_string();
        }
        if name.eq_ignore_ascii_case("x-scheme") {
            scheme = value.to_string();
            continue;
        }
        if DROPPED_HEADERS.iter().any(|d| name.eq_ignore_ascii_case(d)) {
            continue;
        }
        headers.push((name.to_string(), value.to_string()));
    }

    Ok(ParsedRequest {
        method,
        path,
        authority,
        scheme,
        headers,
        body,
    })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Builds the HPACK input list: pseudo-headers in fixed order, then
/// lowercased regular headers.
pub fn build_header_list(req: &ParsedRequest) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::with_capacity(4 + req.headers.len());
    out.push((b":method".to_vec(), req.method.as_bytes().to_vec()));
    out.push((b":path".to_vec(), req.path.as_bytes().to_vec()));
    out.push((b":scheme".to_vec(), req.scheme.as_bytes().to_vec()));
    out.push((b":authority".to_vec(), req.authority.as_bytes().to_vec()));
    for (name, value) in &req.headers {
        out.push((name.to_ascii_lowercase().into_bytes(), value.as_bytes().to_vec()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_drops_connection_headers() {
        let raw = b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nX-Custom: v\r\n\r\n";
        let parsed = parse_request(raw, "fallback", "https").unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/a?b=1");
        assert_eq!(parsed.authority, "example.com");
        assert!(parsed.headers.iter().all(|(n, _)| n != "Connection"));
        assert!(parsed.headers.iter().any(|(n, v)| n == "X-Custom" && v == "v"));
    }

    #[test]
    fn keeps_body_bytes_after_blank_line() {
        let raw = b"POST / HTTP/1.1\r\nHost: h\r\n\r\nbody-bytes";
        let parsed = parse_request(raw, "fallback", "https").unwrap();
        assert_eq!(parsed.body, b"body-bytes");
    }
}
