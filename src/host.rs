//! Host token utilities: IPv6 bracket normalization and lightweight parsing
//! of the first line / headers of a raw HTTP proxy request.
//!
//! Everything here operates on byte slices (or the `&str` views over them)
//! and returns owned `String`s; no intermediate allocation beyond that.

use crate::{Error, Result};

/// Wrap a bare IPv6 literal in brackets, leaving anything already bracketed
/// or anything that isn't IPv6-shaped untouched.
///
/// Heuristic: a host with two or more colons and no leading `[` is treated
/// as an unbracketed IPv6 literal. If the final colon-delimited segment is
/// all digits and the remainder still looks like an IPv6 address (at least
/// one more colon), that segment is treated as a trailing port and kept
/// outside the brackets; otherwise the whole string is wrapped.
pub fn fix_host(host: &str) -> String {
    if host.starts_with('[') {
        return host.to_string();
    }

    let colon_count = host.matches(':').count();
    if colon_count < 2 {
        return host.to_string();
    }

    if let Some(idx) = host.rfind(':') {
        let (addr, port) = (&host[..idx], &host[idx + 1..]);
        // A genuine trailing port only exists if what's left still has enough
        // colons to be a complete IPv6 address on its own (at least two, as
        // in `::1`). Otherwise the "port" we just peeled off is really the
        // address's own last hextet (e.g. `fe80::1` has none left over).
        if !port.is_empty()
            && port.chars().all(|c| c.is_ascii_digit())
            && addr.matches(':').count() >= 2
        {
            return format!("[{}]:{}", addr, port);
        }
    }

    format!("[{}]", host)
}

/// True iff `host` carries no explicit port: either there is no colon at
/// all, or the only colons present are inside IPv6 brackets.
pub fn host_has_no_port(host: &str) -> bool {
    match host.rfind(']') {
        Some(close_idx) => !host[close_idx + 1..].starts_with(':'),
        None => !host.contains(':'),
    }
}

/// Case-insensitive header lookup in a raw HTTP request prefix. `request`
/// is the bytes read off the wire, starting with the request line.
pub fn get_header(name: &str, request: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(request);
    for line in text.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some(idx) = line.find(':') {
            let key = &line[..idx];
            if key.trim().eq_ignore_ascii_case(name) {
                return Ok(line[idx + 1..].trim().to_string());
            }
        }
    }
    Err(Error::header_missing(name.to_string()))
}

/// Reconstruct a canonical absolute URL for the request's first-line
/// target. `is_https` selects the `CONNECT` dialect, where the target
/// token already IS the destination (`host:port`, no scheme). For other
/// methods the target may already be an absolute URI, in which case it is
/// returned unchanged, or an origin-form path, in which case the `Host`
/// header supplies the authority.
pub fn get_url(is_https: bool, request: &[u8], target: &str) -> Result<String> {
    if is_https {
        return Ok(target.to_string());
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(target.to_string());
    }
    let host = get_header("Host", request)?;
    Ok(format!("http://{}{}", host, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_host_preserves_bracketed() {
        assert_eq!(fix_host("[::1]"), "[::1]");
        assert_eq!(fix_host("[::1]:443"), "[::1]:443");
    }

    #[test]
    fn test_fix_host_preserves_plain() {
        assert_eq!(fix_host("example.com"), "example.com");
        assert_eq!(fix_host("example.com:443"), "example.com:443");
        assert_eq!(fix_host("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_fix_host_wraps_bare_ipv6() {
        assert_eq!(fix_host("fe80::1"), "[fe80::1]");
        assert_eq!(fix_host("::1"), "[::1]");
    }

    #[test]
    fn test_fix_host_wraps_bare_ipv6_with_port() {
        assert_eq!(fix_host("fe80::1:443"), "[fe80::1]:443");
    }

    #[test]
    fn test_fix_host_idempotent() {
        for h in ["fe80::1", "::1", "example.com", "example.com:80", "[::1]:443"] {
            let once = fix_host(h);
            let twice = fix_host(&once);
            assert_eq!(once, twice, "fix_host not idempotent for {}", h);
        }
    }

    #[test]
    fn test_host_has_no_port() {
        assert!(host_has_no_port("[::1]"));
        assert!(!host_has_no_port("[::1]:443"));
        assert!(host_has_no_port("example.com"));
        assert!(!host_has_no_port("example.com:80"));
    }

    #[test]
    fn test_get_header_found_case_insensitive() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\nAuthorization: Basic abc\r\n\r\n";
        assert_eq!(get_header("host", req).unwrap(), "example.com");
        assert_eq!(get_header("AUTHORIZATION", req).unwrap(), "Basic abc");
    }

    #[test]
    fn test_get_header_missing() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(
            get_header("Authorization", req),
            Err(Error::HeaderMissing(_))
        ));
    }

    #[test]
    fn test_get_url_connect() {
        let url = get_url(true, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n", "example.com:443")
            .unwrap();
        assert_eq!(url, "example.com:443");
    }

    #[test]
    fn test_get_url_absolute() {
        let req = b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let url = get_url(false, req, "http://example.com/path").unwrap();
        assert_eq!(url, "http://example.com/path");
    }

    #[test]
    fn test_get_url_origin_form() {
        let req = b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let url = get_url(false, req, "/path").unwrap();
        assert_eq!(url, "http://example.com/path");
    }
}
