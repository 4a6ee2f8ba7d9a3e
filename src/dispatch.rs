//! Per-connection dispatch: TCP tunnel mode and the HTTP(S) proxy dialect.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::common::net::connect_timeout;
use crate::host::{fix_host, get_header, get_url, host_has_no_port};
use crate::pool::BoxedStream;
use crate::splice::splice;
use crate::{auth, Error, ProxyRuntime, Result};

const REQUEST_HEAD_CAP: usize = 4096;
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const UNAUTHORIZED: &[u8] =
    b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"\"\r\n\r\nUnauthorized";

/// TCP tunnel mode: every accepted connection is spliced to a pooled parent
/// connection with no preamble.
pub async fn handle_tcp<C>(runtime: Arc<ProxyRuntime>, client: C, peer: SocketAddr) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let pool = runtime
        .pool
        .as_ref()
        .ok_or_else(|| Error::config("tcp mode requires a parent pool"))?;
    let conn = pool.get().await?;
    info!(%peer, "tcp tunnel established via parent pool");
    let on_bytes: Arc<dyn Fn(u64, bool) + Send + Sync> = Arc::new(|_, _| {});
    if let Some(err) = splice(client, conn.stream, on_bytes).await {
        warn!(%peer, error = %err, "tcp splice ended with error");
    }
    Ok(())
}

struct ParsedHead {
    method: String,
    target: String,
}

fn parse_head(buf: &[u8]) -> Result<ParsedHead> {
    let newline = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::malformed("no newline in first request line"))?;
    let line = std::str::from_utf8(&buf[..newline])
        .map_err(|_| Error::malformed("non-UTF8 request line"))?
        .trim_end_matches('\r');
    let mut parts = line.split(' ').filter(|s| !s.is_empty());
    let method = parts
        .next()
        .ok_or_else(|| Error::malformed("missing method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| Error::malformed("missing target"))?
        .to_string();
    Ok(ParsedHead { method, target })
}

fn rewrite_host(buf: &[u8], from: &str, to: &str) -> Vec<u8> {
    String::from_utf8_lossy(buf).replacen(from, to, 1).into_bytes()
}

/// HTTP(S) proxy mode: absolute-URI requests and `CONNECT`.
pub async fn handle_http<C>(runtime: Arc<ProxyRuntime>, mut client: C, peer: SocketAddr) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let buf = read_request_head(&mut client).await?;

    let head = match panic::catch_unwind(AssertUnwindSafe(|| parse_head(&buf))) {
        Ok(result) => result?,
        Err(payload) => {
            let msg = panic_message(payload);
            error!(%peer, panic = %msg, "panic while parsing request head");
            return Err(Error::malformed("internal parse failure"));
        }
    };

    let is_https = head.method.eq_ignore_ascii_case("CONNECT");

    if !is_https && runtime.auth_required() {
        let authorized = get_header("Authorization", &buf)
            .ok()
            .and_then(|v| auth::decode_basic(&v).ok())
            .map(|candidate| runtime.credentials.check(&candidate))
            .unwrap_or(false);
        if !authorized {
            let _ = client.write_all(UNAUTHORIZED).await;
            warn!(%peer, "rejected unauthenticated request");
            return Err(Error::AuthReject);
        }
    }

    let (destination, forward_bytes, sample_for_probe) = if is_https {
        let fixed = fix_host(&head.target);
        let destination = if host_has_no_port(&fixed) {
            format!("{}:443", fixed)
        } else {
            fixed
        };
        (destination, buf.clone(), None)
    } else {
        let full_url = get_url(false, &buf, &head.target)?;
        let parsed = url::Url::parse(&full_url)
            .map_err(|e| Error::malformed(format!("invalid URL {}: {}", full_url, e)))?;
        let raw_host = parsed
            .host_str()
            .ok_or_else(|| Error::malformed("missing host in URL"))?
            .to_string();
        let fixed = fix_host(&raw_host);
        let port = parsed.port().unwrap_or(80);
        let destination = format!("{}:{}", fixed, port);
        let forward_bytes = if fixed != raw_host {
            rewrite_host(&buf, &raw_host, &fixed)
        } else {
            buf.clone()
        };
        (destination, forward_bytes.clone(), Some(forward_bytes))
    };

    // last_url is HTTP-only; CONNECT-derived records carry no URL.
    let logged_url = if is_https {
        None
    } else {
        get_url(is_https, &forward_bytes, &head.target).ok()
    };
    runtime.oracle_add(
        &destination,
        is_https,
        &head.method,
        logged_url.as_deref(),
        sample_for_probe.as_deref(),
    );

    let use_parent = runtime.should_use_parent(&destination);

    let mut outbound: BoxedStream = if use_parent {
        let pool = runtime
            .pool
            .as_ref()
            .ok_or_else(|| Error::config("no parent pool configured"))?;
        pool.get().await?.stream
    } else {
        Box::new(connect_timeout(&destination, runtime.config.conn_timeout_ms).await?)
    };

    if is_https {
        if use_parent {
            outbound.write_all(&buf).await?;
        } else {
            client.write_all(CONNECTION_ESTABLISHED).await?;
        }
    } else {
        outbound.write_all(&forward_bytes).await?;
    }

    info!(%peer, %destination, is_https, use_parent, "dispatching splice");
    let on_bytes: Arc<dyn Fn(u64, bool) + Send + Sync> = Arc::new(|_, _| {});
    if let Some(err) = splice(client, outbound, on_bytes).await {
        warn!(%peer, %destination, error = %err, "splice ended with error");
    }
    Ok(())
}

async fn read_request_head<C: AsyncRead + Unpin>(client: &mut C) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; REQUEST_HEAD_CAP];
    let mut filled = 0usize;
    let mut found_newline = false;
    while filled < buf.len() {
        let n = client.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].contains(&b'\n') {
            found_newline = true;
            break;
        }
    }
    buf.truncate(filled);
    if !found_newline {
        return Err(Error::malformed("no newline in first 4096 bytes"));
    }
    Ok(buf)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_connect() {
        let head = parse_head(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
    }

    #[test]
    fn test_parse_head_get_absolute() {
        let head = parse_head(b"GET http://example.com/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/");
    }

    #[test]
    fn test_parse_head_missing_target() {
        assert!(parse_head(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn test_rewrite_host() {
        let buf = b"GET /x HTTP/1.1\r\nHost: fe80::1\r\n\r\n";
        let rewritten = rewrite_host(buf, "fe80::1", "[fe80::1]");
        assert_eq!(
            String::from_utf8(rewritten).unwrap(),
            "GET /x HTTP/1.1\r\nHost: [fe80::1]\r\n\r\n"
        );
    }

    #[test]
    fn test_rewrite_host_only_first_occurrence() {
        let buf = b"GET http://fe80::1/fe80::1 HTTP/1.1\r\nHost: fe80::1\r\n\r\n";
        let rewritten = rewrite_host(buf, "fe80::1", "[fe80::1]");
        assert_eq!(
            String::from_utf8(rewritten).unwrap(),
            "GET http://[fe80::1]/fe80::1 HTTP/1.1\r\nHost: fe80::1\r\n\r\n"
        );
    }
}
