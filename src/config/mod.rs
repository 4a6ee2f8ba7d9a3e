//! CLI-flag parsing into an immutable `ProxyConfig`.

use std::path::PathBuf;

use clap::Parser;

use crate::{Error, Result};

/// Command-line flags, mirroring the external interface table. Kept
/// separate from `ProxyConfig` so validation/defaulting logic has a single
/// home (`ProxyConfig::from_args`) rather than living in `clap` attributes.
#[derive(Parser, Debug)]
#[command(name = "relay-gate", about = "Dual-mode forwarding proxy")]
pub struct Args {
    /// Parent proxy host:port; empty disables parent routing (HTTP mode only).
    #[arg(long, default_value = "")]
    pub parent: String,

    /// Wrap outbound pool sockets in TLS.
    #[arg(long)]
    pub parent_tls: bool,

    /// Wrap the listener in TLS.
    #[arg(long)]
    pub local_tls: bool,

    /// Listener bind address.
    #[arg(long, default_value = "0.0.0.0")]
    pub ip: String,

    /// Listener bind port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// TCP tunnel mode; requires `parent`.
    #[arg(long)]
    pub tcp: bool,

    /// Skip the reachability oracle; always use the parent.
    #[arg(long)]
    pub always: bool,

    /// Probe connect timeout, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub check_timeout: u64,

    /// Probe minimum re-probe interval, in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    pub check_interval: u64,

    /// Outbound connect timeout, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub tcp_timeout: u64,

    /// Pool min size; max size is `2 * pool_size`.
    #[arg(long, default_value_t = 4)]
    pub pool_size: usize,

    /// TLS certificate path.
    #[arg(long, default_value = "proxy.crt")]
    pub cert: String,

    /// TLS private key path.
    #[arg(long, default_value = "proxy.key")]
    pub key: String,

    /// Blocked-destination override file path.
    #[arg(long)]
    pub blocked: Option<String>,

    /// Direct-destination override file path.
    #[arg(long)]
    pub direct: Option<String>,

    /// Newline-delimited `user:pass` file.
    #[arg(long)]
    pub auth_file: Option<String>,

    /// Repeated inline `user:pass` entries.
    #[arg(long = "auth")]
    pub auth_inline: Vec<String>,

    /// `tracing` filter directive.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Immutable runtime configuration, lowered and validated from `Args`.
pub struct ProxyConfig {
    pub parent_address: Option<String>,
    pub parent_is_tls: bool,
    pub local_is_tls: bool,
    pub bind_ip: String,
    pub bind_port: u16,
    pub tcp_mode: bool,
    pub always_use_parent: bool,
    pub check_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub conn_timeout_ms: u64,
    pub pool_min: usize,
    pub pool_max: usize,
    pub cert_bytes: Option<Vec<u8>>,
    pub key_bytes: Option<Vec<u8>>,
    pub blocked_path: Option<PathBuf>,
    pub direct_path: Option<PathBuf>,
    pub auth_file: Option<String>,
    pub auth_inline: Vec<String>,
}

impl ProxyConfig {
    /// Validate and lower CLI args. Cert/key bytes are read here if TLS is
    /// requested and the files already exist; `main` is responsible for
    /// running `certgen` first when they don't.
    pub fn from_args(args: &Args) -> Result<Self> {
        let parent_address = if args.parent.is_empty() {
            None
        } else {
            Some(args.parent.clone())
        };

        if args.tcp && parent_address.is_none() {
            return Err(Error::config("tcp mode requires --parent"));
        }

        let needs_tls = args.parent_tls || args.local_tls;
        let (cert_bytes, key_bytes) = if needs_tls {
            let cert = std::fs::read(&args.cert).map_err(|e| {
                Error::config(format!("cannot read cert file {}: {}", args.cert, e))
            })?;
            let key = std::fs::read(&args.key)
                .map_err(|e| Error::config(format!("cannot read key file {}: {}", args.key, e)))?;
            (Some(cert), Some(key))
        } else {
            (None, None)
        };

        Ok(Self {
            parent_address,
            parent_is_tls: args.parent_tls,
            local_is_tls: args.local_tls,
            bind_ip: args.ip.clone(),
            bind_port: args.port,
            tcp_mode: args.tcp,
            always_use_parent: args.always,
            check_timeout_ms: args.check_timeout,
            probe_interval_ms: args.check_interval,
            conn_timeout_ms: args.tcp_timeout,
            pool_min: args.pool_size,
            pool_max: args.pool_size * 2,
            cert_bytes,
            key_bytes,
            blocked_path: args.blocked.clone().map(PathBuf::from),
            direct_path: args.direct.clone().map(PathBuf::from),
            auth_file: args.auth_file.clone(),
            auth_inline: args.auth_inline.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            parent: String::new(),
            parent_tls: false,
            local_tls: false,
            ip: "127.0.0.1".to_string(),
            port: 8080,
            tcp: false,
            always: false,
            check_timeout: 3000,
            check_interval: 60_000,
            tcp_timeout: 5000,
            pool_size: 4,
            cert: "proxy.crt".to_string(),
            key: "proxy.key".to_string(),
            blocked: None,
            direct: None,
            auth_file: None,
            auth_inline: vec![],
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_tcp_mode_requires_parent() {
        let mut args = base_args();
        args.tcp = true;
        assert!(ProxyConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_pool_max_is_double_min() {
        let args = base_args();
        let config = ProxyConfig::from_args(&args).unwrap();
        assert_eq!(config.pool_max, config.pool_min * 2);
    }

    #[test]
    fn test_no_parent_is_fine_for_http_mode() {
        let args = base_args();
        let config = ProxyConfig::from_args(&args).unwrap();
        assert!(config.parent_address.is_none());
        assert!(!config.tcp_mode);
    }
}
