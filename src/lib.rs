//! Dual-mode forwarding proxy: a local listener that relays traffic either
//! through a configured parent proxy or directly to the client's intended
//! origin, chosen per-connection by a background reachability oracle.
//!
//! # Architecture
//!
//! ```text
//!                  +-----------------+
//!                  |   listener/     |
//!                  +--------+--------+
//!                           |
//!                  +--------v--------+
//!                  |   dispatch/     |
//!                  +---+---------+---+
//!                      |         |
//!           +----------v-+     +-v-----------+
//!           |   pool/    |     |  oracle/    |
//!           +------------+     +-------------+
//!                      |         |
//!                  +---v---------v---+
//!                  |    splice/       |
//!                  +------------------+
//! ```

pub mod auth;
pub mod certgen;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod listener;
pub mod oracle;
pub mod pool;
pub mod splice;

pub use common::{Error, Result};

use std::sync::Arc;

use tracing::info;

use crate::auth::CredentialSet;
use crate::common::net::{connect_timeout, connect_tls_timeout};
use crate::config::ProxyConfig;
use crate::oracle::Oracle;
use crate::pool::{BoxedStream, Pool};

/// Process-wide value bundling configuration, the outbound pool, the
/// reachability oracle, and the credential store. Constructed once at
/// startup and passed by `Arc` to every accepted-connection task; the
/// signal handler holds a clone of the same `Arc` for shutdown.
pub struct ProxyRuntime {
    pub config: ProxyConfig,
    pub pool: Option<Pool>,
    pub oracle: Option<Arc<Oracle>>,
    pub credentials: CredentialSet,
}

impl ProxyRuntime {
    /// Build the runtime from a validated `ProxyConfig`: loads credentials,
    /// warms the outbound pool (if a parent is configured), and starts the
    /// oracle's probe loop (unless running in plain TCP mode, where the
    /// oracle is never consulted).
    pub async fn new(config: ProxyConfig) -> Result<Self> {
        let credentials = CredentialSet::new();
        if let Some(path) = &config.auth_file {
            credentials.add_from_file(path)?;
        }
        if !config.auth_inline.is_empty() {
            let refs: Vec<&str> = config.auth_inline.iter().map(String::as_str).collect();
            credentials.add(&refs);
        }
        info!(total = credentials.total(), "loaded credentials");

        let pool = match &config.parent_address {
            Some(parent) => Some(build_pool(parent.clone(), &config).await?),
            None => None,
        };

        let oracle = if config.tcp_mode {
            None
        } else {
            let o = Arc::new(Oracle::new(
                config.blocked_path.clone(),
                config.direct_path.clone(),
                config.check_timeout_ms,
                config.probe_interval_ms,
            ));
            o.clone().spawn_probe_loop();
            Some(o)
        };

        Ok(Self {
            config,
            pool,
            oracle,
            credentials,
        })
    }

    pub fn auth_required(&self) -> bool {
        self.credentials.total() > 0
    }

    pub fn oracle_add(
        &self,
        destination: &str,
        is_https: bool,
        method: &str,
        url: Option<&str>,
        sample_request: Option<&[u8]>,
    ) {
        if let Some(oracle) = &self.oracle {
            oracle.add(destination, is_https, method, url, sample_request);
        }
    }

    pub fn should_use_parent(&self, destination: &str) -> bool {
        if self.config.always_use_parent {
            return true;
        }
        match &self.oracle {
            Some(oracle) => oracle.is_blocked(destination).use_parent,
            None => true,
        }
    }

    /// Run the listener until a shutdown signal arrives, then drain the
    /// pool and stop the oracle's probe loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener_runtime = self.clone();
        let listener_handle = tokio::spawn(async move { listener::serve(listener_runtime).await });

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        self.shutdown();
        listener_handle.abort();
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.release_all();
        }
        if let Some(oracle) = &self.oracle {
            oracle.shutdown();
        }
    }
}

async fn build_pool(parent: String, config: &ProxyConfig) -> Result<Pool> {
    let parent_is_tls = config.parent_is_tls;
    let conn_timeout_ms = config.conn_timeout_ms;
    let factory: pool::Factory = Arc::new(move || {
        let parent = parent.clone();
        Box::pin(async move {
            if parent_is_tls {
                let host = sni_host(&parent);
                let stream = connect_tls_timeout(&parent, &host, conn_timeout_ms).await?;
                Ok(Box::new(stream) as BoxedStream)
            } else {
                let stream = connect_timeout(&parent, conn_timeout_ms).await?;
                Ok(Box::new(stream) as BoxedStream)
            }
        })
    });
    Pool::new(factory, config.pool_min, config.pool_max).await
}

fn sni_host(addr: &str) -> String {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sighup.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_host_strips_port() {
        assert_eq!(sni_host("example.com:443"), "example.com");
    }

    #[test]
    fn test_sni_host_strips_ipv6_brackets() {
        assert_eq!(sni_host("[::1]:443"), "::1");
    }
}
