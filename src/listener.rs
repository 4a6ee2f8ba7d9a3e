//! Local listener: binds the TCP socket, optionally wraps accepted sockets
//! in a TLS server session, and hands each connection to dispatch on its
//! own task.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::common::net::{configure_tcp_stream, tls_acceptor};
use crate::{dispatch, Error, ProxyRuntime, Result};

/// Bind and serve forever, spawning one task per accepted connection. Bind
/// failure is fatal; per-connection errors are logged and do not affect
/// the listener.
pub async fn serve(runtime: Arc<ProxyRuntime>) -> Result<()> {
    let addr = format!("{}:{}", runtime.config.bind_ip, runtime.config.bind_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind {}: {}", addr, e)))?;
    info!(%addr, tls = runtime.config.local_is_tls, "listener bound");

    let acceptor = if runtime.config.local_is_tls {
        let cert = runtime
            .config
            .cert_bytes
            .as_deref()
            .ok_or_else(|| Error::config("local TLS requested but no cert bytes available"))?;
        let key = runtime
            .config
            .key_bytes
            .as_deref()
            .ok_or_else(|| Error::config("local TLS requested but no key bytes available"))?;
        Some(tls_acceptor(cert, key)?)
    } else {
        None
    };

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        configure_tcp_stream(&stream);

        let runtime = runtime.clone();
        let acceptor = acceptor.clone();
        let tcp_mode = runtime.config.tcp_mode;

        tokio::spawn(async move {
            let task = async move {
                match acceptor {
                    Some(acceptor) => {
                        let tls_stream = accept_tls(&acceptor, stream).await?;
                        dispatch_connection(runtime, tls_stream, peer, tcp_mode).await
                    }
                    None => dispatch_connection(runtime, stream, peer, tcp_mode).await,
                }
            };
            let handle = tokio::spawn(task);
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%peer, error = %e, "connection ended with error"),
                Err(join_err) if join_err.is_panic() => {
                    error!(%peer, "connection task panicked, connection dropped")
                }
                Err(_) => {}
            }
        });
    }
}

async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: tokio::net::TcpStream,
) -> Result<tokio_rustls::server::TlsStream<tokio::net::TcpStream>> {
    acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::tls(format!("TLS accept failed: {}", e)))
}

async fn dispatch_connection<C>(
    runtime: Arc<ProxyRuntime>,
    stream: C,
    peer: std::net::SocketAddr,
    tcp_mode: bool,
) -> Result<()>
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    if tcp_mode {
        dispatch::handle_tcp(runtime, stream, peer).await
    } else {
        dispatch::handle_http(runtime, stream, peer).await
    }
}
