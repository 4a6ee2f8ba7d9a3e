//! Network utilities: TCP tuning, connect-with-timeout, and TLS helpers shared
//! by the outbound pool and the local listener.

use crate::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use socket2::SockRef;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Open a TCP connection to `addr`, bounded by `timeout_ms`.
pub async fn connect_timeout(addr: &str, timeout_ms: u64) -> Result<TcpStream> {
    let fut = TcpStream::connect(addr);
    let stream = tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
        .await
        .map_err(|_| Error::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| Error::upstream_unreachable(format!("{}: {}", addr, e)))?;
    configure_tcp_stream(&stream);
    Ok(stream)
}

/// Build a PEM cert chain + private key into a server-side TLS config for the
/// local listener.
pub fn server_tls_config(cert_bytes: &[u8], key_bytes: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut Cursor::new(cert_bytes))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::tls(format!("invalid cert PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("no certificates found in cert file"));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut Cursor::new(key_bytes))
        .map_err(|e| Error::tls(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| Error::tls("no private key found in key file"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Build a `TlsAcceptor` for the local listener.
pub fn tls_acceptor(cert_bytes: &[u8], key_bytes: &[u8]) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_tls_config(cert_bytes, key_bytes)?))
}

/// Certificate verifier that accepts any certificate. The parent proxy's
/// certificate is not pinned or validated by default, matching the source
/// proxy's behavior.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Build a `TlsConnector` that does not validate the parent's certificate.
pub fn insecure_tls_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Connect to `addr` and wrap the resulting socket in a TLS client session,
/// bounded by `timeout_ms` for the TCP handshake.
pub async fn connect_tls_timeout(
    addr: &str,
    host: &str,
    timeout_ms: u64,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let stream = connect_timeout(addr, timeout_ms).await?;
    let connector = insecure_tls_connector();
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::tls(format!("invalid server name: {}", host)))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("TLS handshake with {} failed: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_timeout_refused() {
        // Port 1 is reserved and nothing should be listening there.
        let result = connect_timeout("127.0.0.1:1", 200).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_timeout_unroutable() {
        // TEST-NET-1 address, guaranteed not to answer; should time out quickly.
        let result = connect_timeout("192.0.2.1:81", 50).await;
        assert!(result.is_err());
    }
}
