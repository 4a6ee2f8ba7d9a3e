//! Startup-time convenience: generate a self-signed cert/key pair with the
//! system `openssl` binary when TLS is requested and the configured files
//! are missing. Never invoked from the hot path.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

use crate::Result;

/// Generate a 2048-bit RSA key and a 10-year self-signed certificate at
/// `cert_path`/`key_path` if either is missing. Failure is logged and
/// non-fatal here; it only becomes fatal later if TLS setup then finds the
/// files absent.
pub async fn ensure_cert(cert_path: &str, key_path: &str) {
    if Path::new(cert_path).exists() && Path::new(key_path).exists() {
        return;
    }
    info!(cert_path, key_path, "generating self-signed certificate");
    if let Err(e) = generate(cert_path, key_path).await {
        warn!(error = %e, "certificate generation failed; TLS startup may fail");
    }
}

async fn generate(cert_path: &str, key_path: &str) -> Result<()> {
    let status = Command::new("openssl")
        .args([
            "req",
            "-x509",
            "-newkey",
            "rsa:2048",
            "-keyout",
            key_path,
            "-out",
            cert_path,
            "-days",
            "3650",
            "-nodes",
            "-subj",
            "/CN=localhost",
        ])
        .status()
        .await?;
    if !status.success() {
        return Err(crate::Error::config(format!(
            "openssl exited with status {}",
            status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_cert_skips_when_both_present() {
        let dir = std::env::temp_dir().join(format!("certgen-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("proxy.crt");
        let key = dir.join("proxy.key");
        std::fs::write(&cert, "dummy").unwrap();
        std::fs::write(&key, "dummy").unwrap();

        ensure_cert(cert.to_str().unwrap(), key.to_str().unwrap()).await;

        assert_eq!(std::fs::read_to_string(&cert).unwrap(), "dummy");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
