//! Reachability oracle ("Checker"): classifies destinations as directly
//! reachable or blocked via a background probe loop, with disk-persisted
//! overrides that seed (and are kept in sync with) the learned
//! classification.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::common::net::connect_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unknown,
    Direct,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub is_https: bool,
    pub last_method: String,
    pub last_url: Option<String>,
    pub last_request_bytes: Option<Vec<u8>>,
    pub classification: Classification,
    pub fail_count: u32,
    pub success_count: u32,
    pub last_probed_at: Option<Instant>,
    pub probe_in_flight: bool,
    /// Set by a real `add()` call from dispatch. An override-seeded record
    /// that dispatch has never actually observed carries no `is_https` or
    /// `last_request_bytes` worth probing with, and must not be scheduled
    /// until dispatch fills those in — otherwise a degenerate probe would
    /// "fail" and silently flip the pinned override classification.
    seen: bool,
}

impl ProbeRecord {
    fn new(classification: Classification) -> Self {
        Self {
            is_https: false,
            last_method: String::new(),
            last_url: None,
            last_request_bytes: None,
            classification,
            fail_count: 0,
            success_count: 0,
            last_probed_at: None,
            probe_in_flight: false,
            seen: false,
        }
    }
}

/// Result of a `is_blocked` lookup.
pub struct Decision {
    pub use_parent: bool,
    pub fail_count: u32,
    pub success_count: u32,
}

pub struct Oracle {
    records: Mutex<HashMap<String, ProbeRecord>>,
    blocked_path: Option<PathBuf>,
    direct_path: Option<PathBuf>,
    check_timeout_ms: u64,
    probe_interval_ms: u64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Oracle {
    /// Load override files (if given) to seed initial classification, then
    /// return a ready-to-use oracle. Missing files are treated as empty;
    /// unreadable-but-present files are logged and skipped (non-fatal).
    pub fn new(
        blocked_path: Option<PathBuf>,
        direct_path: Option<PathBuf>,
        check_timeout_ms: u64,
        probe_interval_ms: u64,
    ) -> Self {
        let mut records = HashMap::new();
        if let Some(path) = &blocked_path {
            load_overrides(path, Classification::Blocked, &mut records);
        }
        if let Some(path) = &direct_path {
            load_overrides(path, Classification::Direct, &mut records);
        }
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            records: Mutex::new(records),
            blocked_path,
            direct_path,
            check_timeout_ms,
            probe_interval_ms,
            shutdown_tx,
        }
    }

    /// Idempotent upsert of a destination seen by dispatch. Does not block
    /// on I/O.
    pub fn add(
        &self,
        destination: &str,
        is_https: bool,
        method: &str,
        url: Option<&str>,
        sample_request: Option<&[u8]>,
    ) {
        let mut records = self.records.lock();
        let record = records
            .entry(destination.to_string())
            .or_insert_with(|| ProbeRecord::new(Classification::Unknown));
        record.is_https = is_https;
        record.last_method = method.to_string();
        record.last_url = url.map(|u| u.to_string());
        record.last_request_bytes = sample_request.map(|b| b.to_vec());
        record.seen = true;
    }

    /// `use_parent = true` until at least one successful direct probe has
    /// been recorded; thereafter mirrors `classification == Blocked`.
    pub fn is_blocked(&self, destination: &str) -> Decision {
        let records = self.records.lock();
        match records.get(destination) {
            Some(record) => Decision {
                use_parent: record.classification != Classification::Direct,
                fail_count: record.fail_count,
                success_count: record.success_count,
            },
            None => Decision {
                use_parent: true,
                fail_count: 0,
                success_count: 0,
            },
        }
    }

    /// Spawn the probe-scheduler task. Returns a handle to request shutdown
    /// via `shutdown()`.
    pub fn spawn_probe_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                self.probe_interval_ms.max(1),
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.clone().dispatch_due_probes();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("oracle probe scheduler shutting down");
                        break;
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn dispatch_due_probes(self: Arc<Self>) {
        let interval = Duration::from_millis(self.probe_interval_ms);
        let due: Vec<(String, bool, Option<Vec<u8>>)> = {
            let mut records = self.records.lock();
            let now = Instant::now();
            records
                .iter_mut()
                .filter(|(_, r)| {
                    r.seen
                        && !r.probe_in_flight
                        && r.last_probed_at
                            .map(|t| now.duration_since(t) >= interval)
                            .unwrap_or(true)
                })
                .map(|(dest, r)| {
                    r.probe_in_flight = true;
                    (dest.clone(), r.is_https, r.last_request_bytes.clone())
                })
                .collect()
        };
        for (destination, is_https, sample_request) in due {
            let oracle = self.clone();
            tokio::spawn(async move {
                oracle.run_probe(destination, is_https, sample_request).await;
            });
        }
    }

    async fn run_probe(&self, destination: String, is_https: bool, sample_request: Option<Vec<u8>>) {
        let success = if is_https {
            connect_timeout(&destination, self.check_timeout_ms).await.is_ok()
        } else {
            probe_http(&destination, self.check_timeout_ms, sample_request.as_deref()).await
        };

        let new_classification = {
            let mut records = self.records.lock();
            let record = match records.get_mut(&destination) {
                Some(r) => r,
                None => return,
            };
            record.probe_in_flight = false;
            record.last_probed_at = Some(Instant::now());
            if success {
                record.success_count += 1;
                record.fail_count = 0;
                record.classification = Classification::Direct;
            } else {
                record.fail_count += 1;
                record.success_count = 0;
                record.classification = Classification::Blocked;
            }
            record.classification
        };
        debug!(%destination, success, ?new_classification, "probe completed");
        self.persist();
    }

    fn persist(&self) {
        let (blocked, direct): (Vec<String>, Vec<String>) = {
            let records = self.records.lock();
            let blocked = records
                .iter()
                .filter(|(_, r)| r.classification == Classification::Blocked)
                .map(|(d, _)| d.clone())
                .collect();
            let direct = records
                .iter()
                .filter(|(_, r)| r.classification == Classification::Direct)
                .map(|(d, _)| d.clone())
                .collect();
            (blocked, direct)
        };
        if let Some(path) = &self.blocked_path {
            if let Err(e) = write_lines(path, &blocked) {
                warn!(error = %e, path = %path.display(), "failed to persist blocked overrides");
            }
        }
        if let Some(path) = &self.direct_path {
            if let Err(e) = write_lines(path, &direct) {
                warn!(error = %e, path = %path.display(), "failed to persist direct overrides");
            }
        }
    }
}

fn load_overrides(path: &Path, classification: Classification, records: &mut HashMap<String, ProbeRecord>) {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            for line in contents.lines() {
                let dest = line.trim();
                if dest.is_empty() {
                    continue;
                }
                records
                    .entry(dest.to_string())
                    .or_insert_with(|| ProbeRecord::new(classification));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "failed to read override file"),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

async fn probe_http(destination: &str, timeout_ms: u64, sample_request: Option<&[u8]>) -> bool {
    let Ok(mut stream) = connect_timeout(destination, timeout_ms).await else {
        return false;
    };
    let Some(request) = sample_request else {
        return false;
    };
    if stream.write_all(request).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 1024];
    let fut = stream.read(&mut buf);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(Ok(n)) if n > 0 => buf[..n].starts_with(b"HTTP/"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_uses_parent() {
        let oracle = Oracle::new(None, None, 200, 1000);
        let decision = oracle.is_blocked("example.com:443");
        assert!(decision.use_parent);
    }

    #[test]
    fn test_add_then_is_blocked_unknown() {
        let oracle = Oracle::new(None, None, 200, 1000);
        oracle.add("example.com:443", true, "CONNECT", None, None);
        let decision = oracle.is_blocked("example.com:443");
        assert!(decision.use_parent);
    }

    #[test]
    fn test_overrides_seed_classification() {
        let dir = std::env::temp_dir().join(format!("oracle-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let blocked_path = dir.join("blocked.txt");
        std::fs::write(&blocked_path, "censored.example:443\n").unwrap();
        let oracle = Oracle::new(Some(blocked_path), None, 200, 1000);
        let decision = oracle.is_blocked("censored.example:443");
        assert!(decision.use_parent);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unseen_override_is_not_scheduled_for_probing() {
        let dir = std::env::temp_dir().join(format!("oracle-test-unseen-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let direct_path = dir.join("direct.txt");
        std::fs::write(&direct_path, "open.example:80\n").unwrap();
        let oracle = Arc::new(Oracle::new(None, Some(direct_path), 200, 0));

        oracle.clone().dispatch_due_probes();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let decision = oracle.is_blocked("open.example:80");
        assert!(!decision.use_parent, "override pin must survive an unseen-record scheduler pass");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_direct_override_allows_bypass() {
        let dir = std::env::temp_dir().join(format!("oracle-test-direct-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let direct_path = dir.join("direct.txt");
        std::fs::write(&direct_path, "open.example:80\n").unwrap();
        let oracle = Oracle::new(None, Some(direct_path), 200, 1000);
        let decision = oracle.is_blocked("open.example:80");
        assert!(!decision.use_parent);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
