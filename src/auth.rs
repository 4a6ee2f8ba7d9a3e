//! In-memory Basic-auth credential store with constant-time membership
//! checks.

use std::collections::HashSet;
use std::sync::RwLock;

use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{Error, Result};

/// A set of `user:pass` tokens accepted by the local listener's optional
/// Basic-auth gate.
#[derive(Default)]
pub struct CredentialSet {
    entries: RwLock<HashSet<String>>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashSet::new()),
        }
    }

    /// Load `user:pass` lines from `path`. Lines without a `:` are skipped
    /// and counted into the debug log but do not fail the call. Returns the
    /// number of entries newly added.
    pub fn add_from_file(&self, path: &str) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = contents.lines().collect();
        Ok(self.add(&lines))
    }

    /// Add `user:pass` tokens from an in-memory list, skipping malformed
    /// entries. Duplicate adds are idempotent. Returns the number of
    /// entries newly added.
    pub fn add(&self, candidates: &[&str]) -> usize {
        let mut skipped = 0usize;
        let mut added = 0usize;
        let mut entries = self.entries.write().unwrap();
        for raw in candidates {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if !line.contains(':') {
                skipped += 1;
                continue;
            }
            if entries.insert(line.to_string()) {
                added += 1;
            }
        }
        if skipped > 0 {
            debug!(skipped, "skipped malformed credential lines");
        }
        added
    }

    /// Total number of distinct credentials held.
    pub fn total(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Constant-time membership check for a decoded `user:pass` candidate.
    /// Every entry is compared (no early return) so the check's timing does
    /// not depend on which entry, if any, matched.
    pub fn check(&self, candidate: &str) -> bool {
        let candidate = candidate.trim_end();
        let entries = self.entries.read().unwrap();
        let mut found = false;
        for entry in entries.iter() {
            let eq: bool = entry.as_bytes().ct_eq(candidate.as_bytes()).into();
            found |= eq;
        }
        found
    }
}

/// Decode a `Basic <base64>` Authorization header value into a `user:pass`
/// string.
pub fn decode_basic(header_value: &str) -> Result<String> {
    let rest = header_value
        .trim()
        .strip_prefix("Basic ")
        .ok_or_else(|| Error::malformed("Authorization header is not Basic"))?;
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, rest)
        .map_err(|e| Error::malformed(format!("invalid base64 in Authorization header: {}", e)))?;
    String::from_utf8(decoded)
        .map_err(|e| Error::malformed(format!("non-UTF8 Authorization payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_check() {
        let set = CredentialSet::new();
        assert_eq!(set.add(&["alice:secret", "bob:hunter2"]), 2);
        assert!(set.check("alice:secret"));
        assert!(set.check("bob:hunter2"));
        assert!(!set.check("eve:nope"));
    }

    #[test]
    fn test_add_idempotent() {
        let set = CredentialSet::new();
        set.add(&["alice:secret"]);
        assert_eq!(set.add(&["alice:secret"]), 0);
        assert_eq!(set.total(), 1);
    }

    #[test]
    fn test_add_skips_malformed() {
        let set = CredentialSet::new();
        assert_eq!(set.add(&["no-colon-here", "alice:secret"]), 1);
        assert_eq!(set.total(), 1);
    }

    #[test]
    fn test_check_trims_trailing_whitespace() {
        let set = CredentialSet::new();
        set.add(&["alice:secret"]);
        assert!(set.check("alice:secret\r\n"));
    }

    #[test]
    fn test_decode_basic() {
        let encoded = format!(
            "Basic {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "alice:secret")
        );
        assert_eq!(decode_basic(&encoded).unwrap(), "alice:secret");
    }

    #[test]
    fn test_decode_basic_rejects_non_basic() {
        assert!(decode_basic("Bearer abc").is_err());
    }
}
