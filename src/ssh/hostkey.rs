//! Host-key verification policy.
//!
//! The known-hosts table is process-global by necessity: any caller
//! dialing a given host must observe the same remembered key, so it
//! lives behind a single reader-writer lock shared by every
//! [`SshLayer`](super::SshLayer) instance in the process rather than
//! per-instance state.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Trust-on-first-use vs. insecure (test-only) host-key handling.
pub trait HostKeyPolicy: Send + Sync {
    /// Called with the host's `host:port` identity and the key bytes
    /// presented during the handshake. Returns `Ok(())` to accept the
    /// connection or `Err` to reject it.
    fn verify(&self, host_id: &str, presented_key: &[u8]) -> Result<()>;
}

/// Accept the first key seen for a host, remember it, and reject any
/// later handshake presenting a different key.
#[derive(Default)]
pub struct Tofu {
    known_hosts: RwLock<HashMap<String, Vec<u8>>>,
}

impl Tofu {
    pub fn new() -> Self {
        Tofu::default()
    }
}

impl HostKeyPolicy for Tofu {
    fn verify(&self, host_id: &str, presented_key: &[u8]) -> Result<()> {
        {
            let known = self
                .known_hosts
                .read()
                .expect("known-hosts lock poisoned");
            if let Some(remembered) = known.get(host_id) {
                return if remembered.as_slice() == presented_key {
                    Ok(())
                } else {
                    Err(Error::Connectivity(format!(
                        "host key for {host_id} does not match the remembered key"
                    )))
                };
            }
        }
        let mut known = self.known_hosts.write().expect("known-hosts lock poisoned");
        known
            .entry(host_id.to_string())
            .or_insert_with(|| presented_key.to_vec());
        Ok(())
    }
}

/// Accepts any key, logging a warning. Never used outside tests.
#[derive(Default)]
pub struct Insecure;

impl HostKeyPolicy for Insecure {
    fn verify(&self, host_id: &str, _presented_key: &[u8]) -> Result<()> {
        tracing::warn!(host = host_id, "accepting host key without verification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tofu_remembers_first_key_and_rejects_mismatch() {
        let policy = Tofu::new();
        policy.verify("10.0.0.1:22", b"key-a").unwrap();
        policy.verify("10.0.0.1:22", b"key-a").unwrap();
        let err = policy.verify("10.0.0.1:22", b"key-b").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
    }

    #[test]
    fn insecure_always_accepts() {
        let policy = Insecure;
        policy.verify("10.0.0.1:22", b"anything").unwrap();
        policy.verify("10.0.0.1:22", b"something-else").unwrap();
    }
}
