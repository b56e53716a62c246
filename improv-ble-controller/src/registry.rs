//! Registry: one active session per device, and the devices this controller already knows

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
#[error("a provisioning session is already active for {0}")]
pub struct ConcurrentSessionError(pub String);

#[derive(Debug, Default)]
struct Inner {
    active: HashSet<String>,
    known: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

fn normalize(address: &str) -> String {
    address.to_ascii_uppercase()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new();
        for address in addresses {
            registry.mark_known(address.as_ref());
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `address` for a new session. Rejected, not queued, if one is active.
    pub fn acquire(&self, address: &str) -> Result<SessionGuard, ConcurrentSessionError> {
        let address = normalize(address);
        if !self.lock().active.insert(address.clone()) {
            return Err(ConcurrentSessionError(address));
        }
        Ok(SessionGuard {
            registry: self.clone(),
            address,
        })
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.lock().active.contains(&normalize(address))
    }

    pub fn mark_known(&self, address: &str) {
        self.lock().known.insert(normalize(address));
    }

    pub fn is_known(&self, address: &str) -> bool {
        self.lock().known.contains(&normalize(address))
    }
}

/// Held by a session, releases the device on drop
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    address: String,
}

impl SessionGuard {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_known(&self) -> bool {
        self.registry.is_known(&self.address)
    }

    pub fn mark_known(&self) {
        self.registry.mark_known(&self.address)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().active.remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_is_rejected_until_first_is_dropped() {
        let registry = SessionRegistry::new();
        let guard = registry.acquire("aa:bb:cc:dd:ee:ff").unwrap();
        assert!(registry.is_active("AA:BB:CC:DD:EE:FF"));

        let err = registry.acquire("AA:BB:CC:DD:EE:FF").unwrap_err();
        assert_eq!(err.0, "AA:BB:CC:DD:EE:FF");

        // other devices are independent
        let _other = registry.acquire("11:22:33:44:55:66").unwrap();

        drop(guard);
        assert!(!registry.is_active("AA:BB:CC:DD:EE:FF"));
        assert!(registry.acquire("AA:BB:CC:DD:EE:FF").is_ok());
    }

    #[test]
    fn known_devices() {
        let registry = SessionRegistry::with_known(["aa:bb"]);
        assert!(registry.is_known("AA:BB"));
        let guard = registry.acquire("cc:dd").unwrap();
        assert!(!guard.is_known());
        guard.mark_known();
        assert!(registry.is_known("CC:DD"));
    }
}
