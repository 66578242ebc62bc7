//! Cancellation registry for in-flight uploads and transcodes.
//!
//! Each long-running operation registers a [`CancelToken`] keyed by the
//! message it belongs to. Cancellation flips the token; the worker observes
//! it at its next checkpoint and unwinds with [`EngineError::Cancelled`].
//!
//! [`EngineError::Cancelled`]: crate::error::EngineError::Cancelled

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::machine::MachineKey;

/// Shared cancellation flag. Cheap to clone, checked cooperatively.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// At most one live token per message. Registering a new token for a key
/// cancels and replaces whatever was there.
#[derive(Default)]
pub struct CancellationRegistry {
    inner: Mutex<HashMap<MachineKey, CancelToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &MachineKey) -> CancelToken {
        let token = CancelToken::new();
        if let Some(previous) = self.lock().insert(key.clone(), token.clone()) {
            tracing::debug!(uid = %key.uid, "replacing live cancel token");
            previous.cancel();
        }
        token
    }

    /// Cancel the operation registered for a key, if any.
    pub fn cancel(&self, key: &MachineKey) -> bool {
        match self.lock().remove(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token after the operation finished on its own.
    pub fn release(&self, key: &MachineKey) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MachineKey, CancelToken>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estafette_shared::types::ConversationScope;

    fn key(uid: &str) -> MachineKey {
        MachineKey {
            scope: ConversationScope::Contact,
            uid: uid.into(),
        }
    }

    #[test]
    fn cancel_flips_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.register(&key("u1"));
        assert!(!token.is_cancelled());

        assert!(registry.cancel(&key("u1")));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_unknown_key_is_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(&key("nope")));
    }

    #[test]
    fn reregister_cancels_previous_token() {
        let registry = CancellationRegistry::new();
        let first = registry.register(&key("u1"));
        let second = registry.register(&key("u1"));

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn release_keeps_token_uncancelled() {
        let registry = CancellationRegistry::new();
        let token = registry.register(&key("u1"));
        registry.release(&key("u1"));

        assert!(!token.is_cancelled());
        assert!(registry.is_empty());
    }
}
