use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::LockError;

/// Proof of holding a named lock. Hand it back to [`LockCoordinator::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    id: u64,
}

impl LockToken {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Non-blocking, named, exclusive lock serializing ticks across dispatcher
/// instances.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Try to take `name` without waiting.
    ///
    /// `Ok(None)` means the lock is held elsewhere; that is not an error.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, LockError>;

    async fn release(&self, token: LockToken) -> Result<(), LockError>;
}

/// Process-local lock. Sufficient when exactly one dispatcher process runs.
#[derive(Default)]
pub struct LocalLock {
    held: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, name: &str) -> bool {
        self.held.lock().await.contains_key(name)
    }
}

#[async_trait]
impl LockCoordinator for LocalLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let mut held = self.held.lock().await;
        if held.contains_key(name) {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        held.insert(name.to_string(), id);
        Ok(Some(LockToken::new(name, id)))
    }

    async fn release(&self, token: LockToken) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        match held.get(token.name()) {
            Some(id) if *id == token.id() => {
                held.remove(token.name());
                Ok(())
            }
            _ => Err(LockError::NotHeld(token.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let lock = LocalLock::new();
        let token = lock.try_acquire("worker").await.unwrap().expect("first acquire");
        assert!(lock.try_acquire("worker").await.unwrap().is_none());
        assert!(lock.try_acquire("other").await.unwrap().is_some());

        lock.release(token).await.unwrap();
        assert!(lock.try_acquire("worker").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_a_newer_holder() {
        let lock = LocalLock::new();
        let first = lock.try_acquire("worker").await.unwrap().unwrap();
        let forged = LockToken::new("worker", first.id() + 1);
        assert!(matches!(lock.release(forged).await, Err(LockError::NotHeld(_))));
        assert!(lock.is_held("worker").await);
    }
}
