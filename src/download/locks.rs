//! Per-model artifact locks
//!
//! Inference sessions hold a shared guard on the artifact they run against.
//! Replacing or deleting an artifact takes the exclusive guard, which waits until
//! every session referencing it has reached a terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub type SharedArtifactGuard = OwnedRwLockReadGuard<()>;
pub type ExclusiveArtifactGuard = OwnedRwLockWriteGuard<()>;

#[derive(Debug, Default, Clone)]
pub struct ArtifactLocks {
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl ArtifactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, model_id: &str) -> Arc<RwLock<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            locks
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    pub async fn shared(&self, model_id: &str) -> SharedArtifactGuard {
        self.lock_for(model_id).read_owned().await
    }

    pub async fn exclusive(&self, model_id: &str) -> ExclusiveArtifactGuard {
        self.lock_for(model_id).write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exclusive_waits_for_shared_holders() {
        let locks = ArtifactLocks::new();
        let reader = locks.shared("m").await;

        let writer_locks = locks.clone();
        let writer = tokio::spawn(async move {
            let _guard = writer_locks.exclusive("m").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        drop(reader);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_locks_are_per_model() {
        let locks = ArtifactLocks::new();
        let _reader = locks.shared("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.exclusive("b"))
            .await
            .unwrap();
    }
}
