//! Per-user serialization
//!
//! Every mutating operation holds its user's lock for the whole
//! read-validate-write section, so two writers for the same user never
//! observe the same balance. Different users never contend.

use crate::{types::UserId, Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per user
#[derive(Debug)]
pub struct UserLocks {
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    timeout: Duration,
}

/// Held user lock; released on drop
#[derive(Debug)]
pub struct UserGuard {
    user_id: UserId,
    _guard: OwnedMutexGuard<()>,
}

impl UserGuard {
    /// Locked account
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

impl UserLocks {
    /// Create with acquisition timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Acquire `user_id`'s lock, failing with `RetryableConflict` after the
    /// configured timeout
    pub async fn acquire(&self, user_id: UserId) -> Result<UserGuard> {
        // Clone the Arc out so the DashMap shard lock is not held across await
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(UserGuard {
                user_id,
                _guard: guard,
            }),
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for user lock"
                );
                Err(Error::RetryableConflict { user_id })
            }
        }
    }

    /// Drop idle lock entries
    pub fn prune(&self) {
        // Only the map holds an idle lock
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Tracked users
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// No tracked users
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
