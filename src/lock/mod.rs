//! Token-based distributed mutual exclusion.
//!
//! A [`DistributedLock`] elects at most one holder per key on top of a shared
//! [`LockStore`]. Ownership is proven only by the random token stored under
//! the key; every mutation after acquisition is a compare-and-mutate on that
//! token, so a holder whose TTL lapsed can never extend or delete a lock that
//! now belongs to someone else.
//!
//! This is a best-effort mutual-exclusion optimisation, not a consensus
//! primitive. It reduces duplicate work but does not guarantee it: a holder
//! paused past its TTL keeps believing it owns the key, and a store that fails
//! over to a replica that missed the last write can briefly admit two owners.
//! Anything that must not happen twice needs its own guard downstream (for
//! scheduled jobs, the single-in-flight consumer and the idempotent
//! reconciliation predicates).

mod memory;

pub use memory::InMemoryLockStore;

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// The three atomic primitives a lock backend must provide.
///
/// Each call must be a single atomic operation in the backend; a
/// check-then-act sequence across two calls would reopen the races the
/// token protocol exists to close.
pub trait LockStore: Send + Sync {
    /// Store `token` under `key` with the given TTL iff no unexpired entry
    /// exists. Returns whether the entry was written.
    fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Reset the TTL of `key` iff it is unexpired and still holds `token`.
    fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` iff it is unexpired and still holds `token`.
    fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool>;
}

/// Proof of a successful acquisition.
///
/// A handle is a capability, not a reference: once its TTL has passed the
/// key may already belong to another holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

/// Polling parameters for [`DistributedLock::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub max_wait: Duration,
    pub retry_delay: Duration,
    /// Upper bound of the uniform random delay added to each retry.
    pub jitter: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Non-blocking acquisition attempt.
    ///
    /// `Ok(None)` means the key is currently held by someone (possibly us
    /// through another handle). That is the normal "not our turn" answer.
    pub fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_if_absent(key, &token, ttl)? {
            debug!("Acquired lock {}", key);
            Ok(Some(LockHandle {
                key: key.to_string(),
                token,
                ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Poll [`try_acquire`](Self::try_acquire) until it succeeds or
    /// `options.max_wait` elapses.
    ///
    /// Every retry sleeps `retry_delay` plus a random `[0, jitter]` so that
    /// many contenders started together spread out instead of hammering the
    /// store in lockstep. The last sleep is clipped to the deadline.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        options: AcquireOptions,
    ) -> Result<Option<LockHandle>> {
        let deadline = tokio::time::Instant::now() + options.max_wait;
        loop {
            if let Some(handle) = self.try_acquire(key, ttl)? {
                return Ok(Some(handle));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!("Gave up acquiring lock {} after {:?}", key, options.max_wait);
                return Ok(None);
            }
            let wait = (options.retry_delay + random_jitter(options.jitter)).min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }

    /// Extend the TTL of a lock we still own. `Ok(false)` if ownership was lost.
    pub fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let renewed = self
            .store
            .compare_and_extend(&handle.key, &handle.token, ttl)?;
        if !renewed {
            debug!("Lock {} no longer owned, renew skipped", handle.key);
        }
        Ok(renewed)
    }

    /// Release a lock we still own. Releasing a lost lock is a no-op that
    /// returns `Ok(false)`.
    pub fn release(&self, handle: &LockHandle) -> Result<bool> {
        let released = self.store.compare_and_delete(&handle.key, &handle.token)?;
        if !released {
            debug!("Lock {} no longer owned, release skipped", handle.key);
        }
        Ok(released)
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
