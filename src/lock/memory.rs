use super::LockStore;
use crate::clock::Clock;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct LockEntry {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Process-local lock store. Every primitive runs under one mutex, which
/// makes it atomic for all handles sharing this instance.
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, LockEntry>) -> T) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("In-memory lock store mutex poisoned"))?;
        Ok(f(&mut entries))
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>> {
        Ok(self.clock.now() + chrono::Duration::from_std(ttl)?)
    }
}

impl LockStore for InMemoryLockStore {
    fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl)?;
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                entries.insert(
                    key.to_string(),
                    LockEntry {
                        token: token.to_string(),
                        expires_at,
                    },
                );
                true
            }
        })
    }

    fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl)?;
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if entry.token == token && entry.expires_at > now => {
                entry.expires_at = expires_at;
                true
            }
            _ => false,
        })
    }

    fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let now = self.clock.now();
        self.with_entries(|entries| {
            let owned = matches!(
                entries.get(key),
                Some(entry) if entry.token == token && entry.expires_at > now
            );
            if owned {
                entries.remove(key);
            }
            owned
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    #[test]
    fn test_expired_entry_is_treated_as_absent() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryLockStore::new(clock.clone());
        let ttl = Duration::from_secs(5);

        assert!(store.set_if_absent("k", "a", ttl).unwrap());
        clock.advance(chrono::Duration::seconds(5));

        assert!(!store.compare_and_extend("k", "a", ttl).unwrap());
        assert!(!store.compare_and_delete("k", "a").unwrap());
        assert!(store.set_if_absent("k", "b", ttl).unwrap());
        assert!(store.compare_and_delete("k", "b").unwrap());
    }
}
