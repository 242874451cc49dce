//! In-memory key pool and job reporter backed by a `Vec`/`HashMap` behind a `Mutex`.

use crate::KeyInfo;
use async_trait::async_trait;
use rand::seq::SliceRandom as _;
use rendergate_types::{
    ApiKey, GenError, JobRef, JobReporter, KeyPool,
    traits::Result,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    key: ApiKey,
    label: Option<String>,
    /// `Some(until)` means the key is cooling down.
    exhausted_until: Option<Instant>,
    lease_count: u64,
}

impl Entry {
    fn is_available(&self, now: Instant) -> bool {
        self.exhausted_until.is_none_or(|until| now >= until)
    }
}

/// An in-memory [`KeyPool`] for tests and single-process deployments.
///
/// Leases pick uniformly at random among keys that are not cooling down, so
/// concurrent callers spread across the pool instead of converging on one key.
pub struct InMemoryKeyPool {
    entries: Mutex<Vec<Entry>>,
    /// How long a key stays out of rotation after being marked exhausted.
    cooldown: Duration,
}

impl InMemoryKeyPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            cooldown,
        }
    }

    /// Creates a pool seeded with unlabelled keys.
    #[must_use]
    pub fn with_keys<I, K>(keys: I, cooldown: Duration) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ApiKey>,
    {
        let entries = keys
            .into_iter()
            .map(|k| Entry {
                key: k.into(),
                label: None,
                exhausted_until: None,
                lease_count: 0,
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
            cooldown,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Entry>>> {
        self.entries
            .lock()
            .map_err(|_| GenError::Storage("key pool lock poisoned".into()))
    }

    /// Adds a key, or updates the label of an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`GenError::Storage`] if the pool lock is poisoned.
    pub fn add_key(&self, key: impl Into<ApiKey>, label: Option<String>) -> Result<()> {
        let key = key.into();
        let mut entries = self.lock()?;
        if let Some(entry) = entries.iter_mut().find(|e| e.key == key) {
            entry.label = label.or(entry.label.take());
        } else {
            entries.push(Entry {
                key,
                label,
                exhausted_until: None,
                lease_count: 0,
            });
        }
        Ok(())
    }

    /// Removes a key. Returns `true` if it was present.
    ///
    /// # Errors
    ///
    /// Returns [`GenError::Storage`] if the pool lock is poisoned.
    pub fn remove_key(&self, key: &ApiKey) -> Result<bool> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|e| &e.key != key);
        Ok(entries.len() != before)
    }

    /// Clears every cooldown.
    ///
    /// # Errors
    ///
    /// Returns [`GenError::Storage`] if the pool lock is poisoned.
    pub fn reset_exhausted(&self) -> Result<()> {
        for entry in self.lock()?.iter_mut() {
            entry.exhausted_until = None;
        }
        Ok(())
    }

    /// Display-safe listing of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`GenError::Storage`] if the pool lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<KeyInfo>> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .iter()
            .map(|e| KeyInfo {
                fingerprint: e.key.fingerprint(),
                label: e.label.clone(),
                exhausted: !e.is_available(now),
                lease_count: e.lease_count,
            })
            .collect())
    }
}

#[async_trait]
impl KeyPool for InMemoryKeyPool {
    async fn lease(&self) -> Result<Option<ApiKey>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let available: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_available(now))
            .map(|(i, _)| i)
            .collect();
        let Some(&idx) = available.choose(&mut rand::thread_rng()) else {
            return Ok(None);
        };
        let entry = &mut entries[idx];
        entry.exhausted_until = None;
        entry.lease_count += 1;
        Ok(Some(entry.key.clone()))
    }

    async fn mark_exhausted(&self, key: &ApiKey) -> Result<()> {
        let until = Instant::now() + self.cooldown;
        if let Some(entry) = self.lock()?.iter_mut().find(|e| &e.key == key) {
            entry.exhausted_until = Some(until);
            tracing::debug!(key = %key, cooldown = ?self.cooldown, "key marked exhausted");
        }
        Ok(())
    }
}

/// An in-memory [`JobReporter`] that remembers the key fingerprint per job.
#[derive(Default)]
pub struct InMemoryJobReporter {
    reports: Mutex<HashMap<JobRef, String>>,
}

impl InMemoryJobReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of the key last reported for `job`.
    #[must_use]
    pub fn key_for(&self, job: &JobRef) -> Option<String> {
        self.reports.lock().ok()?.get(job).cloned()
    }
}

#[async_trait]
impl JobReporter for InMemoryJobReporter {
    async fn report_key_for_job(&self, job: &JobRef, key: &ApiKey) -> Result<()> {
        self.reports
            .lock()
            .map_err(|_| GenError::Storage("job report lock poisoned".into()))?
            .insert(job.clone(), key.fingerprint());
        Ok(())
    }
}
