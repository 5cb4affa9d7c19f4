//! Process-wide pool registry.
//!
//! Pools are keyed by connection string and never removed, only cleared.
//! Entries live in an append-only table of doubling segments, so readers
//! scan published entries without locking while inserts serialize on a
//! mutex. A published entry never moves.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PgError, PgResult};
use crate::metrics::COUNTERS;
use crate::pool::ConnectorPool;
use crate::settings::ConnectionSettings;

const FIRST_SEGMENT_LEN: usize = 10;
const SEGMENT_COUNT: usize = 20;

/// Registry used by [`crate::pool_for`].
pub(crate) static POOLS: Lazy<PoolManager> = Lazy::new(PoolManager::new);

struct Entry {
    key: String,
    pool: ConnectorPool,
}

pub struct PoolManager {
    segments: [OnceCell<Box<[OnceCell<Entry>]>>; SEGMENT_COUNT],
    /// Number of published entries.
    len: AtomicUsize,
    insert_lock: Mutex<()>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceCell::new()),
            len: AtomicUsize::new(0),
            insert_lock: Mutex::new(()),
        }
    }

    /// Look a pool up without locking.
    pub fn get(&self, key: &str) -> Option<ConnectorPool> {
        self.entries()
            .find(|entry| entry.key == key)
            .map(|entry| entry.pool.clone())
    }

    /// Return the pool for `conn_str`, creating it from the parsed settings
    /// on first use.
    pub fn get_or_create(&self, conn_str: &str) -> PgResult<ConnectorPool> {
        if let Some(pool) = self.get(conn_str) {
            return Ok(pool);
        }
        self.insert_with(conn_str, || ConnectionSettings::parse(conn_str))
    }

    /// Return the pool under `key`, creating it from `settings` if absent.
    pub fn get_or_insert(&self, key: &str, settings: ConnectionSettings) -> PgResult<ConnectorPool> {
        if let Some(pool) = self.get(key) {
            return Ok(pool);
        }
        self.insert_with(key, || Ok(settings))
    }

    fn insert_with(
        &self,
        key: &str,
        settings: impl FnOnce() -> PgResult<ConnectionSettings>,
    ) -> PgResult<ConnectorPool> {
        let _guard = self.insert_lock.lock();
        // Another thread may have inserted while we waited
        if let Some(pool) = self.get(key) {
            return Ok(pool);
        }

        let pool = ConnectorPool::new(settings()?)?;
        let index = self.len.load(Ordering::Acquire);
        let (segment, offset) = locate(index)
            .ok_or_else(|| PgError::Config("Too many distinct connection pools".to_string()))?;

        let slots = self.segments[segment]
            .get_or_init(|| (0..segment_len(segment)).map(|_| OnceCell::new()).collect());
        if slots[offset]
            .set(Entry {
                key: key.to_string(),
                pool: pool.clone(),
            })
            .is_err()
        {
            return Err(PgError::protocol("Pool registry slot already taken"));
        }
        self.len.store(index + 1, Ordering::Release);
        COUNTERS.record_pool_created();

        debug!(pools = index + 1, pool = %pool.settings().user_facing_connection_string(), "registered pool");
        Ok(pool)
    }

    /// Clear the pool under `key`; false if there is none.
    pub fn clear(&self, key: &str) -> bool {
        match self.get(key) {
            Some(pool) => {
                pool.clear();
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) {
        for entry in self.entries() {
            entry.pool.clear();
        }
    }

    pub fn pools(&self) -> Vec<ConnectorPool> {
        self.entries().map(|entry| entry.pool.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        let len = self.len.load(Ordering::Acquire);
        (0..len).filter_map(move |index| {
            let (segment, offset) = locate(index)?;
            self.segments[segment].get()?.get(offset)?.get()
        })
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_len(segment: usize) -> usize {
    FIRST_SEGMENT_LEN << segment
}

/// Segment and offset of the `index`th entry.
fn locate(index: usize) -> Option<(usize, usize)> {
    let mut start = 0;
    for segment in 0..SEGMENT_COUNT {
        let len = segment_len(segment);
        if index < start + len {
            return Some((segment, index - start));
        }
        start += len;
    }
    None
}
