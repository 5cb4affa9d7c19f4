//! Process-wide driver counters.
//!
//! Counters are updated with relaxed atomics from the I/O and command paths
//! and read as a [`DriverMetrics`] snapshot. Idle and busy connection counts
//! are summed over the registered pools when the snapshot is taken, so they
//! are not coherent with each other under concurrent use.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::pool_manager::POOLS;

pub(crate) static COUNTERS: DriverCounters = DriverCounters::new();

/// Raw counters behind [`DriverMetrics`].
pub(crate) struct DriverCounters {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    total_commands: AtomicU64,
    prepared_commands: AtomicU64,
    current_commands: AtomicI64,
    failed_commands: AtomicU64,
    pools: AtomicU64,
}

impl DriverCounters {
    const fn new() -> Self {
        Self {
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            total_commands: AtomicU64::new(0),
            prepared_commands: AtomicU64::new(0),
            current_commands: AtomicI64::new(0),
            failed_commands: AtomicU64::new(0),
            pools: AtomicU64::new(0),
        }
    }

    pub fn record_bytes_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count a started command; the returned guard marks it finished.
    pub fn command_started(&self, prepared: bool) -> CommandInFlight<'_> {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        if prepared {
            self.prepared_commands.fetch_add(1, Ordering::Relaxed);
        }
        self.current_commands.fetch_add(1, Ordering::Relaxed);
        CommandInFlight { counters: self }
    }

    pub fn record_command_failed(&self) {
        self.failed_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_created(&self) {
        self.pools.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DriverMetrics {
        let (idle_connections, busy_connections) = POOLS
            .pools()
            .iter()
            .map(|pool| pool.stats())
            .fold((0, 0), |(idle, busy), s| (idle + s.idle, busy + s.busy));

        DriverMetrics {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            total_commands: self.total_commands.load(Ordering::Relaxed),
            prepared_commands: self.prepared_commands.load(Ordering::Relaxed),
            current_commands: self.current_commands.load(Ordering::Relaxed).max(0) as u64,
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
            pools: self.pools.load(Ordering::Relaxed),
            idle_connections,
            busy_connections,
        }
    }
}

/// Decrements the current-commands counter when dropped, including when a
/// command future is cancelled.
pub(crate) struct CommandInFlight<'a> {
    counters: &'a DriverCounters,
}

impl Drop for CommandInFlight<'_> {
    fn drop(&mut self) {
        self.counters.current_commands.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of the driver-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriverMetrics {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub total_commands: u64,
    /// Commands whose every statement ran on a server-side prepared statement.
    pub prepared_commands: u64,
    pub current_commands: u64,
    pub failed_commands: u64,
    /// Pools registered in the process-wide registry.
    pub pools: u64,
    pub idle_connections: usize,
    pub busy_connections: usize,
}

impl DriverMetrics {
    /// Share of commands that ran prepared, 0.0 before any command.
    pub fn prepared_commands_ratio(&self) -> f64 {
        if self.total_commands == 0 {
            return 0.0;
        }
        self.prepared_commands as f64 / self.total_commands as f64
    }
}

/// Current driver-wide counters.
pub fn driver_metrics() -> DriverMetrics {
    COUNTERS.snapshot()
}
