//! Connector pool.
//!
//! One pool serves one connection-string identity. Busy, idle and waiting
//! counts live in a single packed atomic updated by compare-and-swap, so
//! the allocation fast path never takes a pool-wide lock. Idle connectors
//! sit in a fixed array of `max_pool_size` slots.
//!
//! When the pool is exhausted, requests queue as FIFO waiters. A release
//! hands its connector (or, if the connector had to be closed, its slot)
//! straight to the oldest waiter instead of the idle array, so a connector
//! never idles while someone is waiting for it.
//!
//! The same allocation routine serves async callers, which suspend on a
//! [`Notify`], and blocking callers, which park their thread on a condition
//! variable. See [`IoMode`].

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::command::{Command, QueryResult, Transaction};
use crate::connector::{CancelToken, Connector, ConnectorState};
use crate::error::{PgError, PgResult};
use crate::settings::ConnectionSettings;
use crate::types::{BuiltinTypeMapper, PgValue, TypeMapper};

/// How a caller waits when the pool is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoMode {
    /// Park the calling thread.
    Blocking,
    /// Suspend the calling task.
    Async,
}

/// Identity of an ambient transaction that connectors can be enlisted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnlistmentId(pub u64);

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiting: usize,
}

// ============================================================================
// Packed State
// ============================================================================

/// Busy in bits 0..16, idle in 16..32, waiting in 32..64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolState {
    busy: u16,
    idle: u16,
    waiting: u32,
}

impl PoolState {
    fn unpack(v: u64) -> Self {
        Self {
            busy: (v & 0xFFFF) as u16,
            idle: ((v >> 16) & 0xFFFF) as u16,
            waiting: (v >> 32) as u32,
        }
    }

    fn pack(self) -> u64 {
        u64::from(self.busy) | (u64::from(self.idle) << 16) | (u64::from(self.waiting) << 32)
    }

    fn total(self) -> usize {
        usize::from(self.busy) + usize::from(self.idle)
    }
}

struct AtomicPoolState(AtomicU64);

impl AtomicPoolState {
    fn load(&self) -> PoolState {
        PoolState::unpack(self.0.load(Ordering::Acquire))
    }

    /// Apply `f` with a CAS loop; `None` from `f` aborts. Returns the new
    /// state on success.
    fn update(&self, mut f: impl FnMut(PoolState) -> Option<PoolState>) -> Option<PoolState> {
        let mut next = None;
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                next = f(PoolState::unpack(v));
                next.map(PoolState::pack)
            })
            .ok()
            .and(next)
    }
}

// ============================================================================
// Waiters
// ============================================================================

/// What a release hands to a waiter.
enum Handoff {
    Connector(Connector),
    /// A busy slot whose connector was closed; the waiter opens a new one.
    Slot,
}

enum WaiterState {
    Pending,
    Delivered(Handoff),
    Taken,
    Cancelled,
}

enum CancelOutcome {
    WasPending,
    Delivered(Handoff),
    Finished,
}

struct Waiter {
    state: Mutex<WaiterState>,
    condvar: Condvar,
    notify: Notify,
}

impl Waiter {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::Pending),
            condvar: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Give `handoff` to this waiter; returned back if it already left.
    fn deliver(&self, handoff: Handoff) -> Result<(), Handoff> {
        let mut state = self.state.lock();
        if !matches!(*state, WaiterState::Pending) {
            return Err(handoff);
        }
        *state = WaiterState::Delivered(handoff);
        drop(state);
        self.condvar.notify_one();
        self.notify.notify_one();
        Ok(())
    }

    fn take(&self) -> Option<Handoff> {
        let mut state = self.state.lock();
        take_delivered(&mut state)
    }

    fn cancel(&self) -> CancelOutcome {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, WaiterState::Taken) {
            WaiterState::Pending => {
                *state = WaiterState::Cancelled;
                CancelOutcome::WasPending
            }
            WaiterState::Delivered(handoff) => CancelOutcome::Delivered(handoff),
            other => {
                *state = other;
                CancelOutcome::Finished
            }
        }
    }
}

fn take_delivered(state: &mut WaiterState) -> Option<Handoff> {
    match std::mem::replace(state, WaiterState::Taken) {
        WaiterState::Delivered(handoff) => Some(handoff),
        other => {
            *state = other;
            None
        }
    }
}

/// Withdraws a queued waiter if the allocating future is dropped.
struct WaitRegistration<'a> {
    pool: &'a PoolInner,
    waiter: Arc<Waiter>,
    armed: bool,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_wait(&self.waiter);
        }
    }
}

/// A busy slot held while its connector opens. Freed again unless the open
/// succeeds, including when the allocating future is dropped mid-open.
struct SlotReservation<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.hand_over(Handoff::Slot);
        }
    }
}

// ============================================================================
// Pruning
// ============================================================================

#[derive(Debug, Default)]
struct PruningState {
    enabled: bool,
    /// Bumped on every enable; a timer task from an older generation exits.
    generation: u64,
    samples: Vec<usize>,
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PoolInner {
    settings: Arc<ConnectionSettings>,
    type_mapper: Arc<dyn TypeMapper>,
    state: AtomicPoolState,
    idle: Box<[Mutex<Option<Connector>>]>,
    waiters_tx: Sender<Arc<Waiter>>,
    waiters_rx: Receiver<Arc<Waiter>>,
    /// Held while counting and queueing a waiter, and while purging
    /// cancelled ones.
    enqueue_lock: Mutex<()>,
    clear_counter: AtomicU64,
    pruning: Mutex<PruningState>,
    enlisted: Mutex<HashMap<EnlistmentId, Vec<Connector>>>,
    runtime: OnceCell<Handle>,
}

impl PoolInner {
    fn max(&self) -> usize {
        self.settings.max_pool_size
    }

    fn stats(&self) -> PoolStats {
        let s = self.state.load();
        PoolStats {
            total: s.total(),
            idle: usize::from(s.idle),
            busy: usize::from(s.busy),
            waiting: s.waiting as usize,
        }
    }

    fn remember_runtime(&self) {
        if self.runtime.get().is_none() {
            if let Ok(handle) = Handle::try_current() {
                let _ = self.runtime.set(handle);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    async fn allocate(self: &Arc<Self>, timeout: Option<Duration>, mode: IoMode) -> PgResult<Connector> {
        let max = self.max();

        loop {
            if let Some(connector) = self.try_take_idle() {
                if self.is_reusable(&connector) {
                    return Ok(connector);
                }
                self.discard(connector);
                continue;
            }

            let reserved = self
                .state
                .update(|s| (s.idle == 0 && s.total() < max).then(|| PoolState { busy: s.busy + 1, ..s }));
            if reserved.is_some() {
                return self.open_reserved().await;
            }

            let Some(waiter) = self.enqueue_waiter(max) else {
                continue;
            };

            match self.wait(waiter, timeout, mode).await? {
                Handoff::Connector(connector) => return Ok(connector),
                Handoff::Slot => return self.open_reserved().await,
            }
        }
    }

    /// Count and queue a waiter if the pool is still exhausted.
    fn enqueue_waiter(&self, max: usize) -> Option<Arc<Waiter>> {
        let _enqueue = self.enqueue_lock.lock();
        let state = self.state.update(|s| {
            (s.idle == 0 && s.total() >= max).then(|| PoolState {
                waiting: s.waiting + 1,
                ..s
            })
        })?;

        trace!(waiting = state.waiting, "pool exhausted, queueing waiter");
        let waiter = Arc::new(Waiter::new());
        // The receiver lives as long as the pool, so send cannot fail.
        let _ = self.waiters_tx.send(Arc::clone(&waiter));
        Some(waiter)
    }

    /// Reserve an idle connector and take it out of its slot.
    fn try_take_idle(&self) -> Option<Connector> {
        self.state.update(|s| {
            (s.idle > 0).then(|| PoolState {
                busy: s.busy + 1,
                idle: s.idle - 1,
                ..s
            })
        })?;

        let len = self.idle.len();
        let seed = slot_seed(len);
        loop {
            for i in 0..len {
                if let Some(mut slot) = self.idle[(seed + i) % len].try_lock() {
                    if let Some(connector) = slot.take() {
                        return Some(connector);
                    }
                }
            }
            // A release counted its connector but has not placed it yet
            std::thread::yield_now();
        }
    }

    /// Open a connector for a busy slot already reserved by the caller.
    async fn open_reserved(self: &Arc<Self>) -> PgResult<Connector> {
        let mut reservation = SlotReservation {
            pool: self,
            armed: true,
        };
        let epoch = self.clear_counter.load(Ordering::Acquire);
        match Connector::open(Arc::clone(&self.settings), epoch, Arc::clone(&self.type_mapper)).await {
            Ok(connector) => {
                reservation.armed = false;
                self.maybe_enable_pruning();
                Ok(connector)
            }
            Err(e) => {
                debug!(error = %e, "failed to open connector, releasing its slot");
                Err(e)
            }
        }
    }

    async fn wait(&self, waiter: Arc<Waiter>, timeout: Option<Duration>, mode: IoMode) -> PgResult<Handoff> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut registration = WaitRegistration {
            pool: self,
            waiter,
            armed: true,
        };

        let delivered = match mode {
            IoMode::Async => wait_async(&registration.waiter, deadline).await,
            IoMode::Blocking => wait_blocking(&registration.waiter, deadline),
        };
        registration.armed = false;

        if let Some(handoff) = delivered {
            return Ok(handoff);
        }
        match registration.waiter.cancel() {
            // Delivered just as the deadline passed
            CancelOutcome::Delivered(handoff) => Ok(handoff),
            outcome => {
                if matches!(outcome, CancelOutcome::WasPending) {
                    self.withdraw_waiter();
                }
                let timeout = timeout.unwrap_or_default();
                warn!(
                    max = self.max(),
                    timeout_secs = timeout.as_secs_f64(),
                    "timed out waiting for a pooled connector"
                );
                Err(PgError::PoolExhausted {
                    max: self.max(),
                    timeout,
                })
            }
        }
    }

    fn abandon_wait(&self, waiter: &Waiter) {
        match waiter.cancel() {
            CancelOutcome::WasPending => self.withdraw_waiter(),
            CancelOutcome::Delivered(handoff) => {
                trace!("waiter abandoned after handoff, redelivering");
                self.hand_over(handoff);
            }
            CancelOutcome::Finished => {}
        }
    }

    fn decrement_waiting(&self) -> Option<PoolState> {
        self.state.update(|s| {
            Some(PoolState {
                waiting: s.waiting.saturating_sub(1),
                ..s
            })
        })
    }

    /// Uncount a cancelled waiter. The last one out empties the queue of
    /// cancelled entries.
    fn withdraw_waiter(&self) {
        if self.decrement_waiting().is_some_and(|s| s.waiting == 0) {
            self.purge_cancelled_waiters();
        }
    }

    fn purge_cancelled_waiters(&self) {
        let _enqueue = self.enqueue_lock.lock();
        // Every queued waiter is counted until it is delivered or cancelled,
        // so with none counted the queue holds only cancelled entries.
        if self.state.load().waiting > 0 {
            return;
        }
        let purged = self.waiters_rx.try_iter().count();
        if purged > 0 {
            trace!(purged, "dropped cancelled waiters");
        }
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    fn is_reusable(&self, connector: &Connector) -> bool {
        connector.state() == ConnectorState::Ready
            && connector.clear_counter() == self.clear_counter.load(Ordering::Acquire)
    }

    fn release(&self, mut connector: Connector) {
        if !self.is_reusable(&connector) {
            self.discard(connector);
            return;
        }
        connector.schedule_reset();
        self.hand_over(Handoff::Connector(connector));
    }

    /// Close a busy connector and free its slot.
    fn discard(&self, connector: Connector) {
        debug!(
            connector_id = connector.id(),
            state = ?connector.state(),
            stale = connector.clear_counter() != self.clear_counter.load(Ordering::Acquire),
            "discarding connector"
        );
        self.close_connector(connector);
        self.hand_over(Handoff::Slot);
    }

    fn close_connector(&self, mut connector: Connector) {
        let handle = self.runtime.get().cloned().or_else(|| Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn(async move { connector.close().await });
            }
            None => warn!(
                connector_id = connector.id(),
                "no runtime to send Terminate, dropping the socket"
            ),
        }
    }

    /// Give a busy connector or slot to the oldest waiter, or return it to
    /// the pool when nobody waits.
    fn hand_over(&self, mut handoff: Handoff) {
        loop {
            let state = self.state.load();
            if state.waiting > 0 {
                match self.waiters_rx.try_recv() {
                    Ok(waiter) => match waiter.deliver(handoff) {
                        Ok(()) => {
                            self.decrement_waiting();
                            return;
                        }
                        // Cancelled; try the next one
                        Err(back) => handoff = back,
                    },
                    // The waiter is counted but not queued yet
                    Err(TryRecvError::Empty) => std::thread::yield_now(),
                    Err(TryRecvError::Disconnected) => return,
                }
                continue;
            }

            match handoff {
                Handoff::Connector(connector) => {
                    let placed = self.state.update(|s| {
                        (s.waiting == 0).then(|| PoolState {
                            busy: s.busy.saturating_sub(1),
                            idle: s.idle + 1,
                            ..s
                        })
                    });
                    if placed.is_none() {
                        handoff = Handoff::Connector(connector);
                        continue;
                    }
                    self.place_idle(connector);
                    return;
                }
                Handoff::Slot => {
                    let freed = self.state.update(|s| {
                        (s.waiting == 0).then(|| PoolState {
                            busy: s.busy.saturating_sub(1),
                            ..s
                        })
                    });
                    let Some(state) = freed else {
                        continue;
                    };
                    if state.total() <= self.settings.min_pool_size {
                        self.disable_pruning();
                    }
                    return;
                }
            }
        }
    }

    /// Put a counted idle connector into a free slot.
    fn place_idle(&self, mut connector: Connector) {
        connector.touch_release_timestamp();
        let len = self.idle.len();
        let seed = slot_seed(len);
        loop {
            for i in 0..len {
                let mut slot = self.idle[(seed + i) % len].lock();
                if slot.is_none() {
                    *slot = Some(connector);
                    return;
                }
            }
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------------
    // Clear and prune
    // ------------------------------------------------------------------------

    fn clear(&self) {
        let epoch = self.clear_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let mut closed = 0;
        while let Some(connector) = self.try_take_idle() {
            self.discard(connector);
            closed += 1;
        }
        debug!(epoch, closed, "pool cleared");
    }

    fn maybe_enable_pruning(self: &Arc<Self>) {
        if self.state.load().total() <= self.settings.min_pool_size {
            return;
        }
        let generation = {
            let mut pruning = self.pruning.lock();
            if pruning.enabled {
                return;
            }
            pruning.enabled = true;
            pruning.generation += 1;
            pruning.samples.clear();
            pruning.generation
        };

        let Some(handle) = self.runtime.get().cloned().or_else(|| Handle::try_current().ok()) else {
            debug!("no runtime available, idle pruning disabled");
            return;
        };
        let interval = self.settings.connection_pruning_interval;
        let weak: Weak<PoolInner> = Arc::downgrade(self);
        trace!(generation, "idle pruning enabled");
        handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if !pool.prune_tick(generation) {
                    break;
                }
            }
        });
    }

    fn disable_pruning(&self) {
        let mut pruning = self.pruning.lock();
        if pruning.enabled {
            trace!("idle pruning disabled");
            pruning.enabled = false;
            pruning.samples.clear();
        }
    }

    /// Take one idle-count sample; every `sample_size` samples close the
    /// median count of idle connectors, oldest first, down to the minimum.
    /// Returns false once the timer of `generation` should stop.
    fn prune_tick(&self, generation: u64) -> bool {
        let to_prune = {
            let mut pruning = self.pruning.lock();
            if !pruning.enabled || pruning.generation != generation {
                return false;
            }
            pruning.samples.push(usize::from(self.state.load().idle));
            if pruning.samples.len() < self.settings.pruning_sample_size() {
                return true;
            }
            let mut samples = std::mem::take(&mut pruning.samples);
            samples.sort_unstable();
            samples[samples.len().div_ceil(2) - 1]
        };

        let mut pruned = 0;
        for _ in 0..to_prune {
            if self.state.load().total() <= self.settings.min_pool_size {
                break;
            }
            let Some(connector) = self.take_oldest_idle() else {
                break;
            };
            self.close_connector(connector);
            self.hand_over(Handoff::Slot);
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, median = to_prune, stats = %self.stats_line(), "pruned idle connectors");
        }

        let pruning = self.pruning.lock();
        pruning.enabled && pruning.generation == generation
    }

    fn take_oldest_idle(&self) -> Option<Connector> {
        self.state.update(|s| {
            (s.idle > 0 && s.total() > self.settings.min_pool_size).then(|| PoolState {
                busy: s.busy + 1,
                idle: s.idle - 1,
                ..s
            })
        })?;

        loop {
            let oldest = self
                .idle
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.lock().as_ref().map(|c| (i, c.release_timestamp())))
                .min_by_key(|(_, ts)| *ts)
                .map(|(i, _)| i);
            if let Some(connector) = oldest.and_then(|i| self.idle[i].lock().take()) {
                return Some(connector);
            }
            std::thread::yield_now();
        }
    }

    fn stats_line(&self) -> String {
        let s = self.stats();
        format!("[{} total, {} idle, {} busy, {} waiting]", s.total, s.idle, s.busy, s.waiting)
    }

    // ------------------------------------------------------------------------
    // Enlistment
    // ------------------------------------------------------------------------

    fn park_enlisted(&self, id: EnlistmentId, connector: Connector) {
        trace!(connector_id = connector.id(), enlistment = id.0, "parking enlisted connector");
        self.enlisted.lock().entry(id).or_default().push(connector);
    }

    fn take_enlisted(&self, id: EnlistmentId) -> Option<Connector> {
        let mut enlisted = self.enlisted.lock();
        let list = enlisted.get_mut(&id)?;
        let connector = list.pop();
        if list.is_empty() {
            enlisted.remove(&id);
        }
        connector
    }
}

async fn wait_async(waiter: &Waiter, deadline: Option<Instant>) -> Option<Handoff> {
    loop {
        let notified = waiter.notify.notified();
        if let Some(handoff) = waiter.take() {
            return Some(handoff);
        }
        match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return None;
                }
            }
            None => notified.await,
        }
    }
}

fn wait_blocking(waiter: &Waiter, deadline: Option<Instant>) -> Option<Handoff> {
    let mut state = waiter.state.lock();
    loop {
        if let Some(handoff) = take_delivered(&mut state) {
            return Some(handoff);
        }
        match deadline {
            Some(deadline) => {
                if waiter.condvar.wait_until(&mut state, deadline).timed_out() {
                    return take_delivered(&mut state);
                }
            }
            None => waiter.condvar.wait(&mut state),
        }
    }
}

/// Starting slot for an idle scan, spread by calling thread.
fn slot_seed(len: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() as usize) % len.max(1)
}

// ============================================================================
// Connector Pool
// ============================================================================

/// A pool of connectors for one set of connection settings.
#[derive(Clone)]
pub struct ConnectorPool {
    inner: Arc<PoolInner>,
}

impl ConnectorPool {
    /// Create a pool; settings are validated here.
    pub fn new(settings: ConnectionSettings) -> PgResult<Self> {
        Self::with_type_mapper(settings, Arc::new(BuiltinTypeMapper))
    }

    pub fn with_type_mapper(settings: ConnectionSettings, type_mapper: Arc<dyn TypeMapper>) -> PgResult<Self> {
        settings.validate()?;
        let (waiters_tx, waiters_rx) = crossbeam_channel::unbounded();
        let idle = (0..settings.max_pool_size).map(|_| Mutex::new(None)).collect();

        let inner = PoolInner {
            settings: Arc::new(settings),
            type_mapper,
            state: AtomicPoolState(AtomicU64::new(0)),
            idle,
            waiters_tx,
            waiters_rx,
            enqueue_lock: Mutex::new(()),
            clear_counter: AtomicU64::new(0),
            pruning: Mutex::new(PruningState::default()),
            enlisted: Mutex::new(HashMap::new()),
            runtime: OnceCell::new(),
        };
        inner.remember_runtime();

        debug!(
            pool = %inner.settings.user_facing_connection_string(),
            max = inner.settings.max_pool_size,
            min = inner.settings.min_pool_size,
            "pool created"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Runtime used by blocking calls and background work. The first one
    /// recorded wins.
    pub fn attach_runtime(&self, handle: Handle) {
        let _ = self.inner.runtime.set(handle);
    }

    /// Check out a connector, waiting up to the configured `timeout`.
    pub async fn allocate(&self) -> PgResult<PooledConnector> {
        self.allocate_timeout(self.inner.settings.timeout_opt()).await
    }

    /// Check out a connector, waiting up to `timeout` (`None` waits forever).
    pub async fn allocate_timeout(&self, timeout: Option<Duration>) -> PgResult<PooledConnector> {
        self.inner.remember_runtime();
        let connector = self.inner.allocate(timeout, IoMode::Async).await?;
        Ok(self.guard(connector, None))
    }

    /// Reuse a connector parked by `id`, else allocate one enlisted in it.
    pub async fn allocate_enlisted(&self, id: EnlistmentId) -> PgResult<PooledConnector> {
        if let Some(connector) = self.inner.take_enlisted(id) {
            trace!(connector_id = connector.id(), enlistment = id.0, "reusing enlisted connector");
            return Ok(self.guard(connector, Some(id)));
        }
        let mut conn = self.allocate().await?;
        conn.enlistment = Some(id);
        Ok(conn)
    }

    /// Release every connector parked by `id`.
    pub fn complete_enlistment(&self, id: EnlistmentId) {
        let parked = self.inner.enlisted.lock().remove(&id).unwrap_or_default();
        for connector in parked {
            self.inner.release(connector);
        }
    }

    pub fn enlisted_count(&self, id: EnlistmentId) -> usize {
        self.inner.enlisted.lock().get(&id).map_or(0, Vec::len)
    }

    /// Blocking [`allocate`](Self::allocate) for callers outside any runtime.
    pub fn allocate_blocking(&self) -> PgResult<PooledConnector> {
        self.allocate_blocking_timeout(self.inner.settings.timeout_opt())
    }

    pub fn allocate_blocking_timeout(&self, timeout: Option<Duration>) -> PgResult<PooledConnector> {
        let handle = blocking_handle(&self.inner)?;
        let connector = handle.block_on(self.inner.allocate(timeout, IoMode::Blocking))?;
        Ok(self.guard(connector, None))
    }

    fn guard(&self, connector: Connector, enlistment: Option<EnlistmentId>) -> PooledConnector {
        PooledConnector {
            connector: Some(connector),
            pool: Arc::clone(&self.inner),
            enlistment,
        }
    }

    /// Open connectors until `min_pool_size` are idle or busy.
    pub async fn warm_up(&self) -> PgResult<()> {
        let mut opened = Vec::new();
        while self.inner.state.load().total() < self.inner.settings.min_pool_size {
            opened.push(self.allocate().await?);
        }
        Ok(())
    }

    /// Execute a command on a pooled connector.
    pub async fn execute(&self, command: &Command) -> PgResult<Vec<QueryResult>> {
        let mut conn = self.allocate().await?;
        conn.execute(command).await
    }

    /// Execute a parameterized query on a pooled connector.
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut conn = self.allocate().await?;
        conn.query(sql, params).await
    }

    pub async fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let mut conn = self.allocate().await?;
        conn.simple_query(sql).await
    }

    /// Close idle connectors and retire busy ones on their return.
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn clear_counter(&self) -> u64 {
        self.inner.clear_counter.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same pool.
    pub fn same_pool(&self, other: &ConnectorPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_pruning_enabled(&self) -> bool {
        self.inner.pruning.lock().enabled
    }

    /// Waiter entries still in the queue, cancelled ones included.
    pub(crate) fn queued_waiters(&self) -> usize {
        self.inner.waiters_rx.len()
    }

    /// Run one pruning sample now, as the timer would.
    pub(crate) fn prune_tick(&self) -> bool {
        let generation = self.inner.pruning.lock().generation;
        self.inner.prune_tick(generation)
    }
}

impl fmt::Display for ConnectorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.stats_line())
    }
}

impl fmt::Debug for ConnectorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorPool")
            .field("settings", &self.inner.settings.user_facing_connection_string())
            .field("stats", &self.stats())
            .finish()
    }
}

fn blocking_handle(inner: &PoolInner) -> PgResult<Handle> {
    if Handle::try_current().is_ok() {
        return Err(PgError::Usage(
            "Blocking pool calls cannot be made from inside an async context".to_string(),
        ));
    }
    inner.runtime.get().cloned().ok_or(PgError::NoRuntime)
}

// ============================================================================
// Pooled Connector
// ============================================================================

/// A connector checked out from the pool.
///
/// When dropped, the connector is returned to the pool, or parked under its
/// enlistment until [`ConnectorPool::complete_enlistment`].
pub struct PooledConnector {
    /// The actual connector (None once returned)
    connector: Option<Connector>,
    pool: Arc<PoolInner>,
    enlistment: Option<EnlistmentId>,
}

impl PooledConnector {
    fn conn(&mut self) -> PgResult<&mut Connector> {
        self.connector.as_mut().ok_or(PgError::ConnectionClosed)
    }

    pub async fn execute(&mut self, command: &Command) -> PgResult<Vec<QueryResult>> {
        self.conn()?.execute(command).await
    }

    pub async fn execute_batch(&mut self, commands: &[Command]) -> PgResult<Vec<Vec<QueryResult>>> {
        self.conn()?.execute_batch(commands).await
    }

    pub async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.conn()?.query(sql, params).await
    }

    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.conn()?.simple_query(sql).await
    }

    pub async fn prepare(&mut self, command: &Command) -> PgResult<()> {
        self.conn()?.prepare(command).await
    }

    pub async fn unprepare(&mut self, command: &Command) -> PgResult<()> {
        self.conn()?.unprepare(command).await
    }

    pub async fn begin(&mut self) -> PgResult<Transaction> {
        self.conn()?.begin().await
    }

    pub async fn commit(&mut self) -> PgResult<()> {
        self.conn()?.commit().await
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.conn()?.rollback().await
    }

    /// Blocking [`execute`](Self::execute).
    pub fn execute_blocking(&mut self, command: &Command) -> PgResult<Vec<QueryResult>> {
        let handle = blocking_handle(&self.pool)?;
        handle.block_on(self.execute(command))
    }

    /// Blocking [`query`](Self::query).
    pub fn query_blocking(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let handle = blocking_handle(&self.pool)?;
        handle.block_on(self.query(sql, params))
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.connector.as_ref().map(Connector::cancel_token)
    }

    /// Park this connector under `id` when dropped.
    pub fn enlist(&mut self, id: EnlistmentId) {
        self.enlistment = Some(id);
    }

    pub fn enlistment(&self) -> Option<EnlistmentId> {
        self.enlistment
    }

    pub fn connector(&self) -> Option<&Connector> {
        self.connector.as_ref()
    }

    /// Check if the connector is healthy.
    pub fn is_healthy(&self) -> bool {
        self.connector
            .as_ref()
            .is_some_and(|c| c.state() == ConnectorState::Ready)
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        let Some(connector) = self.connector.take() else {
            return;
        };
        match self.enlistment {
            Some(id) if connector.state() == ConnectorState::Ready => {
                self.pool.park_enlisted(id, connector)
            }
            _ => self.pool.release(connector),
        }
    }
}
