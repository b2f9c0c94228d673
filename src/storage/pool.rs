//! Bounded connection pool with FIFO waiters and health checks.
//!
//! The pool owns every [`SqlManager`] handle it creates and lends them out
//! one owner at a time through RAII [`PooledConnection`] guards. Waiters
//! are served strictly FIFO: each blocked `acquire()` parks on its own
//! bounded channel, and `release()` hands the freed connection to the
//! oldest live waiter.
//!
//! A background thread evicts idle connections above the minimum after
//! `idle_timeout` and pings the rest (`SELECT 1`) every
//! `health_check_interval`, replacing handles that fail.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};

use super::manager::SqlManager;

/// Factory producing fresh connections for the pool.
pub type ConnectionFactory = dyn Fn() -> Result<SqlManager> + Send + Sync;

/// Snapshot of pool occupancy, used by metrics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Total handles alive (idle + lent out).
    pub open: usize,
    /// Handles sitting idle in the pool.
    pub idle: usize,
    /// Callers currently blocked in `acquire()`.
    pub waiters: usize,
    /// Whether `shutdown()` has run.
    pub closed: bool,
}

struct IdleConn {
    manager: SqlManager,
    idle_since: Instant,
}

struct Waiter {
    id: u64,
    tx: Sender<SqlManager>,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    waiters: VecDeque<Waiter>,
    open: usize,
    next_waiter_id: u64,
    closed: bool,
}

struct PoolInner {
    factory: Box<ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Returns a freed connection to the oldest live waiter, or parks it
    /// in the idle queue. Broken connections are dropped and counted out.
    fn release(&self, manager: SqlManager, broken: bool) {
        let mut state = self.state.lock();

        if broken || state.closed {
            state.open -= 1;
            drop(state);
            // Closing outside the lock; errors here are unreportable.
            let _ = manager.close();
            return;
        }

        let mut manager = Some(manager);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(manager.take().expect("connection present")) {
                Ok(()) => return,
                Err(err) => {
                    // Waiter timed out and dropped its receiver; try the next.
                    manager = Some(err.into_inner());
                }
            }
        }

        state.idle.push_back(IdleConn {
            manager: manager.expect("connection present"),
            idle_since: Instant::now(),
        });
    }
}

/// Bounded pool of [`SqlManager`] handles.
///
/// # Invariants
///
/// - `min_connections ≤ open ≤ max_connections`
/// - exactly one task owns a handle at a time
/// - waiters are served FIFO on release
/// - a timed-out acquire leaves the waiter queue without leaking a handle
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    maintenance_stop: Sender<()>,
    maintenance: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("ConnectionPool")
            .field("open", &status.open)
            .field("idle", &status.idle)
            .field("closed", &status.closed)
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool and eagerly opens `min_connections` handles.
    ///
    /// # Errors
    ///
    /// Propagates the factory error if the initial handles cannot be
    /// opened.
    pub fn new(
        factory: impl Fn() -> Result<SqlManager> + Send + Sync + 'static,
        config: PoolConfig,
    ) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            factory: Box::new(factory),
            config: config.clone(),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                open: 0,
                next_waiter_id: 0,
                closed: false,
            }),
        });

        for _ in 0..config.min_connections {
            let manager = (inner.factory)()?;
            let mut state = inner.state.lock();
            state.open += 1;
            state.idle.push_back(IdleConn {
                manager,
                idle_since: Instant::now(),
            });
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let maintenance = spawn_maintenance(Arc::clone(&inner), stop_rx);

        info!(
            min = config.min_connections,
            max = config.max_connections,
            "Connection pool initialized"
        );

        Ok(Self {
            inner,
            maintenance_stop: stop_tx,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Acquires a connection, blocking until one frees or the configured
    /// `acquire_timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`PoolError::PoolClosed`] after `shutdown()`
    /// - [`PoolError::AcquireTimeout`] when no handle frees in time
    #[instrument(skip(self), level = "debug")]
    pub fn acquire(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let waiter = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed.into());
            }

            if let Some(idle) = state.idle.pop_front() {
                return Ok(PooledConnection::new(
                    Arc::clone(&self.inner),
                    idle.manager,
                ));
            }

            if state.open < self.inner.config.max_connections {
                state.open += 1;
                drop(state);
                return match (self.inner.factory)() {
                    Ok(manager) => {
                        Ok(PooledConnection::new(Arc::clone(&self.inner), manager))
                    }
                    Err(err) => {
                        self.inner.state.lock().open -= 1;
                        Err(err)
                    }
                };
            }

            // At capacity: park as a FIFO waiter on a private channel.
            let (tx, rx) = bounded::<SqlManager>(1);
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        self.wait_for_handoff(waiter, started)
    }

    fn wait_for_handoff(
        &self,
        (waiter_id, rx): (u64, Receiver<SqlManager>),
        started: Instant,
    ) -> Result<PooledConnection> {
        let timeout = self.inner.config.acquire_timeout;
        match rx.recv_timeout(timeout) {
            Ok(manager) => Ok(PooledConnection::new(Arc::clone(&self.inner), manager)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                // Shutdown dropped our sender.
                Err(PoolError::PoolClosed.into())
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                // Leave the queue; a release may have raced us, so drain
                // the channel once more before giving up.
                let mut state = self.inner.state.lock();
                state.waiters.retain(|w| w.id != waiter_id);
                drop(state);
                match rx.try_recv() {
                    Ok(manager) => {
                        Ok(PooledConnection::new(Arc::clone(&self.inner), manager))
                    }
                    Err(_) => Err(PoolError::AcquireTimeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                    }
                    .into()),
                }
            }
        }
    }

    /// Returns current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            open: state.open,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
            closed: state.closed,
        }
    }

    /// Shuts the pool down.
    ///
    /// All parked waiters are rejected with `PoolClosed`. The call waits
    /// up to `grace` for lent-out handles to come home, then returns;
    /// stragglers are closed as they are released.
    #[instrument(skip(self))]
    pub fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            // Dropping the senders disconnects every waiter's channel,
            // which surfaces as PoolClosed on their side.
            state.waiters.clear();

            let idle: Vec<IdleConn> = state.idle.drain(..).collect();
            state.open -= idle.len();
            drop(state);
            for conn in idle {
                let _ = conn.manager.close();
            }
        }

        // Stop the maintenance thread.
        let _ = self.maintenance_stop.send(());
        if let Some(handle) = self.maintenance.lock().take() {
            let _ = handle.join();
        }

        // Grace period for outstanding handles.
        let deadline = Instant::now() + grace;
        loop {
            let outstanding = self.inner.state.lock().open;
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(outstanding, "Pool shutdown grace expired with handles lent out");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        info!("Connection pool shut down");
    }
}

/// RAII guard around a lent [`SqlManager`].
///
/// Dereferences to the manager; returning to the pool happens on drop.
/// Call [`mark_broken`](Self::mark_broken) when the connection misbehaved
/// so the pool replaces it instead of recycling it.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    manager: Option<SqlManager>,
    broken: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish()
    }
}

impl PooledConnection {
    fn new(inner: Arc<PoolInner>, manager: SqlManager) -> Self {
        Self {
            inner,
            manager: Some(manager),
            broken: false,
        }
    }

    /// Flags the connection so it is discarded instead of recycled.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = SqlManager;

    fn deref(&self) -> &SqlManager {
        self.manager.as_ref().expect("manager present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            self.inner.release(manager, self.broken);
        }
    }
}

/// Maintenance loop: idle eviction + health checks.
fn spawn_maintenance(
    inner: Arc<PoolInner>,
    stop: Receiver<()>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("codegraph-pool-maint".to_string())
        .spawn(move || {
            let tick = inner
                .config
                .idle_timeout
                .min(inner.config.health_check_interval)
                .max(Duration::from_millis(100));
            let mut last_health = Instant::now();
            loop {
                match stop.recv_timeout(tick) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                }

                evict_idle(&inner);

                if last_health.elapsed() >= inner.config.health_check_interval {
                    last_health = Instant::now();
                    health_check(&inner);
                }
            }
        })
        .expect("spawn pool maintenance thread")
}

/// Closes idle connections above the minimum that have been idle too long.
fn evict_idle(inner: &Arc<PoolInner>) {
    let mut to_close = Vec::new();
    {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        while state.open > inner.config.min_connections {
            let expired = state
                .idle
                .front()
                .map(|c| c.idle_since.elapsed() >= inner.config.idle_timeout)
                .unwrap_or(false);
            if !expired {
                break;
            }
            let conn = state.idle.pop_front().expect("front checked");
            state.open -= 1;
            to_close.push(conn.manager);
        }
    }
    for manager in to_close {
        debug!("Evicting idle connection");
        let _ = manager.close();
    }
}

/// Pings every idle connection; failures are dropped and replaced up to
/// the configured minimum.
fn health_check(inner: &Arc<PoolInner>) {
    let candidates: Vec<IdleConn> = {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }
        state.idle.drain(..).collect()
    };

    let mut healthy = Vec::new();
    let mut failed = 0usize;
    for conn in candidates {
        match conn.manager.ping() {
            Ok(()) => healthy.push(conn),
            Err(err) => {
                warn!(error = %err, "Idle connection failed health check; replacing");
                failed += 1;
                let _ = conn.manager.close();
            }
        }
    }

    {
        let mut state = inner.state.lock();
        state.open -= failed;
        for conn in healthy {
            state.idle.push_back(conn);
        }
    }

    // Top back up to the minimum outside the lock.
    loop {
        {
            let state = inner.state.lock();
            if state.closed || state.open >= inner.config.min_connections {
                return;
            }
        }
        match (inner.factory)() {
            Ok(manager) => {
                inner.state.lock().open += 1;
                inner.release(manager, false);
            }
            Err(err) => {
                warn!(error = %err, "Failed to replace unhealthy connection");
                return;
            }
        }
    }
}
