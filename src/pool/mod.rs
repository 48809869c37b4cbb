//! Per-origin connection pooling.
//!
//! A [`Pool`] keeps idle connections for one pool key as a bounded LIFO
//! stack: the most recently used socket is leased first, since it is the
//! least likely to have been reaped by a server idle timer. Popped
//! connections pass the idle health probe before reuse; dead ones are
//! closed and replaced transparently.

mod key;
mod lru;
mod manager;

pub use key::{PoolKey, TlsKey};
pub use manager::{
    default_manager, set_default_manager, ManagerBuilder, PoolManager, ProxyConfig,
    RequestOptions,
};

pub(crate) use lru::LruMap;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::conn::{ConnConfig, Connection, HostPort};
use crate::Error;

/// Per-origin pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per origin, and the lease cap when `block`.
    pub maxsize: usize,
    /// If true, saturated pools make `lease` wait instead of opening
    /// overflow connections that cannot be pooled on return.
    pub block: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            maxsize: 1,
            block: false,
        }
    }
}

/// Observability counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh connections handed out.
    pub created: usize,
    /// Leases served from the idle stack.
    pub reused: usize,
    /// Healthy returns to the idle stack.
    pub returned: usize,
    /// Connections closed on lease, return or shutdown.
    pub discarded: usize,
}

#[derive(Debug, Default)]
struct StatCells {
    created: AtomicUsize,
    reused: AtomicUsize,
    returned: AtomicUsize,
    discarded: AtomicUsize,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<Connection>,
    outstanding: usize,
    shutdown: bool,
}

pub(crate) struct PoolShared {
    key: PoolKey,
    target: HostPort,
    pool_config: PoolConfig,
    conn_config: Arc<ConnConfig>,
    state: Mutex<PoolState>,
    cond: Condvar,
    stats: StatCells,
}

/// A pool of reusable connections to one peer.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        write!(
            f,
            "Pool<{:?} idle={} outstanding={}{}>",
            self.shared.key,
            state.idle.len(),
            state.outstanding,
            if state.shutdown { " shutdown" } else { "" }
        )
    }
}

impl Pool {
    pub(crate) fn new(
        key: PoolKey,
        target: HostPort,
        pool_config: PoolConfig,
        conn_config: Arc<ConnConfig>,
    ) -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                key,
                target,
                pool_config,
                conn_config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    outstanding: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                stats: StatCells::default(),
            }),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.shared.key
    }

    /// Lease a connection: pooled if a healthy one is idle, fresh
    /// otherwise. With `block=true` and the pool saturated, waits up to
    /// `timeout` for a return before failing with [`Error::EmptyPool`].
    ///
    /// Every lease must be paired with exactly one [`Pool::release`].
    pub(crate) fn lease(&self, timeout: Option<Duration>) -> Result<Connection, Error> {
        let wait_deadline = timeout.map(|t| Instant::now() + t);
        let shared = &self.shared;
        let mut state = shared.state.lock();

        loop {
            if state.shutdown {
                return Err(Error::PoolShutdown);
            }

            while let Some(mut conn) = state.idle.pop() {
                if conn.health_check() {
                    state.outstanding += 1;
                    shared.stats.reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                debug!("replacing dead idle connection: {:?}", conn);
                conn.close();
                shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
            }

            if state.outstanding < shared.pool_config.maxsize || !shared.pool_config.block {
                state.outstanding += 1;
                shared.stats.created.fetch_add(1, Ordering::Relaxed);
                return Ok(Connection::new(
                    shared.target.clone(),
                    shared.conn_config.clone(),
                ));
            }

            match wait_deadline {
                Some(d) => {
                    if Instant::now() >= d {
                        return Err(Error::EmptyPool);
                    }
                    shared.cond.wait_until(&mut state, d);
                }
                None => shared.cond.wait(&mut state),
            }
        }
    }

    /// Give a leased connection back.
    ///
    /// Reusable connections go on the idle stack while capacity allows;
    /// everything else is closed. Always balances the `lease` count.
    pub(crate) fn release(&self, mut conn: Connection) {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.outstanding > 0 {
            state.outstanding -= 1;
        }

        let pooled = !state.shutdown
            && conn.is_reusable()
            && state.idle.len() < shared.pool_config.maxsize;

        if pooled {
            state.idle.push(conn);
            shared.stats.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            conn.close();
            shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
            drop(conn);
        }

        drop(state);
        shared.cond.notify_one();
    }

    /// Shut the pool down: close all idle connections and wake waiters.
    /// Connections still out on lease are closed when returned.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let discarded = state.idle.len();
        for mut conn in state.idle.drain(..) {
            conn.close();
        }
        shared
            .stats
            .discarded
            .fetch_add(discarded, Ordering::Relaxed);
        drop(state);
        shared.cond.notify_all();
        debug!("{:?} closed", self);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Currently idle connections.
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Connections currently out on lease.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.shared.stats;
        PoolStats {
            created: s.created.load(Ordering::Relaxed),
            reused: s.reused.load(Ordering::Relaxed),
            returned: s.returned.load(Ordering::Relaxed),
            discarded: s.discarded.load(Ordering::Relaxed),
        }
    }

    /// A weak handle for deferred release from a streaming response.
    pub(crate) fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Weak reference to a pool, held by in-flight responses.
///
/// The response finds its pool through this handle on release instead of
/// a strong back pointer, so a pool evicted from the manager LRU can be
/// dropped while responses are still streaming: their connections are
/// then simply closed.
#[derive(Debug, Clone)]
pub(crate) struct PoolHandle {
    shared: Weak<PoolShared>,
}

impl PoolHandle {
    pub fn release(&self, mut conn: Connection) {
        match self.shared.upgrade() {
            Some(shared) => Pool { shared }.release(conn),
            None => conn.close(),
        }
    }

    #[cfg(test)]
    pub fn dangling() -> PoolHandle {
        PoolHandle { shared: Weak::new() }
    }
}
