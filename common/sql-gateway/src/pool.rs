//! Bounded async connection pool
//!
//! The idle set and the leased count live under one mutex, so a connection
//! is either idle or leased, never both. Waiters park on a [`Notify`] and are
//! woken whenever capacity frees up.
//!
//! A lease goes back to the idle set only through [`PooledConnection::release`].
//! Dropping a lease, or calling [`PooledConnection::discard`], closes the
//! connection, so a session that failed mid-query never re-enters the pool.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::error::{GatewayError, GatewayResult};

/// Opens connections for the pool
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> GatewayResult<Self::Connection>;
}

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    /// Leased connections plus connections being opened
    leased: usize,
    closed: bool,
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub leased: usize,
    pub max_size: usize,
}

/// Pool sizing resolved from [`PoolConfig`]
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub max_idle: Duration,
    pub connect_timeout: Duration,
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            min_size: config.min_size.clamp(1, max_size),
            max_size,
            max_idle: config.max_idle(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// A bounded pool of connections from `M`
pub struct Pool<M: ConnectionManager> {
    manager: M,
    options: PoolOptions,
    state: Mutex<PoolState<M::Connection>>,
    available: Notify,
}

enum Checkout<C> {
    Idle(C),
    Open,
    Wait,
}

impl<M: ConnectionManager> Pool<M> {
    /// Open the pool, pre-connecting `min_size` connections
    ///
    /// Fails with `DatabaseUnreachable` when not a single connection opens.
    pub async fn open(manager: M, options: PoolOptions) -> GatewayResult<Arc<Self>> {
        let pool = Arc::new(Self {
            manager,
            options,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                leased: 0,
                closed: false,
            }),
            available: Notify::new(),
        });

        let mut opened = Vec::with_capacity(pool.options.min_size);
        let mut last_error = None;
        for _ in 0..pool.options.min_size {
            match pool.connect_bounded().await {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to pre-open pooled connection");
                    last_error = Some(err);
                }
            }
        }

        if opened.is_empty() {
            let reason = last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no connections opened".to_string());
            return Err(GatewayError::DatabaseUnreachable(reason));
        }
        if opened.len() < pool.options.min_size {
            tracing::warn!(
                opened = opened.len(),
                min_size = pool.options.min_size,
                "Connection pool started below its minimum size"
            );
        }

        {
            let mut state = pool.lock_state();
            let now = Instant::now();
            state.idle.extend(opened.into_iter().map(|conn| IdleConnection {
                conn,
                idle_since: now,
            }));
        }

        tracing::info!(
            min_size = pool.options.min_size,
            max_size = pool.options.max_size,
            "Connection pool opened"
        );
        Ok(pool)
    }

    /// Lease a connection, waiting up to `timeout` for capacity
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> GatewayResult<PooledConnection<M>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking state so a release between
            // the check and the wait is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (checkout, expired) = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(GatewayError::PoolClosed);
                }
                let expired = self.take_expired(&mut state);
                let checkout = if let Some(idle) = state.idle.pop_back() {
                    state.leased += 1;
                    Checkout::Idle(idle.conn)
                } else if state.leased < self.options.max_size {
                    state.leased += 1;
                    Checkout::Open
                } else {
                    Checkout::Wait
                };
                (checkout, expired)
            };
            drop(expired);

            match checkout {
                Checkout::Idle(conn) => return Ok(self.lease(conn)),
                Checkout::Open => {
                    let reservation = Reservation { pool: self };
                    let conn = self.connect_bounded().await?;
                    std::mem::forget(reservation);
                    return Ok(self.lease(conn));
                }
                Checkout::Wait => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(GatewayError::PoolExhausted { waited: timeout });
                        }
                    }
                }
            }
        }
    }

    /// Close idle connections that outlived `max_idle`
    ///
    /// Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let expired = {
            let mut state = self.lock_state();
            self.take_expired(&mut state)
        };
        let count = expired.len();
        if count > 0 {
            tracing::debug!(count, "Closed expired idle connections");
        }
        count
    }

    /// Close every idle connection and refuse further leases
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock_state();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        tracing::info!(closed = idle.len(), "Connection pool closed");
        drop(idle);
        self.available.notify_waiters();
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock_state();
        PoolStatus {
            idle: state.idle.len(),
            leased: state.leased,
            max_size: self.options.max_size,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_expired(&self, state: &mut PoolState<M::Connection>) -> Vec<M::Connection> {
        let max_idle = self.options.max_idle;
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(state.idle.len());
        for idle in state.idle.drain(..) {
            if idle.idle_since.elapsed() >= max_idle {
                expired.push(idle.conn);
            } else {
                kept.push_back(idle);
            }
        }
        state.idle = kept;
        expired
    }

    async fn connect_bounded(&self) -> GatewayResult<M::Connection> {
        match tokio::time::timeout(self.options.connect_timeout, self.manager.connect()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::DatabaseUnreachable(format!(
                "connect timed out after {:?}",
                self.options.connect_timeout
            ))),
        }
    }

    fn lease(self: &Arc<Self>, conn: M::Connection) -> PooledConnection<M> {
        PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
        }
    }

    fn give_back(&self, conn: M::Connection) {
        let (rejected, expired) = {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
            let expired = self.take_expired(&mut state);
            if state.closed {
                (Some(conn), expired)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                (None, expired)
            }
        };
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Closed expired idle connections");
        }
        drop(expired);
        drop(rejected);
        self.available.notify_one();
    }

    fn forget_lease(&self) {
        {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
        }
        self.available.notify_one();
    }
}

/// A slot counted as leased while its connection is being opened
///
/// Dropping it, including when the acquiring future is cancelled mid-connect,
/// hands the slot back.
struct Reservation<'a, M: ConnectionManager> {
    pool: &'a Pool<M>,
}

impl<M: ConnectionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        self.pool.forget_lease();
    }
}

/// Exclusive lease on a pooled connection
pub struct PooledConnection<M: ConnectionManager> {
    pool: Arc<Pool<M>>,
    conn: Option<M::Connection>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Return a healthy connection to the idle set
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }

    /// Close a connection that may be in a bad state
    pub fn discard(mut self) {
        self.close_now();
    }

    fn close_now(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            self.pool.forget_lease();
            tracing::debug!("Discarded pooled connection");
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken when the lease is consumed"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken when the lease is consumed"),
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        self.close_now();
    }
}
