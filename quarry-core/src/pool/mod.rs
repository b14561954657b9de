//! Bounded pool of database connections.
//!
//! Connections are opened lazily up to `max_connections`. A slot is reserved
//! before connecting so concurrent callers can never overshoot the ceiling,
//! and callers that find the pool full wait at most `acquire_timeout` before
//! failing with [`GovernorError::PoolExhausted`]. Idle handles are reused
//! most-recently-used first so the reaper can close the cold end.

mod connector;
mod postgres;

use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info, warn};

use crate::error::{GovernorError, Result};
use crate::settings::PoolSettings;

pub use connector::{Connector, DbError, DbErrorKind, QueryResult};
pub use postgres::PgConnector;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle or in use.
    pub live: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
    /// Connections checked out.
    pub in_use: usize,
    /// Configured ceiling.
    pub max_connections: usize,
}

struct IdleConnection<T> {
    conn: T,
    id: u64,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState<T> {
    idle: VecDeque<IdleConnection<T>>,
    /// Idle + in use + slots reserved for connections being opened.
    live: usize,
}

struct Shared<C: Connector> {
    connector: Arc<C>,
    settings: PoolSettings,
    state: Mutex<PoolState<C::Connection>>,
    available: Notify,
    next_id: AtomicU64,
}

impl<C: Connector> Shared<C> {
    /// Give back a live slot whose connection is gone.
    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn checkin(&self, idle: IdleConnection<C::Connection>) {
        self.state.lock().idle.push_front(idle);
        self.available.notify_one();
    }
}

enum Checkout<T> {
    Idle(IdleConnection<T>),
    Reserved,
    Full,
}

/// Bounded, lazily filled connection pool. Clones share the same pool.
pub struct ConnectionPool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Empty pool over `connector`.
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        Self::from_arc(Arc::new(connector), settings)
    }

    /// Empty pool over a shared connector.
    pub fn from_arc(connector: Arc<C>, settings: PoolSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                }),
                available: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Backend the pool opens connections with.
    pub fn connector(&self) -> Arc<C> {
        Arc::clone(&self.shared.connector)
    }

    /// Limits and timeouts the pool enforces.
    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Check out a connection, waiting up to `acquire_timeout` for one to be
    /// returned when the pool is at its ceiling.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let started = Instant::now();
        let deadline = started + self.shared.settings.acquire_timeout();

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not lost.
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout() {
                Checkout::Idle(idle) => {
                    return Ok(PooledConnection::checked_out(
                        Arc::clone(&self.shared),
                        idle.conn,
                        idle.id,
                        idle.created_at,
                    ));
                }
                Checkout::Reserved => return self.open().await,
                Checkout::Full => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let max_connections = self.shared.settings.max_connections;
                let waited = started.elapsed();
                warn!(
                    max_connections,
                    waited_ms = waited.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(GovernorError::PoolExhausted {
                    max_connections,
                    waited,
                });
            }
        }
    }

    /// Run `f` with an exclusively held connection.
    ///
    /// The connection goes back to the pool when `f` succeeds or fails with a
    /// statement error. It is discarded when `f` reports a broken
    /// connection, overruns `query_timeout`, or is dropped mid-flight.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c C,
            &'c mut C::Connection,
        ) -> BoxFuture<'c, std::result::Result<T, DbError>>,
    {
        let mut handle = self.acquire().await?;
        let connector = Arc::clone(&self.shared.connector);
        let timeout = self.shared.settings.query_timeout();

        handle.poisoned = true;
        let outcome =
            tokio::time::timeout(timeout, f(connector.as_ref(), handle.conn_mut()))
                .await;

        match outcome {
            Ok(Ok(value)) => {
                handle.poisoned = false;
                Ok(value)
            }
            Ok(Err(err)) if err.kind == DbErrorKind::Query => {
                handle.poisoned = false;
                Err(GovernorError::Query(err))
            }
            Ok(Err(err)) => {
                warn!(connection = handle.id, error = %err, "discarding broken connection");
                Err(GovernorError::Connection(err))
            }
            Err(_) => {
                warn!(
                    connection = handle.id,
                    timeout_secs = timeout.as_secs(),
                    "query timed out; discarding connection"
                );
                Err(GovernorError::QueryTimeout { timeout })
            }
        }
    }

    /// Close idle connections unused for longer than `idle_timeout` as of
    /// `now`. Returns how many were closed.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.shared.settings.idle_timeout();
        let expired: VecDeque<IdleConnection<C::Connection>> = {
            let mut state = self.shared.state.lock();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|idle| now.saturating_duration_since(idle.last_used) <= idle_timeout);
            state.idle = keep;
            state.live = state.live.saturating_sub(expired.len());
            expired
        };

        let closed = expired.len();
        drop(expired);

        if closed > 0 {
            self.shared.available.notify_one();
            info!(closed, "reaped idle connections");
        } else {
            debug!("no idle connections to reap");
        }
        closed
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            in_use: state.live - state.idle.len(),
            max_connections: self.shared.settings.max_connections,
        }
    }

    fn checkout(&self) -> Checkout<C::Connection> {
        let mut state = self.shared.state.lock();
        if let Some(idle) = state.idle.pop_front() {
            return Checkout::Idle(idle);
        }
        if state.live < self.shared.settings.max_connections {
            state.live += 1;
            return Checkout::Reserved;
        }
        Checkout::Full
    }

    /// Open a connection into an already reserved slot.
    async fn open(&self) -> Result<PooledConnection<C>> {
        let reservation = SlotReservation {
            shared: &self.shared,
            armed: true,
        };
        let connect_timeout = self.shared.settings.connect_timeout();

        let conn = match tokio::time::timeout(connect_timeout, self.shared.connector.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                warn!(error = %err, "failed to open database connection");
                return Err(GovernorError::Connection(err));
            }
            Err(_) => {
                warn!(timeout_secs = connect_timeout.as_secs(), "database connect timed out");
                return Err(GovernorError::Connection(DbError::connect(format!(
                    "connect timed out after {connect_timeout:?}"
                ))));
            }
        };
        reservation.commit();

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, "opened database connection");
        Ok(PooledConnection::checked_out(
            Arc::clone(&self.shared),
            conn,
            id,
            Instant::now(),
        ))
    }
}

/// Releases a reserved slot if connecting fails or the caller goes away.
struct SlotReservation<'a, C: Connector> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<C: Connector> SlotReservation<'_, C> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// An exclusively held connection. Returned to the pool on drop unless it
/// was discarded.
pub struct PooledConnection<C: Connector> {
    shared: Arc<Shared<C>>,
    conn: Option<C::Connection>,
    id: u64,
    created_at: Instant,
    poisoned: bool,
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("age", &self.age())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    fn checked_out(
        shared: Arc<Shared<C>>,
        conn: C::Connection,
        id: u64,
        created_at: Instant,
    ) -> Self {
        Self {
            shared,
            conn: Some(conn),
            id,
            created_at,
            poisoned: false,
        }
    }

    /// Pool-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.poisoned = true;
    }

    fn conn_ref(&self) -> &C::Connection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }

    fn conn_mut(&mut self) -> &mut C::Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn_ref()
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn_mut()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.poisoned {
            drop(conn);
            debug!(connection = self.id, "discarded database connection");
            self.shared.release_slot();
        } else {
            self.shared.checkin(IdleConnection {
                conn,
                id: self.id,
                created_at: self.created_at,
                last_used: Instant::now(),
            });
        }
    }
}
