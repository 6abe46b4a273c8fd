//! Per-backend connection pools, keyed by backend uuid. Checkout validates
//! liveness, discards stale connections, and waits under a bounded timeout
//! when the pool is at capacity; release is unconditional.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::sql::{Connector, SqlRunner};
use crate::topology::Backend;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Sql(crate::sql::Error),

    #[error("credentials rejected by backend ({0})")]
    Credential(Uuid),

    #[error("checkout timeout for backend ({0})")]
    CheckoutTimeout(Uuid),

    #[error("connect timeout to backend ({0})")]
    ConnectTimeout(Uuid),
}

/// Pool limits, taken from `[general]` config.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub checkout_timeout: Duration,
    pub connect_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(general: &herd_config::General) -> Self {
        Self {
            pool_size: general.pool_size,
            checkout_timeout: general.checkout_timeout_duration(),
            connect_timeout: general.connect_timeout_duration(),
        }
    }
}

#[derive(Default)]
struct Pool {
    idle: Mutex<Vec<Box<dyn SqlRunner>>>,
    /// Connections open (idle and checked out); never exceeds pool_size.
    open: AtomicUsize,
    /// Signalled whenever a connection or a capacity slot frees up.
    released: Notify,
}

impl Pool {
    /// Reserve a capacity slot; the caller must open a connection or give
    /// the slot back.
    fn reserve(&self, limit: usize) -> bool {
        self.open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < limit).then_some(open + 1)
            })
            .is_ok()
    }

    fn forget_one(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_one();
    }
}

/// All per-backend pools. Cloneable handle, explicit dependency of the
/// engine rather than a process global.
#[derive(Clone)]
pub struct Pools {
    inner: Arc<PoolsInner>,
}

struct PoolsInner {
    connector: Arc<dyn Connector>,
    pools: DashMap<Uuid, Arc<Pool>>,
    settings: PoolSettings,
}

impl Pools {
    pub fn new(connector: Arc<dyn Connector>, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolsInner {
                connector,
                pools: DashMap::new(),
                settings,
            }),
        }
    }

    fn pool(&self, uuid: &Uuid) -> Arc<Pool> {
        self.inner
            .pools
            .entry(*uuid)
            .or_insert_with(|| Arc::new(Pool::default()))
            .clone()
    }

    /// Check out a live connection to a backend. Waits for one to be
    /// released when the pool is at capacity; the whole checkout is
    /// bounded by the configured checkout timeout.
    pub async fn get(&self, backend: &Backend) -> Result<Conn, Error> {
        let pool = self.pool(&backend.uuid);

        match timeout(
            self.inner.settings.checkout_timeout,
            self.get_internal(&pool, backend),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::CheckoutTimeout(backend.uuid)),
        }
    }

    async fn get_internal(&self, pool: &Arc<Pool>, backend: &Backend) -> Result<Conn, Error> {
        loop {
            // Idle connection, if one survives the liveness probe.
            loop {
                let popped = pool.idle.lock().pop();
                let Some(mut conn) = popped else { break };
                if conn.ping().await.is_ok() {
                    return Ok(Conn {
                        runner: Some(conn),
                        pools: self.clone(),
                        uuid: backend.uuid,
                    });
                }
                // Stale connection, discard inside get.
                pool.forget_one();
                debug!("discarded stale connection to [{}]", backend.address);
            }

            // Pool is empty; open a new connection if there is room,
            // otherwise wait for a release.
            if !pool.reserve(self.inner.settings.pool_size) {
                pool.released.notified().await;
                continue;
            }

            let connect = self.inner.connector.connect(
                &backend.address,
                &backend.user,
                &backend.password,
            );
            let conn = match timeout(self.inner.settings.connect_timeout, connect).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(crate::sql::Error::Credential(_))) => {
                    pool.forget_one();
                    // Idle connections were opened with credentials the
                    // backend no longer accepts.
                    self.purge(&backend.uuid);
                    return Err(Error::Credential(backend.uuid));
                }
                Ok(Err(err)) => {
                    pool.forget_one();
                    return Err(Error::Sql(err));
                }
                Err(_) => {
                    pool.forget_one();
                    return Err(Error::ConnectTimeout(backend.uuid));
                }
            };

            return Ok(Conn {
                runner: Some(conn),
                pools: self.clone(),
                uuid: backend.uuid,
            });
        }
    }

    fn release(&self, uuid: Uuid, conn: Box<dyn SqlRunner>) {
        if let Some(pool) = self.inner.pools.get(&uuid) {
            pool.idle.lock().push(conn);
            pool.released.notify_one();
        }
    }

    /// Close every connection to a backend. Called when the backend is
    /// removed, demoted hard, or its credentials changed.
    pub fn purge(&self, uuid: &Uuid) {
        if let Some((_, pool)) = self.inner.pools.remove(uuid) {
            let dropped = pool.idle.lock().drain(..).count();
            if dropped > 0 {
                debug!("purged {} connection(s) to backend ({})", dropped, uuid);
            }
            pool.released.notify_waiters();
        }
    }

    /// Open connections (idle and checked out) for a backend.
    pub fn count(&self, uuid: &Uuid) -> usize {
        self.inner
            .pools
            .get(uuid)
            .map(|pool| pool.open.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// A checked-out connection; returns itself to the pool on drop.
pub struct Conn {
    runner: Option<Box<dyn SqlRunner>>,
    pools: Pools,
    uuid: Uuid,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("uuid", &self.uuid)
            .field("has_runner", &self.runner.is_some())
            .finish()
    }
}

impl Conn {
    /// Consume without returning to the pool.
    pub fn discard(mut self) {
        if self.runner.take().is_some() {
            if let Some(pool) = self.pools.inner.pools.get(&self.uuid) {
                pool.forget_one();
            }
        }
    }
}

impl Deref for Conn {
    type Target = dyn SqlRunner;

    fn deref(&self) -> &Self::Target {
        self.runner.as_deref().unwrap()
    }
}

impl DerefMut for Conn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.runner.as_deref_mut().unwrap()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            self.pools.release(self.uuid, runner);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimConnector, SimFleet};
    use crate::topology::Backend;

    fn settings() -> PoolSettings {
        PoolSettings {
            pool_size: 2,
            checkout_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn fleet_with_backend() -> (SimFleet, Backend, Pools) {
        let fleet = SimFleet::new();
        let uuid = fleet.add_node("db0:3306");
        let backend = Backend::new(uuid, "db0:3306", "herd");
        let pools = Pools::new(Arc::new(SimConnector::new(fleet.clone())), settings());
        (fleet, backend, pools)
    }

    #[tokio::test]
    async fn test_checkout_and_reuse() {
        let (_fleet, backend, pools) = fleet_with_backend();

        let conn = pools.get(&backend).await.unwrap();
        assert_eq!(pools.count(&backend.uuid), 1);
        drop(conn);

        // Released connection is reused, not reopened.
        let _conn = pools.get(&backend).await.unwrap();
        assert_eq!(pools.count(&backend.uuid), 1);
    }

    #[tokio::test]
    async fn test_stale_connections_discarded() {
        let (fleet, backend, pools) = fleet_with_backend();

        let conn = pools.get(&backend).await.unwrap();
        drop(conn);
        assert_eq!(pools.count(&backend.uuid), 1);

        // The backend dies while the connection is idle; the next get
        // fails the ping and the connect.
        fleet.kill(&backend.uuid);
        assert!(pools.get(&backend).await.is_err());
        assert_eq!(pools.count(&backend.uuid), 0);

        fleet.revive(&backend.uuid);
        let _conn = pools.get(&backend).await.unwrap();
        assert_eq!(pools.count(&backend.uuid), 1);
    }

    #[tokio::test]
    async fn test_purge_closes_everything() {
        let (_fleet, backend, pools) = fleet_with_backend();

        let a = pools.get(&backend).await.unwrap();
        let b = pools.get(&backend).await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pools.count(&backend.uuid), 2);

        pools.purge(&backend.uuid);
        assert_eq!(pools.count(&backend.uuid), 0);
    }

    #[tokio::test]
    async fn test_checkout_times_out_at_capacity() {
        let (_fleet, backend, pools) = fleet_with_backend();

        let a = pools.get(&backend).await.unwrap();
        let b = pools.get(&backend).await.unwrap();
        assert_eq!(pools.count(&backend.uuid), 2);

        // Pool is at capacity and nothing is released.
        let err = pools.get(&backend).await.unwrap_err();
        assert!(matches!(err, Error::CheckoutTimeout(_)));

        // A release unblocks the next checkout and nothing new is opened.
        drop(a);
        let c = pools.get(&backend).await.unwrap();
        assert_eq!(pools.count(&backend.uuid), 2);
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let (_fleet, backend, pools) = fleet_with_backend();

        let a = pools.get(&backend).await.unwrap();
        let b = pools.get(&backend).await.unwrap();

        let waiter = {
            let pools = pools.clone();
            let backend = backend.clone();
            tokio::spawn(async move { pools.get(&backend).await.map(|_| ()) })
        };

        // Let the waiter block on capacity, then release.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(a);

        waiter.await.unwrap().unwrap();
        assert_eq!(pools.count(&backend.uuid), 2);
        drop(b);
    }
}
