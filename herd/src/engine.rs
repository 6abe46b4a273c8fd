//! The assembled control plane: catalog, replication driver, pools,
//! executor and event bus, passed around as one explicit dependency.

use std::sync::Arc;

use crate::error::Error;
use crate::events::EventBus;
use crate::executor::Executor;
use crate::pool::Pools;
use crate::replication::ReplicationDriver;
use crate::store::{Catalog, CatalogTxn};

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<herd_config::Config>,
    catalog: Arc<dyn Catalog>,
    driver: Arc<dyn ReplicationDriver>,
    pools: Pools,
    executor: Executor,
    events: EventBus,
}

impl Engine {
    pub fn new(
        config: Arc<herd_config::Config>,
        catalog: Arc<dyn Catalog>,
        driver: Arc<dyn ReplicationDriver>,
        pools: Pools,
    ) -> Self {
        let executor = Executor::new(
            catalog.clone(),
            config.general.workers,
            config.general.lock_heartbeat_duration(),
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                catalog,
                driver,
                pools,
                executor,
                events: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &herd_config::Config {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.inner.catalog
    }

    pub fn driver(&self) -> &dyn ReplicationDriver {
        self.inner.driver.as_ref()
    }

    pub fn pools(&self) -> &Pools {
        &self.inner.pools
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// A transaction used for read commands; dropping it rolls back.
    pub async fn read(&self) -> Result<Box<dyn CatalogTxn>, Error> {
        Ok(self.inner.catalog.begin().await?)
    }

    /// Drain in-flight steps and stop.
    pub async fn shutdown(&self) {
        self.inner.executor.shutdown().await;
    }
}
