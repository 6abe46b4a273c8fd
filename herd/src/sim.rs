//! In-process fleet simulator backing the end-to-end tests: fake MySQL
//! servers with GTID sets, replication edges, read-only flags and rows,
//! plus a `ReplicationDriver` implementation driving them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::Engine;
use crate::pool::{Pools, PoolSettings};
use crate::replication::{
    DumpImage, Error, GtidSet, MasterIssues, ReplicationDriver, SlaveIssues,
};
use crate::sharding::{PruneWindow, ShardingType};
use crate::sql::{self, Connector, ExecResult, Rows, SqlRunner, Value};
use crate::store::MemCatalog;
use crate::topology::{Backend, Observed};

#[derive(Debug, Clone)]
pub struct Node {
    pub uuid: Uuid,
    pub address: String,
    pub alive: bool,
    pub read_only: bool,
    pub gtid_enabled: bool,
    pub binlog_enabled: bool,
    pub server_id: u32,
    pub executed: GtidSet,
    pub retrieved: GtidSet,
    pub master: Option<Uuid>,
    pub io_running: bool,
    pub sql_running: bool,
    pub tables: HashMap<String, Vec<Value>>,
}

#[derive(Default)]
struct FleetState {
    nodes: HashMap<Uuid, Node>,
    next_server_id: u32,
}

/// The simulated fleet. Cloneable handle shared by the driver and the
/// test body.
#[derive(Clone, Default)]
pub struct SimFleet {
    state: Arc<Mutex<FleetState>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        let mut state = self.state.lock();
        state.next_server_id += 1;
        let server_id = state.next_server_id;

        state.nodes.insert(
            uuid,
            Node {
                uuid,
                address: address.to_owned(),
                alive: true,
                read_only: false,
                gtid_enabled: true,
                binlog_enabled: true,
                server_id,
                executed: GtidSet::new(),
                retrieved: GtidSet::new(),
                master: None,
                io_running: false,
                sql_running: false,
                tables: HashMap::new(),
            },
        );
        uuid
    }

    pub fn node(&self, uuid: &Uuid) -> Option<Node> {
        self.state.lock().nodes.get(uuid).cloned()
    }

    pub fn kill(&self, uuid: &Uuid) {
        if let Some(node) = self.state.lock().nodes.get_mut(uuid) {
            node.alive = false;
        }
    }

    pub fn revive(&self, uuid: &Uuid) {
        if let Some(node) = self.state.lock().nodes.get_mut(uuid) {
            node.alive = true;
        }
    }

    pub fn stop_sql_thread(&self, uuid: &Uuid) {
        if let Some(node) = self.state.lock().nodes.get_mut(uuid) {
            node.sql_running = false;
        }
    }

    /// Copy a master's executed set and tables onto a slave out of band,
    /// regardless of thread state. Test setup helper.
    pub fn force_catch_up(&self, slave: &Uuid, master: &Uuid) {
        let mut state = self.state.lock();
        let Some(master) = state.nodes.get(master).cloned() else {
            return;
        };
        if let Some(node) = state.nodes.get_mut(slave) {
            node.executed.merge(&master.executed);
            node.retrieved.merge(&master.executed);
            for (table, rows) in &master.tables {
                node.tables.insert(table.clone(), rows.clone());
            }
        }
    }

    /// Commit a row on a master: the row lands in its table and a new
    /// transaction lands in its executed set.
    pub fn write(&self, master: &Uuid, table: &str, key: Value) {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(master).expect("unknown sim node");
        node.tables.entry(table.to_owned()).or_default().push(key);
        let next = node.executed.next_transaction(master);
        node.executed.add(*master, next);
    }

    pub fn row_count(&self, uuid: &Uuid, table: &str) -> usize {
        self.state
            .lock()
            .nodes
            .get(uuid)
            .and_then(|n| n.tables.get(table))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Propagate replication along every running edge until nothing
    /// changes: slaves absorb their master's executed set and tables.
    pub fn replicate_all(&self) {
        let mut state = self.state.lock();

        // Edges form a forest; a few passes reach the leaves.
        for _ in 0..state.nodes.len().max(1) {
            let mut changed = false;
            let uuids: Vec<Uuid> = state.nodes.keys().copied().collect();

            for uuid in uuids {
                let (master_uuid, running) = {
                    let node = &state.nodes[&uuid];
                    (node.master, node.alive && node.io_running && node.sql_running)
                };
                let Some(master_uuid) = master_uuid else { continue };
                if !running {
                    continue;
                }

                let Some(master) = state.nodes.get(&master_uuid).cloned() else {
                    continue;
                };
                if !master.alive {
                    continue;
                }

                let node = state.nodes.get_mut(&uuid).unwrap();
                if !node.executed.contains(&master.executed) {
                    node.executed.merge(&master.executed);
                    node.retrieved.merge(&master.executed);
                    for (table, rows) in &master.tables {
                        node.tables.insert(table.clone(), rows.clone());
                    }
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }
}

fn key_bound(kind: ShardingType, value: &Value) -> Option<crate::sharding::Bound> {
    kind.key_bound(&value.to_string()).ok()
}

/// Replication driver over the simulated fleet.
pub struct SimDriver {
    fleet: SimFleet,
}

impl SimDriver {
    pub fn new(fleet: SimFleet) -> Self {
        Self { fleet }
    }

    fn with_node<T>(&self, uuid: &Uuid, f: impl FnOnce(&mut Node) -> T) -> Result<T, Error> {
        let mut state = self.fleet.state.lock();
        let node = state
            .nodes
            .get_mut(uuid)
            .ok_or_else(|| unreachable_error(uuid))?;
        if !node.alive {
            return Err(unreachable_error(uuid));
        }
        Ok(f(node))
    }
}

fn unreachable_error(uuid: &Uuid) -> Error {
    Error::Sql(sql::Error::Unreachable(format!("sim node ({})", uuid)))
}

#[async_trait]
impl ReplicationDriver for SimDriver {
    async fn probe(&self, backend: &Backend) -> Result<Observed, Error> {
        self.with_node(&backend.uuid, |node| Observed {
            uuid: Some(node.uuid),
            server_id: node.server_id,
            version: "8.0.sim".into(),
            gtid_enabled: node.gtid_enabled,
            binlog_enabled: node.binlog_enabled,
            read_only: node.read_only,
        })
    }

    async fn discover_uuid(
        &self,
        address: &str,
        _user: &str,
        _password: &str,
    ) -> Result<Uuid, Error> {
        let state = self.fleet.state.lock();
        state
            .nodes
            .values()
            .find(|n| n.address == address && n.alive)
            .map(|n| n.uuid)
            .ok_or_else(|| Error::Sql(sql::Error::Unreachable(address.to_owned())))
    }

    async fn gtid_executed(&self, backend: &Backend) -> Result<GtidSet, Error> {
        self.with_node(&backend.uuid, |node| node.executed.clone())
    }

    async fn gtid_retrieved(&self, backend: &Backend) -> Result<GtidSet, Error> {
        self.with_node(&backend.uuid, |node| node.retrieved.clone())
    }

    async fn check_master_issues(&self, backend: &Backend) -> Result<MasterIssues, Error> {
        self.with_node(&backend.uuid, |node| MasterIssues {
            binlog_disabled: !node.binlog_enabled,
            gtid_disabled: !node.gtid_enabled,
            not_writable_user: false,
        })
    }

    async fn check_slave_issues(&self, backend: &Backend) -> Result<SlaveIssues, Error> {
        self.with_node(&backend.uuid, |node| SlaveIssues {
            not_configured: node.master.is_none(),
            io_not_running: node.master.is_some() && !node.io_running,
            sql_not_running: node.master.is_some() && !node.sql_running,
            last_error: None,
        })
    }

    async fn slave_has_master(&self, backend: &Backend) -> Result<Option<Uuid>, Error> {
        self.with_node(&backend.uuid, |node| node.master)
    }

    async fn switch_master(&self, slave: &Backend, master: &Backend) -> Result<(), Error> {
        let master_uuid = master.uuid;
        self.with_node(&slave.uuid, |node| {
            node.master = Some(master_uuid);
            node.io_running = true;
            node.sql_running = true;
        })
    }

    async fn start_slave(&self, backend: &Backend, _wait: bool) -> Result<(), Error> {
        self.with_node(&backend.uuid, |node| {
            if node.master.is_some() {
                node.io_running = true;
                node.sql_running = true;
            }
        })
    }

    async fn stop_slave(&self, backend: &Backend, _wait: bool) -> Result<(), Error> {
        self.with_node(&backend.uuid, |node| {
            node.io_running = false;
            node.sql_running = false;
        })
    }

    async fn reset_slave(&self, backend: &Backend, clean: bool) -> Result<(), Error> {
        self.with_node(&backend.uuid, |node| {
            node.io_running = false;
            node.sql_running = false;
            node.retrieved = GtidSet::new();
            if clean {
                node.master = None;
            }
        })
    }

    async fn wait_for_gtid(
        &self,
        slave: &Backend,
        gtids: &GtidSet,
        _timeout: Duration,
    ) -> Result<(), Error> {
        self.fleet.replicate_all();
        let executed = self.with_node(&slave.uuid, |node| node.executed.clone())?;
        if executed.contains(gtids) {
            Ok(())
        } else {
            Err(Error::Timeout(format!("gtid wait on ({})", slave.uuid)))
        }
    }

    async fn process_backlog(&self, slave: &Backend, _timeout: Duration) -> Result<(), Error> {
        self.with_node(&slave.uuid, |node| {
            let retrieved = node.retrieved.clone();
            node.executed.merge(&retrieved);
        })
    }

    async fn set_read_only(&self, backend: &Backend, read_only: bool) -> Result<(), Error> {
        self.with_node(&backend.uuid, |node| {
            node.read_only = read_only;
        })
    }

    async fn backup(&self, source: &Backend) -> Result<DumpImage, Error> {
        self.with_node(&source.uuid, |node| DumpImage::Rows(node.tables.clone()))
    }

    async fn restore(&self, destination: &Backend, image: &DumpImage) -> Result<(), Error> {
        let tables = match image {
            DumpImage::Rows(tables) => tables.clone(),
            DumpImage::File(path) => {
                return Err(Error::Dump(format!(
                    "sim driver cannot restore file dump {}",
                    path.display()
                )))
            }
        };

        self.with_node(&destination.uuid, |node| {
            for (table, rows) in tables {
                node.tables.insert(table, rows);
            }
        })
    }

    async fn prune_rows(
        &self,
        master: &Backend,
        table: &str,
        _column: &str,
        kind: ShardingType,
        window: &PruneWindow,
    ) -> Result<u64, Error> {
        let window = window.clone();
        self.with_node(&master.uuid, |node| {
            let Some(rows) = node.tables.get_mut(table) else {
                return 0;
            };
            let before = rows.len();
            rows.retain(|value| {
                key_bound(kind, value)
                    .map(|bound| window.contains(&bound))
                    .unwrap_or(false)
            });
            (before - rows.len()) as u64
        })
    }

    async fn max_hashed_key(
        &self,
        master: &Backend,
        table: &str,
        _column: &str,
    ) -> Result<Option<[u8; 16]>, Error> {
        self.with_node(&master.uuid, |node| {
            node.tables
                .get(table)
                .into_iter()
                .flatten()
                .map(|value| crate::sharding::key::md5_bytes(&value.to_string()))
                .max()
        })
    }
}

/// Connector over the fleet; enough for the pool's checkout/ping path.
pub struct SimConnector {
    fleet: SimFleet,
}

impl SimConnector {
    pub fn new(fleet: SimFleet) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        address: &str,
        _user: &str,
        _password: &str,
    ) -> Result<Box<dyn SqlRunner>, sql::Error> {
        let state = self.fleet.state.lock();
        let node = state
            .nodes
            .values()
            .find(|n| n.address == address)
            .ok_or_else(|| sql::Error::Unreachable(address.to_owned()))?;
        if !node.alive {
            return Err(sql::Error::Unreachable(address.to_owned()));
        }

        Ok(Box::new(SimConn {
            fleet: self.fleet.clone(),
            uuid: node.uuid,
        }))
    }
}

struct SimConn {
    fleet: SimFleet,
    uuid: Uuid,
}

#[async_trait]
impl SqlRunner for SimConn {
    async fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Rows, sql::Error> {
        Err(sql::Error::Statement("sim connection".into()))
    }

    async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<ExecResult, sql::Error> {
        Err(sql::Error::Statement("sim connection".into()))
    }

    async fn ping(&mut self) -> Result<(), sql::Error> {
        let alive = self
            .fleet
            .state
            .lock()
            .nodes
            .get(&self.uuid)
            .map(|n| n.alive)
            .unwrap_or(false);
        if alive {
            Ok(())
        } else {
            Err(sql::Error::Unreachable(format!("sim node ({})", self.uuid)))
        }
    }
}

/// Engine wired to a simulated fleet and an in-memory catalog.
pub struct TestBed {
    pub engine: Engine,
    pub fleet: SimFleet,
    pub catalog: Arc<MemCatalog>,
}

pub fn test_bed() -> TestBed {
    let mut config = herd_config::Config::default();
    config.general.workers = 4;
    config.general.replication_timeout = 2_000;
    config.general.backlog_timeout = 2_000;

    let fleet = SimFleet::new();
    let catalog = Arc::new(MemCatalog::new());
    let connector = Arc::new(SimConnector::new(fleet.clone()));
    let pools = Pools::new(connector, PoolSettings::from_config(&config.general));
    let driver = Arc::new(SimDriver::new(fleet.clone()));

    let engine = Engine::new(Arc::new(config), catalog.clone(), driver, pools);

    TestBed {
        engine,
        fleet,
        catalog,
    }
}

impl TestBed {
    /// Create a group with `count` registered backends; returns their
    /// uuids in registration order.
    pub async fn group_with_backends(&self, group_id: &str, count: usize) -> Vec<Uuid> {
        crate::ops::group::create(&self.engine, group_id.into(), String::new(), true)
            .await
            .unwrap();

        let mut uuids = vec![];
        for i in 0..count {
            let address = format!("{}-db{}:3306", group_id, i);
            self.fleet.add_node(&address);
            let status = crate::ops::group::add(
                &self.engine,
                group_id.into(),
                address,
                "herd".into(),
                String::new(),
                false,
                true,
            )
            .await
            .unwrap();
            assert!(status.success(), "add failed: {:?}", status.diagnosis());
            let uuid = status.result().unwrap()["uuid"]
                .as_str()
                .unwrap()
                .parse()
                .unwrap();
            uuids.push(uuid);
        }
        uuids
    }

    /// Promote a group and return the new master's uuid.
    pub async fn promote(&self, group_id: &str) -> Uuid {
        let status =
            crate::ops::group::promote(&self.engine, group_id.into(), None, true)
                .await
                .unwrap();
        assert!(status.success(), "promote failed: {:?}", status.diagnosis());
        status.result().unwrap()["master_uuid"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap()
    }
}
