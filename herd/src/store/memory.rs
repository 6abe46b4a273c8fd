//! In-memory catalog. Backs tests and `configcheck`; transactions take a
//! snapshot and restore it on rollback. A global async mutex serializes
//! transactions, which is exactly the isolation level the tests need.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::catalog::{Catalog, CatalogTxn};
use super::Error;
use crate::sharding::{RangeEntry, Shard, ShardMapping, ShardState, ShardTable, ShardingType};
use crate::topology::{Backend, Group};

#[derive(Default, Clone)]
struct MemState {
    backends: HashMap<Uuid, Backend>,
    groups: BTreeMap<String, Group>,
    members: BTreeMap<String, BTreeSet<Uuid>>,
    /// slave group id -> master group id
    edges: BTreeMap<String, String>,
    mappings: BTreeMap<u64, ShardMapping>,
    tables: BTreeMap<String, ShardTable>,
    shards: BTreeMap<u64, Shard>,
    ranges: Vec<RangeEntry>,
    next_mapping: u64,
    next_shard: u64,
}

#[derive(Default, Clone)]
pub struct MemCatalog {
    state: Arc<Mutex<MemState>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn begin(&self) -> Result<Box<dyn CatalogTxn>, Error> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemCatalogTxn {
            guard,
            snapshot,
            done: false,
        }))
    }
}

pub struct MemCatalogTxn {
    guard: OwnedMutexGuard<MemState>,
    snapshot: MemState,
    done: bool,
}

impl MemCatalogTxn {
    fn state(&mut self) -> Result<&mut MemState, Error> {
        if self.done {
            Err(Error::Done)
        } else {
            Ok(&mut self.guard)
        }
    }
}

impl Drop for MemCatalogTxn {
    fn drop(&mut self) {
        // Dropped without commit: restore the snapshot, like the server
        // rolling back a closed connection.
        if !self.done {
            *self.guard = self.snapshot.clone();
        }
    }
}

#[async_trait]
impl CatalogTxn for MemCatalogTxn {
    async fn insert_backend(&mut self, backend: &Backend) -> Result<(), Error> {
        let state = self.state()?;
        state.backends.insert(backend.uuid, backend.clone());
        Ok(())
    }

    async fn update_backend(&mut self, backend: &Backend) -> Result<(), Error> {
        let state = self.state()?;
        state.backends.insert(backend.uuid, backend.clone());
        Ok(())
    }

    async fn delete_backend(&mut self, uuid: &Uuid) -> Result<(), Error> {
        let state = self.state()?;
        state.backends.remove(uuid);
        Ok(())
    }

    async fn backend(&mut self, uuid: &Uuid) -> Result<Option<Backend>, Error> {
        Ok(self.state()?.backends.get(uuid).cloned())
    }

    async fn backend_by_address(&mut self, address: &str) -> Result<Option<Backend>, Error> {
        Ok(self
            .state()?
            .backends
            .values()
            .find(|b| b.address == address)
            .cloned())
    }

    async fn insert_group(&mut self, group: &Group) -> Result<(), Error> {
        let state = self.state()?;
        state.groups.insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn update_group(&mut self, group: &Group) -> Result<(), Error> {
        let state = self.state()?;
        state.groups.insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn delete_group(&mut self, id: &str) -> Result<(), Error> {
        let state = self.state()?;
        state.groups.remove(id);
        state.members.remove(id);
        Ok(())
    }

    async fn group(&mut self, id: &str) -> Result<Option<Group>, Error> {
        Ok(self.state()?.groups.get(id).cloned())
    }

    async fn groups(&mut self) -> Result<Vec<Group>, Error> {
        Ok(self.state()?.groups.values().cloned().collect())
    }

    async fn add_member(&mut self, group_id: &str, uuid: &Uuid) -> Result<(), Error> {
        let state = self.state()?;
        state
            .members
            .entry(group_id.to_owned())
            .or_default()
            .insert(*uuid);
        Ok(())
    }

    async fn remove_member(&mut self, group_id: &str, uuid: &Uuid) -> Result<(), Error> {
        let state = self.state()?;
        if let Some(members) = state.members.get_mut(group_id) {
            members.remove(uuid);
        }
        Ok(())
    }

    async fn members(&mut self, group_id: &str) -> Result<Vec<Backend>, Error> {
        let state = self.state()?;
        let mut members = vec![];
        if let Some(uuids) = state.members.get(group_id) {
            for uuid in uuids {
                if let Some(backend) = state.backends.get(uuid) {
                    members.push(backend.clone());
                }
            }
        }
        Ok(members)
    }

    async fn group_of(&mut self, uuid: &Uuid) -> Result<Option<String>, Error> {
        let state = self.state()?;
        Ok(state
            .members
            .iter()
            .find(|(_, members)| members.contains(uuid))
            .map(|(id, _)| id.clone()))
    }

    async fn master_group_of(&mut self, group_id: &str) -> Result<Option<String>, Error> {
        Ok(self.state()?.edges.get(group_id).cloned())
    }

    async fn slave_groups_of(&mut self, group_id: &str) -> Result<Vec<String>, Error> {
        let state = self.state()?;
        Ok(state
            .edges
            .iter()
            .filter(|(_, master)| master.as_str() == group_id)
            .map(|(slave, _)| slave.clone())
            .collect())
    }

    async fn link_groups(&mut self, master_group: &str, slave_group: &str) -> Result<(), Error> {
        let state = self.state()?;
        state
            .edges
            .insert(slave_group.to_owned(), master_group.to_owned());
        Ok(())
    }

    async fn unlink_groups(&mut self, master_group: &str, slave_group: &str) -> Result<(), Error> {
        let state = self.state()?;
        if state.edges.get(slave_group).map(String::as_str) == Some(master_group) {
            state.edges.remove(slave_group);
        }
        Ok(())
    }

    async fn insert_mapping(
        &mut self,
        kind: ShardingType,
        global_group: &str,
    ) -> Result<u64, Error> {
        let state = self.state()?;
        state.next_mapping += 1;
        let id = state.next_mapping;
        state.mappings.insert(
            id,
            ShardMapping {
                id,
                kind,
                global_group: global_group.to_owned(),
            },
        );
        Ok(id)
    }

    async fn mapping(&mut self, id: u64) -> Result<Option<ShardMapping>, Error> {
        Ok(self.state()?.mappings.get(&id).cloned())
    }

    async fn mappings(&mut self) -> Result<Vec<ShardMapping>, Error> {
        Ok(self.state()?.mappings.values().cloned().collect())
    }

    async fn delete_mapping(&mut self, id: u64) -> Result<(), Error> {
        let state = self.state()?;
        state.mappings.remove(&id);
        Ok(())
    }

    async fn insert_table(&mut self, table: &ShardTable) -> Result<(), Error> {
        let state = self.state()?;
        state.tables.insert(table.table.clone(), table.clone());
        Ok(())
    }

    async fn delete_table(&mut self, table: &str) -> Result<(), Error> {
        let state = self.state()?;
        state.tables.remove(table);
        Ok(())
    }

    async fn table(&mut self, table: &str) -> Result<Option<ShardTable>, Error> {
        Ok(self.state()?.tables.get(table).cloned())
    }

    async fn tables_of(&mut self, mapping_id: u64) -> Result<Vec<ShardTable>, Error> {
        Ok(self
            .state()?
            .tables
            .values()
            .filter(|t| t.mapping_id == mapping_id)
            .cloned()
            .collect())
    }

    async fn insert_shard(&mut self, group_id: &str, state: ShardState) -> Result<u64, Error> {
        let inner = self.state()?;
        inner.next_shard += 1;
        let id = inner.next_shard;
        inner.shards.insert(
            id,
            Shard {
                id,
                group_id: group_id.to_owned(),
                state,
            },
        );
        Ok(id)
    }

    async fn shard(&mut self, id: u64) -> Result<Option<Shard>, Error> {
        Ok(self.state()?.shards.get(&id).cloned())
    }

    async fn shard_on_group(&mut self, group_id: &str) -> Result<Option<Shard>, Error> {
        Ok(self
            .state()?
            .shards
            .values()
            .find(|s| s.group_id == group_id)
            .cloned())
    }

    async fn update_shard(&mut self, shard: &Shard) -> Result<(), Error> {
        let state = self.state()?;
        state.shards.insert(shard.id, shard.clone());
        Ok(())
    }

    async fn delete_shard(&mut self, id: u64) -> Result<(), Error> {
        let state = self.state()?;
        state.shards.remove(&id);
        Ok(())
    }

    async fn insert_range(&mut self, entry: &RangeEntry) -> Result<(), Error> {
        let state = self.state()?;
        state.ranges.push(entry.clone());
        Ok(())
    }

    async fn delete_range(&mut self, shard_id: u64) -> Result<(), Error> {
        let state = self.state()?;
        state.ranges.retain(|r| r.shard_id != shard_id);
        Ok(())
    }

    async fn ranges(&mut self, mapping_id: u64) -> Result<Vec<RangeEntry>, Error> {
        Ok(self
            .state()?
            .ranges
            .iter()
            .filter(|r| r.mapping_id == mapping_id)
            .cloned()
            .collect())
    }

    async fn range_of(&mut self, shard_id: u64) -> Result<Option<RangeEntry>, Error> {
        Ok(self
            .state()?
            .ranges
            .iter()
            .find(|r| r.shard_id == shard_id)
            .cloned())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        if self.done {
            return Err(Error::Done);
        }
        self.done = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        if self.done {
            return Err(Error::Done);
        }
        *self.guard = self.snapshot.clone();
        self.done = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::Group;

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let catalog = MemCatalog::new();

        let mut txn = catalog.begin().await.unwrap();
        txn.insert_group(&Group::new("g1", "")).await.unwrap();
        txn.commit().await.unwrap();
        drop(txn);

        let mut txn = catalog.begin().await.unwrap();
        txn.insert_group(&Group::new("g2", "")).await.unwrap();
        txn.rollback().await.unwrap();
        drop(txn);

        let mut txn = catalog.begin().await.unwrap();
        let groups = txn.groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "g1");
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let catalog = MemCatalog::new();

        {
            let mut txn = catalog.begin().await.unwrap();
            txn.insert_group(&Group::new("g1", "")).await.unwrap();
            // No commit.
        }

        let mut txn = catalog.begin().await.unwrap();
        assert!(txn.groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_leaves_no_residue() {
        let catalog = MemCatalog::new();

        let mut txn = catalog.begin().await.unwrap();
        let id = txn
            .insert_mapping(ShardingType::Range, "global")
            .await
            .unwrap();
        let shard = txn.insert_shard("g1", ShardState::Disabled).await.unwrap();
        txn.insert_range(&RangeEntry {
            mapping_id: id,
            lower_bound: crate::sharding::Bound::Int(1),
            shard_id: shard,
        })
        .await
        .unwrap();

        txn.delete_range(shard).await.unwrap();
        txn.delete_shard(shard).await.unwrap();
        txn.delete_mapping(id).await.unwrap();
        txn.commit().await.unwrap();
        drop(txn);

        let mut txn = catalog.begin().await.unwrap();
        assert!(txn.mappings().await.unwrap().is_empty());
        assert!(txn.ranges(id).await.unwrap().is_empty());
    }
}
