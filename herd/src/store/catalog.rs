//! Typed persistence surface. The rest of the engine reads and writes the
//! topology model through this trait; the SQL implementation is the only
//! component that touches the metadata tables.

use async_trait::async_trait;
use uuid::Uuid;

use super::Error;
use crate::sharding::{RangeEntry, Shard, ShardMapping, ShardState, ShardTable, ShardingType};
use crate::topology::{Backend, Group};

#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Open a transaction. Procedure steps get exactly one; reads open one
    /// and drop it.
    async fn begin(&self) -> Result<Box<dyn CatalogTxn>, Error>;
}

#[async_trait]
pub trait CatalogTxn: Send {
    // Backends.
    async fn insert_backend(&mut self, backend: &Backend) -> Result<(), Error>;
    async fn update_backend(&mut self, backend: &Backend) -> Result<(), Error>;
    async fn delete_backend(&mut self, uuid: &Uuid) -> Result<(), Error>;
    async fn backend(&mut self, uuid: &Uuid) -> Result<Option<Backend>, Error>;
    async fn backend_by_address(&mut self, address: &str) -> Result<Option<Backend>, Error>;

    // Groups and membership.
    async fn insert_group(&mut self, group: &Group) -> Result<(), Error>;
    async fn update_group(&mut self, group: &Group) -> Result<(), Error>;
    async fn delete_group(&mut self, id: &str) -> Result<(), Error>;
    async fn group(&mut self, id: &str) -> Result<Option<Group>, Error>;
    async fn groups(&mut self) -> Result<Vec<Group>, Error>;
    async fn add_member(&mut self, group_id: &str, uuid: &Uuid) -> Result<(), Error>;
    async fn remove_member(&mut self, group_id: &str, uuid: &Uuid) -> Result<(), Error>;
    async fn members(&mut self, group_id: &str) -> Result<Vec<Backend>, Error>;
    async fn group_of(&mut self, uuid: &Uuid) -> Result<Option<String>, Error>;

    // Group replication relations (the fan-out edges).
    async fn master_group_of(&mut self, group_id: &str) -> Result<Option<String>, Error>;
    async fn slave_groups_of(&mut self, group_id: &str) -> Result<Vec<String>, Error>;
    async fn link_groups(&mut self, master_group: &str, slave_group: &str) -> Result<(), Error>;
    async fn unlink_groups(&mut self, master_group: &str, slave_group: &str) -> Result<(), Error>;

    // Shard mappings and attached tables.
    async fn insert_mapping(
        &mut self,
        kind: ShardingType,
        global_group: &str,
    ) -> Result<u64, Error>;
    async fn mapping(&mut self, id: u64) -> Result<Option<ShardMapping>, Error>;
    async fn mappings(&mut self) -> Result<Vec<ShardMapping>, Error>;
    async fn delete_mapping(&mut self, id: u64) -> Result<(), Error>;
    async fn insert_table(&mut self, table: &ShardTable) -> Result<(), Error>;
    async fn delete_table(&mut self, table: &str) -> Result<(), Error>;
    async fn table(&mut self, table: &str) -> Result<Option<ShardTable>, Error>;
    async fn tables_of(&mut self, mapping_id: u64) -> Result<Vec<ShardTable>, Error>;

    // Shards and their index entries.
    async fn insert_shard(&mut self, group_id: &str, state: ShardState) -> Result<u64, Error>;
    async fn shard(&mut self, id: u64) -> Result<Option<Shard>, Error>;
    async fn shard_on_group(&mut self, group_id: &str) -> Result<Option<Shard>, Error>;
    async fn update_shard(&mut self, shard: &Shard) -> Result<(), Error>;
    async fn delete_shard(&mut self, id: u64) -> Result<(), Error>;
    async fn insert_range(&mut self, entry: &RangeEntry) -> Result<(), Error>;
    async fn delete_range(&mut self, shard_id: u64) -> Result<(), Error>;
    async fn ranges(&mut self, mapping_id: u64) -> Result<Vec<RangeEntry>, Error>;
    async fn range_of(&mut self, shard_id: u64) -> Result<Option<RangeEntry>, Error>;

    async fn commit(&mut self) -> Result<(), Error>;
    async fn rollback(&mut self) -> Result<(), Error>;
}
