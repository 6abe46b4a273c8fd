//! SQL implementation of the catalog. Every statement here runs on the
//! state store through the gateway; this module is the only writer of the
//! metadata tables.

use async_trait::async_trait;
use uuid::Uuid;

use super::catalog::{Catalog, CatalogTxn};
use super::{Error, Store, StoreTxn};
use crate::sharding::{
    Bound, RangeEntry, Shard, ShardMapping, ShardState, ShardTable, ShardingType,
};
use crate::sql::Value;
use crate::topology::{Backend, BackendMode, BackendStatus, Group};

pub struct SqlCatalog {
    store: Store,
}

impl SqlCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Catalog for SqlCatalog {
    async fn begin(&self) -> Result<Box<dyn CatalogTxn>, Error> {
        Ok(Box::new(SqlCatalogTxn {
            txn: self.store.begin().await?,
        }))
    }
}

pub struct SqlCatalogTxn {
    txn: StoreTxn,
}

fn decode_backend(row: &[Value]) -> Result<Backend, Error> {
    let bad = |what: &str| Error::Row(format!("backends.{}", what));

    Ok(Backend {
        uuid: row
            .first()
            .and_then(Value::as_uuid)
            .ok_or_else(|| bad("uuid"))?,
        address: row
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| bad("address"))?
            .to_owned(),
        user: row
            .get(2)
            .and_then(Value::as_str)
            .ok_or_else(|| bad("user"))?
            .to_owned(),
        password: row
            .get(3)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        status: row
            .get(4)
            .and_then(Value::as_str)
            .and_then(BackendStatus::parse)
            .ok_or_else(|| bad("status"))?,
        mode: row
            .get(5)
            .and_then(Value::as_str)
            .and_then(BackendMode::parse)
            .ok_or_else(|| bad("mode"))?,
        weight: row.get(6).and_then(Value::as_f64).unwrap_or(1.0),
    })
}

fn decode_group(row: &[Value]) -> Result<Group, Error> {
    Ok(Group {
        id: row
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Row("groups.id".into()))?
            .to_owned(),
        description: row
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        master: row.get(2).and_then(Value::as_uuid),
        active: row.get(3).and_then(Value::as_bool).unwrap_or(false),
    })
}

fn decode_mapping(row: &[Value]) -> Result<ShardMapping, Error> {
    Ok(ShardMapping {
        id: row
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Row("shard_maps.id".into()))?,
        kind: row
            .get(1)
            .and_then(Value::as_str)
            .and_then(|s| ShardingType::parse(s).ok())
            .ok_or_else(|| Error::Row("shard_maps.type".into()))?,
        global_group: row
            .get(2)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Row("shard_maps.global_group".into()))?
            .to_owned(),
    })
}

fn decode_shard(row: &[Value]) -> Result<Shard, Error> {
    Ok(Shard {
        id: row
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Row("shards.id".into()))?,
        group_id: row
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Row("shards.group_id".into()))?
            .to_owned(),
        state: row
            .get(2)
            .and_then(Value::as_str)
            .and_then(|s| ShardState::parse(s).ok())
            .ok_or_else(|| Error::Row("shards.state".into()))?,
    })
}

impl SqlCatalogTxn {
    async fn mapping_kind(&mut self, mapping_id: u64) -> Result<Option<ShardingType>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT type FROM shard_maps WHERE id = ?",
                &[mapping_id.into()],
            )
            .await?;
        Ok(rows
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .and_then(|s| ShardingType::parse(s).ok()))
    }
}

#[async_trait]
impl CatalogTxn for SqlCatalogTxn {
    async fn insert_backend(&mut self, backend: &Backend) -> Result<(), Error> {
        self.txn
            .exec(
                "INSERT INTO backends (uuid, address, user, passwd, status, mode, weight) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                &[
                    backend.uuid.into(),
                    backend.address.as_str().into(),
                    backend.user.as_str().into(),
                    backend.password.as_str().into(),
                    backend.status.to_string().into(),
                    backend.mode.to_string().into(),
                    backend.weight.into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_backend(&mut self, backend: &Backend) -> Result<(), Error> {
        self.txn
            .exec(
                "UPDATE backends SET address = ?, user = ?, passwd = ?, status = ?, \
                 mode = ?, weight = ? WHERE uuid = ?",
                &[
                    backend.address.as_str().into(),
                    backend.user.as_str().into(),
                    backend.password.as_str().into(),
                    backend.status.to_string().into(),
                    backend.mode.to_string().into(),
                    backend.weight.into(),
                    backend.uuid.into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_backend(&mut self, uuid: &Uuid) -> Result<(), Error> {
        self.txn
            .exec("DELETE FROM backends WHERE uuid = ?", &[(*uuid).into()])
            .await?;
        Ok(())
    }

    async fn backend(&mut self, uuid: &Uuid) -> Result<Option<Backend>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT uuid, address, user, passwd, status, mode, weight \
                 FROM backends WHERE uuid = ?",
                &[(*uuid).into()],
            )
            .await?;
        rows.rows.first().map(|r| decode_backend(r)).transpose()
    }

    async fn backend_by_address(&mut self, address: &str) -> Result<Option<Backend>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT uuid, address, user, passwd, status, mode, weight \
                 FROM backends WHERE address = ?",
                &[address.into()],
            )
            .await?;
        rows.rows.first().map(|r| decode_backend(r)).transpose()
    }

    async fn insert_group(&mut self, group: &Group) -> Result<(), Error> {
        self.txn
            .exec(
                "INSERT INTO `groups` (id, description, master_uuid, status) VALUES (?, ?, ?, ?)",
                &[
                    group.id.as_str().into(),
                    group.description.as_str().into(),
                    group.master.into(),
                    group.active.into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_group(&mut self, group: &Group) -> Result<(), Error> {
        self.txn
            .exec(
                "UPDATE `groups` SET description = ?, master_uuid = ?, status = ? WHERE id = ?",
                &[
                    group.description.as_str().into(),
                    group.master.into(),
                    group.active.into(),
                    group.id.as_str().into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_group(&mut self, id: &str) -> Result<(), Error> {
        self.txn
            .exec("DELETE FROM `groups` WHERE id = ?", &[id.into()])
            .await?;
        Ok(())
    }

    async fn group(&mut self, id: &str) -> Result<Option<Group>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT id, description, master_uuid, status FROM `groups` WHERE id = ?",
                &[id.into()],
            )
            .await?;
        rows.rows.first().map(|r| decode_group(r)).transpose()
    }

    async fn groups(&mut self) -> Result<Vec<Group>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT id, description, master_uuid, status FROM `groups` ORDER BY id",
                &[],
            )
            .await?;
        rows.rows.iter().map(|r| decode_group(r)).collect()
    }

    async fn add_member(&mut self, group_id: &str, uuid: &Uuid) -> Result<(), Error> {
        self.txn
            .exec(
                "INSERT INTO group_members (group_id, backend_uuid) VALUES (?, ?)",
                &[group_id.into(), (*uuid).into()],
            )
            .await?;
        Ok(())
    }

    async fn remove_member(&mut self, group_id: &str, uuid: &Uuid) -> Result<(), Error> {
        self.txn
            .exec(
                "DELETE FROM group_members WHERE group_id = ? AND backend_uuid = ?",
                &[group_id.into(), (*uuid).into()],
            )
            .await?;
        Ok(())
    }

    async fn members(&mut self, group_id: &str) -> Result<Vec<Backend>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT b.uuid, b.address, b.user, b.passwd, b.status, b.mode, b.weight \
                 FROM backends b JOIN group_members m ON m.backend_uuid = b.uuid \
                 WHERE m.group_id = ? ORDER BY b.uuid",
                &[group_id.into()],
            )
            .await?;
        rows.rows.iter().map(|r| decode_backend(r)).collect()
    }

    async fn group_of(&mut self, uuid: &Uuid) -> Result<Option<String>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT group_id FROM group_members WHERE backend_uuid = ?",
                &[(*uuid).into()],
            )
            .await?;
        Ok(rows
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    async fn master_group_of(&mut self, group_id: &str) -> Result<Option<String>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT master_group_id FROM global_to_shard WHERE group_id = ?",
                &[group_id.into()],
            )
            .await?;
        Ok(rows
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    async fn slave_groups_of(&mut self, group_id: &str) -> Result<Vec<String>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT slave_group_id FROM shard_to_global WHERE group_id = ? \
                 ORDER BY slave_group_id",
                &[group_id.into()],
            )
            .await?;
        Ok(rows
            .rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_str).map(str::to_owned))
            .collect())
    }

    async fn link_groups(&mut self, master_group: &str, slave_group: &str) -> Result<(), Error> {
        self.txn
            .exec(
                "REPLACE INTO global_to_shard (group_id, master_group_id) VALUES (?, ?)",
                &[slave_group.into(), master_group.into()],
            )
            .await?;
        self.txn
            .exec(
                "REPLACE INTO shard_to_global (group_id, slave_group_id) VALUES (?, ?)",
                &[master_group.into(), slave_group.into()],
            )
            .await?;
        Ok(())
    }

    async fn unlink_groups(&mut self, master_group: &str, slave_group: &str) -> Result<(), Error> {
        self.txn
            .exec(
                "DELETE FROM global_to_shard WHERE group_id = ? AND master_group_id = ?",
                &[slave_group.into(), master_group.into()],
            )
            .await?;
        self.txn
            .exec(
                "DELETE FROM shard_to_global WHERE group_id = ? AND slave_group_id = ?",
                &[master_group.into(), slave_group.into()],
            )
            .await?;
        Ok(())
    }

    async fn insert_mapping(
        &mut self,
        kind: ShardingType,
        global_group: &str,
    ) -> Result<u64, Error> {
        self.txn
            .exec(
                "INSERT INTO shard_maps (type, global_group) VALUES (?, ?)",
                &[kind.to_string().into(), global_group.into()],
            )
            .await?;
        Ok(self.txn.last_insert_id())
    }

    async fn mapping(&mut self, id: u64) -> Result<Option<ShardMapping>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT id, type, global_group FROM shard_maps WHERE id = ?",
                &[id.into()],
            )
            .await?;
        rows.rows.first().map(|r| decode_mapping(r)).transpose()
    }

    async fn mappings(&mut self) -> Result<Vec<ShardMapping>, Error> {
        let rows = self
            .txn
            .query("SELECT id, type, global_group FROM shard_maps ORDER BY id", &[])
            .await?;
        rows.rows.iter().map(|r| decode_mapping(r)).collect()
    }

    async fn delete_mapping(&mut self, id: u64) -> Result<(), Error> {
        self.txn
            .exec("DELETE FROM shard_maps WHERE id = ?", &[id.into()])
            .await?;
        Ok(())
    }

    async fn insert_table(&mut self, table: &ShardTable) -> Result<(), Error> {
        self.txn
            .exec(
                "INSERT INTO shard_tables (map_id, table_name, column_name) VALUES (?, ?, ?)",
                &[
                    table.mapping_id.into(),
                    table.table.as_str().into(),
                    table.column.as_str().into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_table(&mut self, table: &str) -> Result<(), Error> {
        self.txn
            .exec("DELETE FROM shard_tables WHERE table_name = ?", &[table.into()])
            .await?;
        Ok(())
    }

    async fn table(&mut self, table: &str) -> Result<Option<ShardTable>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT map_id, table_name, column_name FROM shard_tables WHERE table_name = ?",
                &[table.into()],
            )
            .await?;
        Ok(rows.rows.first().map(|r| ShardTable {
            mapping_id: r.first().and_then(Value::as_u64).unwrap_or_default(),
            table: r
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            column: r
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }))
    }

    async fn tables_of(&mut self, mapping_id: u64) -> Result<Vec<ShardTable>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT map_id, table_name, column_name FROM shard_tables \
                 WHERE map_id = ? ORDER BY table_name",
                &[mapping_id.into()],
            )
            .await?;
        Ok(rows
            .rows
            .iter()
            .map(|r| ShardTable {
                mapping_id,
                table: r
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                column: r
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            })
            .collect())
    }

    async fn insert_shard(&mut self, group_id: &str, state: ShardState) -> Result<u64, Error> {
        self.txn
            .exec(
                "INSERT INTO shards (group_id, state) VALUES (?, ?)",
                &[group_id.into(), state.to_string().into()],
            )
            .await?;
        Ok(self.txn.last_insert_id())
    }

    async fn shard(&mut self, id: u64) -> Result<Option<Shard>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT id, group_id, state FROM shards WHERE id = ?",
                &[id.into()],
            )
            .await?;
        rows.rows.first().map(|r| decode_shard(r)).transpose()
    }

    async fn shard_on_group(&mut self, group_id: &str) -> Result<Option<Shard>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT id, group_id, state FROM shards WHERE group_id = ?",
                &[group_id.into()],
            )
            .await?;
        rows.rows.first().map(|r| decode_shard(r)).transpose()
    }

    async fn update_shard(&mut self, shard: &Shard) -> Result<(), Error> {
        self.txn
            .exec(
                "UPDATE shards SET group_id = ?, state = ? WHERE id = ?",
                &[
                    shard.group_id.as_str().into(),
                    shard.state.to_string().into(),
                    shard.id.into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_shard(&mut self, id: u64) -> Result<(), Error> {
        self.txn
            .exec("DELETE FROM shards WHERE id = ?", &[id.into()])
            .await?;
        Ok(())
    }

    async fn insert_range(&mut self, entry: &RangeEntry) -> Result<(), Error> {
        self.txn
            .exec(
                "INSERT INTO shard_ranges (map_id, lower_bound, shard_id) VALUES (?, ?, ?)",
                &[
                    entry.mapping_id.into(),
                    entry.lower_bound.encode(),
                    entry.shard_id.into(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_range(&mut self, shard_id: u64) -> Result<(), Error> {
        self.txn
            .exec("DELETE FROM shard_ranges WHERE shard_id = ?", &[shard_id.into()])
            .await?;
        Ok(())
    }

    async fn ranges(&mut self, mapping_id: u64) -> Result<Vec<RangeEntry>, Error> {
        let kind = match self.mapping_kind(mapping_id).await? {
            Some(kind) => kind,
            None => return Ok(vec![]),
        };

        let rows = self
            .txn
            .query(
                "SELECT map_id, lower_bound, shard_id FROM shard_ranges WHERE map_id = ?",
                &[mapping_id.into()],
            )
            .await?;

        rows.rows
            .iter()
            .map(|r| {
                let lower = r
                    .get(1)
                    .ok_or_else(|| Error::Row("shard_ranges.lower_bound".into()))?;
                Ok(RangeEntry {
                    mapping_id,
                    lower_bound: Bound::decode(kind, lower)
                        .map_err(|e| Error::Row(e.to_string()))?,
                    shard_id: r
                        .get(2)
                        .and_then(Value::as_u64)
                        .ok_or_else(|| Error::Row("shard_ranges.shard_id".into()))?,
                })
            })
            .collect()
    }

    async fn range_of(&mut self, shard_id: u64) -> Result<Option<RangeEntry>, Error> {
        let rows = self
            .txn
            .query(
                "SELECT r.map_id, r.lower_bound, r.shard_id, m.type \
                 FROM shard_ranges r JOIN shard_maps m ON m.id = r.map_id \
                 WHERE r.shard_id = ?",
                &[shard_id.into()],
            )
            .await?;

        let row = match rows.rows.first() {
            Some(row) => row,
            None => return Ok(None),
        };

        let kind = row
            .get(3)
            .and_then(Value::as_str)
            .and_then(|s| ShardingType::parse(s).ok())
            .ok_or_else(|| Error::Row("shard_maps.type".into()))?;
        let lower = row
            .get(1)
            .ok_or_else(|| Error::Row("shard_ranges.lower_bound".into()))?;

        Ok(Some(RangeEntry {
            mapping_id: row
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Row("shard_ranges.map_id".into()))?,
            lower_bound: Bound::decode(kind, lower).map_err(|e| Error::Row(e.to_string()))?,
            shard_id,
        }))
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.txn.commit().await
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        self.txn.rollback().await
    }
}
