//! Shard lifecycle: add at definition time, enable/disable, remove,
//! lookup, prune. Growth after definition goes through split.

use serde_json::json;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::key::Bound;
use super::{index, Error, RangeEntry, Shard, ShardMapping, ShardState};
use crate::engine::Engine;
use crate::error::Error as EngineError;
use crate::executor::{step, Step};
use crate::fanout;
use crate::store::CatalogTxn;
use crate::topology::Backend;

/// Fetch the (range entry, shard, mapping) triple or fail.
pub(crate) async fn verify_and_fetch_shard(
    txn: &mut dyn CatalogTxn,
    shard_id: u64,
) -> Result<(RangeEntry, Shard, ShardMapping), EngineError> {
    let entry = txn
        .range_of(shard_id)
        .await?
        .ok_or(Error::ShardNotFound(shard_id))?;
    let shard = txn
        .shard(shard_id)
        .await?
        .ok_or(Error::ShardNotFound(shard_id))?;
    let mapping = txn
        .mapping(entry.mapping_id)
        .await?
        .ok_or(Error::MappingNotFound(entry.mapping_id))?;
    Ok((entry, shard, mapping))
}

/// The master of a group, as a backend record.
pub(crate) async fn group_master(
    txn: &mut dyn CatalogTxn,
    group_id: &str,
) -> Result<Backend, EngineError> {
    let group = txn
        .group(group_id)
        .await?
        .ok_or_else(|| Error::GroupNotFound(group_id.to_owned()))?;
    let master = group
        .master
        .ok_or_else(|| Error::MasterNotFound(group_id.to_owned()))?;
    txn.backend(&master)
        .await?
        .ok_or_else(|| EngineError::server(format!("backend ({}) does not exist", master)))
}

/// Entry step of `sharding.add_shard`. Shards are added only while the
/// mapping is empty; every later change of shape goes through move/split.
pub fn add_shard(
    engine: Engine,
    mapping_id: u64,
    groups: Vec<(String, Option<String>)>,
    state: ShardState,
) -> Step {
    step("add_shard", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let mapping = cat
            .mapping(mapping_id)
            .await?
            .ok_or(Error::MappingNotFound(mapping_id))?;

        if !cat.ranges(mapping_id).await?.is_empty() {
            return Err(Error::ShardsAlreadyExist(mapping_id).into());
        }

        // Parse/derive every lower bound before touching anything.
        let mut bounds: Vec<Bound> = Vec::with_capacity(groups.len());
        for (group_id, lower) in &groups {
            let bound = if mapping.kind.is_hash() {
                if lower.is_some() {
                    return Err(Error::LowerBoundAutoGenerated.into());
                }
                mapping.kind.hashed_bound(group_id)
            } else {
                let raw = lower
                    .as_deref()
                    .ok_or_else(|| Error::LowerBoundMissing(group_id.clone()))?;
                mapping.kind.parse_bound(raw)?
            };

            if bounds.contains(&bound) {
                return Err(Error::InvalidLowerBound(bound.to_string()).into());
            }
            bounds.push(bound);
        }

        let mut shard_ids = Vec::with_capacity(groups.len());
        for ((group_id, _), bound) in groups.iter().zip(bounds) {
            if cat.group(group_id).await?.is_none() {
                return Err(Error::GroupNotFound(group_id.clone()).into());
            }
            if cat.shard_on_group(group_id).await?.is_some() {
                return Err(Error::DestinationNotEmpty(group_id.clone()).into());
            }

            let shard_id = cat.insert_shard(group_id, state).await?;
            cat.insert_range(&RangeEntry {
                mapping_id,
                lower_bound: bound,
                shard_id,
            })
            .await?;

            // An enabled shard replicates from the global group's master
            // from the moment it exists.
            if state == ShardState::Enabled {
                fanout::setup_group_replication(&engine, &mut **cat, &mapping.global_group, group_id)
                    .await?;
            }

            info!(
                "added shard ({}) for mapping ({}) on group ({})",
                shard_id, mapping_id, group_id
            );
            shard_ids.push(shard_id);
        }
        drop(cat);

        ctx.report(json!({ "shard_ids": shard_ids }));
        Ok(())
    })
}

/// Entry step of `sharding.remove_shard`. Only disabled shards go away.
pub fn remove_shard(engine: Engine, shard_id: u64) -> Step {
    step("remove_shard", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let (_, shard, mapping) = verify_and_fetch_shard(&mut **cat, shard_id).await?;
        if shard.state == ShardState::Enabled {
            return Err(Error::ShardNotDisabled(shard_id).into());
        }

        // Replication was stopped at disable time; this clears the edge
        // from the books as well.
        fanout::stop_group_slave(
            &engine,
            &mut **cat,
            &mapping.global_group,
            &shard.group_id,
            true,
        )
        .await?;

        cat.delete_range(shard_id).await?;
        cat.delete_shard(shard_id).await?;

        info!("removed shard ({})", shard_id);
        Ok(())
    })
}

/// Entry step of `sharding.enable_shard`.
pub fn enable_shard(engine: Engine, shard_id: u64) -> Step {
    step("enable_shard", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let (_, mut shard, mapping) = verify_and_fetch_shard(&mut **cat, shard_id).await?;

        fanout::setup_group_replication(&engine, &mut **cat, &mapping.global_group, &shard.group_id)
            .await?;

        shard.state = ShardState::Enabled;
        cat.update_shard(&shard).await?;
        Ok(())
    })
}

/// Entry step of `sharding.disable_shard`. Replication stops but the edge
/// stays on the books until the shard is removed.
pub fn disable_shard(engine: Engine, shard_id: u64) -> Step {
    step("disable_shard", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let (_, mut shard, mapping) = verify_and_fetch_shard(&mut **cat, shard_id).await?;

        fanout::stop_group_slave(
            &engine,
            &mut **cat,
            &mapping.global_group,
            &shard.group_id,
            false,
        )
        .await?;

        shard.state = ShardState::Disabled;
        cat.update_shard(&shard).await?;
        Ok(())
    })
}

/// One backend of the group serving a lookup result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerInfo {
    pub uuid: Uuid,
    pub address: String,
    pub master: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupHint {
    Local,
    Global,
}

impl LookupHint {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(LookupHint::Local),
            "GLOBAL" => Ok(LookupHint::Global),
            other => Err(Error::InvalidHint(other.into())),
        }
    }
}

/// Resolve the servers responsible for a key of a sharded table. GLOBAL
/// ignores the key and answers with the global group; LOCAL walks the
/// shard index and rejects keys landing on disabled shards.
pub async fn lookup(
    engine: &Engine,
    table: &str,
    key: &str,
    hint: LookupHint,
) -> Result<Vec<ServerInfo>, EngineError> {
    let mut txn = engine.read().await?;

    let attached = txn
        .table(table)
        .await?
        .ok_or_else(|| Error::TableNotFound(table.to_owned()))?;
    let mapping = txn
        .mapping(attached.mapping_id)
        .await?
        .ok_or(Error::MappingNotFound(attached.mapping_id))?;

    let group_id = match hint {
        LookupHint::Global => mapping.global_group.clone(),
        LookupHint::Local => {
            let key_bound = mapping
                .kind
                .key_bound(key)
                .map_err(|_| Error::InvalidKey(key.to_owned()))?;

            let entries = txn.ranges(mapping.id).await?;
            let entry = index::locate(mapping.kind, &entries, &key_bound)
                .ok_or_else(|| Error::InvalidKey(key.to_owned()))?;

            let shard = txn
                .shard(entry.shard_id)
                .await?
                .ok_or(Error::ShardNotFound(entry.shard_id))?;
            if shard.state == ShardState::Disabled {
                return Err(Error::ShardNotEnabled(shard.id).into());
            }
            shard.group_id
        }
    };

    let group = txn
        .group(&group_id)
        .await?
        .ok_or_else(|| Error::GroupNotFound(group_id.clone()))?;

    let servers = txn
        .members(&group_id)
        .await?
        .into_iter()
        .map(|backend| ServerInfo {
            master: group.is_master(&backend.uuid),
            uuid: backend.uuid,
            address: backend.address,
        })
        .collect();

    Ok(servers)
}

/// Entry step of `sharding.prune_shard`: on every shard of the table's
/// mapping, delete the rows falling outside that shard's window.
pub fn prune_shard(engine: Engine, table: String) -> Step {
    step("prune_shard_tables", move |ctx| async move {
        let pruned = {
            let mut cat = ctx.catalog().await?;
            let attached = cat
                .table(&table)
                .await?
                .ok_or_else(|| Error::TableNotFound(table.clone()))?;
            let mapping = cat
                .mapping(attached.mapping_id)
                .await?
                .ok_or(Error::MappingNotFound(attached.mapping_id))?;

            let entries = cat.ranges(mapping.id).await?;
            prune_entries(
                &engine,
                &mut **cat,
                &mapping,
                &entries,
                &entries,
                &attached.table,
                &attached.column,
            )
            .await?
        };

        ctx.report(json!({ "table": table, "rows_pruned": pruned }));
        Ok(())
    })
}

/// Prune one table on the `targets` shards; windows are computed against
/// the full entry list of the mapping. Returns total rows deleted.
pub(crate) async fn prune_entries(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    mapping: &ShardMapping,
    entries: &[RangeEntry],
    targets: &[RangeEntry],
    table: &str,
    column: &str,
) -> Result<u64, EngineError> {
    let mut pruned = 0;

    for entry in targets {
        let window = match index::prune_window(mapping.kind, entries, entry) {
            Some(window) => window,
            // The shard owns the whole domain; nothing to delete.
            None => continue,
        };

        let shard = txn
            .shard(entry.shard_id)
            .await?
            .ok_or(Error::ShardNotFound(entry.shard_id))?;
        let master = group_master(txn, &shard.group_id).await?;

        pruned += engine
            .driver()
            .prune_rows(&master, table, column, mapping.kind, &window)
            .await?;
    }

    Ok(pruned)
}
