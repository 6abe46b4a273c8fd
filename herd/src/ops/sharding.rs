//! Sharding operations: definitions, shards, lookup, prune, online move
//! and split.

use serde_json::json;

use super::run;
use crate::engine::Engine;
use crate::error::Error;
use crate::executor::ProcedureStatus;
use crate::sharding::shards::{self, LookupHint, ServerInfo};
use crate::sharding::{definition, mover, splitter, Error as ShardingError, ShardState, ShardingType};

/// Lock name of a shard mapping. Groups are locked by their id; mappings
/// get their own namespace so a group called "7" cannot collide.
fn mapping_lock(mapping_id: u64) -> String {
    format!("shard-mapping:{}", mapping_id)
}

/// Resolve the lock set of a shard: its mapping plus its hosting group.
async fn shard_locks(engine: &Engine, shard_id: u64) -> Result<Vec<String>, Error> {
    let mut txn = engine.read().await?;
    let entry = txn
        .range_of(shard_id)
        .await?
        .ok_or(ShardingError::ShardNotFound(shard_id))?;
    let shard = txn
        .shard(shard_id)
        .await?
        .ok_or(ShardingError::ShardNotFound(shard_id))?;
    Ok(vec![mapping_lock(entry.mapping_id), shard.group_id])
}

/// `sharding.create_definition`
pub async fn create_definition(
    engine: &Engine,
    sharding_type: &str,
    global_group: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let kind = ShardingType::parse(sharding_type)?;
    let locks = vec![global_group.clone()];
    let entry = definition::create_definition(kind, global_group);
    run(engine, "sharding.create_definition", locks, entry, synchronous).await
}

/// `sharding.add_table`
pub async fn add_table(
    engine: &Engine,
    mapping_id: u64,
    table: String,
    column: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![mapping_lock(mapping_id)];
    let entry = definition::add_table(mapping_id, table, column);
    run(engine, "sharding.add_table", locks, entry, synchronous).await
}

/// `sharding.remove_table`
pub async fn remove_table(
    engine: &Engine,
    table: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let mapping_id = {
        let mut txn = engine.read().await?;
        txn.table(&table)
            .await?
            .ok_or_else(|| ShardingError::TableNotFound(table.clone()))?
            .mapping_id
    };

    let locks = vec![mapping_lock(mapping_id)];
    let entry = definition::remove_table(table);
    run(engine, "sharding.remove_table", locks, entry, synchronous).await
}

/// `sharding.remove_definition`
pub async fn remove_definition(
    engine: &Engine,
    mapping_id: u64,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![mapping_lock(mapping_id)];
    let entry = definition::remove_definition(mapping_id);
    run(engine, "sharding.remove_definition", locks, entry, synchronous).await
}

/// `sharding.add_shard` — `groups` pairs a hosting group with an optional
/// lower bound (RANGE* requires one, HASH forbids it).
pub async fn add_shard(
    engine: &Engine,
    mapping_id: u64,
    groups: Vec<(String, Option<String>)>,
    state: &str,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let state = ShardState::parse(state)?;

    let mut locks = vec![mapping_lock(mapping_id)];
    locks.extend(groups.iter().map(|(group, _)| group.clone()));

    let entry = shards::add_shard(engine.clone(), mapping_id, groups, state);
    run(engine, "sharding.add_shard", locks, entry, synchronous).await
}

/// `sharding.remove_shard`
pub async fn remove_shard(
    engine: &Engine,
    shard_id: u64,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = shard_locks(engine, shard_id).await?;
    let entry = shards::remove_shard(engine.clone(), shard_id);
    run(engine, "sharding.remove_shard", locks, entry, synchronous).await
}

/// `sharding.enable_shard`
pub async fn enable_shard(
    engine: &Engine,
    shard_id: u64,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = shard_locks(engine, shard_id).await?;
    let entry = shards::enable_shard(engine.clone(), shard_id);
    run(engine, "sharding.enable_shard", locks, entry, synchronous).await
}

/// `sharding.disable_shard`
pub async fn disable_shard(
    engine: &Engine,
    shard_id: u64,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = shard_locks(engine, shard_id).await?;
    let entry = shards::disable_shard(engine.clone(), shard_id);
    run(engine, "sharding.disable_shard", locks, entry, synchronous).await
}

/// `sharding.lookup_servers` — read command.
pub async fn lookup_servers(
    engine: &Engine,
    table: &str,
    key: &str,
    hint: &str,
) -> Result<Vec<ServerInfo>, Error> {
    let hint = LookupHint::parse(hint)?;
    shards::lookup(engine, table, key, hint).await
}

/// `sharding.prune_shard`
pub async fn prune_shard(
    engine: &Engine,
    table: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let mapping_id = {
        let mut txn = engine.read().await?;
        txn.table(&table)
            .await?
            .ok_or_else(|| ShardingError::TableNotFound(table.clone()))?
            .mapping_id
    };

    let locks = vec![mapping_lock(mapping_id)];
    let entry = shards::prune_shard(engine.clone(), table);
    run(engine, "sharding.prune_shard", locks, entry, synchronous).await
}

/// `sharding.move_shard` — online move of a shard to an empty group.
pub async fn move_shard(
    engine: &Engine,
    shard_id: u64,
    destination: String,
    update_only: bool,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let mut locks = shard_locks(engine, shard_id).await?;
    locks.push(destination.clone());

    let entry = mover::entry(engine.clone(), shard_id, destination, update_only);
    run(engine, "sharding.move_shard", locks, entry, synchronous).await
}

/// `sharding.split_shard` — online split; `split_value` is required for
/// RANGE* and forbidden for HASH.
pub async fn split_shard(
    engine: &Engine,
    shard_id: u64,
    destination: String,
    split_value: Option<String>,
    update_only: bool,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let mut locks = shard_locks(engine, shard_id).await?;
    locks.push(destination.clone());

    let entry = splitter::entry(engine.clone(), shard_id, destination, split_value, update_only);
    run(engine, "sharding.split_shard", locks, entry, synchronous).await
}

/// `sharding.list_definitions` — read command.
pub async fn list_definitions(engine: &Engine) -> Result<serde_json::Value, Error> {
    let mut txn = engine.read().await?;
    let mappings = txn.mappings().await?;
    Ok(json!(mappings
        .iter()
        .map(|m| {
            json!({
                "mapping_id": m.id,
                "type": m.kind.to_string(),
                "global_group": m.global_group,
            })
        })
        .collect::<Vec<_>>()))
}

/// `sharding.list_tables` — read command; tables attached to mappings of
/// one sharding type.
pub async fn list_tables(engine: &Engine, sharding_type: &str) -> Result<serde_json::Value, Error> {
    let kind = ShardingType::parse(sharding_type)?;
    let mut txn = engine.read().await?;

    let mut tables = vec![];
    for mapping in txn.mappings().await? {
        if mapping.kind != kind {
            continue;
        }
        for table in txn.tables_of(mapping.id).await? {
            tables.push(json!({
                "mapping_id": mapping.id,
                "table": table.table,
                "column": table.column,
                "global_group": mapping.global_group,
            }));
        }
    }

    Ok(json!(tables))
}

/// `sharding.lookup_table` — read command.
pub async fn lookup_table(engine: &Engine, table: &str) -> Result<serde_json::Value, Error> {
    let mut txn = engine.read().await?;

    let attached = txn
        .table(table)
        .await?
        .ok_or_else(|| ShardingError::TableNotFound(table.to_owned()))?;
    let mapping = txn
        .mapping(attached.mapping_id)
        .await?
        .ok_or(ShardingError::MappingNotFound(attached.mapping_id))?;

    Ok(json!({
        "mapping_id": mapping.id,
        "type": mapping.kind.to_string(),
        "table": attached.table,
        "column": attached.column,
        "global_group": mapping.global_group,
    }))
}

/// Fetch a shard by id — read command kept for callers that created one
/// through `add_shard` and want its placement.
pub async fn lookup_shard(engine: &Engine, shard_id: u64) -> Result<serde_json::Value, Error> {
    let mut txn = engine.read().await?;

    let shard = txn
        .shard(shard_id)
        .await?
        .ok_or(ShardingError::ShardNotFound(shard_id))?;
    let entry = txn.range_of(shard_id).await?;

    Ok(json!({
        "shard_id": shard.id,
        "group_id": shard.group_id,
        "state": shard.state.to_string(),
        "lower_bound": entry.map(|e| e.lower_bound.to_string()),
    }))
}
