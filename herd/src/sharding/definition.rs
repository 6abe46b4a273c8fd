//! Shard mapping definitions and their attached tables.

use serde_json::json;

use super::{Error, ShardTable, ShardingType};
use crate::executor::{step, Step};

/// Entry step of `sharding.create_definition`.
pub fn create_definition(kind: ShardingType, global_group: String) -> Step {
    step("define_shard_mapping", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        if cat.group(&global_group).await?.is_none() {
            return Err(Error::GroupNotFound(global_group.clone()).into());
        }

        let mapping_id = cat.insert_mapping(kind, &global_group).await?;
        drop(cat);

        ctx.report(json!({ "mapping_id": mapping_id }));
        Ok(())
    })
}

/// Entry step of `sharding.add_table`.
pub fn add_table(mapping_id: u64, table: String, column: String) -> Step {
    step("add_shard_mapping", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        if cat.mapping(mapping_id).await?.is_none() {
            return Err(Error::MappingNotFound(mapping_id).into());
        }
        if cat.table(&table).await?.is_some() {
            return Err(Error::TableAlreadySharded(table.clone()).into());
        }

        cat.insert_table(&ShardTable {
            mapping_id,
            table: table.clone(),
            column: column.clone(),
        })
        .await?;
        drop(cat);

        ctx.report(json!({ "mapping_id": mapping_id, "table": table }));
        Ok(())
    })
}

/// Entry step of `sharding.remove_table`.
pub fn remove_table(table: String) -> Step {
    step("remove_shard_mapping", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let attached = cat
            .table(&table)
            .await?
            .ok_or_else(|| Error::TableNotFound(table.clone()))?;

        if !cat.ranges(attached.mapping_id).await?.is_empty() {
            return Err(Error::ShardsAlreadyExist(attached.mapping_id).into());
        }

        cat.delete_table(&table).await?;
        Ok(())
    })
}

/// Entry step of `sharding.remove_definition`.
pub fn remove_definition(mapping_id: u64) -> Step {
    step("remove_shard_mapping_defn", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        if cat.mapping(mapping_id).await?.is_none() {
            return Err(Error::MappingNotFound(mapping_id).into());
        }
        if !cat.ranges(mapping_id).await?.is_empty() {
            return Err(Error::ShardsAlreadyExist(mapping_id).into());
        }
        if !cat.tables_of(mapping_id).await?.is_empty() {
            return Err(Error::TablesStillAttached(mapping_id).into());
        }

        cat.delete_mapping(mapping_id).await?;
        Ok(())
    })
}
