//! Online shard split. The shard is provisioned onto the new group like a
//! move; at cutover the old shard is retired and two fresh shards take
//! over its range, one per group, each pruned down to its own half.

use serde_json::json;
use tracing::info;

use super::key::Bound;
use super::mover::{self, Reshard};
use super::shards::{group_master, prune_entries, verify_and_fetch_shard};
use super::{index, Error, RangeEntry, ShardState};
use crate::engine::Engine;
use crate::error::Error as EngineError;
use crate::executor::{step, Step};
use crate::fanout;
use crate::store::CatalogTxn;

/// Entry step of `sharding.split_shard`. RANGE* splits take an explicit
/// split value; HASH splits compute the midpoint of the shard's arc.
pub fn entry(
    engine: Engine,
    shard_id: u64,
    destination: String,
    split_value: Option<String>,
    update_only: bool,
) -> Step {
    step("check_split_information", move |ctx| async move {
        let (source, split) = {
            let mut cat = ctx.catalog().await?;
            mover::check_destination(&mut **cat, &destination).await?;

            let (entry, shard, mapping) = verify_and_fetch_shard(&mut **cat, shard_id).await?;
            let entries = cat.ranges(mapping.id).await?;
            let upper = index::upper_bound_of(&entries, &entry.lower_bound).cloned();

            let split = if mapping.kind.is_hash() {
                if split_value.is_some() {
                    return Err(Error::NoSplitValueForHash.into());
                }
                hash_split_point(&engine, &mut **cat, &shard.group_id, &mapping, &entry, upper)
                    .await?
            } else {
                let raw = split_value.as_deref().ok_or(Error::SplitValueNotDefined)?;
                let split = mapping.kind.parse_bound(raw)?;

                // Strictly inside the shard's window.
                let inside = split > entry.lower_bound
                    && upper.as_ref().map(|u| split < *u).unwrap_or(true);
                if !inside {
                    return Err(Error::InvalidSplitValue(split.to_string()).into());
                }
                split
            };

            (shard.group_id, split)
        };

        if update_only {
            ctx.enqueue(cutover(engine, shard_id, source, destination, split, true));
        } else {
            ctx.enqueue(mover::backup_source(
                engine,
                shard_id,
                source,
                destination,
                Reshard::Split { split },
            ));
        }
        Ok(())
    })
}

/// The split point of a HASH shard: the midpoint between its lower bound
/// and the next bound on the ring, or, for the last shard, the largest
/// hashed key actually present in its tables.
async fn hash_split_point(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    mapping: &super::ShardMapping,
    entry: &RangeEntry,
    upper: Option<Bound>,
) -> Result<Bound, EngineError> {
    let upper = match upper {
        Some(upper) => upper,
        None => {
            let master = group_master(txn, group_id).await?;
            let mut max: Option<[u8; 16]> = None;
            for table in txn.tables_of(mapping.id).await? {
                let found = engine
                    .driver()
                    .max_hashed_key(&master, &table.table, &table.column)
                    .await?;
                max = match (max, found) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            Bound::Hash(max.ok_or(Error::EmptyShard(entry.shard_id))?)
        }
    };

    entry
        .lower_bound
        .midpoint(&upper)
        .ok_or_else(|| Error::InvalidSplitValue(upper.to_string()).into())
}

/// Cutover of a split: retire the old shard, create the two halves with
/// fresh ids, wire the new group into the fan-out, enable both, and prune
/// each half down to its own range.
pub(crate) fn cutover(
    engine: Engine,
    shard_id: u64,
    source: String,
    destination: String,
    split: Bound,
    update_only: bool,
) -> Step {
    step("setup_shard_switch_split", move |ctx| async move {
        let (low_shard, high_shard) = {
            let mut cat = ctx.catalog().await?;
            let (entry, mut shard, mapping) = verify_and_fetch_shard(&mut **cat, shard_id).await?;

            // Retire the shard being split.
            shard.state = ShardState::Disabled;
            cat.update_shard(&shard).await?;
            cat.delete_range(shard_id).await?;
            cat.delete_shard(shard_id).await?;

            // The original lower bound stays with the source group; the
            // new group starts at the split value.
            let low_shard = cat.insert_shard(&source, ShardState::Disabled).await?;
            let high_shard = cat.insert_shard(&destination, ShardState::Disabled).await?;
            cat.insert_range(&RangeEntry {
                mapping_id: mapping.id,
                lower_bound: entry.lower_bound.clone(),
                shard_id: low_shard,
            })
            .await?;
            cat.insert_range(&RangeEntry {
                mapping_id: mapping.id,
                lower_bound: split.clone(),
                shard_id: high_shard,
            })
            .await?;

            // The sync step left the source master read-only.
            if !update_only {
                let master = group_master(&mut **cat, &source).await?;
                engine.driver().set_read_only(&master, false).await?;
            }

            // The new group joins the fan-out; the source group keeps its
            // existing edge.
            fanout::setup_group_replication(&engine, &mut **cat, &mapping.global_group, &destination)
                .await?;

            for id in [low_shard, high_shard] {
                let mut half = cat
                    .shard(id)
                    .await?
                    .ok_or(Error::ShardNotFound(id))?;
                half.state = ShardState::Enabled;
                cat.update_shard(&half).await?;
            }

            info!(
                "shard ({}) split at ({}) into ({}) on ({}) and ({}) on ({})",
                shard_id, split, low_shard, source, high_shard, destination
            );

            (low_shard, high_shard)
        };

        if !update_only {
            ctx.enqueue(prune_split(engine, low_shard, high_shard));
        }

        ctx.report(json!({ "shard_ids": [low_shard, high_shard] }));
        Ok(())
    })
}

/// Prune the two halves after a split so each keeps only its own rows.
fn prune_split(engine: Engine, low_shard: u64, high_shard: u64) -> Step {
    step("prune_shards_after_split", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let (_, _, mapping) = verify_and_fetch_shard(&mut **cat, low_shard).await?;
        let entries = cat.ranges(mapping.id).await?;
        let tables = cat.tables_of(mapping.id).await?;

        let halves: Vec<RangeEntry> = entries
            .iter()
            .filter(|e| e.shard_id == low_shard || e.shard_id == high_shard)
            .cloned()
            .collect();

        let mut pruned = 0;
        for table in &tables {
            pruned += prune_entries(
                &engine,
                &mut **cat,
                &mapping,
                &entries,
                &halves,
                &table.table,
                &table.column,
            )
            .await?;
        }

        drop(cat);
        ctx.report(json!({ "rows_pruned": pruned }));
        Ok(())
    })
}
