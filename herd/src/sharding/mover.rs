//! Online shard move, and the backup → restore → sync chain shared with
//! split. The source shard stays live until cutover; data flows via a
//! logical dump plus replication catch-up.

use serde_json::json;
use tracing::info;

use super::key::Bound;
use super::shards::{group_master, verify_and_fetch_shard};
use super::Error;
use crate::engine::Engine;
use crate::error::Error as EngineError;
use crate::executor::{step, Step};
use crate::fanout;
use crate::replication::DumpImage;
use crate::store::CatalogTxn;
use crate::topology::{Backend, BackendStatus};

/// What happens at cutover, after the destination group caught up.
#[derive(Debug, Clone)]
pub(crate) enum Reshard {
    Move,
    Split { split: Bound },
}

/// Entry step of `sharding.move_shard`.
pub fn entry(engine: Engine, shard_id: u64, destination: String, update_only: bool) -> Step {
    step("check_shard_information", move |ctx| async move {
        let source = {
            let mut cat = ctx.catalog().await?;
            check_destination(&mut **cat, &destination).await?;
            let (_, shard, _) = verify_and_fetch_shard(&mut **cat, shard_id).await?;
            shard.group_id
        };

        if update_only {
            ctx.enqueue(cutover(engine, shard_id, source, destination, true));
        } else {
            ctx.enqueue(backup_source(
                engine,
                shard_id,
                source,
                destination,
                Reshard::Move,
            ));
        }
        Ok(())
    })
}

/// Pick the server a dump is taken from: a spare, else a secondary, else
/// the master itself.
fn backup_server(members: &[Backend]) -> Option<&Backend> {
    members
        .iter()
        .find(|b| b.status == BackendStatus::Spare)
        .or_else(|| {
            members
                .iter()
                .find(|b| b.status == BackendStatus::Secondary)
        })
        .or_else(|| members.iter().find(|b| b.status == BackendStatus::Primary))
}

pub(crate) fn backup_source(
    engine: Engine,
    shard_id: u64,
    source: String,
    destination: String,
    reshard: Reshard,
) -> Step {
    step("backup_source_shard", move |ctx| async move {
        let image = {
            let mut cat = ctx.catalog().await?;
            let members = cat.members(&source).await?;
            let server = backup_server(&members)
                .ok_or_else(|| Error::MasterNotFound(source.clone()))?;

            info!(
                "dumping shard ({}) from backend ({}) [{}]",
                shard_id, server.uuid, server.address
            );
            engine.driver().backup(server).await?
        };

        ctx.enqueue(restore_backup(
            engine,
            shard_id,
            source,
            destination,
            image,
            reshard,
        ));
        Ok(())
    })
}

fn restore_backup(
    engine: Engine,
    shard_id: u64,
    source: String,
    destination: String,
    image: DumpImage,
    reshard: Reshard,
) -> Step {
    step("restore_shard_backup", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let members = cat.members(&destination).await?;
            if members.is_empty() {
                return Err(Error::GroupNotFound(destination.clone()).into());
            }
            for server in &members {
                engine.driver().restore(server, &image).await?;
            }
        }

        ctx.enqueue(setup_sync(engine, shard_id, source, destination, reshard));
        Ok(())
    })
}

/// Replicate the writes that happened during dump/restore from the source
/// group master to the destination group master, then detach cleanly. The
/// source master is read-only from here until cutover.
fn setup_sync(
    engine: Engine,
    shard_id: u64,
    source: String,
    destination: String,
    reshard: Reshard,
) -> Step {
    step("setup_move_sync", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let master = group_master(&mut **cat, &source).await?;
            let slave = group_master(&mut **cat, &destination).await?;
            drop(cat);

            let driver = engine.driver();
            driver.stop_slave(&slave, true).await?;
            driver.reset_slave(&slave, true).await?;
            driver.switch_master(&slave, &master).await?;
            driver.start_slave(&slave, true).await?;

            driver.set_read_only(&master, true).await?;
            let timeout = engine.config().general.replication_timeout_duration();
            crate::replication::synchronize(driver, &slave, &master, timeout).await?;

            driver.stop_slave(&slave, true).await?;
            driver.reset_slave(&slave, true).await?;
        }

        match reshard {
            Reshard::Move => {
                ctx.enqueue(cutover(engine, shard_id, source, destination, false))
            }
            Reshard::Split { split } => ctx.enqueue(super::splitter::cutover(
                engine,
                shard_id,
                source,
                destination,
                split,
                false,
            )),
        }
        Ok(())
    })
}

/// Cutover of a move: point the shard's metadata and the global fan-out
/// at the destination group, detach the source.
pub(crate) fn cutover(
    engine: Engine,
    shard_id: u64,
    source: String,
    destination: String,
    update_only: bool,
) -> Step {
    step("setup_shard_switch_move", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let (_, mut shard, mapping) = verify_and_fetch_shard(&mut **cat, shard_id).await?;

            // The destination replicates from the global group before it
            // starts serving the shard.
            fanout::setup_group_replication(&engine, &mut **cat, &mapping.global_group, &destination)
                .await?;

            shard.group_id = destination.clone();
            cat.update_shard(&shard).await?;

            fanout::stop_group_slave(&engine, &mut **cat, &mapping.global_group, &source, true)
                .await?;

            // The sync step left the source master read-only.
            if !update_only {
                let master = group_master(&mut **cat, &source).await?;
                engine.driver().set_read_only(&master, false).await?;
            }

            info!(
                "shard ({}) moved from group ({}) to group ({})",
                shard_id, source, destination
            );
        }

        ctx.report(json!({ "shard_id": shard_id, "group_id": destination }));
        Ok(())
    })
}

/// Shared preflight for move/split destinations.
pub(crate) async fn check_destination(
    txn: &mut dyn CatalogTxn,
    destination: &str,
) -> Result<(), EngineError> {
    if txn.group(destination).await?.is_none() {
        return Err(Error::GroupNotFound(destination.to_owned()).into());
    }
    if txn.shard_on_group(destination).await?.is_some() {
        return Err(Error::DestinationNotEmpty(destination.to_owned()).into());
    }
    Ok(())
}
