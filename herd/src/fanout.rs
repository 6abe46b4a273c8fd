//! Global fan-out: replication edges between groups. Every enabled shard
//! group replicates from its mapping's global group master; every master
//! change, whatever procedure caused it, funnels through
//! [`set_group_master`] so the edges stay consistent with the metadata.

use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::store::CatalogTxn;

/// Change a group's master and rewire every replication edge touching the
/// group: the inbound edge from its master group, and the outbound edges
/// to its slave groups. `clear_ref` also forgets the edges instead of just
/// stopping them.
pub async fn set_group_master(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    new_master: Option<Uuid>,
    clear_ref: bool,
) -> Result<(), Error> {
    let mut group = txn
        .group(group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

    // Stop the inbound edge while the group has no (or a different) master.
    if group.master.is_some() {
        if let Some(master_group) = txn.master_group_of(group_id).await? {
            stop_group_slave(engine, txn, &master_group, group_id, clear_ref).await?;
        }
    }

    // Stop every outbound edge.
    stop_group_slaves(engine, txn, group_id, clear_ref).await?;

    group.master = new_master;
    txn.update_group(&group).await?;

    if new_master.is_some() {
        start_group_slaves(engine, txn, group_id).await?;
        if let Some(master_group) = txn.master_group_of(group_id).await? {
            setup_group_replication(engine, txn, &master_group, group_id).await?;
        }
    }

    debug!(
        "group ({}) master set to ({})",
        group_id,
        new_master.map(|u| u.to_string()).unwrap_or_else(|| "none".into())
    );

    Ok(())
}

/// Point the slave group's master at the master group's master and record
/// the edge.
pub async fn setup_group_replication(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    master_group_id: &str,
    slave_group_id: &str,
) -> Result<(), Error> {
    if master_group_id == slave_group_id {
        return Err(Error::group(format!(
            "group ({}) cannot replicate from itself",
            master_group_id
        )));
    }

    let master_group = txn
        .group(master_group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", master_group_id)))?;
    let slave_group = txn
        .group(slave_group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", slave_group_id)))?;

    let master_uuid = master_group.master.ok_or_else(|| {
        Error::group(format!("group ({}) does not have a master", master_group_id))
    })?;
    let slave_uuid = slave_group.master.ok_or_else(|| {
        Error::group(format!("group ({}) does not have a master", slave_group_id))
    })?;

    let master = txn
        .backend(&master_uuid)
        .await?
        .ok_or_else(|| Error::server(format!("backend ({}) does not exist", master_uuid)))?;
    let slave = txn
        .backend(&slave_uuid)
        .await?
        .ok_or_else(|| Error::server(format!("backend ({}) does not exist", slave_uuid)))?;

    engine.driver().switch_master(&slave, &master).await?;
    engine.driver().start_slave(&slave, true).await?;

    txn.link_groups(master_group_id, slave_group_id).await?;

    info!(
        "group ({}) now replicates from group ({})",
        slave_group_id, master_group_id
    );

    Ok(())
}

/// Stop the slave group's replication from the master group. With
/// `clear_ref` the edge is forgotten, otherwise it survives for a later
/// restart (a disabled shard keeps its edge on the books).
pub async fn stop_group_slave(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    master_group_id: &str,
    slave_group_id: &str,
    clear_ref: bool,
) -> Result<(), Error> {
    let slave_group = txn
        .group(slave_group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", slave_group_id)))?;

    if let Some(slave_uuid) = slave_group.master {
        if let Some(slave) = txn.backend(&slave_uuid).await? {
            engine.driver().stop_slave(&slave, true).await?;
            engine.driver().reset_slave(&slave, clear_ref).await?;
        }
    }

    if clear_ref {
        txn.unlink_groups(master_group_id, slave_group_id).await?;
    }

    Ok(())
}

/// Stop every group replicating from `group_id`.
pub async fn stop_group_slaves(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    clear_ref: bool,
) -> Result<(), Error> {
    for slave_group in txn.slave_groups_of(group_id).await? {
        stop_group_slave(engine, txn, group_id, &slave_group, clear_ref).await?;
    }
    Ok(())
}

/// (Re)start replication on every group registered as a slave of
/// `group_id`; used after the group's master changed.
pub async fn start_group_slaves(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
) -> Result<(), Error> {
    for slave_group in txn.slave_groups_of(group_id).await? {
        setup_group_replication(engine, txn, group_id, &slave_group).await?;
    }
    Ok(())
}
