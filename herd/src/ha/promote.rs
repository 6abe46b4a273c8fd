//! Promote: a switchover when the current master is alive, a failover
//! when it is gone or faulty. The entry step picks the flavor under the
//! group lock and appends the matching chain.

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::candidate::{self, Flavor};
use crate::engine::Engine;
use crate::error::Error;
use crate::executor::{step, Step};
use crate::topology::BackendStatus;

/// Entry step of `group.promote`. `expected_master` is the master the
/// caller observed when it issued the operation; if another procedure
/// changed it in the meantime, the promote fails instead of switching
/// masters twice.
pub fn entry(
    engine: Engine,
    group_id: String,
    candidate: Option<Uuid>,
    expected_master: Option<Uuid>,
) -> Step {
    step("define_ha_operation", move |ctx| async move {
        let flavor = {
            let mut cat = ctx.catalog().await?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            if group.master != expected_master {
                return Err(Error::group(format!(
                    "master of group ({}) changed while the promote was queued \
                     (expected {:?}, found {:?})",
                    group_id, expected_master, group.master
                )));
            }

            match group.master {
                Some(master_uuid) => {
                    let master = super::fetch_backend(&mut **cat, &master_uuid).await?;
                    let alive = master.status != BackendStatus::Faulty
                        && engine.driver().probe(&master).await.is_ok();
                    if alive {
                        Flavor::Switchover
                    } else {
                        Flavor::Failover
                    }
                }
                None => Flavor::Failover,
            }
        };

        match (flavor, candidate) {
            (Flavor::Switchover, Some(slave)) => {
                ctx.enqueue(check_candidate_switch(engine, group_id, slave))
            }
            (Flavor::Switchover, None) => ctx.enqueue(find_candidate_switch(engine, group_id)),
            (Flavor::Failover, Some(slave)) => {
                ctx.enqueue(check_candidate_fail(engine, group_id, slave))
            }
            (Flavor::Failover, None) => ctx.enqueue(find_candidate_fail(engine, group_id)),
        }

        Ok(())
    })
}

fn find_candidate_switch(engine: Engine, group_id: String) -> Step {
    step("find_candidate_switch", move |ctx| async move {
        let slave = {
            let mut cat = ctx.catalog().await?;
            candidate::find(&engine, &mut **cat, &group_id, Flavor::Switchover).await?
        };
        ctx.enqueue(check_candidate_switch(engine, group_id, slave));
        Ok(())
    })
}

fn check_candidate_switch(engine: Engine, group_id: String, slave_uuid: Uuid) -> Step {
    step("check_candidate_switch", move |ctx| async move {
        let master_uuid = {
            let mut cat = ctx.catalog().await?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            let master_uuid = group.master.ok_or_else(|| {
                Error::group(format!(
                    "group ({}) does not contain a valid master; run a promote or failover",
                    group_id
                ))
            })?;

            if master_uuid == slave_uuid {
                return Err(Error::server(format!(
                    "candidate slave ({}) is already master",
                    slave_uuid
                )));
            }

            let slave = super::fetch_backend(&mut **cat, &slave_uuid).await?;

            if cat.group_of(&slave_uuid).await?.as_deref() != Some(group_id.as_str()) {
                return Err(Error::group(format!(
                    "group ({}) does not contain server ({})",
                    group_id, slave_uuid
                )));
            }

            let master_issues = engine.driver().check_master_issues(&slave).await?;
            if !master_issues.is_empty() {
                return Err(Error::server(format!(
                    "server ({}) is not a valid candidate slave: {}",
                    slave_uuid, master_issues
                )));
            }

            let slave_issues = engine.driver().check_slave_issues(&slave).await?;
            if !slave_issues.is_empty() {
                return Err(Error::server(format!(
                    "server ({}) is not a valid candidate slave: {}",
                    slave_uuid, slave_issues
                )));
            }

            let replicates_from = engine.driver().slave_has_master(&slave).await?;
            if replicates_from != Some(master_uuid) {
                return Err(Error::group(format!(
                    "the group's master ({}) is different from the candidate's master ({:?})",
                    master_uuid, replicates_from
                )));
            }

            if !matches!(
                slave.status,
                BackendStatus::Secondary | BackendStatus::Spare
            ) {
                return Err(Error::server(format!("server ({}) is faulty", slave_uuid)));
            }

            master_uuid
        };

        ctx.enqueue(block_write_switch(engine, group_id, master_uuid, slave_uuid));
        Ok(())
    })
}

fn block_write_switch(
    engine: Engine,
    group_id: String,
    master_uuid: Uuid,
    slave_uuid: Uuid,
) -> Step {
    step("block_write_switch", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            super::block_write_master(&engine, &mut **cat, &group_id, &master_uuid).await?;
        }
        ctx.enqueue(wait_slaves_switch(engine, group_id, master_uuid, slave_uuid));
        Ok(())
    })
}

fn wait_slaves_switch(
    engine: Engine,
    group_id: String,
    master_uuid: Uuid,
    slave_uuid: Uuid,
) -> Step {
    step("wait_slaves_switch", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let master = super::fetch_backend(&mut **cat, &master_uuid).await?;
            let slave = super::fetch_backend(&mut **cat, &slave_uuid).await?;

            // The candidate must fully catch up; failures here are fatal.
            let timeout = engine.config().general.replication_timeout_duration();
            crate::replication::synchronize(engine.driver(), &slave, &master, timeout).await?;

            // Everyone else gets a best-effort catch-up.
            super::wait_slaves_catch(&engine, &mut **cat, &group_id, &master, &[slave_uuid])
                .await?;
        }
        ctx.enqueue(change_to_candidate(engine, group_id, slave_uuid));
        Ok(())
    })
}

fn find_candidate_fail(engine: Engine, group_id: String) -> Step {
    step("find_candidate_fail", move |ctx| async move {
        let slave = {
            let mut cat = ctx.catalog().await?;
            candidate::find(&engine, &mut **cat, &group_id, Flavor::Failover).await?
        };
        ctx.enqueue(check_candidate_fail(engine, group_id, slave));
        Ok(())
    })
}

fn check_candidate_fail(engine: Engine, group_id: String, slave_uuid: Uuid) -> Step {
    step("check_candidate_fail", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            if group.master == Some(slave_uuid) {
                return Err(Error::server(format!(
                    "candidate slave ({}) is already master",
                    slave_uuid
                )));
            }

            let slave = super::fetch_backend(&mut **cat, &slave_uuid).await?;

            if cat.group_of(&slave_uuid).await?.as_deref() != Some(group_id.as_str()) {
                return Err(Error::group(format!(
                    "group ({}) does not contain server ({})",
                    group_id, slave_uuid
                )));
            }

            let master_issues = engine.driver().check_master_issues(&slave).await?;
            if !master_issues.is_empty() {
                return Err(Error::server(format!(
                    "server ({}) is not a valid candidate slave: {}",
                    slave_uuid, master_issues
                )));
            }

            // A stale master that is still reachable means some
            // transactions may never make it to the slaves.
            if let Some(old_master) = group.master {
                if let Some(backend) = cat.backend(&old_master).await? {
                    if engine.driver().probe(&backend).await.is_ok() {
                        warn!(
                            "failover in group ({}) while the previous master is apparently \
                             running; transactions may be lost",
                            group_id
                        );
                    }
                }
            }

            if !matches!(
                slave.status,
                BackendStatus::Secondary | BackendStatus::Spare
            ) {
                return Err(Error::server(format!("server ({}) is faulty", slave_uuid)));
            }
        }

        ctx.enqueue(wait_slave_fail(engine, group_id, slave_uuid));
        Ok(())
    })
}

fn wait_slave_fail(engine: Engine, group_id: String, slave_uuid: Uuid) -> Step {
    step("wait_slave_fail", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let slave = super::fetch_backend(&mut **cat, &slave_uuid).await?;
            let timeout = engine.config().general.backlog_timeout_duration();
            engine.driver().process_backlog(&slave, timeout).await?;
        }
        ctx.enqueue(change_to_candidate(engine, group_id, slave_uuid));
        Ok(())
    })
}

fn change_to_candidate(engine: Engine, group_id: String, new_master: Uuid) -> Step {
    step("change_to_candidate", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            super::change_to_candidate(&engine, &mut **cat, &group_id, &new_master).await?;
        }
        ctx.report(json!({ "group_id": group_id, "master_uuid": new_master }));
        Ok(())
    })
}
