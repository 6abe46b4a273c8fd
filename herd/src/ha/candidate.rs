//! Candidate selection. Picks the slave that has processed the most
//! transactions and can actually become a master; purged transactions and
//! replication delay are not considered here.

use tracing::warn;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::replication::{GtidSet, SlaveIssues};
use crate::store::CatalogTxn;
use crate::topology::{Backend, BackendStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Planned transition: the candidate must also be a healthy slave of
    /// the current master.
    Switchover,
    /// The master is gone; slave-thread state is not held against a
    /// candidate.
    Failover,
}

/// Find the best backend to become master of `group_id`, or fail with a
/// group error when none qualifies.
pub async fn find(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    flavor: Flavor,
) -> Result<Uuid, Error> {
    let group = txn
        .group(group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;
    let master_uuid = group.master;

    let mut chosen: Option<(Uuid, GtidSet)> = None;

    for candidate in txn.members(group_id).await? {
        if Some(candidate.uuid) == master_uuid {
            continue;
        }
        if matches!(
            candidate.status,
            BackendStatus::Faulty | BackendStatus::Spare
        ) {
            continue;
        }

        match evaluate(engine, &candidate, master_uuid, flavor, chosen.as_ref()).await {
            Ok(Some(gtids)) => chosen = Some((candidate.uuid, gtids)),
            Ok(None) => {}
            Err(err) => {
                warn!("error accessing candidate ({}): {}", candidate.uuid, err);
            }
        }
    }

    chosen.map(|(uuid, _)| uuid).ok_or_else(|| {
        Error::group(format!(
            "there is no valid candidate that can be automatically chosen \
             in group ({}); please choose one manually",
            group_id
        ))
    })
}

/// Whether `candidate` should replace the best candidate so far. Returns
/// its gtid set when it does.
async fn evaluate(
    engine: &Engine,
    candidate: &Backend,
    master_uuid: Option<Uuid>,
    flavor: Flavor,
    chosen: Option<&(Uuid, GtidSet)>,
) -> Result<Option<GtidSet>, Error> {
    let driver = engine.driver();

    let gtids = driver.gtid_executed(candidate).await?;
    let master_issues = driver.check_master_issues(candidate).await?;
    let slave_issues = match flavor {
        Flavor::Switchover => driver.check_slave_issues(candidate).await?,
        Flavor::Failover => SlaveIssues::default(),
    };
    let has_valid_master = match master_uuid {
        None => true,
        Some(master) => driver.slave_has_master(candidate).await? == Some(master),
    };

    let healthy = master_issues.is_empty() && slave_issues.is_empty() && has_valid_master;

    // A later candidate wins only when it executed everything the best
    // candidate so far has.
    let at_least_as_far = match chosen {
        Some((_, best)) => best.diff(&gtids) == 0,
        None => true,
    };

    if healthy && at_least_as_far {
        return Ok(Some(gtids));
    }

    if !healthy {
        warn!(
            "candidate ({}) cannot become a master: master issues ({}), \
             slave issues ({}), valid master ({})",
            candidate.uuid, master_issues, slave_issues, has_valid_master
        );
    }

    Ok(None)
}
