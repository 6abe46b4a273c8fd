//! HA state machine: promote (switchover or failover), demote, and the
//! shared write-blocking and catch-up machinery. Each workflow is a chain
//! of executor steps; any step failure is fatal to its procedure and
//! leaves the model in the last committed intermediate state.

pub mod candidate;
pub mod demote;
pub mod promote;

pub use candidate::Flavor;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::events::DomainEvent;
use crate::fanout;
use crate::replication::synchronize;
use crate::store::CatalogTxn;
use crate::topology::{Backend, BackendMode, BackendStatus};

/// Fetch a backend or fail with a server error.
pub(crate) async fn fetch_backend(
    txn: &mut dyn CatalogTxn,
    uuid: &Uuid,
) -> Result<Backend, Error> {
    txn.backend(uuid)
        .await?
        .ok_or_else(|| Error::server(format!("backend ({}) does not exist", uuid)))
}

/// Block and disable write access to the current master. The group's
/// master reference is temporarily unset; connections are not killed, so
/// in-flight writes drain on their own.
pub(crate) async fn block_write_master(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    master_uuid: &Uuid,
) -> Result<(), Error> {
    fanout::set_group_master(engine, txn, group_id, None, false).await?;

    let mut master = fetch_backend(txn, master_uuid).await?;
    engine.driver().set_read_only(&master, true).await?;
    master.mode = BackendMode::ReadOnly;
    master.status = BackendStatus::Secondary;
    txn.update_backend(&master).await?;

    Ok(())
}

/// Synchronize every slave of the group with `master`, skipping the
/// listed backends. Per-slave failures are logged, not fatal. Emits
/// SERVER_DEMOTED when done: whoever calls this is taking the master out
/// of service.
pub(crate) async fn wait_slaves_catch(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    master: &Backend,
    skip: &[Uuid],
) -> Result<(), Error> {
    let timeout = engine.config().general.replication_timeout_duration();

    for server in txn.members(group_id).await? {
        if server.uuid == master.uuid || skip.contains(&server.uuid) {
            continue;
        }

        let result = async {
            let current = engine.driver().slave_has_master(&server).await?;
            if current == Some(master.uuid) {
                synchronize(engine.driver(), &server, master, timeout).await
            } else {
                debug!(
                    "slave ({}) has a different master from group ({})",
                    server.uuid, group_id
                );
                Ok(())
            }
        }
        .await;

        if let Err(err) = result {
            warn!("error synchronizing slave ({}): {}", server.uuid, err);
        }
    }

    engine.events().emit(DomainEvent::ServerDemoted {
        group_id: group_id.to_owned(),
        old_master: master.uuid,
    });

    Ok(())
}

/// Make `new_master` the master of the group: reset its slave config,
/// open it for writes, rewire the fan-out, and point every other member
/// at it. Used by both promote flavors.
pub(crate) async fn change_to_candidate(
    engine: &Engine,
    txn: &mut dyn CatalogTxn,
    group_id: &str,
    new_master_uuid: &Uuid,
) -> Result<(), Error> {
    let mut master = fetch_backend(txn, new_master_uuid).await?;

    engine.driver().reset_slave(&master, true).await?;
    engine.driver().set_read_only(&master, false).await?;
    master.mode = BackendMode::ReadWrite;
    master.status = BackendStatus::Primary;
    txn.update_backend(&master).await?;

    fanout::set_group_master(engine, txn, group_id, Some(master.uuid), false).await?;

    for server in txn.members(group_id).await? {
        if server.uuid == master.uuid {
            continue;
        }
        if let Err(err) = engine.driver().switch_master(&server, &master).await {
            debug!("error configuring slave ({}): {}", server.uuid, err);
        }
    }

    engine.events().emit(DomainEvent::ServerPromoted {
        group_id: group_id.to_owned(),
        master: master.uuid,
    });

    Ok(())
}
