//! Server operations: status, mode, weight, uuid discovery, and the
//! failure-report entry point the failure detector feeds.

use serde_json::json;
use uuid::Uuid;

use super::run;
use crate::engine::Engine;
use crate::error::Error;
use crate::events::DomainEvent;
use crate::executor::{step, ProcedureStatus};
use crate::ha;
use crate::topology::{BackendMode, BackendStatus};

/// `server.set_status` — administrative transitions. PRIMARY is owned by
/// the HA machine; the PRIMARY of a group cannot be marked FAULTY here.
pub async fn set_status(
    engine: &Engine,
    uuid: Uuid,
    status: BackendStatus,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    // Lock the backend's group: status changes race with HA transitions.
    let group_id = {
        let mut txn = engine.read().await?;
        txn.group_of(&uuid)
            .await?
            .ok_or_else(|| Error::server(format!("server ({}) is not in any group", uuid)))?
    };

    let locks = vec![group_id.clone()];
    let engine2 = engine.clone();
    let entry = step("set_server_status", move |ctx| async move {
        let engine = engine2;
        let lost = {
            let mut cat = ctx.catalog().await?;

            let mut backend = cat
                .backend(&uuid)
                .await?
                .ok_or_else(|| Error::server(format!("backend ({}) does not exist", uuid)))?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            if status == BackendStatus::Primary {
                return Err(Error::server(
                    "PRIMARY status is set by promote/failover, not directly",
                ));
            }
            if group.is_master(&uuid) {
                return Err(Error::server(format!(
                    "server ({}) is the master of group ({}); demote or failover first",
                    uuid, group_id
                )));
            }
            if backend.status == status {
                return Err(Error::server(format!(
                    "server ({}) is already {}",
                    uuid, status
                )));
            }

            backend.status = status;
            backend.mode = match status {
                BackendStatus::Offline => BackendMode::Offline,
                _ => BackendMode::ReadOnly,
            };
            cat.update_backend(&backend).await?;

            status == BackendStatus::Faulty
        };

        if lost {
            engine.pools().purge(&uuid);
            engine.events().emit(DomainEvent::ServerLost {
                group_id: group_id.clone(),
                uuid,
            });
        }

        ctx.report(json!({ "uuid": uuid, "status": status.to_string() }));
        Ok(())
    });

    run(engine, "server.set_status", locks, entry, synchronous).await
}

/// `server.report_failure` — the failure-detector entry point. Unlike
/// `set_status`, it may hit the master of a group: the backend is marked
/// FAULTY, its pool purged, and, when its (active) group just lost its
/// master, a failover is scheduled.
pub async fn report_failure(
    engine: &Engine,
    uuid: Uuid,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let group_id = {
        let mut txn = engine.read().await?;
        txn.group_of(&uuid)
            .await?
            .ok_or_else(|| Error::server(format!("server ({}) is not in any group", uuid)))?
    };

    let locks = vec![group_id.clone()];
    let engine2 = engine.clone();
    let entry = step("report_failure", move |ctx| async move {
        let engine = engine2;
        let failover = {
            let mut cat = ctx.catalog().await?;

            let mut backend = cat
                .backend(&uuid)
                .await?
                .ok_or_else(|| Error::server(format!("backend ({}) does not exist", uuid)))?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            if backend.status == BackendStatus::Faulty {
                return Err(Error::server(format!("server ({}) is already faulty", uuid)));
            }

            backend.status = BackendStatus::Faulty;
            cat.update_backend(&backend).await?;

            group.is_master(&uuid) && group.active
        };

        engine.pools().purge(&uuid);
        engine.events().emit(DomainEvent::ServerLost {
            group_id: group_id.clone(),
            uuid,
        });

        // A monitored group without a live master heals itself.
        if failover {
            ctx.enqueue(ha::promote::entry(
                engine.clone(),
                group_id.clone(),
                None,
                Some(uuid),
            ));
        }

        ctx.report(json!({ "uuid": uuid, "status": "FAULTY" }));
        Ok(())
    });

    run(engine, "server.report_failure", locks, entry, synchronous).await
}

/// `server.set_mode` — the master stays writable, everyone else stays
/// read-only or offline.
pub async fn set_mode(
    engine: &Engine,
    uuid: Uuid,
    mode: BackendMode,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let group_id = {
        let mut txn = engine.read().await?;
        txn.group_of(&uuid)
            .await?
            .ok_or_else(|| Error::server(format!("server ({}) is not in any group", uuid)))?
    };

    let locks = vec![group_id.clone()];
    let entry = step("set_server_mode", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        let mut backend = cat
            .backend(&uuid)
            .await?
            .ok_or_else(|| Error::server(format!("backend ({}) does not exist", uuid)))?;
        let group = cat
            .group(&group_id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

        let is_master = group.is_master(&uuid);
        if is_master && !mode.writable() {
            return Err(Error::server(format!(
                "master ({}) must remain in a writable mode",
                uuid
            )));
        }
        if !is_master && mode.writable() {
            return Err(Error::server(format!(
                "server ({}) is not a master and cannot accept writes",
                uuid
            )));
        }

        backend.mode = mode;
        cat.update_backend(&backend).await?;
        Ok(())
    });

    run(engine, "server.set_mode", locks, entry, synchronous).await
}

/// `server.set_weight`
pub async fn set_weight(
    engine: &Engine,
    uuid: Uuid,
    weight: f64,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let group_id = {
        let mut txn = engine.read().await?;
        txn.group_of(&uuid)
            .await?
            .ok_or_else(|| Error::server(format!("server ({}) is not in any group", uuid)))?
    };

    let locks = vec![group_id];
    let entry = step("set_server_weight", move |ctx| async move {
        if weight <= 0.0 {
            return Err(Error::server(format!(
                "weight ({}) must be a positive value",
                weight
            )));
        }

        let mut cat = ctx.catalog().await?;
        let mut backend = cat
            .backend(&uuid)
            .await?
            .ok_or_else(|| Error::server(format!("backend ({}) does not exist", uuid)))?;
        backend.weight = weight;
        cat.update_backend(&backend).await?;
        Ok(())
    });

    run(engine, "server.set_weight", locks, entry, synchronous).await
}

/// `server.lookup_uuid` — read command; asks the server itself.
pub async fn lookup_uuid(
    engine: &Engine,
    address: &str,
    user: &str,
    password: &str,
) -> Result<Uuid, Error> {
    Ok(engine.driver().discover_uuid(address, user, password).await?)
}
