//! Group operations: lifecycle, membership, activation, HA transitions,
//! health and reconciliation.

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::run;
use crate::engine::Engine;
use crate::error::Error;
use crate::executor::{step, ProcedureStatus};
use crate::ha;
use crate::topology::{BackendMode, BackendStatus, Group};

/// `group.create`
pub async fn create(
    engine: &Engine,
    group_id: String,
    description: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let entry = step("create_group", move |ctx| async move {
        let mut cat = ctx.catalog().await?;
        if cat.group(&group_id).await?.is_some() {
            return Err(Error::group(format!("group ({}) already exists", group_id)));
        }
        cat.insert_group(&Group::new(group_id.clone(), description))
            .await?;
        drop(cat);
        ctx.report(json!({ "group_id": group_id }));
        Ok(())
    });

    run(engine, "group.create", locks, entry, synchronous).await
}

/// `group.destroy` — refused while anything still references the group.
pub async fn destroy(
    engine: &Engine,
    group_id: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let entry = step("destroy_group", move |ctx| async move {
        let mut cat = ctx.catalog().await?;

        if cat.group(&group_id).await?.is_none() {
            return Err(Error::group(format!("group ({}) does not exist", group_id)));
        }
        if cat.shard_on_group(&group_id).await?.is_some() {
            return Err(Error::group(format!(
                "group ({}) hosts a shard; move it away first",
                group_id
            )));
        }
        for mapping in cat.mappings().await? {
            if mapping.global_group == group_id {
                return Err(Error::group(format!(
                    "group ({}) is the global group of mapping ({})",
                    group_id, mapping.id
                )));
            }
        }
        if !cat.members(&group_id).await?.is_empty() {
            return Err(Error::group(format!(
                "group ({}) is not empty; remove its servers first",
                group_id
            )));
        }
        if !cat.slave_groups_of(&group_id).await?.is_empty() {
            return Err(Error::group(format!(
                "group ({}) still has groups replicating from it",
                group_id
            )));
        }
        if let Some(master_group) = cat.master_group_of(&group_id).await? {
            return Err(Error::group(format!(
                "group ({}) still replicates from group ({})",
                group_id, master_group
            )));
        }

        cat.delete_group(&group_id).await?;
        Ok(())
    });

    run(engine, "group.destroy", locks, entry, synchronous).await
}

/// `group.description`
pub async fn description(
    engine: &Engine,
    group_id: String,
    description: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let entry = step("update_group_description", move |ctx| async move {
        let mut cat = ctx.catalog().await?;
        let mut group = cat
            .group(&group_id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;
        group.description = description;
        cat.update_group(&group).await?;
        Ok(())
    });

    run(engine, "group.description", locks, entry, synchronous).await
}

/// `group.add` — register a backend into a group. The backend's identity
/// is whatever uuid it reports about itself.
#[allow(clippy::too_many_arguments)]
pub async fn add(
    engine: &Engine,
    group_id: String,
    address: String,
    user: String,
    password: String,
    update_only: bool,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let engine2 = engine.clone();
    let entry = step("add_server", move |ctx| async move {
        let engine = engine2;
        let mut cat = ctx.catalog().await?;

        let group = cat
            .group(&group_id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

        if cat.backend_by_address(&address).await?.is_some() {
            return Err(Error::server(format!(
                "server ({}) is already registered",
                address
            )));
        }

        let uuid = engine.driver().discover_uuid(&address, &user, &password).await?;
        if cat.backend(&uuid).await?.is_some() {
            return Err(Error::server(format!(
                "server ({}) is already a member of a group",
                uuid
            )));
        }

        let mut backend = crate::topology::Backend::new(uuid, address, user);
        backend.password = password;

        // The backend has to be usable for replication before it joins.
        let observed = engine.driver().probe(&backend).await?;
        if let Some(reported) = observed.uuid {
            if reported != uuid {
                return Err(Error::Uuid {
                    address: backend.address.clone(),
                    expected: uuid,
                    got: reported,
                });
            }
        }
        if !observed.binlog_enabled {
            return Err(Error::server(format!(
                "server ({}) does not have binary logging enabled",
                uuid
            )));
        }
        if !observed.gtid_enabled {
            return Err(Error::server(format!(
                "server ({}) does not have gtid support enabled",
                uuid
            )));
        }

        cat.insert_backend(&backend).await?;
        cat.add_member(&group_id, &uuid).await?;

        // Joining a group with a master means becoming its slave.
        if !update_only {
            if let Some(master_uuid) = group.master {
                let master = cat
                    .backend(&master_uuid)
                    .await?
                    .ok_or_else(|| Error::server(format!("backend ({}) does not exist", master_uuid)))?;
                engine.driver().switch_master(&backend, &master).await?;
            }
        }
        drop(cat);

        ctx.report(json!({ "uuid": uuid }));
        Ok(())
    });

    run(engine, "group.add", locks, entry, synchronous).await
}

/// `group.remove` — the master cannot be removed; demote or failover
/// first.
pub async fn remove(
    engine: &Engine,
    group_id: String,
    uuid: Uuid,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let engine2 = engine.clone();
    let entry = step("remove_server", move |ctx| async move {
        let engine = engine2;
        let mut cat = ctx.catalog().await?;

        let group = cat
            .group(&group_id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

        if cat.group_of(&uuid).await?.as_deref() != Some(group_id.as_str()) {
            return Err(Error::group(format!(
                "group ({}) does not contain server ({})",
                group_id, uuid
            )));
        }
        if group.is_master(&uuid) {
            return Err(Error::group(format!(
                "cannot remove server ({}): it is the master of group ({}); \
                 demote or failover first",
                uuid, group_id
            )));
        }

        cat.remove_member(&group_id, &uuid).await?;
        cat.delete_backend(&uuid).await?;
        drop(cat);

        engine.pools().purge(&uuid);
        Ok(())
    });

    run(engine, "group.remove", locks, entry, synchronous).await
}

/// `group.activate` / `group.deactivate` — toggles failure detector
/// monitoring for the group.
pub async fn activate(
    engine: &Engine,
    group_id: String,
    active: bool,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let name = if active {
        "group.activate"
    } else {
        "group.deactivate"
    };
    let entry = step("set_group_activation", move |ctx| async move {
        let mut cat = ctx.catalog().await?;
        let mut group = cat
            .group(&group_id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;
        group.active = active;
        cat.update_group(&group).await?;
        Ok(())
    });

    run(engine, name, locks, entry, synchronous).await
}

/// `group.promote` — switchover or failover depending on the state of
/// the current master.
pub async fn promote(
    engine: &Engine,
    group_id: String,
    candidate: Option<Uuid>,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    // Capture the master the caller is acting on; the entry step fails if
    // a concurrent procedure changed it before our locks were granted.
    let expected_master = {
        let mut txn = engine.read().await?;
        txn.group(&group_id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?
            .master
    };

    let locks = vec![group_id.clone()];
    let entry = ha::promote::entry(engine.clone(), group_id, candidate, expected_master);
    run(engine, "group.promote", locks, entry, synchronous).await
}

/// `group.demote` — block writes and leave the group without a master.
pub async fn demote(
    engine: &Engine,
    group_id: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let entry = ha::demote::entry(engine.clone(), group_id);
    run(engine, "group.demote", locks, entry, synchronous).await
}

/// `group.lookup_groups` — read command.
pub async fn lookup_groups(
    engine: &Engine,
    group_id: Option<&str>,
) -> Result<serde_json::Value, Error> {
    let mut txn = engine.read().await?;

    let groups = match group_id {
        Some(id) => vec![txn
            .group(id)
            .await?
            .ok_or_else(|| Error::group(format!("group ({}) does not exist", id)))?],
        None => txn.groups().await?,
    };

    Ok(json!(groups
        .iter()
        .map(|g| {
            json!({
                "group_id": g.id,
                "description": g.description,
                "master_uuid": g.master,
                "active": g.active,
            })
        })
        .collect::<Vec<_>>()))
}

/// `group.lookup_servers` — read command.
pub async fn lookup_servers(
    engine: &Engine,
    group_id: &str,
) -> Result<serde_json::Value, Error> {
    let mut txn = engine.read().await?;

    let group = txn
        .group(group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

    let servers = txn.members(group_id).await?;
    Ok(json!(servers
        .iter()
        .map(|b| {
            json!({
                "uuid": b.uuid,
                "address": b.address,
                "status": b.status.to_string(),
                "mode": b.mode.to_string(),
                "weight": b.weight,
                "is_master": group.is_master(&b.uuid),
            })
        })
        .collect::<Vec<_>>()))
}

/// `group.health` — probe every member and report aliveness and
/// replication issues.
pub async fn health(engine: &Engine, group_id: &str) -> Result<serde_json::Value, Error> {
    let mut txn = engine.read().await?;

    let group = txn
        .group(group_id)
        .await?
        .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

    let mut health = serde_json::Map::new();
    for server in txn.members(group_id).await? {
        let is_master = group.is_master(&server.uuid);
        let mut status = server.status;
        let mut issues = String::new();

        let alive = match engine.driver().probe(&server).await {
            Ok(_) => {
                if !is_master {
                    let slave_issues = engine.driver().check_slave_issues(&server).await?;
                    let replicates_from = engine.driver().slave_has_master(&server).await?;
                    if !slave_issues.is_empty() {
                        issues = slave_issues.to_string();
                    } else if group.master.is_some() && replicates_from != group.master {
                        issues = format!(
                            "group has master ({:?}) but server replicates from ({:?})",
                            group.master, replicates_from
                        );
                    }
                }
                true
            }
            Err(_) => {
                if status != BackendStatus::Faulty {
                    status = BackendStatus::Faulty;
                }
                false
            }
        };

        health.insert(
            server.uuid.to_string(),
            json!({
                "is_alive": alive,
                "is_master": is_master,
                "status": status.to_string(),
                "issues": issues,
            }),
        );
    }

    Ok(serde_json::Value::Object(health))
}

/// `group.reconcile` — repair backend read-only flags that drifted from
/// the recorded topology (e.g. a failed step left the old master
/// read-only while the metadata rolled back).
pub async fn reconcile(
    engine: &Engine,
    group_id: String,
    synchronous: bool,
) -> Result<ProcedureStatus, Error> {
    let locks = vec![group_id.clone()];
    let engine2 = engine.clone();
    let entry = step("reconcile_group", move |ctx| async move {
        let engine = engine2;
        let mut repaired: Vec<Uuid> = vec![];
        {
            let mut cat = ctx.catalog().await?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            for mut server in cat.members(&group_id).await? {
                let is_master = group.is_master(&server.uuid);
                let observed = match engine.driver().probe(&server).await {
                    Ok(observed) => observed,
                    Err(err) => {
                        warn!("cannot reconcile server ({}): {}", server.uuid, err);
                        continue;
                    }
                };

                // A server answering under a different uuid is not the
                // server the model thinks it is.
                if let Some(reported) = observed.uuid {
                    if reported != server.uuid {
                        return Err(Error::Uuid {
                            address: server.address.clone(),
                            expected: server.uuid,
                            got: reported,
                        });
                    }
                }

                let want_read_only = !is_master;
                if observed.read_only != want_read_only {
                    engine.driver().set_read_only(&server, want_read_only).await?;
                    repaired.push(server.uuid);
                }

                let want_mode = if is_master {
                    BackendMode::ReadWrite
                } else if server.mode == BackendMode::Offline {
                    BackendMode::Offline
                } else {
                    BackendMode::ReadOnly
                };
                if server.mode != want_mode {
                    server.mode = want_mode;
                    cat.update_backend(&server).await?;
                }
            }
        }

        ctx.report(json!({ "repaired": repaired }));
        Ok(())
    });

    run(engine, "group.reconcile", locks, entry, synchronous).await
}

