//! Demote: block writes on the current master, let the slaves drain, stop
//! replication everywhere. Nobody is promoted; the group is left without
//! a master.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::executor::{step, Step};

/// Entry step of `group.demote`.
pub fn entry(engine: Engine, group_id: String) -> Step {
    step("block_write_demote", move |ctx| async move {
        let master_uuid = {
            let mut cat = ctx.catalog().await?;
            let group = cat
                .group(&group_id)
                .await?
                .ok_or_else(|| Error::group(format!("group ({}) does not exist", group_id)))?;

            let master_uuid = group.master.ok_or_else(|| {
                Error::group(format!("group ({}) does not have a master", group_id))
            })?;

            super::block_write_master(&engine, &mut **cat, &group_id, &master_uuid).await?;
            master_uuid
        };

        ctx.enqueue(wait_slaves_demote(engine, group_id, master_uuid));
        Ok(())
    })
}

fn wait_slaves_demote(engine: Engine, group_id: String, master_uuid: Uuid) -> Step {
    step("wait_slaves_demote", move |ctx| async move {
        {
            let mut cat = ctx.catalog().await?;
            let master = super::fetch_backend(&mut **cat, &master_uuid).await?;

            super::wait_slaves_catch(&engine, &mut **cat, &group_id, &master, &[]).await?;

            for server in cat.members(&group_id).await? {
                if let Err(err) = engine.driver().stop_slave(&server, true).await {
                    debug!("error stopping slave ({}): {}", server.uuid, err);
                }
            }
        }

        ctx.report(json!({ "group_id": group_id, "master_uuid": null }));
        Ok(())
    })
}
