//! End-to-end scenarios against the fleet simulator: HA transitions,
//! sharding with online move/split, and the global fan-out.

use uuid::Uuid;

use crate::ops;
use crate::sharding::ShardState;
use crate::sim::{test_bed, TestBed};
use crate::sql::Value;

/// The mapping's global group master, as seen by the simulator.
async fn global_master(bed: &TestBed, group_id: &str) -> Uuid {
    let mut txn = bed.engine.read().await.unwrap();
    txn.group(group_id).await.unwrap().unwrap().master.unwrap()
}

async fn shard_master(bed: &TestBed, shard_id: u64) -> Uuid {
    let mut txn = bed.engine.read().await.unwrap();
    let shard = txn.shard(shard_id).await.unwrap().unwrap();
    txn.group(&shard.group_id)
        .await
        .unwrap()
        .unwrap()
        .master
        .unwrap()
}

/// Build the S2-style topology: a promoted global group G1 and four
/// promoted shard groups G2..G5, plus an empty promoted destination G6.
async fn sharded_bed(sharding_type: &str) -> (TestBed, u64, Vec<u64>) {
    let bed = test_bed();

    for group in ["G1", "G2", "G3", "G4", "G5", "G6"] {
        bed.group_with_backends(group, 2).await;
        bed.promote(group).await;
    }

    let status = ops::sharding::create_definition(&bed.engine, sharding_type, "G1".into(), true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
    let mapping_id = status.result().unwrap()["mapping_id"].as_u64().unwrap();

    let status = ops::sharding::add_table(
        &bed.engine,
        mapping_id,
        "db1.t1".into(),
        "user_id".into(),
        true,
    )
    .await
    .unwrap();
    assert!(status.success());

    let groups: Vec<(String, Option<String>)> = if sharding_type == "HASH" {
        ["G2", "G3", "G4", "G5"]
            .iter()
            .map(|g| (g.to_string(), None))
            .collect()
    } else {
        [("G2", "1"), ("G3", "101"), ("G4", "1001"), ("G5", "10001")]
            .iter()
            .map(|(g, lb)| (g.to_string(), Some(lb.to_string())))
            .collect()
    };

    let status = ops::sharding::add_shard(&bed.engine, mapping_id, groups, "ENABLED", true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
    let shard_ids: Vec<u64> = status.result().unwrap()["shard_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();

    (bed, mapping_id, shard_ids)
}

// S1 — basic promote.
#[tokio::test]
async fn test_basic_promote() {
    let bed = test_bed();
    let backends = bed.group_with_backends("G1", 2).await;

    let master = bed.promote("G1").await;
    assert!(backends.contains(&master));

    // The other backend replicates from the new master.
    let other = backends.iter().find(|u| **u != master).unwrap();
    let node = bed.fleet.node(other).unwrap();
    assert_eq!(node.master, Some(master));
    assert!(node.io_running && node.sql_running);

    // The lookup surface agrees.
    let servers = ops::group::lookup_servers(&bed.engine, "G1").await.unwrap();
    let master_row = servers
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["is_master"].as_bool().unwrap())
        .unwrap();
    assert_eq!(master_row["uuid"].as_str().unwrap(), master.to_string());

    // And the master is writable while the slave is not.
    assert!(!bed.fleet.node(&master).unwrap().read_only);
}

// Universal invariant 1: enabled shards replicate from the global master.
#[tokio::test]
async fn test_add_shard_wires_fanout() {
    let (bed, _mapping, shard_ids) = sharded_bed("RANGE").await;
    let global = global_master(&bed, "G1").await;

    for shard_id in &shard_ids {
        let master = shard_master(&bed, *shard_id).await;
        let node = bed.fleet.node(&master).unwrap();
        assert_eq!(node.master, Some(global), "shard {} not fanned in", shard_id);
    }
}

// S2 — split + global fan-out.
#[tokio::test]
async fn test_split_and_global_fanout() {
    let (bed, mapping_id, shard_ids) = sharded_bed("RANGE").await;

    // Seed 70 rows into the first shard's range [1, 101).
    let source_master = shard_master(&bed, shard_ids[0]).await;
    for key in 1..=70i64 {
        bed.fleet.write(&source_master, "db1.t1", Value::Int(key));
    }
    bed.fleet.replicate_all();

    let status =
        ops::sharding::split_shard(&bed.engine, shard_ids[0], "G6".into(), Some("36".into()), false, true)
            .await
            .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
    let halves: Vec<u64> = status.result().unwrap()["shard_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert_eq!(halves.len(), 2);

    // Row counts on the halves sum to the pre-split count.
    let low_master = shard_master(&bed, halves[0]).await;
    let high_master = shard_master(&bed, halves[1]).await;
    assert_eq!(bed.fleet.row_count(&low_master, "db1.t1"), 35);
    assert_eq!(bed.fleet.row_count(&high_master, "db1.t1"), 35);

    // A global write reaches every enabled shard group's master,
    // including both halves of the split.
    let global = global_master(&bed, "G1").await;
    bed.fleet.write(&global, "global.gtable", Value::Int(1));
    bed.fleet.replicate_all();

    {
        let mut txn = bed.engine.read().await.unwrap();
        let entries = txn.ranges(mapping_id).await.unwrap();
        assert_eq!(entries.len(), 5);
        for entry in &entries {
            let shard = txn.shard(entry.shard_id).await.unwrap().unwrap();
            assert_eq!(shard.state, ShardState::Enabled);
            let master = txn
                .group(&shard.group_id)
                .await
                .unwrap()
                .unwrap()
                .master
                .unwrap();
            assert_eq!(
                bed.fleet.row_count(&master, "global.gtable"),
                1,
                "global row missing on group {}",
                shard.group_id
            );
        }
    }

    // Lookups route around the split point.
    let low = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "35", "LOCAL")
        .await
        .unwrap();
    let high = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "36", "LOCAL")
        .await
        .unwrap();
    assert!(low.iter().any(|s| s.master && s.uuid == low_master));
    assert!(high.iter().any(|s| s.master && s.uuid == high_master));
}

// A master change on the global group re-points every enabled shard
// group at the new master.
#[tokio::test]
async fn test_global_promote_reconfigures_fanout() {
    let (bed, _mapping, shard_ids) = sharded_bed("RANGE").await;

    let old_global = global_master(&bed, "G1").await;
    let new_global = bed.promote("G1").await;
    assert_ne!(old_global, new_global);

    for shard_id in &shard_ids {
        let master = shard_master(&bed, *shard_id).await;
        let node = bed.fleet.node(&master).unwrap();
        assert_eq!(node.master, Some(new_global));
    }

    // Writes through the new global master still fan out.
    bed.fleet.write(&new_global, "global.gtable", Value::Int(7));
    bed.fleet.replicate_all();
    for shard_id in &shard_ids {
        let master = shard_master(&bed, *shard_id).await;
        assert_eq!(bed.fleet.row_count(&master, "global.gtable"), 1);
    }
}

// S3 — HASH move: the shard holding "a3" lands on G6 and lookups follow.
#[tokio::test]
async fn test_hash_move() {
    let (bed, _mapping, _shards) = sharded_bed("HASH").await;

    let before = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "a3", "LOCAL")
        .await
        .unwrap();
    let owner = before.iter().find(|s| s.master).unwrap().uuid;

    // Which shard is that?
    let shard_id = {
        let mut txn = bed.engine.read().await.unwrap();
        let group = txn.group_of(&owner).await.unwrap().unwrap();
        txn.shard_on_group(&group).await.unwrap().unwrap().id
    };

    // Seed some rows, including "a3".
    for key in ["a1", "a2", "a3", "b7"] {
        bed.fleet.write(&owner, "db1.t1", Value::Text(key.into()));
    }
    bed.fleet.replicate_all();

    let status = ops::sharding::move_shard(&bed.engine, shard_id, "G6".into(), false, true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());

    let after = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "a3", "LOCAL")
        .await
        .unwrap();
    let new_master = after.iter().find(|s| s.master).unwrap().uuid;

    {
        let mut txn = bed.engine.read().await.unwrap();
        assert_eq!(
            txn.group_of(&new_master).await.unwrap().unwrap(),
            "G6",
            "lookup does not route to the destination group"
        );
    }

    // Row count preserved on the moved shard, and the destination
    // replicates from the global group again.
    assert_eq!(bed.fleet.row_count(&new_master, "db1.t1"), 4);
    let global = global_master(&bed, "G1").await;
    assert_eq!(bed.fleet.node(&new_master).unwrap().master, Some(global));
}

// S4 — concurrent conflicting promotes: exactly one wins, the loser
// reports the race as a group error.
#[tokio::test]
async fn test_concurrent_promotes() {
    let bed = test_bed();
    bed.group_with_backends("G1", 2).await;

    let a = ops::group::promote(&bed.engine, "G1".into(), None, true);
    let b = ops::group::promote(&bed.engine, "G1".into(), None, true);
    let (a, b) = tokio::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    let winners = [&a, &b].iter().filter(|s| s.success()).count();
    assert_eq!(winners, 1, "exactly one promote must win");

    let loser = if a.success() { &b } else { &a };
    let diagnosis = loser.diagnosis().unwrap();
    assert!(
        diagnosis.contains("[group]") && diagnosis.contains("changed while the promote"),
        "unexpected race diagnosis: {}",
        diagnosis
    );

    // The group is left with a live master either way.
    let mut txn = bed.engine.read().await.unwrap();
    assert!(txn.group("G1").await.unwrap().unwrap().master.is_some());
}

// S5 — demote, then destroy: refused while a shard maps to the group,
// possible after the shard moved away and the servers are gone.
#[tokio::test]
async fn test_demote_then_destroy() {
    let (bed, _mapping, shard_ids) = sharded_bed("RANGE").await;

    // G2 hosts shard_ids[0]; destroying it now must fail.
    let status = ops::group::destroy(&bed.engine, "G2".into(), true)
        .await
        .unwrap();
    assert!(!status.success());
    assert!(status.diagnosis().unwrap().contains("[group]"));

    // Move the shard away (metadata-only is enough here), demote, empty
    // the group, then destroy.
    let status = ops::sharding::move_shard(&bed.engine, shard_ids[0], "G6".into(), false, true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());

    let status = ops::group::demote(&bed.engine, "G2".into(), true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
    {
        let mut txn = bed.engine.read().await.unwrap();
        assert!(txn.group("G2").await.unwrap().unwrap().master.is_none());
    }

    let members = {
        let mut txn = bed.engine.read().await.unwrap();
        txn.members("G2").await.unwrap()
    };
    for backend in members {
        let status = ops::group::remove(&bed.engine, "G2".into(), backend.uuid, true)
            .await
            .unwrap();
        assert!(status.success(), "{:?}", status.diagnosis());
    }

    let status = ops::group::destroy(&bed.engine, "G2".into(), true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
}

// S6 — a lagging but healthy slave beats a caught-up slave whose sql
// thread is stopped.
#[tokio::test]
async fn test_candidate_with_lag_beats_candidate_with_issues() {
    let bed = test_bed();
    let backends = bed.group_with_backends("G1", 3).await;
    let master = bed.promote("G1").await;

    let slaves: Vec<Uuid> = backends.into_iter().filter(|u| *u != master).collect();
    let (healthy_lagging, stopped) = (slaves[0], slaves[1]);

    // Everyone catches up, then the master commits five more
    // transactions. The broken slave has them all but its sql thread is
    // stopped; the healthy slave is five behind.
    for _ in 0..5 {
        bed.fleet.write(&master, "db1.t1", Value::Int(1));
    }
    bed.fleet.replicate_all();
    bed.fleet.stop_sql_thread(&stopped);
    for _ in 0..5 {
        bed.fleet.write(&master, "db1.t1", Value::Int(2));
    }
    bed.fleet.force_catch_up(&stopped, &master);

    let new_master = bed.promote("G1").await;
    assert_eq!(new_master, healthy_lagging);
}

// Promote failure leaves a state a second promote can recover from
// (universal invariant 4).
#[tokio::test]
async fn test_failed_promote_is_retryable() {
    let bed = test_bed();
    let backends = bed.group_with_backends("G1", 2).await;
    let master = bed.promote("G1").await;
    let slave = *backends.iter().find(|u| **u != master).unwrap();

    // Break every candidate: the only slave is dead, so the switchover
    // finds nobody to promote.
    bed.fleet.kill(&slave);
    let status = ops::group::promote(&bed.engine, "G1".into(), None, true)
        .await
        .unwrap();
    assert!(!status.success());
    assert!(status.diagnosis().unwrap().contains("no valid candidate"));

    // Revive and retry with no new input; the group heals.
    bed.fleet.revive(&slave);
    let new_master = bed.promote("G1").await;
    assert!(new_master == slave || new_master == master);

    let mut txn = bed.engine.read().await.unwrap();
    assert!(txn.group("G1").await.unwrap().unwrap().master.is_some());
}

// Disabled shards are invisible to local lookups.
#[tokio::test]
async fn test_disabled_shard_rejected_by_lookup() {
    let (bed, _mapping, shard_ids) = sharded_bed("RANGE").await;

    let status = ops::sharding::disable_shard(&bed.engine, shard_ids[0], true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());

    let err = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "50", "LOCAL")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not enabled"));

    // Keys of other shards still resolve.
    assert!(
        !ops::sharding::lookup_servers(&bed.engine, "db1.t1", "500", "LOCAL")
            .await
            .unwrap()
            .is_empty()
    );

    // Re-enabling restores the route and the fan-out edge.
    let status = ops::sharding::enable_shard(&bed.engine, shard_ids[0], true)
        .await
        .unwrap();
    assert!(status.success());
    let master = shard_master(&bed, shard_ids[0]).await;
    let global = global_master(&bed, "G1").await;
    assert_eq!(bed.fleet.node(&master).unwrap().master, Some(global));
}

// Keys outside every range are invalid; HASH wraps instead.
#[tokio::test]
async fn test_lookup_boundaries() {
    let (bed, _mapping, _shards) = sharded_bed("RANGE").await;

    let err = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "0", "LOCAL")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid key"));

    let err = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "not-a-number", "LOCAL")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid key"));

    // GLOBAL ignores the key entirely.
    let servers = ops::sharding::lookup_servers(&bed.engine, "db1.t1", "0", "GLOBAL")
        .await
        .unwrap();
    let global = global_master(&bed, "G1").await;
    assert!(servers.iter().any(|s| s.master && s.uuid == global));
}

// Prune deletes exactly the rows outside each shard's window.
#[tokio::test]
async fn test_prune_shard() {
    let (bed, _mapping, shard_ids) = sharded_bed("RANGE").await;

    // Pollute the first two shards with rows belonging elsewhere.
    let first = shard_master(&bed, shard_ids[0]).await;
    let second = shard_master(&bed, shard_ids[1]).await;
    for key in [5i64, 50, 500, 5000] {
        bed.fleet.write(&first, "db1.t1", Value::Int(key));
        bed.fleet.write(&second, "db1.t1", Value::Int(key));
    }

    let status = ops::sharding::prune_shard(&bed.engine, "db1.t1".into(), true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());

    // Shard 1 owns [1, 101): keeps 5 and 50. Shard 2 owns [101, 1001):
    // keeps 500.
    assert_eq!(bed.fleet.row_count(&first, "db1.t1"), 2);
    assert_eq!(bed.fleet.row_count(&second, "db1.t1"), 1);
}

// The state store ends byte-identical after create-then-remove (modulo
// auto-increment ids).
#[tokio::test]
async fn test_sharding_round_trip_leaves_no_residue() {
    let bed = test_bed();
    for group in ["G1", "G2"] {
        bed.group_with_backends(group, 1).await;
        bed.promote(group).await;
    }

    let status = ops::sharding::create_definition(&bed.engine, "RANGE", "G1".into(), true)
        .await
        .unwrap();
    let mapping_id = status.result().unwrap()["mapping_id"].as_u64().unwrap();

    ops::sharding::add_table(&bed.engine, mapping_id, "db1.t1".into(), "id".into(), true)
        .await
        .unwrap();
    let status = ops::sharding::add_shard(
        &bed.engine,
        mapping_id,
        vec![("G2".into(), Some("1".into()))],
        "ENABLED",
        true,
    )
    .await
    .unwrap();
    let shard_id = status.result().unwrap()["shard_ids"][0].as_u64().unwrap();

    // Tear everything down in reverse.
    let status = ops::sharding::disable_shard(&bed.engine, shard_id, true)
        .await
        .unwrap();
    assert!(status.success());
    let status = ops::sharding::remove_shard(&bed.engine, shard_id, true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
    let status = ops::sharding::remove_table(&bed.engine, "db1.t1".into(), true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
    let status = ops::sharding::remove_definition(&bed.engine, mapping_id, true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());

    let mut txn = bed.engine.read().await.unwrap();
    assert!(txn.mappings().await.unwrap().is_empty());
    assert!(txn.ranges(mapping_id).await.unwrap().is_empty());
    assert!(txn.shard_on_group("G2").await.unwrap().is_none());
    assert!(txn.slave_groups_of("G1").await.unwrap().is_empty());
}

// server.set_status: the master cannot be marked faulty by the admin
// API; a non-master can, and its pool is purged.
#[tokio::test]
async fn test_set_status_protects_master() {
    let bed = test_bed();
    let backends = bed.group_with_backends("G1", 2).await;
    let master = bed.promote("G1").await;
    let slave = *backends.iter().find(|u| **u != master).unwrap();

    let status = ops::server::set_status(
        &bed.engine,
        master,
        crate::topology::BackendStatus::Faulty,
        true,
    )
    .await
    .unwrap();
    assert!(!status.success());
    assert!(status.diagnosis().unwrap().contains("demote or failover"));

    let status = ops::server::set_status(
        &bed.engine,
        slave,
        crate::topology::BackendStatus::Faulty,
        true,
    )
    .await
    .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());
}

// server.report_failure on the master of an active group triggers a
// failover within the same procedure.
#[tokio::test]
async fn test_report_failure_fails_over_active_group() {
    let bed = test_bed();
    let backends = bed.group_with_backends("G1", 2).await;
    let master = bed.promote("G1").await;
    let status = ops::group::activate(&bed.engine, "G1".into(), true, true)
        .await
        .unwrap();
    assert!(status.success());

    bed.fleet.kill(&master);
    let status = ops::server::report_failure(&bed.engine, master, true)
        .await
        .unwrap();
    assert!(status.success(), "{:?}", status.diagnosis());

    let mut txn = bed.engine.read().await.unwrap();
    let new_master = txn.group("G1").await.unwrap().unwrap().master.unwrap();
    assert_ne!(new_master, master);
    assert!(backends.contains(&new_master));
}
