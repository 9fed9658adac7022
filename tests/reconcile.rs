//! Leader reconciliation: cascading kills, orphan reaping, abnormal-node
//! takeover and the kill coordinator's convergence paths.

mod common;

use common::{eventually, eventually_async, record, Harness};
use warden::meta::keys;
use warden::meta::store::MetaStore;
use warden::reconcile::messages::{CancelScope, KillCode, KillRequest};
use warden::registry::record::{InstanceStatus, KillSignal};

async fn leader_harness() -> Harness {
    let harness = Harness::start(common::test_config()).await;
    harness.placement.add_node("n1");
    harness.promote().await;
    harness
}

#[tokio::test]
async fn fatal_ancestor_cascades_exactly_one_kill_per_descendant() {
    let harness = leader_harness().await;
    let mut a = record("a", "", "n1");
    let b = record("b", "a", "n1");
    let c = record("c", "b", "n1");
    harness.put_record(&a).await;
    harness.put_record(&b).await;
    harness.put_record(&c).await;

    let placement = harness.placement.clone();
    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { warden.query_instances().await.unwrap().len() == 3 }
    })
    .await;

    a.status = InstanceStatus::Fatal;
    a.reason = "process crashed".to_string();
    harness.put_record(&a).await;

    eventually(|| {
        placement.kills_for("b").len() == 1 && placement.kills_for("c").len() == 1
    })
    .await;
    for id in ["b", "c"] {
        let kills = placement.kills_for(id);
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].signal, KillSignal::FamilyExit);
        assert!(
            kills[0].reason.contains("instance(a)"),
            "kill reason must name the fatal ancestor, got: {}",
            kills[0].reason
        );
    }

    // A redelivered FATAL state must not kill the family again.
    a.reason = "process crashed again".to_string();
    harness.put_record(&a).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(placement.kills_for("b").len(), 1);
    assert_eq!(placement.kills_for("c").len(), 1);
}

#[tokio::test]
async fn orphan_is_killed_within_one_pass() {
    let harness = leader_harness().await;
    let orphan = record("lost-child", "ghost-parent", "n1");
    harness.put_record(&orphan).await;

    let placement = harness.placement.clone();
    eventually(|| placement.kills_for("lost-child").len() == 1).await;
    let kill = placement.kills_for("lost-child").remove(0);
    assert_eq!(kill.signal, KillSignal::Shutdown);
    assert!(
        kill.reason.contains("ghost-parent"),
        "kill reason must name the missing parent, got: {}",
        kill.reason
    );
}

#[tokio::test]
async fn parent_delete_cascades_to_children() {
    let harness = leader_harness().await;
    let a = record("a", "", "n1");
    let b = record("b", "a", "n1");
    harness.put_record(&a).await;
    harness.put_record(&b).await;

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { warden.query_instances().await.unwrap().len() == 2 }
    })
    .await;

    harness.delete_record(&a).await;

    let placement = harness.placement.clone();
    eventually(|| placement.kills_for("b").len() == 1).await;
    let kill = placement.kills_for("b").remove(0);
    assert_eq!(kill.signal, KillSignal::FamilyExit);
    assert!(
        kill.reason.contains("instance(a)"),
        "kill reason must name the deleted ancestor, got: {}",
        kill.reason
    );
    eventually(|| {
        placement
            .cancels
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.scope == CancelScope::Parent && c.id == "a")
    })
    .await;
}

#[tokio::test]
async fn promotion_takes_over_abnormal_node_exactly_once() {
    let harness = Harness::start(common::test_config()).await;
    // Marker and instances exist before this replica ever leads.
    harness
        .store
        .put(
            &keys::abnormal_scheduler_key("n1"),
            r#"{"nodeId":"n1"}"#,
            None,
        )
        .await
        .unwrap();
    let worker = record("i1", "", "n1");
    let mut driver = record("drv", "", "n1");
    driver.created_by_frontend = true;
    let worker_key = harness.put_record(&worker).await;
    harness.put_record(&driver).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    harness.promote().await;

    let store = harness.store.clone();
    eventually_async(|| {
        let harness_store = store.clone();
        let worker_key = worker_key.clone();
        async move {
            let fatal = match harness_store.get(&worker_key).await.unwrap() {
                Some(kv) => kv.value.contains("FATAL"),
                None => false,
            };
            let driver_gone = harness_store
                .get("instances/tenant0/echo/drv")
                .await
                .unwrap()
                .is_none();
            fatal && driver_gone
        }
    })
    .await;

    // No second takeover write: the record was written exactly twice
    // (creation, then the FATAL transition).
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let kv = harness.store.get(&worker_key).await.unwrap().unwrap();
    assert_eq!(kv.version, 2);
    let stored = harness.stored_record(&worker).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Fatal);
    assert!(stored.node_id.is_empty());
    assert_eq!(stored.reason, "n1 is abnormal");
}

#[tokio::test]
async fn abnormal_node_reschedules_within_budget_and_goes_fatal_beyond() {
    let mut config = common::test_config();
    config.reconcile.runtime_recover_enable = true;
    let harness = Harness::start(config).await;
    harness.placement.add_node("n1");
    harness.promote().await;

    let fresh = record("fresh", "", "n1");
    let mut worn = record("worn", "", "n1");
    worn.schedule_times = 3;
    harness.put_record(&fresh).await;
    harness.put_record(&worn).await;

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { warden.query_instances().await.unwrap().len() == 2 }
    })
    .await;

    harness
        .store
        .put(
            &keys::abnormal_scheduler_key("n1"),
            r#"{"nodeId":"n1"}"#,
            None,
        )
        .await
        .unwrap();

    let store = harness.store.clone();
    eventually_async(|| {
        let store = store.clone();
        async move {
            let fresh_kv = store.get("instances/tenant0/echo/fresh").await.unwrap();
            let worn_kv = store.get("instances/tenant0/echo/worn").await.unwrap();
            matches!(&fresh_kv, Some(kv) if kv.value.contains("SCHEDULING"))
                && matches!(&worn_kv, Some(kv) if kv.value.contains("FATAL"))
        }
    })
    .await;

    let rescheduled = harness.stored_record(&fresh).await.unwrap();
    assert_eq!(rescheduled.status, InstanceStatus::Scheduling);
    assert_eq!(rescheduled.schedule_times, 1);
    assert_eq!(rescheduled.reason, "n1 is abnormal");
    eventually(|| harness.placement.scheduled_count("fresh") == 1).await;
    assert_eq!(harness.placement.scheduled_count("worn"), 0);
}

#[tokio::test]
async fn unreachable_placement_marks_resubmission_schedule_failed() {
    let mut config = common::test_config();
    config.reconcile.runtime_recover_enable = true;
    let harness = Harness::start(config).await;
    harness.placement.add_node("n1");
    harness.promote().await;
    harness.placement.set_schedule_fails(true);

    let inst = record("doomed", "", "n1");
    harness.put_record(&inst).await;
    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    harness
        .store
        .put(
            &keys::abnormal_scheduler_key("n1"),
            r#"{"nodeId":"n1"}"#,
            None,
        )
        .await
        .unwrap();

    let store = harness.store.clone();
    eventually_async(move || {
        let store = store.clone();
        async move {
            match store.get("instances/tenant0/echo/doomed").await.unwrap() {
                Some(kv) => kv.value.contains("SCHEDULE_FAILED"),
                None => false,
            }
        }
    })
    .await;
    let stored = harness.stored_record(&inst).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::ScheduleFailed);
    assert_eq!(harness.placement.scheduled_count("doomed"), 0);
}

#[tokio::test]
async fn forced_node_removal_takes_over_its_instances() {
    let harness = leader_harness().await;
    let inst = record("tenant-inst", "", "n1");
    harness.put_record(&inst).await;
    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    harness.placement.remove_node("n1");
    harness.warden.node_removed("n1", true).await.unwrap();

    let store = harness.store.clone();
    eventually_async(move || {
        let store = store.clone();
        async move {
            match store.get("instances/tenant0/echo/tenant-inst").await.unwrap() {
                Some(kv) => kv.value.contains("FATAL"),
                None => false,
            }
        }
    })
    .await;
    let stored = harness.stored_record(&inst).await.unwrap();
    assert!(stored.node_id.is_empty());
}

#[tokio::test]
async fn node_fault_completion_covers_record_transitions() {
    let harness = leader_harness().await;
    let inst = record("migrant", "", "n1");
    harness.put_record(&inst).await;
    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    harness.warden.node_fault("n1").await.unwrap();

    // No polling: by the time the call resolves, the record has already
    // been transitioned and the abnormal marker written.
    let stored = harness.stored_record(&inst).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Fatal);
    assert!(stored.node_id.is_empty());
    assert!(harness
        .store
        .get(&keys::abnormal_scheduler_key("n1"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn kill_resolves_when_record_is_deleted() {
    let harness = leader_harness().await;
    let target = record("victim", "", "n1");
    harness.put_record(&target).await;

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    let warden = harness.warden.clone();
    let pending = tokio::spawn(async move {
        warden
            .kill(KillRequest::instance("victim", KillSignal::Shutdown, "test"))
            .await
            .unwrap()
    });

    let placement = harness.placement.clone();
    eventually(|| !placement.kills_for("victim").is_empty()).await;
    // The owning node confirms by deleting the record.
    harness.delete_record(&target).await;

    let response = pending.await.unwrap();
    assert_eq!(response.code, KillCode::Ok);
}

#[tokio::test]
async fn kill_is_resent_until_the_record_goes_away() {
    let mut config = common::test_config();
    config.reconcile.kill_retry_interval_ms = 50;
    let harness = Harness::start(config).await;
    harness.placement.add_node("n1");
    harness.promote().await;

    let target = record("stubborn", "", "n1");
    harness.put_record(&target).await;
    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    let warden = harness.warden.clone();
    let pending = tokio::spawn(async move {
        warden
            .kill(KillRequest::instance("stubborn", KillSignal::Shutdown, "test"))
            .await
            .unwrap()
    });

    let placement = harness.placement.clone();
    eventually(|| placement.kills_for("stubborn").len() >= 2).await;
    harness.delete_record(&target).await;
    let response = pending.await.unwrap();
    assert_eq!(response.code, KillCode::Ok);
}

#[tokio::test]
async fn remote_not_found_force_deletes_record_and_route() {
    let harness = leader_harness().await;
    let target = record("stray", "", "n1");
    let key = harness.put_record(&target).await;
    harness
        .store
        .put(&keys::instance_route_key("stray"), "{}", None)
        .await
        .unwrap();

    let mut hidden = record("hidden", "", "n1");
    hidden.low_reliability = true;
    harness.put_record(&hidden).await;
    harness
        .store
        .put(&keys::instance_route_key("hidden"), "{}", None)
        .await
        .unwrap();

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { warden.query_instances().await.unwrap().len() == 2 }
    })
    .await;

    harness.placement.set_kill_code("stray", KillCode::NotFound);
    harness.placement.set_kill_code("hidden", KillCode::NotFound);
    let response = harness
        .warden
        .kill(KillRequest::instance("stray", KillSignal::Shutdown, "test"))
        .await
        .unwrap();
    assert_eq!(response.code, KillCode::Ok);
    harness
        .warden
        .kill(KillRequest::instance("hidden", KillSignal::Shutdown, "test"))
        .await
        .unwrap();

    let store = harness.store.clone();
    eventually_async(|| {
        let store = store.clone();
        let key = key.clone();
        async move {
            store.get(&key).await.unwrap().is_none()
                && store
                    .get(&keys::instance_route_key("stray"))
                    .await
                    .unwrap()
                    .is_none()
        }
    })
    .await;
    // Low-reliability instances never owned a managed route key.
    assert!(harness
        .store
        .get(&keys::instance_route_key("hidden"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn job_kill_skips_detached_instances() {
    let harness = leader_harness().await;
    let member = record("j-member", "", "n1");
    let mut loner = record("j-detached", "", "n1");
    loner.detached = true;
    harness.put_record(&member).await;
    harness.put_record(&loner).await;

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { warden.query_instances().await.unwrap().len() == 2 }
    })
    .await;

    let response = harness
        .warden
        .kill(KillRequest::job("job-1", "tenant asked"))
        .await
        .unwrap();
    assert_eq!(response.code, KillCode::Ok);

    let placement = harness.placement.clone();
    eventually(|| placement.kills_for("j-member").len() == 1).await;
    assert!(placement.kills_for("j-detached").is_empty());
    eventually(|| {
        placement
            .cancels
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.scope == CancelScope::Job && c.id == "job-1")
    })
    .await;

    let missing = harness
        .warden
        .kill(KillRequest::job("no-such-job", "tenant asked"))
        .await
        .unwrap();
    assert_eq!(missing.code, KillCode::NotFound);
}

#[tokio::test]
async fn function_removal_kills_its_instances() {
    let harness = leader_harness().await;
    let meta_key = format!("{}tenant0/echo", keys::FUNCTION_META_PREFIX);
    harness.store.put(&meta_key, "{}", None).await.unwrap();
    let inst = record("fn-inst", "", "n1");
    harness.put_record(&inst).await;

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    harness.store.delete(&meta_key, None).await.unwrap();

    let placement = harness.placement.clone();
    eventually(|| placement.kills_for("fn-inst").len() == 1).await;
    assert_eq!(placement.kills_for("fn-inst")[0].signal, KillSignal::Shutdown);
    eventually(|| {
        placement
            .cancels
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.scope == CancelScope::Function && c.id == "tenant0/echo")
    })
    .await;
}

#[tokio::test]
async fn upgrade_window_suspends_fault_handling() {
    let harness = leader_harness().await;
    let inst = record("survivor", "", "n1");
    harness.put_record(&inst).await;

    eventually_async(|| {
        let warden = harness.warden.clone();
        async move { !warden.query_instances().await.unwrap().is_empty() }
    })
    .await;

    harness.warden.set_upgrade_window(true).await.unwrap();
    harness.warden.node_fault("n1").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // No marker written, record untouched.
    assert!(harness
        .store
        .get(&keys::abnormal_scheduler_key("n1"))
        .await
        .unwrap()
        .is_none());
    assert!(!harness.warden.check_node_abnormal("n1").await.unwrap());
    let stored = harness.stored_record(&inst).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Running);

    // Closing the window restores fault handling.
    harness.warden.set_upgrade_window(false).await.unwrap();
    harness.warden.node_fault("n1").await.unwrap();
    assert!(harness.warden.check_node_abnormal("n1").await.unwrap());
}
