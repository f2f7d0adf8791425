//! Reclaim scan and store housekeeping.


use std::time::Duration;

use harness::{by_id, by_name, Harness, ON_DEMAND};
use hostprov_engine::provider::SimOp;
use hostprov_engine::{Clock, SimulatedConfig};
use hostprov_reconcile::RequestStatus;

/// Provision `count` machines and poll them to `running`.
async fn running(h: &Harness, count: i64) -> (String, Vec<String>) {
    let request_id = h.provision(ON_DEMAND, count).await;
    let ids = h.machine_ids(&request_id);
    h.set_status_all(&ids, "running").await;
    assert_eq!(h.poll_one(&request_id).await.status, RequestStatus::Complete);
    (request_id, ids)
}

#[tokio::test]
async fn test_orphan_missing_from_provider_is_removed_silently() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 1).await;
    h.provider.forget(&ids[0]).await;

    let response = h.scan(vec![]).await;

    assert_eq!(response.status, Some(RequestStatus::Complete));
    assert_eq!(response.return_views().count(), 0);
    assert!(h.doc().find_request(&request_id).is_none());
}

#[tokio::test]
async fn test_known_machine_missing_from_provider_is_reported() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 2).await;
    h.provider.forget(&ids[0]).await;

    let response = h.scan(vec![by_id(&ids[0]), by_id(&ids[1])]).await;

    let notices: Vec<_> = response.return_views().collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].machine_id.as_deref(), Some(ids[0].as_str()));
    assert_eq!(notices[0].grace_period, 0);
    assert_eq!(h.machine_ids(&request_id), vec![ids[1].clone()]);
}

#[tokio::test]
async fn test_reclaim_grace_period_counts_down() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 1).await;
    let marked_at = h.clock.now();
    h.provider.mark_for_reclaim(&ids[0], marked_at).await;
    let before = h.doc();

    h.advance(Duration::from_secs(30));
    let response = h.scan(vec![by_id(&ids[0])]).await;
    let notice = response.return_views().next().unwrap();
    assert_eq!(notice.grace_period, 90);
    assert_eq!(notice.machine_id.as_deref(), Some(ids[0].as_str()));

    // Reporting a reclaim does not touch the store.
    assert_eq!(before, h.doc());

    h.advance(Duration::from_secs(120));
    let response = h.scan(vec![by_id(&ids[0])]).await;
    assert_eq!(response.return_views().next().unwrap().grace_period, 0);
    assert_eq!(h.machine_ids(&request_id), ids);
}

#[tokio::test]
async fn test_terminated_machines_kept_only_while_known() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 2).await;
    h.set_status_all(&ids, "terminated").await;

    let response = h.scan(vec![by_id(&ids[0])]).await;

    let notices: Vec<_> = response.return_views().collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].machine_id.as_deref(), Some(ids[0].as_str()));

    let machines = h.machines(&request_id);
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].status.as_deref(), Some("terminated"));
}

#[tokio::test]
async fn test_alive_orphan_is_terminated_by_exactly_one_scan() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 1).await;

    h.advance(Duration::from_secs(14 * 60));
    h.scan(vec![]).await;
    assert_eq!(h.machine_ids(&request_id), ids);
    assert_eq!(h.provider.calls(SimOp::Terminate).await, 0);

    h.advance(Duration::from_secs(2 * 60));
    let response = h.scan(vec![]).await;
    assert_eq!(response.return_views().count(), 0);
    assert!(h.doc().find_request(&request_id).is_none());
    assert_eq!(
        h.provider.instance(&ids[0]).await.unwrap().status,
        "shutting-down"
    );

    h.scan(vec![]).await;
    assert_eq!(h.provider.calls(SimOp::Terminate).await, 1);
}

#[tokio::test]
async fn test_known_machines_are_left_alone() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 1).await;
    let before = h.doc();

    h.advance(Duration::from_secs(60 * 60));
    let response = h.scan(vec![by_id(&ids[0])]).await;

    assert_eq!(response.return_views().count(), 0);
    assert_eq!(before, h.doc());
    assert_eq!(h.machine_ids(&request_id), ids);
}

#[tokio::test]
async fn test_unresolved_orphan_is_terminated_by_name() {
    let h = Harness::with_config(SimulatedConfig {
        names_only_on_create: true,
        ..SimulatedConfig::default()
    });
    let request_id = h.provision(ON_DEMAND, 1).await;
    let name = h.machines(&request_id)[0].name.clone().unwrap();
    assert!(h.provider.forget(&format!("i-{:017x}", 1)).await);

    h.advance(Duration::from_secs(16 * 60));
    let response = h.scan(vec![]).await;

    assert_eq!(response.return_views().count(), 0);
    assert_eq!(h.provider.calls(SimOp::TerminateByName).await, 1);
    assert!(h.doc().find_request(&request_id).is_none());

    // A caller that still lists it by name hears it is gone.
    let response = h.scan(vec![by_name(&name)]).await;
    let notice = response.return_views().next().unwrap();
    assert_eq!(notice.machine, name);
    assert_eq!(notice.grace_period, 0);
}

#[tokio::test]
async fn test_caller_machines_unknown_everywhere_are_reported() {
    let h = Harness::new();
    let stray = h.provider.launch_untracked(1, "elsewhere").await.remove(0);
    let stray_id = stray.machine_id.unwrap();

    let response = h.scan(vec![by_id("i-ghost"), by_id(&stray_id)]).await;

    let notices: Vec<_> = response.return_views().collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].machine, "i-ghost");
    assert_eq!(notices[0].machine_id.as_deref(), Some("i-ghost"));
}

#[tokio::test]
async fn test_returned_machine_waits_for_its_return_poll() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 1).await;
    let return_id = h
        .return_machines(vec![by_id(&ids[0])])
        .await
        .request_id
        .unwrap();
    h.provider.forget(&ids[0]).await;

    h.scan(vec![]).await;
    assert_eq!(h.machine_ids(&request_id), ids);

    let view = h.poll_one(&return_id).await;
    assert_eq!(view.status, RequestStatus::Complete);

    h.scan(vec![]).await;
    assert!(h.doc().find_request(&request_id).is_none());
}

#[tokio::test]
async fn test_status_check_collects_settled_requests() {
    let h = Harness::new();
    let request_id = h.provision(ON_DEMAND, 1).await;
    let ids = h.machine_ids(&request_id);
    h.set_status_all(&ids, "terminated").await;
    assert_eq!(
        h.poll_one(&request_id).await.status,
        RequestStatus::CompleteWithError
    );

    h.advance(Duration::from_secs(23 * 60 * 60));
    h.poll(&[&request_id]).await;
    assert!(h.doc().find_request(&request_id).is_some());

    h.advance(Duration::from_secs(2 * 60 * 60));
    let view = h.poll_one(&request_id).await;
    assert_eq!(view.status, RequestStatus::CompleteWithError);
    assert!(h.doc().find_request(&request_id).is_none());
}

#[tokio::test]
async fn test_status_check_keeps_serving_requests() {
    let h = Harness::new();
    let (request_id, _) = running(&h, 1).await;

    h.advance(Duration::from_secs(48 * 60 * 60));
    let view = h.poll_one(&request_id).await;

    assert_eq!(view.status, RequestStatus::Complete);
    assert!(h.doc().find_request(&request_id).is_some());
}

#[tokio::test]
async fn test_status_check_leaves_orphans_to_the_reclaim_scan() {
    let h = Harness::new();
    let (request_id, ids) = running(&h, 1).await;

    // past the orphan window, which only the reclaim scan acts on
    h.advance(Duration::from_secs(16 * 60));
    let view = h.poll_one(&request_id).await;

    assert_eq!(view.status, RequestStatus::Complete);
    assert_eq!(h.provider.calls(SimOp::Terminate).await, 0);
    assert_eq!(h.machine_ids(&request_id), ids);
}
