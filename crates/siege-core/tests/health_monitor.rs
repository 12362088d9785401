//! Health monitor polling against the fake tower counters.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use siege_core::fakes::FakeProvisioner;
use siege_core::{
    BattleConfig, DirectOverlay, EventBus, HealthMonitor, LedgerSink, RunEmitter,
    SandboxLifecycleManager,
};
use siege_state::fakes::MemoryLedger;
use siege_state::{EventKind, EventLog, RunId, RunStatus, RunStore};

struct Harness {
    ledger: Arc<MemoryLedger>,
    provisioner: Arc<FakeProvisioner>,
    run_id: RunId,
    cancel: CancellationToken,
    monitor: HealthMonitor,
}

async fn harness(initial_health: u32) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let sink = Arc::new(LedgerSink::new(ledger.clone(), EventBus::new()));
    let provisioner = Arc::new(FakeProvisioner::new());
    let config = BattleConfig {
        initial_health,
        ..BattleConfig::default()
    };
    let sandboxes = Arc::new(SandboxLifecycleManager::new(
        provisioner.clone(),
        Arc::new(DirectOverlay),
        config.clone(),
    ));

    let run_id = ledger.create_run(vec![]).await.unwrap().run_id;
    ledger
        .transition(&run_id, RunStatus::Idle, RunStatus::Running)
        .await
        .unwrap();
    sandboxes.create_target_sandbox(&run_id).await.unwrap();

    let cancel = CancellationToken::new();
    let monitor = HealthMonitor::new(
        sandboxes,
        ledger.clone(),
        RunEmitter::new(run_id.clone(), sink),
        config,
        cancel.clone(),
    );
    Harness {
        ledger,
        provisioner,
        run_id,
        cancel,
        monitor,
    }
}

async fn healths(ledger: &MemoryLedger, run_id: &RunId) -> Vec<u64> {
    ledger
        .list_since(run_id, 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::TowerStatus)
        .map(|e| e.payload.as_ref().unwrap()["health"].as_u64().unwrap())
        .collect()
}

#[test]
fn test_stats_command() {
    assert_eq!(
        HealthMonitor::stats_command(3000),
        "curl -s --max-time 2 http://localhost:3000/stats"
    );
}

#[tokio::test(start_paused = true)]
async fn test_defeat_finishes_the_run_and_cancels() {
    let h = harness(100).await;
    h.provisioner.counters().add("agent-1", 60);
    h.provisioner.counters().add("agent-2", 40);

    let report = h.monitor.run().await;
    assert!(report.defeated);
    assert_eq!(report.final_health, 0);
    assert_eq!(report.last_stats.unwrap().agents["agent-1"], 60);
    assert!(h.cancel.is_cancelled());
    assert_eq!(
        h.ledger.get_run(&h.run_id).await.unwrap().status,
        RunStatus::Finished
    );

    let events = h.ledger.list_since(&h.run_id, 0).await.unwrap();
    assert_eq!(events.len(), 1);
    let payload = events[0].payload.as_ref().unwrap();
    assert_eq!(events[0].message.as_deref(), Some("Tower health: 0"));
    assert_eq!(payload["status"], "defeated");
    assert_eq!(payload["maxHealth"], 100);
    assert_eq!(payload["totalRequests"], 100);
    assert_eq!(payload["agents"]["agent-2"], 40);
}

#[tokio::test(start_paused = true)]
async fn test_progressive_hits_report_only_changes() {
    let h = harness(10).await;
    let counters = h.provisioner.counters();
    let task = tokio::spawn(h.monitor.run());

    for hits in [3, 0, 4, 0, 3] {
        counters.add("agent-1", hits);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let report = task.await.unwrap();

    assert!(report.defeated);
    assert_eq!(healths(&h.ledger, &h.run_id).await, vec![7, 3, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reads_are_skipped() {
    let h = harness(10).await;
    let counters = h.provisioner.counters();
    counters.add("agent-1", 2);
    counters.set_tower_down(true);
    let task = tokio::spawn(h.monitor.run());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(healths(&h.ledger, &h.run_id).await.is_empty());

    counters.set_tower_down(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(healths(&h.ledger, &h.run_id).await, vec![8]);

    h.cancel.cancel();
    let report = task.await.unwrap();
    assert!(!report.defeated);
    assert_eq!(report.final_health, 8);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_polling_without_finishing() {
    let h = harness(1000).await;
    let task = tokio::spawn(h.monitor.run());
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.cancel.cancel();

    let report = task.await.unwrap();
    assert!(!report.defeated);
    assert_eq!(report.final_health, 1000);
    assert_eq!(report.last_stats.unwrap().total_requests, 0);
    assert_eq!(
        h.ledger.get_run(&h.run_id).await.unwrap().status,
        RunStatus::Running
    );
    assert!(healths(&h.ledger, &h.run_id).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_defeat_after_stop_keeps_cancelled_status() {
    let h = harness(5).await;
    h.ledger
        .transition(&h.run_id, RunStatus::Running, RunStatus::Cancelled)
        .await
        .unwrap();
    h.provisioner.counters().add("agent-1", 5);

    let report = h.monitor.run().await;
    assert!(report.defeated);
    assert_eq!(
        h.ledger.get_run(&h.run_id).await.unwrap().status,
        RunStatus::Cancelled
    );
}
