//! Crash-recovery: snapshot, kill, restart, probe.

mod common;

use std::sync::Arc;

use common::{fake_probe, start_hub};
use hive::agent::client::{MockWorkerClient, WorkerClient, WorkerStatus};
use hive::agent::spawner::SpawnOptions;
use hive::{Config, Hub};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn restart_keeps_live_agents_and_drops_killed_ones() {
    let fixture = start_hub(22400).await;
    let cancel = CancellationToken::new();

    // Two agents up, two leases persisted.
    let a = fixture
        .hub
        .manager
        .spawn(SpawnOptions { name: "a".into(), ..SpawnOptions::default() }, &cancel)
        .await
        .unwrap();
    let b = fixture
        .hub
        .manager
        .spawn(SpawnOptions { name: "b".into(), ..SpawnOptions::default() }, &cancel)
        .await
        .unwrap();

    fixture.hub.snapshot().unwrap();
    assert!(fixture.hub.persistor.exists());

    // Kill A's process group externally — the hub does not get to clean up.
    let a_pid = a.pid.unwrap();
    unsafe {
        libc::kill(-a_pid, libc::SIGKILL);
        libc::kill(a_pid, libc::SIGKILL);
    }
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // A second hub boots over the same repo. Its drone client only knows
    // about B's port: A is dead on both probes, B answers busy.
    let bin = tempfile::TempDir::new().unwrap();
    let mut config = Config::new(fixture.repo.path().to_path_buf());
    config.worktrees_dir = fixture._trees.path().to_path_buf();
    config.base_port = 22400;
    config.probe_bin = fake_probe(bin.path()).to_string_lossy().to_string();

    let mock = Arc::new(MockWorkerClient::new());
    mock.set_status(b.port, WorkerStatus::Busy);

    let restarted =
        Hub::with_client(config, Arc::clone(&mock) as Arc<dyn WorkerClient>).unwrap();
    let summary = restarted.restore().await;

    assert_eq!(summary.agents_restored, 1);
    assert_eq!(summary.agents_dropped, 1);
    assert_eq!(restarted.manager.count(), 1);

    let survivor = restarted.manager.get("b").unwrap();
    assert_eq!(survivor.id, b.id);
    assert_eq!(survivor.status, hive::agent::AgentStatus::Busy);
    // Recovered without a process handle, but the pid survives.
    assert_eq!(survivor.pid, b.pid);

    // B's lease came back; A's was released with the dead agent.
    assert!(restarted.ports.is_leased(b.port));
    assert!(!restarted.ports.is_leased(a.port));

    // Health over HTTP agrees with the scenario: one agent total.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let restarted = Arc::new(restarted);
    let serve_hub = Arc::clone(&restarted);
    tokio::spawn(async move {
        let _ = serve_hub.serve(listener).await;
    });

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["agents_total"], 1);
    assert_eq!(health["agents_running"], 1);

    // Tidy up the survivor through the original hub, which owns the child.
    fixture.hub.manager.stop_all(&cancel).await.unwrap();
}

#[tokio::test]
async fn snapshot_roundtrip_preserves_tasks_and_solicitations() {
    let fixture = start_hub(22520).await;

    let task = fixture
        .hub
        .tasks
        .create(hive::tasks::CreateTaskRequest {
            subject: "persist me".into(),
            description: "must survive restarts".into(),
            ..hive::tasks::CreateTaskRequest::default()
        })
        .unwrap();
    let solicitation = fixture
        .hub
        .solicitations
        .create(hive::solicitations::CreateSolicitationRequest {
            agent_id: "a1".into(),
            agent_name: "alpha".into(),
            task_id: Some(task.id.clone()),
            solicitation_type: hive::solicitations::SolicitationType::Decision,
            urgency: hive::solicitations::Urgency::Medium,
            message: "tabs or spaces?".into(),
            context: None,
            options: Some(vec!["tabs".into(), "spaces".into()]),
            metadata: None,
        });

    fixture.hub.snapshot().unwrap();

    let snapshot = fixture.hub.persistor.load().unwrap().unwrap();
    assert_eq!(snapshot.version, hive::state::SNAPSHOT_VERSION);
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(snapshot.solicitations.len(), 1);
    assert_eq!(snapshot.solicitations[0].id, solicitation.id);

    // Saving what we loaded reproduces the same state (modulo timestamps).
    fixture.hub.persistor.save(&snapshot).unwrap();
    let again = fixture.hub.persistor.load().unwrap().unwrap();
    assert_eq!(again.tasks[0].id, task.id);
    assert_eq!(again.solicitations[0].message, "tabs or spaces?");
}
