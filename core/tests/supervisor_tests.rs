#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kafka_toolkit::{
    AdminClient, AdminError, BrokerConfig, BrokerState, Cadence, ConfigInspector, Event, EventBus,
    JobStatus, ProcessSupervisor, ReadinessProbe, SimulationEngine, SimulationError,
    SupervisorError, ToolkitSettings, TopicSpec,
};
use kafka_toolkit_client::{ClusterAdmin, InMemoryCluster};
use tempfile::TempDir;

const PROPERTIES: &str = "\
process.roles=broker,controller
node.id=1
controller.quorum.voters=1@localhost:19093
listeners=PLAINTEXT://localhost:19092,CONTROLLER://localhost:19093
controller.listener.names=CONTROLLER
log.dirs=data
";

const HEALTHY_START: &str = r#"#!/bin/sh
echo "[2024-05-01 10:00:00,000] INFO Starting broker with $1"
echo $$ > broker.pid
touch ready
exec sleep 30
"#;

const HANGING_START: &str = r#"#!/bin/sh
echo $$ > broker.pid
exec sleep 30
"#;

const CRASHING_START: &str = r#"#!/bin/sh
echo "[2024-05-01 10:00:00,000] ERROR Exiting Kafka due to fatal exception" >&2
exit 3
"#;

const READY_THEN_EXIT: &str = r#"#!/bin/sh
touch ready
sleep 0.1
exit 7
"#;

const STOP: &str = r#"#!/bin/sh
echo "Stopping broker"
kill $(cat broker.pid)
"#;

const IGNORING_STOP: &str = r#"#!/bin/sh
echo "Not stopping anything"
"#;

/// Ready once the fake broker has touched its marker file
struct MarkerProbe {
    marker: PathBuf,
}

#[async_trait]
impl ReadinessProbe for MarkerProbe {
    async fn probe(&self) -> bool {
        self.marker.exists()
    }

    fn describe(&self) -> String {
        self.marker.display().to_string()
    }
}

/// Ready only after a slow check, once the marker exists
struct SlowProbe {
    marker: PathBuf,
    delay: Duration,
}

#[async_trait]
impl ReadinessProbe for SlowProbe {
    async fn probe(&self) -> bool {
        if !self.marker.exists() {
            return false;
        }
        tokio::time::sleep(self.delay).await;
        true
    }

    fn describe(&self) -> String {
        format!("{} (slow)", self.marker.display())
    }
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn installation(start_script: &str) -> (TempDir, BrokerConfig) {
    installation_with(start_script, STOP)
}

fn installation_with(start_script: &str, stop_script: &str) -> (TempDir, BrokerConfig) {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("bin")).unwrap();
    fs::create_dir_all(dir.path().join("config")).unwrap();
    fs::create_dir_all(dir.path().join("data")).unwrap();
    write_script(&dir.path().join("bin/kafka-server-start.sh"), start_script);
    write_script(&dir.path().join("bin/kafka-server-stop.sh"), stop_script);
    fs::write(dir.path().join("config/server.properties"), PROPERTIES).unwrap();

    let config = ConfigInspector::new().parse(dir.path()).unwrap();
    (dir, config)
}

fn settings() -> ToolkitSettings {
    ToolkitSettings {
        startup_timeout_ms: 5_000,
        probe_initial_backoff_ms: 20,
        probe_max_backoff_ms: 100,
        graceful_stop_timeout_ms: 5_000,
        kill_wait_timeout_ms: 2_000,
        ..ToolkitSettings::default()
    }
}

fn supervisor(dir: &TempDir, settings: ToolkitSettings) -> (EventBus, ProcessSupervisor) {
    let bus = EventBus::new(1024, 1024);
    let supervisor = ProcessSupervisor::new(settings, bus.clone()).with_probe(Arc::new(MarkerProbe {
        marker: dir.path().join("ready"),
    }));
    (bus, supervisor)
}

fn lifecycle(bus: &EventBus) -> Vec<(BrokerState, BrokerState)> {
    bus.history(1024)
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            Event::Lifecycle(e) => Some((e.old, e.new)),
            _ => None,
        })
        .collect()
}

fn log_lines(bus: &EventBus, source: &str) -> Vec<String> {
    bus.history(1024)
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            Event::Log(e) if e.source == source => Some(e.text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_and_stop() {
    let (dir, config) = installation(HEALTHY_START);
    let (bus, supervisor) = supervisor(&dir, settings());

    let info = supervisor.start(&config).await.expect("broker should start");
    assert!(info.pid.is_some());
    assert_eq!(info.installation, dir.path());
    assert_eq!(supervisor.current_state(), BrokerState::Running);
    assert!(supervisor.process_info().await.is_some());

    supervisor.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(supervisor.current_state(), BrokerState::Stopped);
    assert!(supervisor.process_info().await.is_none());

    assert_eq!(
        lifecycle(&bus),
        vec![
            (BrokerState::Stopped, BrokerState::Starting),
            (BrokerState::Starting, BrokerState::Running),
            (BrokerState::Running, BrokerState::Stopping),
            (BrokerState::Stopping, BrokerState::Stopped),
        ]
    );

    let broker_output = log_lines(&bus, "broker");
    assert!(
        broker_output
            .iter()
            .any(|line| line.contains("Starting broker with") && line.ends_with("server.properties")),
        "{:?}",
        broker_output
    );
    assert_eq!(log_lines(&bus, "stop-script"), vec!["Stopping broker".to_string()]);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (dir, config) = installation(HEALTHY_START);
    let (bus, supervisor) = supervisor(&dir, settings());

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    assert!(lifecycle(&bus).is_empty());

    supervisor.start(&config).await.unwrap();
    supervisor.stop(Duration::from_secs(5)).await.unwrap();
    supervisor.stop(Duration::from_secs(5)).await.unwrap();

    let into_stopped = lifecycle(&bus)
        .into_iter()
        .filter(|(_, new)| *new == BrokerState::Stopped)
        .count();
    assert_eq!(into_stopped, 1);
}

#[tokio::test]
async fn test_concurrent_stops_emit_one_stopped_transition() {
    let (dir, config) = installation(HEALTHY_START);
    let (bus, supervisor) = supervisor(&dir, settings());
    supervisor.start(&config).await.unwrap();

    let (a, b) = tokio::join!(
        supervisor.stop(Duration::from_secs(5)),
        supervisor.stop(Duration::from_secs(5))
    );
    a.unwrap();
    b.unwrap();

    let into_stopped = lifecycle(&bus)
        .into_iter()
        .filter(|(_, new)| *new == BrokerState::Stopped)
        .count();
    assert_eq!(into_stopped, 1);
}

#[tokio::test]
async fn test_second_start_is_refused() {
    let (dir, config) = installation(HEALTHY_START);
    let (_bus, supervisor) = supervisor(&dir, settings());

    supervisor.start(&config).await.unwrap();
    let err = supervisor.start(&config).await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::AlreadyRunning {
            state: BrokerState::Running
        }
    ));

    supervisor.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_startup_timeout_fails_and_kills() {
    let (dir, config) = installation(HANGING_START);
    let settings = ToolkitSettings {
        startup_timeout_ms: 500,
        ..settings()
    };
    let (_bus, supervisor) = supervisor(&dir, settings);

    let err = supervisor.start(&config).await.unwrap_err();
    assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
    assert_eq!(
        supervisor.current_state(),
        BrokerState::Failed("startup timeout".to_string())
    );
    assert!(supervisor.process_info().await.is_none());

    // Failed -> Stopped, and a fresh start is allowed again.
    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(supervisor.current_state(), BrokerState::Stopped);
}

#[tokio::test]
async fn test_exit_during_startup_is_reported() {
    let (dir, config) = installation(CRASHING_START);
    let (bus, supervisor) = supervisor(&dir, settings());

    let err = supervisor.start(&config).await.unwrap_err();
    match err {
        SupervisorError::UnexpectedExit { exit } => assert_eq!(exit.code, Some(3)),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        supervisor.current_state(),
        BrokerState::Failed("unexpected exit, code 3".to_string())
    );
    assert!(log_lines(&bus, "broker")
        .iter()
        .any(|line| line.contains("fatal exception")));
}

#[tokio::test]
async fn test_exit_while_probing_is_not_promoted() {
    let (dir, config) = installation(READY_THEN_EXIT);
    let bus = EventBus::new(1024, 1024);
    let supervisor = ProcessSupervisor::new(settings(), bus.clone()).with_probe(Arc::new(SlowProbe {
        marker: dir.path().join("ready"),
        delay: Duration::from_millis(500),
    }));

    let err = supervisor.start(&config).await.unwrap_err();
    match err {
        SupervisorError::UnexpectedExit { exit } => assert_eq!(exit.code, Some(7)),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        supervisor.current_state(),
        BrokerState::Failed("unexpected exit, code 7".to_string())
    );
    assert!(supervisor.process_info().await.is_none());

    let transitions = lifecycle(&bus);
    assert!(
        transitions.iter().all(|(_, new)| *new != BrokerState::Running),
        "{:?}",
        transitions
    );
    let failures = transitions
        .iter()
        .filter(|(_, new)| matches!(new, BrokerState::Failed(_)))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_occupied_endpoint_refuses_start() {
    let (dir, config) = installation(HEALTHY_START);
    let (bus, supervisor) = supervisor(&dir, settings());
    fs::write(dir.path().join("ready"), "").unwrap();

    let err = supervisor.start(&config).await.unwrap_err();
    assert!(matches!(err, SupervisorError::EndpointInUse { .. }));
    assert_eq!(supervisor.current_state(), BrokerState::Stopped);
    assert!(supervisor.process_info().await.is_none());
    assert!(lifecycle(&bus).is_empty());
    assert!(!dir.path().join("broker.pid").exists());
}

#[tokio::test]
async fn test_stop_kills_broker_that_ignores_stop_script() {
    let (dir, config) = installation_with(HEALTHY_START, IGNORING_STOP);
    let (bus, supervisor) = supervisor(&dir, settings());
    supervisor.start(&config).await.unwrap();

    supervisor.stop(Duration::from_millis(300)).await.unwrap();
    assert_eq!(supervisor.current_state(), BrokerState::Stopped);
    assert!(supervisor.process_info().await.is_none());

    assert_eq!(
        lifecycle(&bus).last(),
        Some(&(BrokerState::Stopping, BrokerState::Stopped))
    );
    assert_eq!(
        log_lines(&bus, "stop-script"),
        vec!["Not stopping anything".to_string()]
    );
    assert!(log_lines(&bus, "supervisor")
        .iter()
        .any(|line| line.contains("forcing termination")));
}

#[tokio::test]
async fn test_stop_during_startup_aborts_start() {
    let (dir, config) = installation(HANGING_START);
    let settings = ToolkitSettings {
        startup_timeout_ms: 10_000,
        ..settings()
    };
    let (bus, supervisor) = supervisor(&dir, settings);

    let (started, stopped) = tokio::join!(supervisor.start(&config), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        supervisor.stop(Duration::from_secs(5)).await
    });

    assert!(matches!(started, Err(SupervisorError::Aborted)), "{:?}", started);
    stopped.unwrap();
    assert_eq!(supervisor.current_state(), BrokerState::Stopped);
    assert_eq!(
        lifecycle(&bus),
        vec![
            (BrokerState::Stopped, BrokerState::Starting),
            (BrokerState::Starting, BrokerState::Stopping),
            (BrokerState::Stopping, BrokerState::Stopped),
        ]
    );
}

#[tokio::test]
async fn test_crash_while_running() {
    let (dir, config) = installation(HEALTHY_START);
    let (bus, supervisor) = supervisor(&dir, settings());
    let info = supervisor.start(&config).await.unwrap();

    let client_settings = ToolkitSettings {
        consumer_poll_timeout_ms: 50,
        ..settings()
    };
    let cluster = InMemoryCluster::new();
    cluster
        .create_topic(&TopicSpec::new("orders", 1, 1))
        .await
        .unwrap();
    let admin = AdminClient::new(
        Arc::new(cluster.clone()),
        supervisor.state_watch(),
        bus.clone(),
        &client_settings,
    );
    let simulation = SimulationEngine::new(
        Arc::new(cluster),
        supervisor.state_watch(),
        bus.clone(),
        &client_settings,
    );
    let producer = simulation.start_producer("orders", Cadence::Manual).unwrap();
    let consumer = simulation.start_consumer("orders", "crash-group").unwrap();

    let pid = info.pid.expect("child pid");
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    let mut watch = supervisor.state_watch();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        watch.wait_for(|s| matches!(s, BrokerState::Failed(_))),
    )
    .await
    .expect("crash should be detected");
    assert_eq!(state, BrokerState::Failed("unexpected exit, signal 9".to_string()));

    let failures: Vec<_> = lifecycle(&bus)
        .into_iter()
        .filter(|(_, new)| matches!(new, BrokerState::Failed(_)))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, BrokerState::Running);

    assert!(matches!(
        admin.list_topics().await,
        Err(AdminError::NotRunning { .. })
    ));
    assert!(matches!(
        simulation.start_producer("orders", Cadence::Manual),
        Err(SimulationError::NotRunning { .. })
    ));
    assert!(matches!(
        simulation.send_once(producer, None, "after crash").await,
        Err(SimulationError::NotRunning { .. })
    ));

    let consumer_status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = simulation.job_status(consumer).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("consumer should notice the crash");
    assert_eq!(consumer_status, JobStatus::Error);

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(supervisor.current_state(), BrokerState::Stopped);

    // A failed broker can be started again.
    fs::remove_file(dir.path().join("ready")).unwrap();
    supervisor.start(&config).await.unwrap();
    supervisor.stop(Duration::from_secs(5)).await.unwrap();
}
