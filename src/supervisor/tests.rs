use super::*;
use crate::mcp::ChildIo;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        auto_restart: true,
        restart_delay_ms: 200,
        stop_timeout_ms: 1000,
        startup_grace_ms: 100,
        capability_discovery: false,
        handshake_timeout_ms: 1000,
        tool_call_timeout_ms: 200,
        watch_debounce_ms: 100,
    }
}

fn sleeper(name: &str) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        command: "sleep".to_string(),
        args: vec!["30".to_string()],
        ..ServerSpec::default()
    }
}

fn shell(name: &str, script: &str) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        ..ServerSpec::default()
    }
}

fn pass_through() -> ProcessSupervisor {
    ProcessSupervisor::new(fast_settings(), Arc::new(CapabilityMode::PassThrough))
}

/// Connector whose clients offer a fixed tool set without speaking any
/// protocol to the child.
struct FakeConnector {
    tools: Vec<String>,
    fail_handshake: bool,
}

struct FakeClient {
    tools: Vec<String>,
    fail_handshake: bool,
    _io: AsyncMutex<ChildIo>,
}

impl CapabilityConnector for FakeConnector {
    fn attach(&self, _server: &str, io: ChildIo) -> Arc<dyn CapabilityClient> {
        Arc::new(FakeClient {
            tools: self.tools.clone(),
            fail_handshake: self.fail_handshake,
            _io: AsyncMutex::new(io),
        })
    }
}

#[async_trait]
impl CapabilityClient for FakeClient {
    async fn handshake(&self, _timeout: Duration) -> Result<Vec<String>, CapabilityError> {
        if self.fail_handshake {
            return Err(CapabilityError::Protocol("not an MCP server".to_string()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        match tool {
            "echo" => Ok(json!({"echo": arguments})),
            "slow" => {
                tokio::time::sleep(timeout * 4).await;
                Err(CapabilityError::Timeout(timeout))
            }
            _ => Err(CapabilityError::Rpc {
                code: -32603,
                message: "tool exploded".to_string(),
            }),
        }
    }
}

fn with_tools(tools: &[&str]) -> ProcessSupervisor {
    ProcessSupervisor::new(
        fast_settings(),
        Arc::new(FakeConnector {
            tools: tools.iter().map(|tool| tool.to_string()).collect(),
            fail_handshake: false,
        }),
    )
}

async fn wait_for_status(
    supervisor: &ProcessSupervisor,
    name: &str,
    expected: InstanceStatus,
    within: Duration,
) -> Option<ServerStatus> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if let Some(status) = supervisor.server_status(name) {
            if status.status == expected {
                return Some(status);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn snapshot_of(specs: Vec<ServerSpec>) -> ConfigSnapshot {
    ConfigSnapshot {
        servers: specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect(),
        settings: fast_settings(),
        ..ConfigSnapshot::default()
    }
}

#[tokio::test]
async fn start_brings_server_to_running() {
    let supervisor = pass_through();

    let status = supervisor.start(sleeper("alpha")).await;

    assert_eq!(status, InstanceStatus::Running);
    let view = supervisor.server_status("alpha").expect("alpha registered");
    assert!(view.pid.is_some());
    assert!(view.uptime_secs.is_some());
    assert_eq!(view.restart_count, 0);
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn start_is_a_no_op_while_running() {
    let supervisor = pass_through();
    supervisor.start(sleeper("alpha")).await;
    let first_pid = supervisor.server_status("alpha").and_then(|s| s.pid);

    let status = supervisor.start(sleeper("alpha")).await;

    assert_eq!(status, InstanceStatus::Running);
    assert_eq!(
        supervisor.server_status("alpha").and_then(|s| s.pid),
        first_pid
    );
    assert_eq!(supervisor.status().len(), 1);
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn disabled_spec_is_recorded_without_process() {
    let supervisor = pass_through();
    let mut spec = sleeper("beta");
    spec.disabled = true;

    let status = supervisor.start(spec).await;

    assert_eq!(status, InstanceStatus::Disabled);
    let view = supervisor.server_status("beta").expect("beta registered");
    assert_eq!(view.pid, None);
}

#[tokio::test]
async fn spawn_failure_is_an_error() {
    let supervisor = pass_through();
    let spec = ServerSpec {
        name: "ghost".to_string(),
        command: "/nonexistent/mcp-fleet-test-binary".to_string(),
        ..ServerSpec::default()
    };

    let status = supervisor.start(spec).await;

    assert_eq!(status, InstanceStatus::Error);
    let view = supervisor.server_status("ghost").expect("ghost registered");
    assert!(view
        .last_error
        .as_deref()
        .is_some_and(|err| err.contains("Failed to spawn")));
}

#[tokio::test]
async fn exit_during_startup_is_an_error_and_not_restarted() {
    let supervisor = pass_through();

    let status = supervisor.start(shell("flaky", "exit 3")).await;

    assert_eq!(status, InstanceStatus::Error);
    tokio::time::sleep(Duration::from_millis(600)).await;
    let view = supervisor.server_status("flaky").expect("flaky registered");
    assert_eq!(view.status, InstanceStatus::Error);
    assert_eq!(view.restart_count, 0);
    assert!(view
        .last_error
        .as_deref()
        .is_some_and(|err| err.contains("during startup")));
}

#[tokio::test]
async fn clean_exit_after_startup_is_stopped() {
    let supervisor = pass_through();

    assert_eq!(
        supervisor.start(shell("oneshot", "sleep 0.4")).await,
        InstanceStatus::Running
    );

    let view = wait_for_status(
        &supervisor,
        "oneshot",
        InstanceStatus::Stopped,
        Duration::from_secs(5),
    )
    .await
    .expect("server should stop cleanly");
    assert_eq!(view.pid, None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let view = supervisor.server_status("oneshot").expect("still registered");
    assert_eq!(view.status, InstanceStatus::Stopped);
    assert_eq!(view.restart_count, 0);
}

#[tokio::test]
async fn crash_after_startup_is_restarted() {
    let supervisor = pass_through();
    let mut events = supervisor.subscribe();

    assert_eq!(
        supervisor.start(shell("crashy", "sleep 0.4; exit 1")).await,
        InstanceStatus::Running
    );

    let attempt = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::Restarting { name, attempt }) if name == "crashy" => {
                    return attempt
                }
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("restart should be attempted");

    assert_eq!(attempt, 1);
    let view = supervisor.server_status("crashy").expect("still registered");
    assert!(view.restart_count >= 1);
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn per_server_override_disables_auto_restart() {
    let supervisor = pass_through();
    let mut spec = shell("crashy", "sleep 0.3; exit 1");
    spec.auto_restart = Some(false);

    supervisor.start(spec).await;
    wait_for_status(
        &supervisor,
        "crashy",
        InstanceStatus::Error,
        Duration::from_secs(5),
    )
    .await
    .expect("server should crash");
    tokio::time::sleep(Duration::from_millis(600)).await;

    let view = supervisor.server_status("crashy").expect("still registered");
    assert_eq!(view.status, InstanceStatus::Error);
    assert_eq!(view.restart_count, 0);
}

#[tokio::test]
async fn stop_removes_instance_and_is_idempotent() {
    let supervisor = pass_through();
    supervisor.start(sleeper("alpha")).await;
    let pid = supervisor
        .server_status("alpha")
        .and_then(|status| status.pid)
        .expect("pid recorded");
    let mut events = supervisor.subscribe();

    assert!(supervisor.stop("alpha").await);
    assert!(!supervisor.stop("alpha").await);

    assert!(supervisor.status().is_empty());
    assert!(!process_alive(pid));
    let mut removed = false;
    while let Ok(event) = events.try_recv() {
        if event == (SupervisorEvent::Removed { name: "alpha".to_string() }) {
            removed = true;
        }
    }
    assert!(removed);
}

#[tokio::test]
async fn stop_does_not_trigger_auto_restart() {
    let supervisor = pass_through();
    supervisor.start(sleeper("alpha")).await;
    let mut events = supervisor.subscribe();

    supervisor.stop("alpha").await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SupervisorEvent::Restarting { .. }));
    }
    assert!(supervisor.status().is_empty());
}

#[tokio::test]
async fn restart_replaces_process_and_keeps_instance() {
    let supervisor = pass_through();
    supervisor.start(sleeper("alpha")).await;
    let old_pid = supervisor.server_status("alpha").and_then(|s| s.pid);

    let status = supervisor.restart("alpha").await.expect("restart");

    assert_eq!(status, InstanceStatus::Running);
    let view = supervisor.server_status("alpha").expect("alpha registered");
    assert_ne!(view.pid, old_pid);
    assert_eq!(view.restart_count, 1);
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn restart_of_unknown_server_fails() {
    let supervisor = pass_through();
    let err = supervisor.restart("nobody").await.expect_err("unknown server");
    assert!(matches!(err, SupervisorError::UnknownServer { .. }));
}

#[tokio::test]
async fn status_events_follow_lifecycle() {
    let supervisor = pass_through();
    let mut events = supervisor.subscribe();

    supervisor.start(sleeper("alpha")).await;

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::StatusChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (InstanceStatus::Stopped, InstanceStatus::Starting),
            (InstanceStatus::Starting, InstanceStatus::Running),
        ]
    );
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn reconcile_applies_every_diff_category() {
    let supervisor = pass_through();
    let mut disabled = sleeper("disabled");
    disabled.disabled = true;
    let initial = snapshot_of(vec![
        sleeper("keep"),
        sleeper("change"),
        sleeper("drop"),
        disabled,
    ]);

    let report = supervisor
        .reconcile(&ConfigDiff::initial(&initial), &initial)
        .await;
    assert_eq!(report.started, vec!["change", "drop", "keep"]);
    assert_eq!(report.disabled, vec!["disabled"]);
    let keep_pid = supervisor.server_status("keep").and_then(|s| s.pid);
    let change_pid = supervisor.server_status("change").and_then(|s| s.pid);

    let mut changed = sleeper("change");
    changed.args = vec!["31".to_string()];
    let mut disabled = sleeper("disabled");
    disabled.disabled = true;
    let next = snapshot_of(vec![sleeper("keep"), changed, sleeper("added"), disabled]);
    let diff = ConfigDiff::between(&initial, &next);

    let report = supervisor.reconcile(&diff, &next).await;

    assert_eq!(report.started, vec!["added"]);
    assert_eq!(report.stopped, vec!["drop"]);
    assert_eq!(report.restarted, vec!["change"]);
    assert!(report.failed.is_empty());

    let names: BTreeSet<String> = supervisor.status().into_iter().map(|s| s.name).collect();
    assert_eq!(
        names,
        ["added", "change", "disabled", "keep"]
            .into_iter()
            .map(String::from)
            .collect()
    );
    assert_eq!(supervisor.server_status("keep").and_then(|s| s.pid), keep_pid);
    let change = supervisor.server_status("change").expect("change registered");
    assert_ne!(change.pid, change_pid);
    assert_eq!(change.status, InstanceStatus::Running);
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn change_to_disabled_stops_and_records_disabled() {
    let supervisor = pass_through();
    let initial = snapshot_of(vec![sleeper("alpha")]);
    supervisor
        .reconcile(&ConfigDiff::initial(&initial), &initial)
        .await;
    let pid = supervisor
        .server_status("alpha")
        .and_then(|s| s.pid)
        .expect("pid recorded");

    let mut disabled = sleeper("alpha");
    disabled.disabled = true;
    let next = snapshot_of(vec![disabled]);
    let report = supervisor
        .reconcile(&ConfigDiff::between(&initial, &next), &next)
        .await;

    assert_eq!(report.disabled, vec!["alpha"]);
    let view = supervisor.server_status("alpha").expect("alpha registered");
    assert_eq!(view.status, InstanceStatus::Disabled);
    assert_eq!(view.pid, None);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn reenabling_goes_from_disabled_straight_to_starting() {
    let supervisor = pass_through();
    let mut disabled = sleeper("beta");
    disabled.disabled = true;
    let initial = snapshot_of(vec![disabled]);
    supervisor
        .reconcile(&ConfigDiff::initial(&initial), &initial)
        .await;
    let mut events = supervisor.subscribe();

    let next = snapshot_of(vec![sleeper("beta")]);
    let report = supervisor
        .reconcile(&ConfigDiff::between(&initial, &next), &next)
        .await;

    assert_eq!(report.restarted, vec!["beta"]);
    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::StatusChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (InstanceStatus::Disabled, InstanceStatus::Starting),
            (InstanceStatus::Starting, InstanceStatus::Running),
        ]
    );
    supervisor.shutdown_all().await;
}

/// Liveness that treats an unreaped zombie as dead.
fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
        Err(_) => process_alive(pid),
    }
}

#[tokio::test]
async fn crash_takes_background_children_down() {
    let temp_dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let pid_file = temp_dir.path().join("background.pid");
    let supervisor = pass_through();
    let mut spec = shell(
        "wrapper",
        &format!(
            "sleep 37 & echo $! > '{}'; sleep 0.3; exit 1",
            pid_file.display()
        ),
    );
    spec.auto_restart = Some(false);

    assert_eq!(supervisor.start(spec).await, InstanceStatus::Running);
    wait_for_status(
        &supervisor,
        "wrapper",
        InstanceStatus::Error,
        Duration::from_secs(5),
    )
    .await
    .expect("wrapper should crash");
    let background: u32 = std::fs::read_to_string(&pid_file)
        .expect("pid file written")
        .trim()
        .parse()
        .expect("pid file holds a pid");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while process_running(background) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "background child {background} outlived its crashed parent"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(supervisor.stop("wrapper").await);
}

#[tokio::test]
async fn reconcile_passes_env_file_values_to_children() {
    let supervisor = pass_through();
    let mut snapshot = snapshot_of(vec![shell(
        "envcheck",
        r#"test "$MCP_FLEET_SUP_TEST" = from-file || exit 1; sleep 30"#,
    )]);
    snapshot
        .environment
        .insert("MCP_FLEET_SUP_TEST".to_string(), "from-file".to_string());

    let report = supervisor
        .reconcile(&ConfigDiff::initial(&snapshot), &snapshot)
        .await;

    assert_eq!(report.started, vec!["envcheck"]);
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn concurrent_start_and_stop_never_duplicate() {
    let supervisor = pass_through();

    let (_, _, _) = tokio::join!(
        supervisor.start(sleeper("alpha")),
        supervisor.stop("alpha"),
        supervisor.start(sleeper("alpha")),
    );

    let statuses = supervisor.status();
    assert!(statuses.len() <= 1);
    for status in statuses {
        assert_eq!(status.status, InstanceStatus::Running);
    }
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn shutdown_stops_everything_and_suppresses_restarts() {
    let supervisor = pass_through();
    supervisor.start(sleeper("alpha")).await;
    supervisor.start(shell("crashy", "sleep 0.3; exit 1")).await;
    let mut events = supervisor.subscribe();

    supervisor.shutdown_all().await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(supervisor.status().is_empty());
    assert!(!supervisor.is_shutting_down());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SupervisorEvent::Restarting { .. }));
    }
}

#[tokio::test]
async fn call_tool_requires_running_server() {
    let supervisor = with_tools(&["echo"]);
    let err = supervisor
        .call_tool("alpha", "echo", Map::new())
        .await
        .expect_err("nothing running");
    assert!(matches!(err, SupervisorError::ServerNotRunning { .. }));

    let mut spec = sleeper("alpha");
    spec.disabled = true;
    supervisor.start(spec).await;
    let err = supervisor
        .call_tool("alpha", "echo", Map::new())
        .await
        .expect_err("disabled server");
    assert!(matches!(err, SupervisorError::ServerNotRunning { .. }));
}

#[tokio::test]
async fn call_tool_checks_discovered_tools() {
    let supervisor = with_tools(&["echo", "slow", "boom"]);
    supervisor.start(sleeper("alpha")).await;
    assert_eq!(
        supervisor.server_status("alpha").map(|s| s.tools),
        Some(vec!["echo".to_string(), "slow".to_string(), "boom".to_string()])
    );

    let err = supervisor
        .call_tool("alpha", "missing", Map::new())
        .await
        .expect_err("unknown tool");
    assert!(matches!(err, SupervisorError::ToolNotFound { .. }));
    assert!(supervisor.validate_tool_call("alpha", "echo").is_ok());
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn call_tool_returns_result_or_maps_failures() {
    let supervisor = with_tools(&["echo", "slow", "boom"]);
    supervisor.start(sleeper("alpha")).await;

    let mut arguments = Map::new();
    arguments.insert("text".to_string(), json!("hi"));
    let result = supervisor
        .call_tool("alpha", "echo", arguments)
        .await
        .expect("echo succeeds");
    assert_eq!(result["echo"]["text"], "hi");

    let err = supervisor
        .call_tool("alpha", "slow", Map::new())
        .await
        .expect_err("slow tool times out");
    assert!(matches!(err, SupervisorError::ToolInvocationTimeout { .. }));

    let err = supervisor
        .call_tool("alpha", "boom", Map::new())
        .await
        .expect_err("boom fails");
    assert!(matches!(
        err,
        SupervisorError::ToolInvocation {
            source: CapabilityError::Rpc { .. },
            ..
        }
    ));

    // The process is unaffected by tool failures.
    assert_eq!(
        supervisor.server_status("alpha").map(|s| s.status),
        Some(InstanceStatus::Running)
    );
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn failed_handshake_still_runs_without_tools() {
    let supervisor = ProcessSupervisor::new(
        fast_settings(),
        Arc::new(FakeConnector {
            tools: vec!["echo".to_string()],
            fail_handshake: true,
        }),
    );

    let status = supervisor.start(sleeper("alpha")).await;

    assert_eq!(status, InstanceStatus::Running);
    let view = supervisor.server_status("alpha").expect("alpha registered");
    assert!(view.tools.is_empty());
    assert!(view
        .last_error
        .as_deref()
        .is_some_and(|err| err.contains("handshake")));
    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn status_facade_summarizes_fleet() {
    let supervisor = pass_through();
    supervisor.start(sleeper("alpha")).await;
    let mut spec = sleeper("beta");
    spec.disabled = true;
    supervisor.start(spec).await;
    let facade = StatusFacade::new(supervisor.clone());

    let summary = facade.summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.count(InstanceStatus::Running), 1);
    assert_eq!(summary.count(InstanceStatus::Disabled), 1);
    assert_eq!(facade.running(), vec!["alpha"]);
    let names: Vec<String> = facade.snapshot().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(facade.server("gamma").is_none());
    supervisor.shutdown_all().await;
}
