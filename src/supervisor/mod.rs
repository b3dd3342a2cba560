//! Process supervision for configured servers.
//!
//! The registry maps each server name to an `InstanceSlot`. The registry
//! lock is only held to look up, insert or remove a slot. Work on a single
//! name is serialized by the slot's async operation lock, and status reads go
//! through the slot's own `RwLock` so they never wait on a running operation.
//!
//! When a slot leaves the registry it is marked retired. Anyone who queued on
//! a retired slot's operation lock retries against the registry, which keeps
//! a stop racing a start from ever leaving two processes behind for one name.

pub mod error;
pub mod events;
pub mod instance;
pub mod process;
pub mod status;

pub use error::SupervisorError;
pub use events::SupervisorEvent;
pub use instance::{InstanceStatus, RuntimeInstance, ServerStatus};
pub use status::{StatusFacade, StatusSummary};

use crate::core::config::{ConfigDiff, ConfigSnapshot, ServerSpec, SupervisorSettings};
use crate::mcp::{CapabilityClient, CapabilityConnector, CapabilityError, CapabilityMode};
use futures_util::future::{join_all, BoxFuture};
use process::{ExitOutcome, ProcessHandle, SpawnedProcess};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Instant;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct InstanceSlot {
    ops: Arc<tokio::sync::Mutex<()>>,
    state: RwLock<RuntimeInstance>,
    process: Mutex<Option<ProcessHandle>>,
    client: RwLock<Option<Arc<dyn CapabilityClient>>>,
    retired: AtomicBool,
}

impl InstanceSlot {
    fn new(spec: &ServerSpec) -> Self {
        Self {
            ops: Arc::new(tokio::sync::Mutex::new(())),
            state: RwLock::new(RuntimeInstance::new(spec.clone())),
            process: Mutex::new(None),
            client: RwLock::new(None),
            retired: AtomicBool::new(false),
        }
    }

    fn view<R>(&self, f: impl FnOnce(&RuntimeInstance) -> R) -> R {
        f(&read(&self.state))
    }

    fn update<R>(&self, f: impl FnOnce(&mut RuntimeInstance) -> R) -> R {
        f(&mut write(&self.state))
    }

    fn name(&self) -> String {
        self.view(|instance| instance.name.clone())
    }
}

/// Proof that the caller holds a live slot's operation lock.
struct SlotGuard {
    slot: Arc<InstanceSlot>,
    _ops: OwnedMutexGuard<()>,
}

/// Per-name outcome of a reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub disabled: Vec<String>,
    pub failed: Vec<String>,
}

enum ReconcileStep {
    Started,
    Stopped,
    Restarted,
    Disabled,
    Failed,
}

impl ReconcileReport {
    fn record(&mut self, name: String, step: ReconcileStep) {
        let bucket = match step {
            ReconcileStep::Started => &mut self.started,
            ReconcileStep::Stopped => &mut self.stopped,
            ReconcileStep::Restarted => &mut self.restarted,
            ReconcileStep::Disabled => &mut self.disabled,
            ReconcileStep::Failed => &mut self.failed,
        };
        bucket.push(name);
    }

    fn sort(&mut self) {
        for bucket in [
            &mut self.started,
            &mut self.stopped,
            &mut self.restarted,
            &mut self.disabled,
            &mut self.failed,
        ] {
            bucket.sort();
        }
    }
}

struct SupervisorInner {
    registry: Mutex<HashMap<String, Arc<InstanceSlot>>>,
    settings: RwLock<SupervisorSettings>,
    environment: RwLock<BTreeMap<String, String>>,
    connector: Arc<dyn CapabilityConnector>,
    events: broadcast::Sender<SupervisorEvent>,
    shutting_down: AtomicBool,
}

/// Cheaply cloneable handle to the supervisor.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, connector: Arc<dyn CapabilityConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SupervisorInner {
                registry: Mutex::new(HashMap::new()),
                settings: RwLock::new(settings),
                environment: RwLock::new(BTreeMap::new()),
                connector,
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Supervisor whose capability protocol follows `settings`.
    pub fn with_settings(settings: SupervisorSettings) -> Self {
        let mode = CapabilityMode::from_settings(&settings);
        Self::new(settings, Arc::new(mode))
    }

    pub fn settings(&self) -> SupervisorSettings {
        read(&self.inner.settings).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts `spec` unless an instance for its name is already starting or
    /// running. A disabled spec is recorded as `disabled` without spawning.
    pub async fn start(&self, spec: ServerSpec) -> InstanceStatus {
        let guard = self.acquire(&spec).await;
        self.start_locked(&guard.slot, spec).await
    }

    /// Stops the named instance and removes it from the registry. Returns
    /// `false` when there was nothing to remove.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(guard) = self.acquire_existing(name).await else {
            return false;
        };
        self.stop_locked(&guard.slot).await;
        self.retire(name, &guard.slot);
        true
    }

    /// Stops and starts the named instance with its current spec.
    pub async fn restart(&self, name: &str) -> Result<InstanceStatus, SupervisorError> {
        let guard = self
            .acquire_existing(name)
            .await
            .ok_or_else(|| SupervisorError::UnknownServer {
                server: name.to_string(),
            })?;
        let spec = guard.slot.update(|instance| {
            instance.restart_count += 1;
            instance.spec.clone()
        });
        info!(server = %name, "Restarting server");
        self.stop_locked(&guard.slot).await;
        Ok(self.start_locked(&guard.slot, spec).await)
    }

    /// Replaces the running process with one built from `spec`, keeping the
    /// logical instance.
    pub async fn restart_with(&self, spec: ServerSpec) -> InstanceStatus {
        let guard = self.acquire(&spec).await;
        self.stop_locked(&guard.slot).await;
        self.start_locked(&guard.slot, spec).await
    }

    /// Brings the registry in line with `diff`. Names are handled
    /// concurrently; each name's own steps run in order.
    pub async fn reconcile(&self, diff: &ConfigDiff, snapshot: &ConfigSnapshot) -> ReconcileReport {
        self.apply_snapshot(snapshot);

        let mut steps: Vec<BoxFuture<'_, (String, ReconcileStep)>> = Vec::new();
        for name in &diff.removed {
            steps.push(Box::pin(async move {
                self.stop(name).await;
                (name.clone(), ReconcileStep::Stopped)
            }));
        }
        for name in &diff.added {
            let Some(spec) = snapshot.get(name).cloned() else {
                continue;
            };
            steps.push(Box::pin(async move {
                let status = self.start(spec).await;
                (name.clone(), step_for(status, ReconcileStep::Started))
            }));
        }
        for name in &diff.changed {
            let Some(spec) = snapshot.get(name).cloned() else {
                continue;
            };
            steps.push(Box::pin(async move {
                info!(server = %name, "Configuration changed; restarting");
                let status = self.restart_with(spec).await;
                (name.clone(), step_for(status, ReconcileStep::Restarted))
            }));
        }

        let mut report = ReconcileReport::default();
        for (name, step) in join_all(steps).await {
            report.record(name, step);
        }
        report.sort();
        info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            restarted = report.restarted.len(),
            disabled = report.disabled.len(),
            failed = report.failed.len(),
            unchanged = diff.unchanged.len(),
            "Reconciled servers"
        );
        report
    }

    /// Invokes `tool` on a running server, bounded by the tool call timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, SupervisorError> {
        let client = self.tool_client(server, tool)?;
        let timeout = self.settings().tool_call_timeout();
        debug!(server = %server, tool = %tool, "Calling tool");
        client
            .call_tool(tool, arguments, timeout)
            .await
            .map_err(|err| match err {
                CapabilityError::Timeout(_) => SupervisorError::ToolInvocationTimeout {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    timeout,
                },
                source => SupervisorError::ToolInvocation {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    source,
                },
            })
    }

    /// Runs the checks `call_tool` performs, without calling anything.
    pub fn validate_tool_call(&self, server: &str, tool: &str) -> Result<(), SupervisorError> {
        self.tool_client(server, tool).map(|_| ())
    }

    /// All instances, sorted by name.
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .slots()
            .iter()
            .map(|slot| slot.view(RuntimeInstance::status_view))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn server_status(&self, name: &str) -> Option<ServerStatus> {
        self.slot(name)
            .map(|slot| slot.view(RuntimeInstance::status_view))
    }

    /// Stops everything. Automatic restarts are suppressed until it returns.
    pub async fn shutdown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let names: Vec<String> = lock(&self.inner.registry).keys().cloned().collect();
        info!(servers = names.len(), "Stopping all servers");
        join_all(names.iter().map(|name| self.stop(name))).await;
        self.inner.shutting_down.store(false, Ordering::SeqCst);
    }

    fn apply_snapshot(&self, snapshot: &ConfigSnapshot) {
        *write(&self.inner.settings) = snapshot.settings.clone();
        *write(&self.inner.environment) = snapshot.environment.clone();
    }

    fn slot(&self, name: &str) -> Option<Arc<InstanceSlot>> {
        lock(&self.inner.registry).get(name).cloned()
    }

    fn slots(&self) -> Vec<Arc<InstanceSlot>> {
        lock(&self.inner.registry).values().cloned().collect()
    }

    async fn acquire(&self, spec: &ServerSpec) -> SlotGuard {
        loop {
            let slot = lock(&self.inner.registry)
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(InstanceSlot::new(spec)))
                .clone();
            let ops = slot.ops.clone().lock_owned().await;
            if !slot.retired.load(Ordering::SeqCst) {
                return SlotGuard { slot, _ops: ops };
            }
        }
    }

    async fn acquire_existing(&self, name: &str) -> Option<SlotGuard> {
        loop {
            let slot = self.slot(name)?;
            let ops = slot.ops.clone().lock_owned().await;
            if !slot.retired.load(Ordering::SeqCst) {
                return Some(SlotGuard { slot, _ops: ops });
            }
        }
    }

    /// Must be called with the slot's operation lock held.
    fn retire(&self, name: &str, slot: &Arc<InstanceSlot>) {
        slot.retired.store(true, Ordering::SeqCst);
        let removed = {
            let mut registry = lock(&self.inner.registry);
            match registry.get(name) {
                Some(current) if Arc::ptr_eq(current, slot) => registry.remove(name).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(server = %name, "Server removed");
            self.emit(SupervisorEvent::Removed {
                name: name.to_string(),
            });
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    /// Applies `decide` under the instance's write lock and, if it picked a
    /// new status, publishes the transition.
    fn transition(
        &self,
        slot: &InstanceSlot,
        decide: impl FnOnce(&mut RuntimeInstance) -> Option<InstanceStatus>,
    ) -> Option<(InstanceStatus, InstanceStatus)> {
        let (name, from, to) = {
            let mut instance = write(&slot.state);
            let to = decide(&mut instance)?;
            let from = instance.status;
            instance.status = to;
            (instance.name.clone(), from, to)
        };
        if from != to {
            debug!(server = %name, from = %from, to = %to, "Status changed");
            self.emit(SupervisorEvent::StatusChanged { name, from, to });
        }
        Some((from, to))
    }

    async fn start_locked(&self, slot: &Arc<InstanceSlot>, spec: ServerSpec) -> InstanceStatus {
        let current = slot.view(|instance| instance.status);
        if current.is_active() {
            debug!(server = %spec.name, status = %current, "Start ignored; already active");
            return current;
        }

        let name = spec.name.clone();
        if spec.disabled {
            self.transition(slot, |instance| {
                instance.spec = spec;
                instance.pid = None;
                instance.tools.clear();
                Some(InstanceStatus::Disabled)
            });
            info!(server = %name, "Server disabled; not starting");
            return InstanceStatus::Disabled;
        }

        let settings = self.settings();
        let environment = read(&self.inner.environment).clone();
        let mut generation = 0;
        self.transition(slot, |instance| {
            instance.spec = spec.clone();
            instance.generation += 1;
            generation = instance.generation;
            instance.pid = None;
            instance.tools.clear();
            instance.last_error = None;
            instance.started_at = None;
            instance.started_wall = None;
            Some(InstanceStatus::Starting)
        });

        let SpawnedProcess { handle, io } = match process::spawn(&spec, &environment) {
            Ok(spawned) => spawned,
            Err(source) => {
                let err = SupervisorError::ProcessSpawn {
                    server: name.clone(),
                    source,
                };
                error!(server = %name, command = %spec.command, error = %err, "Failed to spawn server");
                self.transition(slot, |instance| {
                    instance.last_error = Some(err.to_string());
                    Some(InstanceStatus::Error)
                });
                return InstanceStatus::Error;
            }
        };

        let pid = handle.pid();
        let mut exit = handle.exit_watch();
        slot.update(|instance| {
            instance.pid = pid;
            instance.started_at = Some(Instant::now());
            instance.started_wall = Some(chrono::Utc::now());
        });
        self.spawn_exit_monitor(slot, generation, handle);
        info!(server = %name, pid = ?pid, command = %spec.command, "Spawned server process");

        let client = self.inner.connector.attach(&name, io);
        *write(&slot.client) = Some(client.clone());

        let grace = settings.startup_grace();
        if let Ok(outcome) = tokio::time::timeout(grace, process::wait_exit(&mut exit)).await {
            let outcome = outcome.unwrap_or_else(|| ExitOutcome {
                code: None,
                detail: "exit status unknown".to_string(),
            });
            self.record_exit(slot, generation, &outcome);
            return slot.view(|instance| instance.status);
        }

        let handshake_timeout = settings.handshake_timeout();
        let (tools, handshake_error) =
            match tokio::time::timeout(handshake_timeout, client.handshake(handshake_timeout)).await {
                Ok(Ok(tools)) => (tools, None),
                Ok(Err(err)) => (Vec::new(), Some(err)),
                Err(_) => (Vec::new(), Some(CapabilityError::Timeout(handshake_timeout))),
            };
        if let Some(err) = &handshake_error {
            warn!(server = %name, error = %err, "Capability handshake failed; continuing without tools");
        }

        let tool_count = tools.len();
        let promoted = self.transition(slot, |instance| {
            if instance.generation != generation || instance.status != InstanceStatus::Starting {
                return None;
            }
            instance.tools = tools;
            instance.last_error = handshake_error
                .as_ref()
                .map(|err| format!("Capability handshake failed: {err}"));
            Some(InstanceStatus::Running)
        });
        if promoted.is_some() {
            info!(server = %name, pid = ?pid, tools = tool_count, "Server running");
        }
        slot.view(|instance| instance.status)
    }

    async fn stop_locked(&self, slot: &Arc<InstanceSlot>) {
        let handle = lock(&slot.process).take();
        write(&slot.client).take();
        let name = slot.name();
        let had_process = handle.is_some();

        if let Some(mut handle) = handle {
            let grace = self.settings().stop_timeout();
            let outcome = handle.terminate(grace).await;
            match outcome {
                Some(outcome) => {
                    info!(server = %name, pid = ?handle.pid(), outcome = %outcome, "Server stopped")
                }
                None => warn!(server = %name, pid = ?handle.pid(), "Server stopped without exit status"),
            }
        }

        // A disabled instance has nothing to stop; it goes straight to its
        // next state.
        self.transition(slot, |instance| {
            if !had_process && instance.status == InstanceStatus::Disabled {
                return None;
            }
            instance.pid = None;
            instance.tools.clear();
            instance.started_at = None;
            instance.started_wall = None;
            Some(InstanceStatus::Stopped)
        });
    }

    fn spawn_exit_monitor(
        &self,
        slot: &Arc<InstanceSlot>,
        generation: u64,
        handle: ProcessHandle,
    ) {
        let mut exit = handle.exit_watch();
        let stop_requested = handle.stop_flag();
        *lock(&slot.process) = Some(handle);

        let supervisor = Arc::downgrade(&self.inner);
        let slot = Arc::downgrade(slot);
        tokio::spawn(async move {
            let outcome = process::wait_exit(&mut exit).await;
            if stop_requested.load(Ordering::SeqCst) {
                return;
            }
            let (Some(inner), Some(slot)) = (supervisor.upgrade(), slot.upgrade()) else {
                return;
            };
            let outcome = outcome.unwrap_or_else(|| ExitOutcome {
                code: None,
                detail: "exit status unknown".to_string(),
            });
            ProcessSupervisor { inner }.record_exit(&slot, generation, &outcome);
        });
    }

    /// Records an unrequested exit. Safe to call more than once for the same
    /// process; only the first call for a generation has an effect.
    fn record_exit(&self, slot: &Arc<InstanceSlot>, generation: u64, outcome: &ExitOutcome) {
        let Some((from, to)) = self.transition(slot, |instance| {
            if instance.generation != generation {
                return None;
            }
            let next = match instance.status {
                InstanceStatus::Starting => {
                    let err = SupervisorError::ProcessExit {
                        server: instance.name.clone(),
                        detail: format!("{outcome} during startup"),
                    };
                    instance.last_error = Some(err.to_string());
                    InstanceStatus::Error
                }
                InstanceStatus::Running if outcome.success() => InstanceStatus::Stopped,
                InstanceStatus::Running => {
                    let err = SupervisorError::ProcessExit {
                        server: instance.name.clone(),
                        detail: outcome.to_string(),
                    };
                    instance.last_error = Some(err.to_string());
                    InstanceStatus::Error
                }
                _ => return None,
            };
            instance.pid = None;
            instance.tools.clear();
            Some(next)
        }) else {
            return;
        };

        let settings = self.settings();
        let (name, auto_restart) = slot.view(|instance| {
            (
                instance.name.clone(),
                instance.spec.auto_restart_enabled(&settings),
            )
        });
        match (from, to) {
            (InstanceStatus::Running, InstanceStatus::Stopped) => {
                info!(server = %name, "Server exited cleanly");
            }
            (InstanceStatus::Starting, _) => {
                error!(server = %name, outcome = %outcome, "Server exited during startup");
            }
            _ => {
                error!(server = %name, outcome = %outcome, "Server exited unexpectedly");
                if auto_restart && !self.is_shutting_down() {
                    self.schedule_restart(slot, generation);
                }
            }
        }
    }

    fn schedule_restart(&self, slot: &Arc<InstanceSlot>, generation: u64) {
        let delay = self.settings().restart_delay();
        let supervisor: Weak<SupervisorInner> = Arc::downgrade(&self.inner);
        let slot = Arc::downgrade(slot);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let (Some(inner), Some(slot)) = (supervisor.upgrade(), slot.upgrade()) else {
                return;
            };
            ProcessSupervisor { inner }.auto_restart(slot, generation).await;
        });
    }

    async fn auto_restart(&self, slot: Arc<InstanceSlot>, generation: u64) {
        let _ops = slot.ops.clone().lock_owned().await;
        let name = slot.name();
        if slot.retired.load(Ordering::SeqCst) || self.is_shutting_down() {
            debug!(server = %name, "Pending restart abandoned");
            return;
        }
        let pending = slot.update(|instance| {
            if instance.generation != generation || instance.status != InstanceStatus::Error {
                return None;
            }
            instance.restart_count += 1;
            Some((instance.spec.clone(), instance.restart_count))
        });
        let Some((spec, attempt)) = pending else {
            debug!(server = %name, "Pending restart abandoned");
            return;
        };

        warn!(server = %name, attempt, "Restarting crashed server");
        self.emit(SupervisorEvent::Restarting {
            name: name.clone(),
            attempt,
        });
        self.start_locked(&slot, spec).await;
    }

    fn tool_client(
        &self,
        server: &str,
        tool: &str,
    ) -> Result<Arc<dyn CapabilityClient>, SupervisorError> {
        let not_running = || SupervisorError::ServerNotRunning {
            server: server.to_string(),
        };
        let slot = self.slot(server).ok_or_else(not_running)?;
        let (status, offered) = slot.view(|instance| {
            (
                instance.status,
                instance.tools.iter().any(|name| name == tool),
            )
        });
        if status != InstanceStatus::Running {
            return Err(not_running());
        }
        if !offered {
            return Err(SupervisorError::ToolNotFound {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }
        let client = read(&slot.client).clone();
        client.ok_or_else(not_running)
    }
}

fn step_for(status: InstanceStatus, success: ReconcileStep) -> ReconcileStep {
    match status {
        InstanceStatus::Disabled => ReconcileStep::Disabled,
        InstanceStatus::Error => ReconcileStep::Failed,
        _ => success,
    }
}

#[cfg(all(test, unix))]
mod tests;
