//! The running fleet: configuration, supervisor and hot reload wired together.

use crate::core::config::watcher::{run_reload_loop, ConfigWatcher};
use crate::core::config::{ConfigDiff, ConfigError, ConfigManager, ReloadOutcome};
use crate::mcp::CapabilityMode;
use crate::supervisor::{
    ProcessSupervisor, ServerStatus, StatusFacade, SupervisorError, SupervisorEvent,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub config_path: PathBuf,
    /// Optional dotenv file; a missing file is treated as empty.
    pub env_path: Option<PathBuf>,
    /// Overrides `settings.capability_discovery` when set.
    pub capability_mode: Option<CapabilityMode>,
    /// Reload automatically when either file changes.
    pub watch: bool,
}

impl FleetOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            env_path: None,
            capability_mode: None,
            watch: true,
        }
    }
}

struct FleetShared {
    manager: ConfigManager,
    supervisor: ProcessSupervisor,
    /// Keeps reload-and-reconcile passes from interleaving.
    reconcile_gate: AsyncMutex<()>,
}

impl FleetShared {
    async fn reload_and_reconcile(&self) -> Result<ReloadOutcome, ConfigError> {
        let _gate = self.reconcile_gate.lock().await;
        let outcome = self.manager.reload().await?;
        match &outcome {
            ReloadOutcome::Applied(change) => {
                self.supervisor.reconcile(&change.diff, &change.new).await;
            }
            ReloadOutcome::Unchanged => debug!("Reload found no changes"),
            ReloadOutcome::Skipped => debug!("Reload skipped; another is in progress"),
        }
        Ok(outcome)
    }
}

pub struct Fleet {
    shared: Arc<FleetShared>,
    cancel: CancellationToken,
    watcher: Mutex<Option<ConfigWatcher>>,
    reload_task: Mutex<Option<JoinHandle<()>>>,
    /// Subscribed before the initial reconcile so startup is not lost.
    startup_events: Mutex<Option<broadcast::Receiver<SupervisorEvent>>>,
}

impl Fleet {
    /// Loads the configuration, starts every enabled server and, if asked
    /// to, begins watching the configuration for changes.
    ///
    /// Fails only when the initial configuration cannot be loaded.
    pub async fn initialize(options: FleetOptions) -> Result<Self, ConfigError> {
        let manager = ConfigManager::new(options.config_path.clone(), options.env_path.clone());
        let snapshot = manager.load()?;
        let mode = options
            .capability_mode
            .unwrap_or_else(|| CapabilityMode::from_settings(&snapshot.settings));
        let supervisor = ProcessSupervisor::new(snapshot.settings.clone(), Arc::new(mode));
        let startup_events = supervisor.subscribe();

        info!(
            servers = snapshot.servers.len(),
            capability_mode = ?mode,
            "Starting fleet"
        );
        supervisor
            .reconcile(&ConfigDiff::initial(&snapshot), &snapshot)
            .await;

        let fleet = Self {
            shared: Arc::new(FleetShared {
                manager,
                supervisor,
                reconcile_gate: AsyncMutex::new(()),
            }),
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
            reload_task: Mutex::new(None),
            startup_events: Mutex::new(Some(startup_events)),
        };
        if options.watch {
            fleet.start_watching();
        }
        Ok(fleet)
    }

    fn start_watching(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = &self.shared.manager;
        let mut files: Vec<&Path> = vec![manager.config_path()];
        files.extend(manager.env_path());
        let Some(watcher) = ConfigWatcher::spawn(&files, tx) else {
            return;
        };

        let window = {
            let shared = self.shared.clone();
            move || shared.manager.current().settings.watch_debounce()
        };
        let shared = self.shared.clone();
        let task = tokio::spawn(run_reload_loop(rx, window, self.cancel.clone(), move || {
            let shared = shared.clone();
            async move {
                if let Err(err) = shared.reload_and_reconcile().await {
                    warn!(error = %err, "Configuration reload failed; keeping previous configuration");
                }
            }
        }));

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        *self.reload_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.shared.supervisor.status()
    }

    pub fn facade(&self) -> StatusFacade {
        StatusFacade::new(self.shared.supervisor.clone())
    }

    /// Supervisor events. The first receiver handed out also replays the
    /// events of the initial reconcile; later ones start from now.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.startup_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.shared.supervisor.subscribe())
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.shared.supervisor
    }

    pub fn config(&self) -> &ConfigManager {
        &self.shared.manager
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, SupervisorError> {
        self.shared.supervisor.call_tool(server, tool, arguments).await
    }

    /// Reloads and reconciles immediately, bypassing the watcher.
    pub async fn reload_now(&self) -> Result<ReloadOutcome, ConfigError> {
        self.shared.reload_and_reconcile().await
    }

    /// Stops watching and stops every server.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let task = self
            .reload_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.supervisor.shutdown_all().await;
        info!("Fleet stopped");
    }
}
