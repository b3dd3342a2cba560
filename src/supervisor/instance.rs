use crate::core::config::ServerSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopped,
    Error,
    Disabled,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 5] = [
        InstanceStatus::Starting,
        InstanceStatus::Running,
        InstanceStatus::Stopped,
        InstanceStatus::Error,
        InstanceStatus::Disabled,
    ];

    /// A process exists (or is being brought up) for this instance.
    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Live state for one configured server. The logical instance outlives the
/// processes it runs, so the restart counter carries across restarts.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub name: String,
    pub spec: ServerSpec,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub started_wall: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tools: Vec<String>,
    pub restart_count: u32,
    /// Bumped on every spawn attempt; exit notifications and pending
    /// restarts carrying an older value are stale.
    pub(crate) generation: u64,
}

impl RuntimeInstance {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            spec,
            status: InstanceStatus::Stopped,
            pid: None,
            started_at: None,
            started_wall: None,
            last_error: None,
            tools: Vec::new(),
            restart_count: 0,
            generation: 0,
        }
    }

    pub fn status_view(&self) -> ServerStatus {
        let uptime_secs = if self.status.is_active() {
            self.started_at.map(|started| started.elapsed().as_secs())
        } else {
            None
        };
        ServerStatus {
            name: self.name.clone(),
            status: self.status,
            pid: self.pid,
            uptime_secs,
            started_at: self.started_wall.filter(|_| self.status.is_active()),
            tools: self.tools.clone(),
            last_error: self.last_error.clone(),
            restart_count: self.restart_count,
        }
    }
}

/// Serializable per-server status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub tools: Vec<String>,
    pub last_error: Option<String>,
    pub restart_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_is_stopped_without_uptime() {
        let instance = RuntimeInstance::new(ServerSpec {
            name: "alpha".to_string(),
            command: "sleep".to_string(),
            ..ServerSpec::default()
        });
        let view = instance.status_view();
        assert_eq!(view.status, InstanceStatus::Stopped);
        assert_eq!(view.uptime_secs, None);
        assert_eq!(view.started_at, None);
    }

    #[test]
    fn uptime_only_reported_while_active() {
        let mut instance = RuntimeInstance::new(ServerSpec::default());
        instance.started_at = Some(Instant::now());
        instance.started_wall = Some(Utc::now());
        instance.status = InstanceStatus::Running;
        assert!(instance.status_view().uptime_secs.is_some());

        instance.status = InstanceStatus::Error;
        assert!(instance.status_view().uptime_secs.is_none());
    }

    #[test]
    fn status_serializes_lowercase() {
        let value = serde_json::to_value(InstanceStatus::Running).expect("serializable");
        assert_eq!(value, "running");
    }
}
