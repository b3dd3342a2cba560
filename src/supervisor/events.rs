use crate::supervisor::instance::InstanceStatus;

/// Lifecycle notifications published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StatusChanged {
        name: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    /// An automatic restart is about to spawn a replacement process.
    Restarting { name: String, attempt: u32 },
    /// The instance left the registry.
    Removed { name: String },
}

impl SupervisorEvent {
    pub fn server(&self) -> &str {
        match self {
            SupervisorEvent::StatusChanged { name, .. }
            | SupervisorEvent::Restarting { name, .. }
            | SupervisorEvent::Removed { name } => name,
        }
    }
}
