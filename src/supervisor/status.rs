use crate::supervisor::{InstanceStatus, ProcessSupervisor, ServerStatus, SupervisorError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Read-only view over a supervisor for callers that should not control it.
///
/// Every query reflects the last recorded state, including while a reconcile
/// is in progress.
#[derive(Clone)]
pub struct StatusFacade {
    supervisor: ProcessSupervisor,
}

/// Instance counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub counts: BTreeMap<InstanceStatus, usize>,
}

impl StatusSummary {
    pub fn count(&self, status: InstanceStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} servers", self.total)?;
        for status in InstanceStatus::ALL {
            let count = self.count(status);
            if count > 0 {
                write!(f, ", {count} {status}")?;
            }
        }
        Ok(())
    }
}

impl StatusFacade {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }

    pub fn snapshot(&self) -> Vec<ServerStatus> {
        self.supervisor.status()
    }

    pub fn server(&self, name: &str) -> Option<ServerStatus> {
        self.supervisor.server_status(name)
    }

    pub fn running(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|status| status.status == InstanceStatus::Running)
            .map(|status| status.name)
            .collect()
    }

    pub fn validate_tool_call(&self, server: &str, tool: &str) -> Result<(), SupervisorError> {
        self.supervisor.validate_tool_call(server, tool)
    }

    pub fn summary(&self) -> StatusSummary {
        let snapshot = self.snapshot();
        let mut summary = StatusSummary {
            total: snapshot.len(),
            counts: BTreeMap::new(),
        };
        for status in snapshot {
            *summary.counts.entry(status.status).or_insert(0) += 1;
        }
        summary
    }
}
