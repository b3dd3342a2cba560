pub mod data;
pub mod defaults;
pub mod io;
pub mod manager;
pub mod snapshot;
pub mod substitute;
pub mod watcher;

pub use data::{ServerSpec, SupervisorSettings};
pub use io::ConfigError;
pub use manager::{ConfigManager, ReloadOutcome};
pub use snapshot::{ConfigChange, ConfigDiff, ConfigSnapshot};
pub use substitute::ConfigWarning;
