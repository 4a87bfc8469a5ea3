pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod integrations;
pub mod plan_backup;
pub mod prompts;
pub mod restrictions;

pub use config::{InstallPaths, RuntimeConfig};
pub use engine::{StageEngine, StageOutcome};
pub use error::{Error, Result};
pub use events::{EventKind, IntegrationEvent, IntegrationHandler, IntegrationRegistry};
pub use restrictions::WriteGuard;
