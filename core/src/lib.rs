//! Core ingestion control plane for the host-resident log capture agent:
//! file and container log monitors, the dispatcher and its sinks, and the
//! crash-safe position store that ties restarts back to where reading left
//! off.

pub mod dedup;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod monitors;
pub mod position;
pub mod sinks;
pub mod supervisor;
pub mod timestamp;
pub mod types;

pub use error::{ErrorKind, IngestError, Result};
pub use supervisor::{Supervisor, SupervisorConfig};
