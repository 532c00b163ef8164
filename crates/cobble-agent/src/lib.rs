//! Supervision of Minecraft-style game servers: launching with a matching
//! Java runtime, lifecycle tracking from console output, command relay,
//! status-query probing and fan-out of console logs to observers.

pub mod config;
pub mod error;
pub mod launch;
pub mod log_bus;
pub mod log_parser;
pub mod process_tree;
pub mod properties;
pub mod registry;
pub mod runtime;
pub mod status_probe;
pub mod supervisor;
pub mod telemetry;

pub use cobble_process::{
    EventBody, LogEvent, PlayerSample, ServerId, ServerListing, ServerState, ServerStats,
    Severity, ShutdownInfo,
};
pub use error::AgentError;
pub use supervisor::Supervisor;
