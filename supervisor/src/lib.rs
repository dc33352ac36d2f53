// Environment configuration
pub mod config;

// Child process lifecycle
pub mod process;

// HTTP health probes
pub mod health;

// Startup, monitoring and shutdown of the callback and MCP servers
pub mod supervisor;

pub use config::SupervisorConfig;
pub use process::{ManagedProcess, ProcessSpec, ProcessState};
pub use supervisor::Supervisor;
