/// Firmware update workflow core
///
/// The orchestrator sequences a firmware update: checking the repository,
/// detecting the device, reading its firmware versions and reprogramming
/// it. It drives the adapters from `devadapter` and reports every step to
/// an observer through the wire messages defined here.

pub mod commands;
pub mod config;
pub mod orchestrator;
pub mod state;
pub mod wire;

pub use commands::{Command, Completion, Control, Event, Input, Setting};
pub use config::{CheckFailurePolicy, ConfigError, Settings};
pub use orchestrator::{Adapters, Orchestrator};
pub use state::{Records, WorkflowState};
pub use wire::{decode, ChannelTransport, ObserverTransport, Scalar, WireError, WireMessage};
