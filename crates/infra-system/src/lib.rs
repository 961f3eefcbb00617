// vidforge Infrastructure - System Adapters
// Implements: WorkerRunner

pub mod command_builder;
pub mod process_adapter;
pub mod progress_protocol;

pub use command_builder::{ExecutableSpec, WorkerCommands};
pub use process_adapter::ProcessWorkerRunner;
