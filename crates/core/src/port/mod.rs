// Port Layer - Interfaces for external dependencies

pub mod broker;
pub mod id_provider; // For deterministic testing
pub mod job_store;
pub mod notifier;
pub mod time_provider;
pub mod worker_runner;

// Re-exports
pub use broker::{Broker, BrokerError, Delivery};
pub use id_provider::IdProvider;
pub use job_store::{JobQuery, JobStore, KindUsage, StatusCounts};
pub use notifier::{JobEvent, JobNotifier};
pub use time_provider::TimeProvider;
pub use worker_runner::{ExecutionError, ProgressSink, WorkerOutput, WorkerRunner};
