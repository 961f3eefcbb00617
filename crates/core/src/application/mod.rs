// Application Layer - Use Cases and Business Logic

pub mod access;
pub mod backend;
pub mod engine;
pub mod lifecycle;
pub mod mode;
pub mod orchestrator;
pub mod retry;
pub mod sink;
pub mod worker;

// Re-exports
pub use access::SessionRegistry;
pub use backend::{BrokerBackend, InlineBackend, NewJob, QueueBackend};
pub use engine::{Engine, EngineConfig, EngineDeps};
pub use lifecycle::{AttemptOutcome, LifecycleController, StallConfig, StallReport};
pub use mode::{ModeSelection, ModeSelector, ModeState};
pub use orchestrator::{JobListing, JobOrchestrator, JobStats};
pub use retry::{KindRetry, RetryDecision, RetryPolicy};
pub use worker::{shutdown_channel, Concurrency, ShutdownSender, ShutdownToken, Worker, WorkerConfig};
