// Worker Runner Port
// Runs one attempt of a job in an external worker and streams its progress.

use crate::domain::{Job, JobError, ProgressUpdate};
use async_trait::async_trait;
use thiserror::Error;

/// Successful worker run
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutput {
    pub result: serde_json::Value,
    /// False when stdout held no JSON object and `result` is the raw text
    pub structured: bool,
    pub duration_ms: i64,
}

/// Execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Spawn failed for {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Worker exited with code {code:?}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Worker task panicked: {0}")]
    Panicked(String),
}

impl From<ExecutionError> for JobError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::SpawnFailed { program, reason } => {
                JobError::spawn_failure(&program, reason)
            }
            ExecutionError::NonZeroExit { code, stderr } => JobError::non_zero_exit(code, stderr),
            other => JobError::internal(other.to_string()),
        }
    }
}

/// Receives progress in stream order
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, update: ProgressUpdate);
}

#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Run the worker for `job` to completion.
    ///
    /// # Errors
    /// - ExecutionError::SpawnFailed if the executable cannot be started
    /// - ExecutionError::NonZeroExit with captured stderr otherwise
    async fn run(&self, job: &Job, sink: &dyn ProgressSink)
        -> Result<WorkerOutput, ExecutionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a fixed progress script, then resolves with the configured outcome
    pub struct ScriptedRunner {
        updates: Vec<ProgressUpdate>,
        outcome: Mutex<Result<WorkerOutput, ExecutionError>>,
        step_delay: Duration,
        call_count: AtomicUsize,
    }

    impl ScriptedRunner {
        pub fn succeeding(result: serde_json::Value) -> Self {
            Self::new(Ok(WorkerOutput {
                result,
                structured: true,
                duration_ms: 1,
            }))
        }

        pub fn failing(err: ExecutionError) -> Self {
            Self::new(Err(err))
        }

        pub fn new(outcome: Result<WorkerOutput, ExecutionError>) -> Self {
            Self {
                updates: Vec::new(),
                outcome: Mutex::new(outcome),
                step_delay: Duration::ZERO,
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn with_updates(mut self, updates: Vec<ProgressUpdate>) -> Self {
            self.updates = updates;
            self
        }

        /// Pause between updates (and before resolving)
        pub fn with_step_delay(mut self, delay: Duration) -> Self {
            self.step_delay = delay;
            self
        }

        pub fn set_outcome(&self, outcome: Result<WorkerOutput, ExecutionError>) {
            *self.outcome.lock().unwrap() = outcome;
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerRunner for ScriptedRunner {
        async fn run(
            &self,
            _job: &Job,
            sink: &dyn ProgressSink,
        ) -> Result<WorkerOutput, ExecutionError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            for update in &self.updates {
                if !self.step_delay.is_zero() {
                    tokio::time::sleep(self.step_delay).await;
                }
                sink.on_progress(update.clone()).await;
            }
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            self.outcome.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobErrorKind;

    #[test]
    fn test_execution_error_maps_to_job_error_kind() {
        let spawn: JobError = ExecutionError::SpawnFailed {
            program: "yt-dlp".to_string(),
            reason: "not found".to_string(),
        }
        .into();
        assert_eq!(spawn.kind, JobErrorKind::SpawnFailure);

        let exit: JobError = ExecutionError::NonZeroExit {
            code: Some(2),
            stderr: "bad".to_string(),
        }
        .into();
        assert_eq!(exit.kind, JobErrorKind::NonZeroExit);
        assert_eq!(exit.exit_code, Some(2));
        assert_eq!(exit.stderr.as_deref(), Some("bad"));

        let panicked: JobError = ExecutionError::Panicked("oops".to_string()).into();
        assert_eq!(panicked.kind, JobErrorKind::Internal);
    }
}
