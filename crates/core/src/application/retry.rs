// Retry policy: per-kind attempt budgets with exponential backoff
use crate::application::worker::constants::*;
use crate::domain::{Job, JobError, JobKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the job after the backoff delay (ms)
    Retry(i64),
    /// Do not retry, job has failed permanently
    Failed,
}

/// Budget for one job kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KindRetry {
    pub max_attempts: u32,
    pub base_delay_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub download: KindRetry,
    pub parse: KindRetry,
    pub generate: KindRetry,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            download: KindRetry {
                max_attempts: DOWNLOAD_MAX_ATTEMPTS,
                base_delay_ms: DOWNLOAD_BASE_DELAY_MS,
            },
            parse: KindRetry {
                max_attempts: PARSE_MAX_ATTEMPTS,
                base_delay_ms: PARSE_BASE_DELAY_MS,
            },
            generate: KindRetry {
                max_attempts: GENERATE_MAX_ATTEMPTS,
                base_delay_ms: GENERATE_BASE_DELAY_MS,
            },
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Same budget for every kind (handy in tests)
    pub fn uniform(max_attempts: u32, base_delay_ms: i64) -> Self {
        let budget = KindRetry {
            max_attempts,
            base_delay_ms,
        };
        Self {
            download: budget,
            parse: budget,
            generate: budget,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }

    pub fn for_kind(&self, kind: JobKind) -> KindRetry {
        match kind {
            JobKind::Download => self.download,
            JobKind::Parse => self.parse,
            JobKind::Generate => self.generate,
        }
    }

    pub fn max_attempts(&self, kind: JobKind) -> u32 {
        self.for_kind(kind).max_attempts.max(1)
    }

    /// delay = base * factor^(attempt - 1), attempt counted from 1
    pub fn backoff_delay_ms(&self, kind: JobKind, attempt: u32) -> i64 {
        let base = self.for_kind(kind).base_delay_ms.max(0) as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        (base * self.backoff_factor.powi(exponent)) as i64
    }

    /// Decide what happens after `job` failed its current attempt with `error`
    pub fn should_retry(&self, job: &Job, error: &JobError) -> RetryDecision {
        if !error.is_retryable() {
            info!(
                job_id = %job.id,
                error_kind = %error.kind.as_str(),
                "Failure is not retryable"
            );
            return RetryDecision::Failed;
        }

        let failures = job.failed_attempts();
        if failures >= job.max_attempts {
            warn!(
                job_id = %job.id,
                attempts = %failures,
                max_attempts = %job.max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Failed;
        }

        let delay_ms = self.backoff_delay_ms(job.kind, failures);
        info!(
            job_id = %job.id,
            attempt = %failures,
            max_attempts = %job.max_attempts,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );
        RetryDecision::Retry(delay_ms)
    }
}
