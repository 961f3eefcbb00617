// Job Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::mode::QueueMode;
use crate::domain::payload::JobPayload;
use crate::domain::progress::ProgressUpdate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job ID. Broker ids are numeric strings, inline ids carry the `inline-` prefix.
pub type JobId = String;

/// Owning user. `None` on a job means system-owned.
pub type OwnerId = i64;

/// Job Kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Parse,
    Generate,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Download, JobKind::Parse, JobKind::Generate];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Download => "download",
            JobKind::Parse => "parse",
            JobKind::Generate => "generate",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "download" => Ok(JobKind::Download),
            "parse" => Ok(JobKind::Parse),
            "generate" => Ok(JobKind::Generate),
            other => Err(DomainError::UnknownJobKind(other.to_string())),
        }
    }
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::UnknownJobStatus(other.to_string())),
        }
    }
}

/// Free-form progress details reported by the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Executable could not be started
    SpawnFailure,
    /// Executable ran and exited with a non-zero code (or was killed)
    NonZeroExit,
    /// No heartbeat within the stall window, stall retries exhausted
    Stalled,
    /// Pipe I/O errors, worker task panics
    Internal,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::SpawnFailure => "spawn_failure",
            JobErrorKind::NonZeroExit => "non_zero_exit",
            JobErrorKind::Stalled => "stalled",
            JobErrorKind::Internal => "internal",
        }
    }
}

/// Failure recorded on a job once it reaches `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl JobError {
    pub fn spawn_failure(program: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::SpawnFailure,
            message: format!("failed to spawn {}: {}", program, reason.into()),
            exit_code: None,
            stderr: None,
        }
    }

    pub fn non_zero_exit(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        let message = match exit_code {
            Some(code) => format!("worker exited with code {}", code),
            None => "worker terminated by signal".to_string(),
        };
        Self {
            kind: JobErrorKind::NonZeroExit,
            message,
            exit_code,
            stderr: Some(stderr.into()),
        }
    }

    pub fn stalled(stall_count: u32) -> Self {
        Self {
            kind: JobErrorKind::Stalled,
            message: format!("job stalled {} time(s) without a heartbeat", stall_count + 1),
            exit_code: None,
            stderr: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: JobErrorKind::Internal,
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    /// Whether the automatic retry policy may schedule another attempt.
    /// A missing executable will not appear between backoff delays, so spawn
    /// failures go straight to `failed` and wait for a manual retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, JobErrorKind::NonZeroExit | JobErrorKind::Internal)
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Job Entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub owner_id: Option<OwnerId>,
    pub status: JobStatus,

    pub progress_percent: u8,
    pub progress_meta: ProgressMeta,

    pub payload: JobPayload,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,

    // Retry bookkeeping
    pub attempts: u32,
    pub max_attempts: u32,
    pub stall_count: u32,

    pub backend: QueueMode,
    /// Lets the spreadsheet writer find the row a `generate` job belongs to
    pub correlation_token: Option<String>,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    /// Earliest time a pending job may be claimed (backoff)
    pub available_at: i64,
    pub finished_at: Option<i64>,
}

impl Job {
    pub fn new(
        id: impl Into<JobId>,
        created_at: i64,
        owner_id: Option<OwnerId>,
        payload: JobPayload,
        backend: QueueMode,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            kind: payload.kind(),
            owner_id,
            status: JobStatus::Pending,
            progress_percent: 0,
            progress_meta: ProgressMeta::default(),
            correlation_token: payload.correlation_token(),
            payload,
            result: None,
            error: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            stall_count: 0,
            backend,
            created_at,
            started_at: None,
            heartbeat_at: None,
            available_at: created_at,
            finished_at: None,
        }
    }

    /// Claim the job for a new attempt. Progress restarts from zero here,
    /// the only place it may move backwards.
    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: JobStatus::Active.to_string(),
            });
        }
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.progress_percent = 0;
        self.progress_meta = ProgressMeta::default();
        self.started_at = Some(now_millis);
        self.heartbeat_at = Some(now_millis);
        Ok(())
    }

    /// Fold one protocol update into the job. Returns true when anything changed.
    pub fn apply_progress(&mut self, update: &ProgressUpdate, now_millis: i64) -> bool {
        if self.status != JobStatus::Active {
            return false;
        }
        self.heartbeat_at = Some(now_millis);

        let before = (self.progress_percent, self.progress_meta.clone());
        match update {
            ProgressUpdate::Transfer { percent, speed, eta } => {
                self.raise_percent(*percent);
                if speed.is_some() {
                    self.progress_meta.speed = speed.clone();
                }
                if eta.is_some() {
                    self.progress_meta.eta = eta.clone();
                }
            }
            ProgressUpdate::Step(step) => {
                self.progress_meta.current_step = Some(step.clone());
            }
            ProgressUpdate::Percent(percent) => self.raise_percent(*percent),
        }
        before != (self.progress_percent, self.progress_meta.clone())
    }

    fn raise_percent(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    /// Transition to Completed. Returns Ok(false) when the job is already terminal.
    pub fn complete(&mut self, now_millis: i64, result: serde_json::Value) -> Result<bool> {
        if !self.ensure_finishable(JobStatus::Completed)? {
            return Ok(false);
        }
        self.status = JobStatus::Completed;
        self.progress_percent = 100;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now_millis);
        Ok(true)
    }

    /// Transition to Failed. Returns Ok(false) when the job is already terminal.
    pub fn fail(&mut self, now_millis: i64, error: JobError) -> Result<bool> {
        if !self.ensure_finishable(JobStatus::Failed)? {
            return Ok(false);
        }
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(error);
        self.finished_at = Some(now_millis);
        Ok(true)
    }

    fn ensure_finishable(&self, to: JobStatus) -> Result<bool> {
        match self.status {
            JobStatus::Active => Ok(true),
            JobStatus::Completed | JobStatus::Failed => Ok(false),
            JobStatus::Pending => Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempts that ended in a failure. Stall requeues bump `attempts` too
    /// (it doubles as the fencing token) but draw from their own budget.
    pub fn failed_attempts(&self) -> u32 {
        self.attempts.saturating_sub(self.stall_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload::DownloadPayload;

    fn download_job() -> Job {
        let payload = JobPayload::Download(DownloadPayload {
            video_id: "dQw4w9WgXcQ".to_string(),
            quality: None,
            cookies_path: None,
        });
        Job::new("1", 1_000, Some(7), payload, QueueMode::Broker, 3)
    }

    #[test]
    fn test_new_job_is_pending_and_empty() {
        let job = download_job();
        assert_eq!(job.kind, JobKind::Download);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.result.is_none() && job.error.is_none());
        assert_eq!(job.available_at, job.created_at);
    }

    #[test]
    fn test_start_increments_attempts_and_resets_progress() {
        let mut job = download_job();
        job.start(2_000).unwrap();
        job.apply_progress(&ProgressUpdate::Percent(40), 2_100);

        job.status = JobStatus::Pending;
        job.start(3_000).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.progress_percent, 0);
        assert_eq!(job.started_at, Some(3_000));
    }

    #[test]
    fn test_start_rejects_active_job() {
        let mut job = download_job();
        job.start(2_000).unwrap();
        let err = job.start(2_001).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_progress_never_decreases_while_active() {
        let mut job = download_job();
        job.start(2_000).unwrap();

        assert!(job.apply_progress(&ProgressUpdate::Percent(50), 2_001));
        assert!(!job.apply_progress(&ProgressUpdate::Percent(40), 2_002));
        assert_eq!(job.progress_percent, 50);
        assert_eq!(job.heartbeat_at, Some(2_002));
    }

    #[test]
    fn test_step_marker_keeps_percent() {
        let mut job = download_job();
        job.start(2_000).unwrap();
        job.apply_progress(&ProgressUpdate::Percent(30), 2_001);
        job.apply_progress(&ProgressUpdate::Step("merging".to_string()), 2_002);

        assert_eq!(job.progress_percent, 30);
        assert_eq!(job.progress_meta.current_step.as_deref(), Some("merging"));
    }

    #[test]
    fn test_transfer_update_sets_speed_and_eta() {
        let mut job = download_job();
        job.start(2_000).unwrap();
        job.apply_progress(
            &ProgressUpdate::Transfer {
                percent: 12,
                speed: Some("1.20MiB/s".to_string()),
                eta: Some("00:31".to_string()),
            },
            2_001,
        );
        assert_eq!(job.progress_percent, 12);
        assert_eq!(job.progress_meta.speed.as_deref(), Some("1.20MiB/s"));
        assert_eq!(job.progress_meta.eta.as_deref(), Some("00:31"));
    }

    #[test]
    fn test_progress_ignored_unless_active() {
        let mut job = download_job();
        assert!(!job.apply_progress(&ProgressUpdate::Percent(10), 2_000));
        assert_eq!(job.progress_percent, 0);
    }

    #[test]
    fn test_complete_sets_result_and_full_progress() {
        let mut job = download_job();
        job.start(2_000).unwrap();
        job.apply_progress(&ProgressUpdate::Percent(50), 2_001);

        assert!(job.complete(3_000, serde_json::json!({"file": "a.mp4"})).unwrap());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.finished_at, Some(3_000));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_second_terminal_transition_is_noop() {
        let mut job = download_job();
        job.start(2_000).unwrap();
        assert!(job.complete(3_000, serde_json::json!({})).unwrap());

        let applied = job.fail(4_000, JobError::internal("late")).unwrap();
        assert!(!applied);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.finished_at, Some(3_000));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_finishing_pending_job_is_rejected() {
        let mut job = download_job();
        assert!(job.fail(2_000, JobError::internal("x")).is_err());
    }

    #[test]
    fn test_spawn_failure_is_not_auto_retryable() {
        assert!(!JobError::spawn_failure("yt-dlp", "No such file").is_retryable());
        assert!(JobError::non_zero_exit(Some(1), "boom").is_retryable());
        assert!(!JobError::stalled(1).is_retryable());
    }

    #[test]
    fn test_stalls_do_not_count_as_failures() {
        let mut job = download_job();
        job.attempts = 3;
        job.stall_count = 1;
        assert_eq!(job.failed_attempts(), 2);
    }

    #[test]
    fn test_kind_and_status_round_trip_strings() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!("upload".parse::<JobKind>().is_err());
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }
}
