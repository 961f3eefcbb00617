//! RPC Request/Response Types

use serde::{Deserialize, Serialize};
use vidforge_core::domain::{JobId, JobKind, JobPayload, JobStatus, OwnerId, Principal, QueueMode};
use vidforge_core::port::KindUsage;

/// session.open.v1
#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub user_id: i64,
    #[serde(default)]
    pub elevated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub token: String,
    /// Principal every later call on this token acts as
    pub principal: Principal,
}

/// session.impersonate.v1
#[derive(Debug, Deserialize)]
pub struct ImpersonateRequest {
    pub token: String,
    pub owner_id: OwnerId,
}

/// session.revert.v1, session.close.v1, usage.get.v1
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseSessionResponse {
    pub closed: bool,
}

/// jobs.submit.v1
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub token: String,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub backend: QueueMode,
}

/// jobs.status.v1
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub token: String,
    pub job_id: JobId,
    #[serde(default)]
    pub kind: Option<JobKind>,
}

/// jobs.list.v1, jobs.stats.v1
#[derive(Debug, Deserialize)]
pub struct KindFilterRequest {
    pub token: String,
    #[serde(default)]
    pub kind: Option<JobKind>,
}

/// jobs.retry.v1, jobs.remove.v1
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub token: String,
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResponse {
    pub job_id: JobId,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageResponse {
    pub user_id: i64,
    pub usage: Vec<KindUsage>,
}

/// system.mode.v1
#[derive(Debug, Clone, Serialize)]
pub struct ModeResponse {
    pub mode: QueueMode,
    pub version: String,
}
