//! RPC Method Handlers
//!
//! Resolves the session token to its effective principal, then delegates
//! to the orchestrator.

use crate::error::to_rpc_error;
use crate::types::{
    CloseSessionResponse, ImpersonateRequest, JobRequest, KindFilterRequest, ModeResponse,
    OpenSessionRequest, RemoveResponse, SessionResponse, StatusRequest, SubmitRequest,
    SubmitResponse, TokenRequest, UsageResponse,
};
use jsonrpsee::types::ErrorObjectOwned;
use std::sync::Arc;
use tracing::{debug, warn};
use vidforge_core::application::{JobListing, JobOrchestrator, JobStats};
use vidforge_core::domain::{Job, OwnerId, Principal};
use vidforge_core::error::AppError;

type RpcResult<T> = Result<T, ErrorObjectOwned>;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    orchestrator: Arc<JobOrchestrator>,
    elevated_users: Vec<OwnerId>,
}

impl RpcHandler {
    pub fn new(orchestrator: Arc<JobOrchestrator>, elevated_users: Vec<OwnerId>) -> Self {
        Self {
            orchestrator,
            elevated_users,
        }
    }

    async fn principal(&self, token: &str) -> RpcResult<Principal> {
        self.orchestrator
            .sessions()
            .effective(token)
            .await
            .map_err(to_rpc_error)
    }

    /// session.open.v1
    pub async fn open_session(&self, params: OpenSessionRequest) -> RpcResult<SessionResponse> {
        if params.elevated && !self.elevated_users.contains(&params.user_id) {
            warn!(user_id = %params.user_id, "Elevated session refused");
            return Err(to_rpc_error(AppError::Forbidden(format!(
                "user {} may not open an elevated session",
                params.user_id
            ))));
        }
        let principal = Principal {
            user_id: params.user_id,
            elevated: params.elevated,
        };
        let token = self.orchestrator.sessions().open(principal).await;
        Ok(SessionResponse { token, principal })
    }

    /// session.impersonate.v1
    pub async fn impersonate(&self, params: ImpersonateRequest) -> RpcResult<SessionResponse> {
        let principal = self
            .orchestrator
            .sessions()
            .impersonate(&params.token, params.owner_id)
            .await
            .map_err(to_rpc_error)?;
        Ok(SessionResponse {
            token: params.token,
            principal,
        })
    }

    /// session.revert.v1
    pub async fn revert(&self, params: TokenRequest) -> RpcResult<SessionResponse> {
        let principal = self
            .orchestrator
            .sessions()
            .revert(&params.token)
            .await
            .map_err(to_rpc_error)?;
        Ok(SessionResponse {
            token: params.token,
            principal,
        })
    }

    /// session.close.v1
    pub async fn close_session(&self, params: TokenRequest) -> RpcResult<CloseSessionResponse> {
        let closed = self.orchestrator.sessions().close(&params.token).await;
        Ok(CloseSessionResponse { closed })
    }

    /// jobs.submit.v1
    pub async fn submit(&self, params: SubmitRequest) -> RpcResult<SubmitResponse> {
        let principal = self.principal(&params.token).await?;
        let job = self
            .orchestrator
            .submit(params.payload, Some(principal.user_id))
            .await
            .map_err(to_rpc_error)?;
        debug!(job_id = %job.id, status = %job.status, "Job submitted over RPC");
        Ok(SubmitResponse {
            job_id: job.id,
            status: job.status,
            backend: job.backend,
        })
    }

    /// jobs.status.v1
    pub async fn status(&self, params: StatusRequest) -> RpcResult<Option<Job>> {
        let principal = self.principal(&params.token).await?;
        self.orchestrator
            .get_status(&params.job_id, params.kind, &principal)
            .await
            .map_err(to_rpc_error)
    }

    /// jobs.list.v1
    pub async fn list(&self, params: KindFilterRequest) -> RpcResult<JobListing> {
        let principal = self.principal(&params.token).await?;
        self.orchestrator
            .list_jobs(params.kind, &principal)
            .await
            .map_err(to_rpc_error)
    }

    /// jobs.stats.v1
    pub async fn stats(&self, params: KindFilterRequest) -> RpcResult<JobStats> {
        let principal = self.principal(&params.token).await?;
        self.orchestrator
            .stats(params.kind, &principal)
            .await
            .map_err(to_rpc_error)
    }

    /// jobs.retry.v1
    pub async fn retry(&self, params: JobRequest) -> RpcResult<Job> {
        let principal = self.principal(&params.token).await?;
        self.orchestrator
            .retry(&params.job_id, &principal)
            .await
            .map_err(to_rpc_error)
    }

    /// jobs.remove.v1
    pub async fn remove(&self, params: JobRequest) -> RpcResult<RemoveResponse> {
        let principal = self.principal(&params.token).await?;
        self.orchestrator
            .remove(&params.job_id, &principal)
            .await
            .map_err(to_rpc_error)?;
        Ok(RemoveResponse {
            job_id: params.job_id,
            removed: true,
        })
    }

    /// usage.get.v1
    pub async fn usage(&self, params: TokenRequest) -> RpcResult<UsageResponse> {
        let principal = self.principal(&params.token).await?;
        let usage = self
            .orchestrator
            .usage(&principal)
            .await
            .map_err(to_rpc_error)?;
        Ok(UsageResponse {
            user_id: principal.user_id,
            usage,
        })
    }

    /// system.mode.v1
    pub async fn mode(&self) -> RpcResult<ModeResponse> {
        Ok(ModeResponse {
            mode: self.orchestrator.mode(),
            version: vidforge_core::VERSION.to_string(),
        })
    }
}
