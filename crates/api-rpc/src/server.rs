//! JSON-RPC Server
//!
//! HTTP on localhost. There is no authentication layer: the session token
//! only selects which principal a call acts as. Elevated sessions are only
//! opened for user ids listed in `elevated_users`.

use crate::handler::RpcHandler;
use crate::types::{
    ImpersonateRequest, JobRequest, KindFilterRequest, OpenSessionRequest, StatusRequest,
    SubmitRequest, TokenRequest,
};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::RpcModule;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use vidforge_core::application::JobOrchestrator;

const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9537;

/// RPC Server Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcServerConfig {
    pub host: String,
    /// 0 picks a free port
    pub port: u16,
    /// Users allowed to open elevated sessions
    pub elevated_users: Vec<i64>,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
            elevated_users: Vec::new(),
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

/// Register one method whose params parse into `P`
fn register<P, R, F, Fut>(
    module: &mut RpcModule<()>,
    name: &'static str,
    handler: &Arc<RpcHandler>,
    call: F,
) -> Result<(), String>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Clone + Send + 'static,
    F: Fn(Arc<RpcHandler>, P) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ErrorObjectOwned>> + Send + 'static,
{
    let handler = Arc::clone(handler);
    module
        .register_async_method(name, move |params, _, _| {
            let handler = Arc::clone(&handler);
            let call = call.clone();
            async move {
                let req: P = params.parse()?;
                call(handler, req).await
            }
        })
        .map_err(|e| e.to_string())?;
    Ok(())
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, orchestrator: Arc<JobOrchestrator>) -> Self {
        let handler = RpcHandler::new(orchestrator, config.elevated_users.clone());
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    fn module(&self) -> Result<RpcModule<()>, String> {
        let mut module = RpcModule::new(());
        let h = &self.handler;

        // Sessions
        register(&mut module, "session.open.v1", h, |h, req: OpenSessionRequest| async move {
            h.open_session(req).await
        })?;
        register(&mut module, "session.impersonate.v1", h, |h, req: ImpersonateRequest| async move {
            h.impersonate(req).await
        })?;
        register(&mut module, "session.revert.v1", h, |h, req: TokenRequest| async move {
            h.revert(req).await
        })?;
        register(&mut module, "session.close.v1", h, |h, req: TokenRequest| async move {
            h.close_session(req).await
        })?;

        // Jobs
        register(&mut module, "jobs.submit.v1", h, |h, req: SubmitRequest| async move {
            h.submit(req).await
        })?;
        register(&mut module, "jobs.status.v1", h, |h, req: StatusRequest| async move {
            h.status(req).await
        })?;
        register(&mut module, "jobs.list.v1", h, |h, req: KindFilterRequest| async move {
            h.list(req).await
        })?;
        register(&mut module, "jobs.stats.v1", h, |h, req: KindFilterRequest| async move {
            h.stats(req).await
        })?;
        register(&mut module, "jobs.retry.v1", h, |h, req: JobRequest| async move {
            h.retry(req).await
        })?;
        register(&mut module, "jobs.remove.v1", h, |h, req: JobRequest| async move {
            h.remove(req).await
        })?;
        register(&mut module, "usage.get.v1", h, |h, req: TokenRequest| async move {
            h.usage(req).await
        })?;

        // System
        let handler = Arc::clone(&self.handler);
        module
            .register_async_method("system.mode.v1", move |_, _, _| {
                let handler = Arc::clone(&handler);
                async move { handler.mode().await }
            })
            .map_err(|e| e.to_string())?;

        Ok(module)
    }

    /// Start the JSON-RPC server. Returns the bound address and the handle
    /// that stops it.
    pub async fn start(self) -> Result<(SocketAddr, ServerHandle), String> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let module = self.module()?;

        let server = Server::builder()
            .build(&addr)
            .await
            .map_err(|e| format!("Failed to build server on {}: {}", addr, e))?;
        let local_addr = server
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        info!(addr = %local_addr, methods = %module.method_names().count(), "JSON-RPC server started");
        Ok((local_addr, server.start(module)))
    }
}
