//! gRPC transport layer.
//!
//! Exposes `Identify` and `Health` over tonic. Resolution itself is blocking
//! and runs on the `ResolverRuntime` worker pool; the async handlers only
//! queue work and wait for it off the tokio executor threads.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};

use crate::error::{ExecutionError, IdentityError};
use crate::identity::ConsolidatedIdentity;
use crate::request::IdentifyRequest;
use crate::runtime::ResolverRuntime;

pub mod proto {
    #![allow(missing_docs, clippy::pedantic)]
    tonic::include_proto!("identity");
}

use proto::identity_service_server::{IdentityService, IdentityServiceServer};

/// Maximum accepted length of a raw field before normalization.
const MAX_RAW_FIELD_BYTES: usize = 4 * 1024;

/// gRPC service implementation.
pub struct IdentityServiceImpl {
    runtime: Arc<ResolverRuntime>,
    request_timeout: Duration,
}

impl IdentityServiceImpl {
    /// Create a service that resolves on `runtime`, waiting at most `request_timeout`.
    #[must_use]
    pub fn new(runtime: Arc<ResolverRuntime>, request_timeout: Duration) -> Self {
        Self {
            runtime,
            request_timeout,
        }
    }

    /// Wrap the service in the tonic server type.
    #[must_use]
    pub fn into_server(self) -> IdentityServiceServer<Self> {
        IdentityServiceServer::new(self)
    }
}

fn status_from_identity_error(err: IdentityError) -> Status {
    match err {
        IdentityError::Validation(v) => Status::invalid_argument(v.to_string()),
        IdentityError::Execution(e) => match e {
            ExecutionError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
            ExecutionError::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            ExecutionError::Disconnected => Status::unavailable(e.to_string()),
        },
        // Store and internal details stay in the logs.
        err @ (IdentityError::Storage(_) | IdentityError::Internal { .. }) => {
            tracing::error!(error = %err, "identify failed");
            Status::internal("Internal server error")
        }
    }
}

fn check_raw_len(field: &str, value: Option<&String>) -> Result<(), Status> {
    if value.is_some_and(|v| v.len() > MAX_RAW_FIELD_BYTES) {
        return Err(Status::invalid_argument(format!("{field} exceeds maximum size")));
    }
    Ok(())
}

impl From<ConsolidatedIdentity> for proto::ConsolidatedContact {
    fn from(identity: ConsolidatedIdentity) -> Self {
        Self {
            primary_contact_id: identity.primary_contact_id.get(),
            emails: identity.emails,
            phone_numbers: identity.phone_numbers,
            secondary_contact_ids: identity
                .secondary_contact_ids
                .into_iter()
                .map(|id| id.get())
                .collect(),
        }
    }
}

#[tonic::async_trait]
impl IdentityService for IdentityServiceImpl {
    async fn identify(
        &self,
        request: Request<proto::IdentifyRequest>,
    ) -> Result<Response<proto::IdentifyResponse>, Status> {
        let req = request.into_inner();
        check_raw_len("email", req.email.as_ref())?;
        check_raw_len("phone_number", req.phone_number.as_ref())?;

        let request_id = uuid::Uuid::new_v4();
        tracing::debug!(%request_id, "identify request received");

        let handle = self
            .runtime
            .submit(IdentifyRequest::new(req.email, req.phone_number))
            .map_err(status_from_identity_error)?;
        let timeout = self.request_timeout;
        let resolution = tokio::task::spawn_blocking(move || handle.join_timeout(timeout))
            .await
            .map_err(|e| Status::internal(format!("resolver task failed: {e}")))?
            .map_err(status_from_identity_error)?;

        Ok(Response::new(proto::IdentifyResponse {
            contact: Some(resolution.identity.into()),
        }))
    }

    async fn health(
        &self,
        _request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthResponse>, Status> {
        // The store lock can be held by a resolution; wait for it off the executor.
        let store = Arc::clone(self.runtime.resolver().store());
        let contact_count = tokio::task::spawn_blocking(move || store.len())
            .await
            .map_err(|e| Status::internal(format!("health task failed: {e}")))?
            .map_err(|e| status_from_identity_error(e.into()))?;
        Ok(Response::new(proto::HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            contact_count: contact_count as u64,
        }))
    }
}

pub use proto::identity_service_client::IdentityServiceClient;
