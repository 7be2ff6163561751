use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::auth::AuthError;
use crate::instances::ProvisionError;
use crate::metadata::MetadataError;
use crate::orchestrator::OrchestratorError;
use crate::run::RunError;
use crate::workspace::MaterializeError;

/// Every error kind a handler can surface to an HTTP client, per the
/// error taxonomy: MissingCredential/Invalid/Expired (401), Forbidden (403),
/// NotFound (404), Conflict/NoExternalPort (409), QuotaExceeded (429),
/// Internal (500), Exhausted/ServiceUnavailable (503).
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential")]
    Invalid,
    #[error("credential expired")]
    Expired,
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no external port bound")]
    NoExternalPort,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("provisioning exhausted")]
    Exhausted,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("no live session")]
    NoSession,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BrokerError {
    fn kind(&self) -> &'static str {
        match self {
            BrokerError::MissingCredential => "missing_credential",
            BrokerError::Invalid => "invalid_credential",
            BrokerError::Expired => "expired_credential",
            BrokerError::Forbidden => "forbidden",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::Conflict(_) => "conflict",
            BrokerError::NoExternalPort => "no_external_port",
            BrokerError::QuotaExceeded => "quota_exceeded",
            BrokerError::Internal(_) => "internal",
            BrokerError::Exhausted => "exhausted",
            BrokerError::ServiceUnavailable(_) => "service_unavailable",
            BrokerError::NoSession => "no_session",
            BrokerError::InvalidRequest(_) => "invalid_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            BrokerError::MissingCredential | BrokerError::Invalid | BrokerError::Expired => {
                StatusCode::UNAUTHORIZED
            }
            BrokerError::Forbidden => StatusCode::FORBIDDEN,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::Conflict(_) | BrokerError::NoExternalPort => StatusCode::CONFLICT,
            BrokerError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Exhausted | BrokerError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BrokerError::NoSession | BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::warn!(error = %self, kind = self.kind(), "request rejected");
        }
        let body = Json(json!({ "error": self.kind(), "message": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<AuthError> for BrokerError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Missing => BrokerError::MissingCredential,
            AuthError::Expired => BrokerError::Expired,
            AuthError::Invalid(_) => BrokerError::Invalid,
        }
    }
}

impl From<MetadataError> for BrokerError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::Transport(msg) => BrokerError::ServiceUnavailable(msg),
            MetadataError::Client { status, body } => {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    BrokerError::QuotaExceeded
                } else if status == StatusCode::NOT_FOUND {
                    BrokerError::NotFound(body)
                } else {
                    BrokerError::Internal(format!("metadata store returned {status}: {body}"))
                }
            }
            MetadataError::Server(msg) => BrokerError::Internal(msg),
        }
    }
}

impl From<OrchestratorError> for BrokerError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::NotFound(id) => BrokerError::NotFound(id),
            OrchestratorError::Ambiguous(prefix) => {
                BrokerError::Conflict(format!("ambiguous instance prefix: {prefix}"))
            }
            other => BrokerError::Internal(other.to_string()),
        }
    }
}

impl From<ProvisionError> for BrokerError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::QuotaExceeded => BrokerError::QuotaExceeded,
            ProvisionError::Exhausted => BrokerError::Exhausted,
            ProvisionError::Metadata(m) => m.into(),
            ProvisionError::Orchestrator(o) => o.into(),
        }
    }
}

impl From<MaterializeError> for BrokerError {
    fn from(e: MaterializeError) -> Self {
        match e {
            MaterializeError::NoEntry => BrokerError::NotFound("entry node".into()),
            MaterializeError::Orchestrator(o) => o.into(),
        }
    }
}

impl From<RunError> for BrokerError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::NoSession => BrokerError::NoSession,
            RunError::Materialize(m) => m.into(),
            RunError::Orchestrator(o) => o.into(),
        }
    }
}
