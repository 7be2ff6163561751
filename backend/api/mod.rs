//! HTTP/WS surface: router assembly and the shared `AppState` every handler
//! closes over. Not one of the distilled spec's named components — the
//! ambient surface SPEC_FULL §2 adds around them.

pub mod handlers;
pub mod routes;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::auth::{Principal, extract_bearer_token, verify_token};
use crate::config::Config;
use crate::error::BrokerError;
use crate::instances::InstanceManager;
use crate::metadata::MetadataClient;
use crate::orchestrator::Orchestrator;
use crate::run::RunCoordinator;
use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub metadata: MetadataClient,
    pub instances: Arc<InstanceManager>,
    pub sessions: Arc<SessionRegistry>,
    pub run_coordinator: Arc<RunCoordinator>,
}

/// A verified Principal plus the raw bearer token, so handlers can forward
/// the caller's credential to the Metadata Client without re-parsing it
/// (§4.2: "every call propagates the principal's bearer token").
pub struct AuthContext {
    pub principal: Principal,
    pub bearer_token: String,
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
    AppState: axum::extract::FromRef<S>,
{
    type Rejection = BrokerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok());
        let token = extract_bearer_token(header)?;
        let principal = verify_token(token, &app_state.config.jwt_secret, app_state.config.jwt_algorithm)?;
        Ok(AuthContext {
            principal,
            bearer_token: token.to_string(),
        })
    }
}

/// Hints read straight off the inbound request for `BuildAccessUrls` (§4.5).
pub fn host_context_from_parts(parts: &Parts) -> crate::instances::HostContext {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string())
    };
    crate::instances::HostContext {
        forwarded_host: header("x-forwarded-host"),
        forwarded_proto: header("x-forwarded-proto"),
        host_header: header("host"),
        peer_addr: None,
    }
}
