//! Instance Manager (§4.5): atomic instance provisioning — name+port
//! selection under a process-wide mutex, runtime creation, metadata
//! registration, compensating rollback on any failure — plus listing,
//! resolution, teardown, rename, and access-URL construction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::auth::{Principal, Role};
use crate::metadata::{InstanceRecord, MetadataClient, MetadataError};
use crate::orchestrator::{CreateSpec, Orchestrator, OrchestratorError};
use crate::ports::PortPool;
use crate::sessions::fresh_session_id;

const MAX_PROVISION_ATTEMPTS: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("free-tier instance quota exceeded")]
    QuotaExceeded,
    #[error("exhausted name/port attempts")]
    Exhausted,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Request body for `POST /containers` (§6, SPEC_FULL §3 CreateInstanceRequest).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(rename = "projectName")]
    pub project_name: String,
    pub image: Option<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// An instance as known to this process once provisioned (§3 Instance).
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub image: String,
    pub owner: String,
    pub project_name: String,
    pub port: u16,
}

/// `GET /containers/{id}/urls` and the URL fields of `POST /containers` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct InstanceUrls {
    pub cid: String,
    pub ws_url: String,
    pub vnc_url: String,
}

/// Hints gathered from the inbound HTTP request, used to derive the
/// external hostname the client will actually reach (§4.5 BuildAccessUrls).
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub forwarded_host: Option<String>,
    pub forwarded_proto: Option<String>,
    pub host_header: Option<String>,
    pub peer_addr: Option<String>,
}

pub struct InstanceManager {
    orchestrator: Arc<dyn Orchestrator>,
    metadata: MetadataClient,
    port_pool: PortPool,
    image: String,
    internal_novnc_port: u16,
    env_default: HashMap<String, String>,
    free_max_containers: u32,
    /// Serializes name+port selection so two concurrent provisions never
    /// race on the same candidate (§5 Ordering guarantees (c)).
    provision_lock: Mutex<()>,
}

impl InstanceManager {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        metadata: MetadataClient,
        port_pool: PortPool,
        image: String,
        internal_novnc_port: u16,
        env_default: HashMap<String, String>,
        free_max_containers: u32,
    ) -> Self {
        Self {
            orchestrator,
            metadata,
            port_pool,
            image,
            internal_novnc_port,
            env_default,
            free_max_containers,
            provision_lock: Mutex::new(()),
        }
    }

    pub async fn provision(
        &self,
        principal: &Principal,
        request: CreateInstanceRequest,
        bearer_token: &str,
    ) -> Result<Instance, ProvisionError> {
        if principal.role == Role::Free {
            let count = self.metadata.count_instances(&principal.username, bearer_token).await?;
            if count >= self.free_max_containers {
                return Err(ProvisionError::QuotaExceeded);
            }
        }

        let image = request.image.clone().unwrap_or_else(|| self.image.clone());
        let mut env = self.env_default.clone();
        if let Some(extra) = &request.env {
            env.extend(extra.clone());
        }

        let _guard = self.provision_lock.lock().await;

        for _attempt in 0..MAX_PROVISION_ATTEMPTS {
            let name = format!("{}-{}", principal.username, random_hex8());

            if self.orchestrator.lookup(&name).await.is_ok() {
                continue;
            }

            let mut claimed: Option<(String, u16)> = None;
            for port in self.port_pool.candidates(|_| false) {
                let spec = CreateSpec {
                    name: name.clone(),
                    image: image.clone(),
                    env: env.clone(),
                    internal_novnc_port: self.internal_novnc_port,
                    external_novnc_port: port,
                };
                match self.orchestrator.create(spec).await {
                    Ok(handle) => {
                        claimed = Some((handle.id, port));
                        break;
                    }
                    Err(OrchestratorError::PortInUse) => {
                        let _ = self.orchestrator.destroy(&name).await;
                        continue;
                    }
                    Err(OrchestratorError::NameInUse) => {
                        let _ = self.orchestrator.destroy(&name).await;
                        break;
                    }
                    Err(other) => {
                        let _ = self.orchestrator.destroy(&name).await;
                        return Err(ProvisionError::Orchestrator(other));
                    }
                }
            }

            let Some((instance_id, port)) = claimed else {
                // Every port was in use for this name, or the name collided
                // mid-loop — try a fresh name.
                continue;
            };

            let record = InstanceRecord {
                container_id: instance_id.clone(),
                container_name: name.clone(),
                owner_username: principal.username.clone(),
                image_name: image.clone(),
                status: "Running".to_string(),
                project_name: Some(request.project_name.clone()),
                port,
            };

            if let Err(e) = self.metadata.register_instance(&record, bearer_token).await {
                // Registration failed: the instance must not become visible.
                let _ = self.orchestrator.destroy(&instance_id).await;
                return Err(ProvisionError::Metadata(e));
            }

            return Ok(Instance {
                id: instance_id,
                name,
                image,
                owner: principal.username.clone(),
                project_name: request.project_name,
                port,
            });
        }

        Err(ProvisionError::Exhausted)
    }

    pub async fn list(&self, principal: &Principal, bearer_token: &str) -> Result<serde_json::Value, MetadataError> {
        let _ = principal;
        self.metadata.list_instances(bearer_token).await
    }

    pub async fn resolve(&self, id_or_prefix: &str) -> Result<crate::orchestrator::InstanceHandle, OrchestratorError> {
        self.orchestrator.lookup(id_or_prefix).await
    }

    /// Idempotent (§8 Laws: Idempotence). Metadata deletion of an unknown
    /// id is already treated as success by `MetadataClient::delete_instance`;
    /// orchestrator destroy is idempotent by contract (§4.3).
    pub async fn teardown(&self, principal: &Principal, id: &str, bearer_token: &str) -> Result<(), MetadataError> {
        self.metadata.delete_instance(id, &principal.username, bearer_token).await?;
        if let Err(e) = self.orchestrator.destroy(id).await {
            tracing::warn!(id, error = %e, "orchestrator destroy failed during teardown");
        }
        Ok(())
    }

    pub async fn rename(
        &self,
        principal: &Principal,
        id: &str,
        project_name: &str,
        bearer_token: &str,
    ) -> Result<(), MetadataError> {
        self.metadata.rename_instance(id, &principal.username, project_name, bearer_token).await
    }

    /// Derives the external hostname via forwarded-host/proto hints, falling
    /// back to the Host header, then the peer address (§4.5 Access URL
    /// construction). The display URL's path/query are preserved exactly
    /// as the opaque wire contract the embedded noVNC server expects (§6).
    pub fn build_access_urls(&self, instance: &Instance, ctx: &HostContext, request_port: u16) -> InstanceUrls {
        let http_scheme = ctx
            .forwarded_proto
            .clone()
            .unwrap_or_else(|| "http".to_string());
        let ws_scheme = if http_scheme == "https" { "wss" } else { "ws" };

        let host = ctx
            .forwarded_host
            .clone()
            .or_else(|| ctx.host_header.clone())
            .or_else(|| ctx.peer_addr.clone().map(|a| format!("{a}:{request_port}")))
            .unwrap_or_else(|| format!("localhost:{request_port}"));

        let sid = fresh_session_id();
        let ws_url = format!("{ws_scheme}://{host}/ws?cid={}&sid={sid}", instance.id);
        let vnc_host = host.split(':').next().unwrap_or(&host);
        let vnc_url = format!(
            "{http_scheme}://{vnc_host}:{}/vnc.html?autoconnect=true&resize=scale",
            instance.port
        );

        InstanceUrls {
            cid: instance.id.clone(),
            ws_url,
            vnc_url,
        }
    }
}

fn random_hex8() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex8_is_eight_lowercase_hex_chars() {
        let h = random_hex8();
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn instance() -> Instance {
        Instance {
            id: "abc123".into(),
            name: "alice-abc123".into(),
            image: "vnc:1.0.0".into(),
            owner: "alice".into(),
            project_name: "proj".into(),
            port: 30101,
        }
    }

    fn manager() -> InstanceManager {
        InstanceManager::new(
            Arc::new(DummyOrchestrator),
            MetadataClient::new("http://localhost:9090"),
            PortPool::new(vec![30101]),
            "vnc:1.0.0".into(),
            5901,
            HashMap::new(),
            3,
        )
    }

    struct DummyOrchestrator;
    #[async_trait::async_trait]
    impl Orchestrator for DummyOrchestrator {
        fn kind(&self) -> &'static str {
            "dummy"
        }
        async fn create(&self, _s: CreateSpec) -> Result<crate::orchestrator::InstanceHandle, OrchestratorError> {
            unimplemented!()
        }
        async fn destroy(&self, _id: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn lookup(&self, _id: &str) -> Result<crate::orchestrator::InstanceHandle, OrchestratorError> {
            Err(OrchestratorError::NotFound("n/a".into()))
        }
        async fn exec(&self, _id: &str, _argv: &[String]) -> Result<crate::orchestrator::ExecOutcome, OrchestratorError> {
            unimplemented!()
        }
        async fn attach(&self, _id: &str, _argv: &[String]) -> Result<crate::orchestrator::AttachedPty, OrchestratorError> {
            unimplemented!()
        }
        async fn put_file(&self, _id: &str, _path: &str, _content: &[u8]) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn kill_by_pattern(&self, _id: &str, _pattern: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn ensure_dir(&self, _id: &str, _path: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn purge_dir(&self, _id: &str, _path: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn read_tree(&self, _id: &str, _base_path: &str) -> Result<Vec<crate::orchestrator::PathEntry>, OrchestratorError> {
            unimplemented!()
        }
        async fn move_path(&self, _id: &str, _old_path: &str, _new_path: &str) -> Result<(), OrchestratorError> {
            unimplemented!()
        }
        async fn remove_path(&self, _id: &str, _path: &str) -> Result<(), OrchestratorError> {
            unimplemented!()
        }
    }

    #[test]
    fn build_access_urls_prefers_forwarded_host_and_proto() {
        let ctx = HostContext {
            forwarded_host: Some("sandbox.example.com".into()),
            forwarded_proto: Some("https".into()),
            host_header: Some("internal:8080".into()),
            peer_addr: Some("10.0.0.5".into()),
        };
        let urls = manager().build_access_urls(&instance(), &ctx, 8080);
        assert!(urls.ws_url.starts_with("wss://sandbox.example.com/ws?cid=abc123&sid="));
        assert!(urls.vnc_url.starts_with("https://sandbox.example.com:30101/vnc.html"));
    }

    #[test]
    fn build_access_urls_falls_back_to_host_header() {
        let ctx = HostContext {
            forwarded_host: None,
            forwarded_proto: None,
            host_header: Some("workbench.local:9000".into()),
            peer_addr: Some("10.0.0.5".into()),
        };
        let urls = manager().build_access_urls(&instance(), &ctx, 9000);
        assert!(urls.ws_url.starts_with("ws://workbench.local:9000/ws"));
    }

    #[test]
    fn build_access_urls_falls_back_to_peer_address_and_request_port() {
        let ctx = HostContext {
            forwarded_host: None,
            forwarded_proto: None,
            host_header: None,
            peer_addr: Some("203.0.113.9".into()),
        };
        let urls = manager().build_access_urls(&instance(), &ctx, 8080);
        assert!(urls.ws_url.starts_with("ws://203.0.113.9:8080/ws"));
    }
}
