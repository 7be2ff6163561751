//! Typed facade over the external HTTP metadata store (§4.2): quota counts,
//! registration, listing, rename, delete. Grounded on the teacher's
//! `VmManagerClient` — trailing-slash-trimmed base URL, one method per
//! operation, explicit status-code branching, idempotent-404 delete.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata store unreachable: {0}")]
    Transport(String),
    #[error("metadata store rejected request: {status} {body}")]
    Client { status: StatusCode, body: String },
    #[error("metadata store error: {0}")]
    Server(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
    #[serde(rename = "ownerUsername")]
    pub owner_username: String,
    #[serde(rename = "imageName")]
    pub image_name: String,
    pub status: String,
    #[serde(rename = "projectName")]
    pub project_name: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct CountResponse {
    #[serde(default)]
    count: u32,
}

/// A typed HTTP client over the metadata store, carrying the caller's bearer
/// token through on every call so the store can authorize the write itself.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    base_url: String,
    client: reqwest::Client,
}

impl MetadataClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build metadata HTTP client"),
        }
    }

    fn auth(
        &self,
        builder: reqwest::RequestBuilder,
        bearer_token: &str,
    ) -> reqwest::RequestBuilder {
        builder.bearer_auth(bearer_token)
    }

    pub async fn count_instances(
        &self,
        username: &str,
        bearer_token: &str,
    ) -> Result<u32, MetadataError> {
        let url = format!("{}/internal/api/containers/count/{}", self.base_url, username);
        let resp = self
            .auth(self.client.get(&url), bearer_token)
            .send()
            .await
            .map_err(|e| MetadataError::Transport(e.to_string()))?;

        Self::check_status(&resp)?;
        let body: CountResponse = resp
            .json()
            .await
            .map_err(|e| MetadataError::Server(format!("bad count response: {e}")))?;
        Ok(body.count)
    }

    pub async fn register_instance(
        &self,
        record: &InstanceRecord,
        bearer_token: &str,
    ) -> Result<(), MetadataError> {
        let url = format!("{}/internal/api/containers", self.base_url);
        let resp = self
            .auth(self.client.post(&url).json(record), bearer_token)
            .send()
            .await
            .map_err(|e| MetadataError::Transport(e.to_string()))?;
        Self::check_status(&resp)?;
        Ok(())
    }

    pub async fn list_instances(&self, bearer_token: &str) -> Result<Value, MetadataError> {
        let url = format!("{}/internal/api/containers", self.base_url);
        let resp = self
            .auth(self.client.get(&url), bearer_token)
            .send()
            .await
            .map_err(|e| MetadataError::Transport(e.to_string()))?;
        Self::check_status(&resp)?;
        resp.json()
            .await
            .map_err(|e| MetadataError::Server(format!("bad list response: {e}")))
    }

    /// Idempotent: an unknown id is treated as success to keep teardown monotone.
    pub async fn delete_instance(
        &self,
        id: &str,
        username: &str,
        bearer_token: &str,
    ) -> Result<(), MetadataError> {
        let url = format!("{}/internal/api/containers/{id}/owner/{username}", self.base_url);
        let resp = self
            .auth(self.client.delete(&url), bearer_token)
            .send()
            .await
            .map_err(|e| MetadataError::Transport(e.to_string()))?;

        if resp.status().as_u16() == 404 {
            tracing::warn!(id, "metadata record already absent on delete");
            return Ok(());
        }
        Self::check_status(&resp)?;
        Ok(())
    }

    pub async fn rename_instance(
        &self,
        id: &str,
        username: &str,
        project_name: &str,
        bearer_token: &str,
    ) -> Result<(), MetadataError> {
        let url = format!("{}/internal/api/containers/{id}/owner/{username}", self.base_url);
        let resp = self
            .auth(
                self.client
                    .patch(&url)
                    .json(&serde_json::json!({ "projectName": project_name })),
                bearer_token,
            )
            .send()
            .await
            .map_err(|e| MetadataError::Transport(e.to_string()))?;
        Self::check_status(&resp)?;
        Ok(())
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), MetadataError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_client_error() {
            return Err(MetadataError::Client {
                status,
                body: status.canonical_reason().unwrap_or("client error").to_string(),
            });
        }
        Err(MetadataError::Server(format!("metadata store returned {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let c = MetadataClient::new("http://example.com:9090/");
        assert_eq!(c.base_url, "http://example.com:9090");
    }

    #[test]
    fn instance_record_serializes_expected_fields() {
        let record = InstanceRecord {
            container_id: "alice-abc12345".into(),
            container_name: "alice-abc12345".into(),
            owner_username: "alice".into(),
            image_name: "jaewoo6257/vnc:1.0.0".into(),
            status: "Running".into(),
            project_name: Some("my-project".into()),
            port: 30101,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["containerId"], "alice-abc12345");
        assert_eq!(json["ownerUsername"], "alice");
        assert_eq!(json["port"], 30101);
    }
}
