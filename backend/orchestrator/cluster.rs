//! Cluster-runtime Orchestrator Adapter backend: talks to Kubernetes via
//! `kube`/`k8s-openapi`. Grounded on the original source's `k8s_vnc.py`
//! (one Pod + one NodePort Service per instance, labelled by owner/instance)
//! and on idiomatic `kube::Api` usage for typed create/list/exec/attach.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, ObjectMeta, PostParams};

use super::{AttachedPty, CreateSpec, ExecOutcome, InstanceHandle, Orchestrator, OrchestratorError};

const APP_LABEL: &str = "app.workbench/component";
const APP_VALUE: &str = "vnc-session";
const OWNER_LABEL: &str = "app.workbench/owner";
const INSTANCE_LABEL: &str = "app.workbench/instance";

pub struct ClusterOrchestrator {
    client: Client,
    namespace: String,
}

impl ClusterOrchestrator {
    pub async fn connect(namespace: String) -> Result<Self, OrchestratorError> {
        let client = Client::try_default()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("kube client init failed: {e}")))?;
        Ok(Self { client, namespace })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn service_name(pod_name: &str) -> String {
        format!("{pod_name}-svc")
    }

    async fn resolve(&self, id_or_prefix: &str) -> Result<String, OrchestratorError> {
        if self.pods().get(id_or_prefix).await.is_ok() {
            return Ok(id_or_prefix.to_string());
        }

        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("{APP_LABEL}={APP_VALUE}")))
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let matches: Vec<String> = pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .filter(|name| name.starts_with(id_or_prefix))
            .collect();

        match matches.len() {
            0 => Err(OrchestratorError::NotFound(id_or_prefix.to_string())),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(OrchestratorError::Ambiguous(id_or_prefix.to_string())),
        }
    }
}

#[async_trait]
impl Orchestrator for ClusterOrchestrator {
    fn kind(&self) -> &'static str {
        "cluster-k8s"
    }

    async fn create(&self, spec: CreateSpec) -> Result<InstanceHandle, OrchestratorError> {
        if self.pods().get(&spec.name).await.is_ok() {
            return Err(OrchestratorError::NameInUse);
        }

        let svc_name = Self::service_name(&spec.name);

        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), APP_VALUE.to_string());
        labels.insert(OWNER_LABEL.to_string(), spec.name.clone());
        labels.insert(INSTANCE_LABEL.to_string(), spec.name.clone());

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "vnc".to_string(),
                    image: Some(spec.image.clone()),
                    env: Some(env),
                    ports: Some(vec![ContainerPort {
                        container_port: spec.internal_novnc_port as i32,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                termination_grace_period_seconds: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| classify_kube_error(e, OrchestratorError::NameInUse))?;

        let service = Service {
            metadata: ObjectMeta {
                name: Some(svc_name),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some("novnc".to_string()),
                    port: spec.internal_novnc_port as i32,
                    target_port: Some(IntOrString::Int(spec.internal_novnc_port as i32)),
                    node_port: Some(spec.external_novnc_port as i32),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        if let Err(e) = self.services().create(&PostParams::default(), &service).await {
            let _ = self.pods().delete(&spec.name, &DeleteParams::default()).await;
            return Err(classify_kube_error(e, OrchestratorError::PortInUse));
        }

        let id = created.metadata.name.clone().unwrap_or(spec.name.clone());
        Ok(InstanceHandle {
            id,
            name: spec.name,
        })
    }

    async fn destroy(&self, id: &str) -> Result<(), OrchestratorError> {
        let svc_name = Self::service_name(id);
        // Best-effort, matching the original's delete_vnc_pod_and_service.
        let _ = self.services().delete(&svc_name, &DeleteParams::default()).await;
        match self.pods().delete(id, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(OrchestratorError::Internal(e.to_string())),
        }
    }

    async fn lookup(&self, id_or_prefix: &str) -> Result<InstanceHandle, OrchestratorError> {
        let id = self.resolve(id_or_prefix).await?;
        Ok(InstanceHandle {
            id: id.clone(),
            name: id,
        })
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutcome, OrchestratorError> {
        let full_id = self.resolve(id).await?;
        let ap = AttachParams::default().stdout(true).stderr(true);
        let mut attached = self
            .pods()
            .exec(&full_id, argv.to_vec(), &ap)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let mut stdout = String::new();
        if let Some(mut out) = attached.stdout() {
            use tokio::io::AsyncReadExt;
            let _ = out.read_to_string(&mut stdout).await;
        }

        // The exec stream's terminal status carries success/failure; a
        // missing status (stream dropped before completion) is treated as
        // unknown rather than failure, matching the adapter's "never guess"
        // posture for orchestrator-reported state.
        let exit_code = match attached.take_status() {
            Some(status_fut) => status_fut.await.map(|s| if s.status.as_deref() == Some("Success") { 0 } else { 1 }),
            None => None,
        };

        Ok(ExecOutcome {
            exit_code,
            stdout,
            stderr: String::new(),
        })
    }

    async fn attach(&self, id: &str, argv: &[String]) -> Result<AttachedPty, OrchestratorError> {
        let full_id = self.resolve(id).await?;
        let ap = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .tty(true);
        let mut attached = self
            .pods()
            .exec(&full_id, argv.to_vec(), &ap)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let writer = attached
            .stdin()
            .ok_or_else(|| OrchestratorError::Internal("exec stream has no stdin".into()))?;
        let reader = attached
            .stdout()
            .ok_or_else(|| OrchestratorError::Internal("exec stream has no stdout".into()))?;

        Ok(AttachedPty {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        })
    }

    async fn put_file(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), OrchestratorError> {
        let full_id = self.resolve(id).await?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            self.ensure_dir(&full_id, &parent.to_string_lossy()).await?;
        }

        let ap = AttachParams::default().stdin(true).stdout(true).stderr(true);
        let mut attached = self
            .pods()
            .exec(&full_id, vec!["cp".into(), "/dev/stdin".into(), path.to_string()], &ap)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        if let Some(mut stdin) = attached.stdin() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(content)
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn kill_by_pattern(&self, id: &str, pattern: &str) -> Result<(), OrchestratorError> {
        let _ = self
            .exec(
                id,
                &["bash".into(), "-c".into(), format!("pkill -f '{pattern}' || true")],
            )
            .await?;
        Ok(())
    }

    async fn ensure_dir(&self, id: &str, path: &str) -> Result<(), OrchestratorError> {
        let outcome = self
            .exec(id, &["mkdir".into(), "-p".into(), path.to_string()])
            .await?;
        if outcome.succeeded() || outcome.exit_code.is_none() {
            Ok(())
        } else {
            Err(OrchestratorError::Internal(format!("mkdir -p {path} failed")))
        }
    }

    async fn purge_dir(&self, id: &str, path: &str) -> Result<(), OrchestratorError> {
        let _ = self
            .exec(
                id,
                &[
                    "bash".into(),
                    "-c".into(),
                    format!("rm -rf '{path}'/* '{path}'/.[!.]* 2>/dev/null || true"),
                ],
            )
            .await?;
        self.ensure_dir(id, path).await
    }

    async fn read_tree(&self, id: &str, base_path: &str) -> Result<Vec<super::PathEntry>, OrchestratorError> {
        super::local::read_tree_via_exec(self, id, base_path).await
    }

    async fn move_path(&self, id: &str, old_path: &str, new_path: &str) -> Result<(), OrchestratorError> {
        super::local::move_path_via_exec(self, id, old_path, new_path).await
    }

    async fn remove_path(&self, id: &str, path: &str) -> Result<(), OrchestratorError> {
        super::local::remove_path_via_exec(self, id, path).await
    }
}

fn classify_kube_error(e: kube::Error, on_conflict: OrchestratorError) -> OrchestratorError {
    match e {
        kube::Error::Api(resp) if resp.code == 409 => on_conflict,
        other => OrchestratorError::Internal(other.to_string()),
    }
}
