//! Local-runtime Orchestrator Adapter backend: talks to the Docker daemon
//! via `bollard`. `Create` publishes the instance's internal noVNC port to
//! the chosen external port; `Lookup` does exact-then-unique-prefix
//! matching the way the original source's `_resolve_container_id` did.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use super::{AttachedPty, CreateSpec, ExecOutcome, InstanceHandle, Orchestrator, OrchestratorError};

pub struct LocalOrchestrator {
    docker: Docker,
    network: Option<String>,
}

impl LocalOrchestrator {
    pub fn connect(network: Option<String>) -> Result<Self, OrchestratorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| OrchestratorError::Internal(format!("docker connect failed: {e}")))?;
        Ok(Self { docker, network })
    }

    async fn resolve(&self, id_or_prefix: &str) -> Result<String, OrchestratorError> {
        // Exact match first.
        if self.docker.inspect_container(id_or_prefix, None).await.is_ok() {
            return Ok(id_or_prefix.to_string());
        }

        // Unique-prefix match over all containers (running or not).
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let matches: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.id)
            .filter(|id| id.starts_with(id_or_prefix))
            .collect();

        match matches.len() {
            0 => Err(OrchestratorError::NotFound(id_or_prefix.to_string())),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(OrchestratorError::Ambiguous(id_or_prefix.to_string())),
        }
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    fn kind(&self) -> &'static str {
        "local-docker"
    }

    async fn create(&self, spec: CreateSpec) -> Result<InstanceHandle, OrchestratorError> {
        let internal = format!("{}/tcp", spec.internal_novnc_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            internal.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.external_novnc_port.to_string()),
            }]),
        );

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: self.network.clone(),
            ..Default::default()
        };

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(internal, HashMap::new());

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify_create_error(&e))?;

        // Docker typically rejects a bound host port at start time, not at
        // create time — classify start failures the same way as create
        // failures so PortInUse/NameInUse surface correctly either way.
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify_create_error(&e))?;

        Ok(InstanceHandle {
            id: created.id,
            name: spec.name,
        })
    }

    async fn destroy(&self, id: &str) -> Result<(), OrchestratorError> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(OrchestratorError::Internal(e.to_string())),
        }
    }

    async fn lookup(&self, id_or_prefix: &str) -> Result<InstanceHandle, OrchestratorError> {
        let id = self.resolve(id_or_prefix).await?;
        let details = self
            .docker
            .inspect_container(&id, None)
            .await
            .map_err(|_| OrchestratorError::NotFound(id_or_prefix.to_string()))?;
        let name = details
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());
        Ok(InstanceHandle { id, name })
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutcome, OrchestratorError> {
        let full_id = self.resolve(id).await?;
        let exec = self
            .docker
            .create_exec(
                &full_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        {
            while let Some(Ok(chunk)) = output.next().await {
                stdout.push_str(&chunk.to_string());
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        Ok(ExecOutcome {
            exit_code: inspect.exit_code.map(|c| c as i32),
            stdout,
            stderr: String::new(),
        })
    }

    async fn attach(&self, id: &str, argv: &[String]) -> Result<AttachedPty, OrchestratorError> {
        let full_id = self.resolve(id).await?;
        let exec = self
            .docker
            .create_exec(
                &full_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => {
                let byte_stream = output.map(|item| {
                    item.map(|chunk| chunk.into_bytes())
                        .map_err(super::io_err)
                });
                let reader = Box::pin(StreamReader::new(byte_stream));
                Ok(AttachedPty {
                    reader,
                    writer: Box::pin(input),
                })
            }
            StartExecResults::Detached => {
                Err(OrchestratorError::Internal("exec started detached".into()))
            }
        }
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

        let exec = self
            .docker
            .create_exec(
                &full_id,
                CreateExecOptions {
                    cmd: Some(vec!["cp".into(), "/dev/stdin".into(), path.to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        if let StartExecResults::Attached { mut input, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
        {
            input
                .write_all(content)
                .await
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            input
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
        if outcome.succeeded() {
            Ok(())
        } else {
            Err(OrchestratorError::Internal(format!(
                "mkdir -p {path} failed: {}",
                outcome.stderr
            )))
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
        read_tree_via_exec(self, id, base_path).await
    }

    async fn move_path(&self, id: &str, old_path: &str, new_path: &str) -> Result<(), OrchestratorError> {
        move_path_via_exec(self, id, old_path, new_path).await
    }

    async fn remove_path(&self, id: &str, path: &str) -> Result<(), OrchestratorError> {
        remove_path_via_exec(self, id, path).await
    }
}

/// Shared by both backends — listing/moving/removing paths is plain shell
/// work, identical regardless of which runtime `exec` reaches into.
pub(super) async fn read_tree_via_exec(
    o: &dyn Orchestrator,
    id: &str,
    base_path: &str,
) -> Result<Vec<super::PathEntry>, OrchestratorError> {
    let listing = o
        .exec(
            id,
            &[
                "bash".into(),
                "-c".into(),
                format!("cd '{base_path}' 2>/dev/null && find . -mindepth 1 -printf '%y %P\\n' || true"),
            ],
        )
        .await?;

    let mut entries = Vec::new();
    for line in listing.stdout.lines() {
        let Some((kind, rel)) = line.split_once(' ') else { continue };
        let is_dir = kind == "d";
        let content = if is_dir {
            None
        } else {
            let full = format!("{base_path}/{rel}");
            let read = o.exec(id, &["cat".into(), full]).await?;
            Some(read.stdout)
        };
        entries.push(super::PathEntry {
            relative_path: rel.to_string(),
            is_dir,
            content,
        });
    }
    Ok(entries)
}

pub(super) async fn move_path_via_exec(
    o: &dyn Orchestrator,
    id: &str,
    old_path: &str,
    new_path: &str,
) -> Result<(), OrchestratorError> {
    let outcome = o
        .exec(id, &["mv".into(), old_path.to_string(), new_path.to_string()])
        .await?;
    if outcome.succeeded() {
        Ok(())
    } else {
        Err(OrchestratorError::Internal(format!("mv {old_path} {new_path} failed: {}", outcome.stderr)))
    }
}

pub(super) async fn remove_path_via_exec(
    o: &dyn Orchestrator,
    id: &str,
    path: &str,
) -> Result<(), OrchestratorError> {
    let outcome = o.exec(id, &["rm".into(), "-rf".into(), path.to_string()]).await?;
    if outcome.succeeded() {
        Ok(())
    } else {
        Err(OrchestratorError::Internal(format!("rm -rf {path} failed: {}", outcome.stderr)))
    }
}

fn classify_create_error(e: &bollard::errors::Error) -> OrchestratorError {
    if let bollard::errors::Error::DockerResponseServerError { status_code, message } = e {
        if *status_code == 409 {
            if message.to_lowercase().contains("port is already allocated") {
                return OrchestratorError::PortInUse;
            }
            if message.to_lowercase().contains("already in use") {
                return OrchestratorError::NameInUse;
            }
        }
    }
    OrchestratorError::Internal(e.to_string())
}
