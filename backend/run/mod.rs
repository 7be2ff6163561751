//! Run Coordinator (§4.9): materializes the workspace, injects the run
//! command into the live PTY, and classifies the launched program as
//! graphical or terminal. Does not carry program output back in its
//! response — the terminal user observes it through the same PTY that
//! received the command (§4.9, an intentional property: the shell is the
//! single serializer between human typing and command injection).

use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::scaffold::python_bin;
use crate::sessions::{SessionKey, SessionRegistry};
use crate::workspace::{self, FileMap, MaterializeError, TreeNode};

const GRAPHICAL_PROBE_ATTEMPTS: u32 = 5;
const GRAPHICAL_PROBE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no live session for this instance/session id")]
    NoSession,
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Graphical,
    Terminal,
}

// Wire values are `"gui"`/`"cli"` (§6), not the variant names.
impl Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Mode::Graphical => s.serialize_str("gui"),
            Mode::Terminal => s.serialize_str("cli"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub mode: Mode,
}

pub struct RunCoordinator {
    orchestrator: std::sync::Arc<dyn Orchestrator>,
    sessions: std::sync::Arc<SessionRegistry>,
    workspace_base: String,
    purge_on_run: bool,
}

impl RunCoordinator {
    pub fn new(
        orchestrator: std::sync::Arc<dyn Orchestrator>,
        sessions: std::sync::Arc<SessionRegistry>,
        workspace_base: String,
        purge_on_run: bool,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            workspace_base,
            purge_on_run,
        }
    }

    pub async fn run(
        &self,
        instance_id: &str,
        session_id: &str,
        tree: &TreeNode,
        file_map: &FileMap,
        entry_id: &str,
    ) -> Result<RunOutcome, RunError> {
        let key: SessionKey = (instance_id.to_string(), session_id.to_string());
        let handle = self.sessions.get(&key).await.ok_or(RunError::NoSession)?;

        if self.purge_on_run {
            self.orchestrator.purge_dir(instance_id, &self.workspace_base).await?;
        } else {
            self.orchestrator.ensure_dir(instance_id, &self.workspace_base).await?;
        }

        let entry_path = workspace::materialize(
            self.orchestrator.as_ref(),
            instance_id,
            &self.workspace_base,
            tree,
            file_map,
            entry_id,
        )
        .await?;

        // Best-effort: end whatever the previous run left behind.
        let _ = self.orchestrator.kill_by_pattern(instance_id, &self.workspace_base).await;

        let command = format!("{} '{}'\n", python_bin(), entry_path);
        {
            let mut writer = handle.writer.lock().await;
            writer
                .write_all(command.as_bytes())
                .await
                .map_err(|e| RunError::Orchestrator(OrchestratorError::Internal(e.to_string())))?;
            writer
                .flush()
                .await
                .map_err(|e| RunError::Orchestrator(OrchestratorError::Internal(e.to_string())))?;
        }

        let mode = self.probe_graphical(instance_id).await;
        Ok(RunOutcome { mode })
    }

    /// Probes up to 5 times at 200ms intervals; any `yes` short-circuits to
    /// `Graphical` (§4.9 step 6, §5 Cancellation & timeouts: bounded to
    /// 5x200ms uniformly — SPEC_FULL §9 resolves this as a fixed constant,
    /// not configuration).
    async fn probe_graphical(&self, instance_id: &str) -> Mode {
        let probe_argv = vec![
            "bash".into(),
            "-c".into(),
            "DISPLAY=:1 xwininfo -root -tree | grep -E '\"[^ ]+\"' && echo yes || echo no".to_string(),
        ];

        for attempt in 0..GRAPHICAL_PROBE_ATTEMPTS {
            match self.orchestrator.exec(instance_id, &probe_argv).await {
                Ok(outcome) if outcome.stdout.trim() == "yes" => return Mode::Graphical,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(instance_id, error = %e, "graphical probe exec failed");
                }
            }
            if attempt + 1 < GRAPHICAL_PROBE_ATTEMPTS {
                tokio::time::sleep(GRAPHICAL_PROBE_INTERVAL).await;
            }
        }
        Mode::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{AttachedPty, CreateSpec, ExecOutcome, InstanceHandle};
    use crate::sessions::SessionHandle;
    use crate::workspace::{FileMeta, NodeKind};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeOrchestrator {
        graphical_after_attempt: Option<u32>,
        probes: StdMutex<u32>,
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        fn kind(&self) -> &'static str {
            "fake"
        }
        async fn create(&self, _s: CreateSpec) -> Result<InstanceHandle, OrchestratorError> {
            unimplemented!()
        }
        async fn destroy(&self, _id: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn lookup(&self, _id: &str) -> Result<InstanceHandle, OrchestratorError> {
            unimplemented!()
        }
        async fn exec(&self, _id: &str, _argv: &[String]) -> Result<ExecOutcome, OrchestratorError> {
            let mut probes = self.probes.lock().unwrap();
            *probes += 1;
            let is_yes = self.graphical_after_attempt == Some(*probes);
            Ok(ExecOutcome {
                exit_code: Some(0),
                stdout: if is_yes { "yes".into() } else { "no".into() },
                stderr: String::new(),
            })
        }
        async fn attach(&self, _id: &str, _argv: &[String]) -> Result<AttachedPty, OrchestratorError> {
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

    fn simple_tree() -> (TreeNode, FileMap) {
        let tree = TreeNode {
            id: "root".into(),
            kind: NodeKind::Folder,
            children: vec![TreeNode { id: "a.py".into(), kind: NodeKind::File, children: vec![] }],
        };
        let mut map = FileMap::new();
        map.insert("root".into(), FileMeta { name: "".into(), kind: NodeKind::Folder, content: None });
        map.insert("a.py".into(), FileMeta { name: "a.py".into(), kind: NodeKind::File, content: Some("print(1)".into()) });
        (tree, map)
    }

    #[tokio::test]
    async fn no_session_fails_fast() {
        let orch = std::sync::Arc::new(FakeOrchestrator { graphical_after_attempt: None, probes: StdMutex::new(0) });
        let sessions = std::sync::Arc::new(SessionRegistry::new());
        let coordinator = RunCoordinator::new(orch, sessions, "/home/user/workspace".into(), false);
        let (tree, map) = simple_tree();
        let err = coordinator.run("inst-1", "sess-1", &tree, &map, "a.py").await.unwrap_err();
        assert!(matches!(err, RunError::NoSession));
    }

    #[tokio::test]
    async fn terminal_mode_when_no_window_ever_appears() {
        let orch = std::sync::Arc::new(FakeOrchestrator { graphical_after_attempt: None, probes: StdMutex::new(0) });
        let sessions = std::sync::Arc::new(SessionRegistry::new());
        let key: SessionKey = ("inst-1".into(), "sess-1".into());
        sessions.insert_pending(key.clone()).await.unwrap();
        let (writer, _reader) = tokio::io::duplex(4096);
        sessions.attach(&key, SessionHandle::new(Box::pin(writer))).await;

        let coordinator = RunCoordinator::new(orch, sessions, "/home/user/workspace".into(), false);
        let (tree, map) = simple_tree();
        let outcome = coordinator.run("inst-1", "sess-1", &tree, &map, "a.py").await.unwrap();
        assert_eq!(outcome.mode, Mode::Terminal);
    }

    #[tokio::test]
    async fn graphical_mode_when_window_appears_on_second_probe() {
        let orch = std::sync::Arc::new(FakeOrchestrator { graphical_after_attempt: Some(2), probes: StdMutex::new(0) });
        let sessions = std::sync::Arc::new(SessionRegistry::new());
        let key: SessionKey = ("inst-1".into(), "sess-1".into());
        sessions.insert_pending(key.clone()).await.unwrap();
        let (writer, _reader) = tokio::io::duplex(4096);
        sessions.attach(&key, SessionHandle::new(Box::pin(writer))).await;

        let coordinator = RunCoordinator::new(orch, sessions, "/home/user/workspace".into(), false);
        let (tree, map) = simple_tree();
        let outcome = coordinator.run("inst-1", "sess-1", &tree, &map, "a.py").await.unwrap();
        assert_eq!(outcome.mode, Mode::Graphical);
    }

    #[tokio::test]
    async fn command_is_written_to_the_session_pty() {
        let orch = std::sync::Arc::new(FakeOrchestrator { graphical_after_attempt: None, probes: StdMutex::new(0) });
        let sessions = std::sync::Arc::new(SessionRegistry::new());
        let key: SessionKey = ("inst-1".into(), "sess-1".into());
        sessions.insert_pending(key.clone()).await.unwrap();
        let (writer, mut reader) = tokio::io::duplex(4096);
        sessions.attach(&key, SessionHandle::new(Box::pin(writer))).await;

        let coordinator = RunCoordinator::new(orch, sessions, "/home/user/workspace".into(), false);
        let (tree, map) = simple_tree();
        coordinator.run("inst-1", "sess-1", &tree, &map, "a.py").await.unwrap();

        let mut buf = vec![0u8; 256];
        use tokio::io::AsyncReadExt;
        let n = reader.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]);
        assert!(written.contains("workspace/a.py"));
        assert!(written.ends_with('\n'));
    }
}
