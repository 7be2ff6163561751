//! Orchestrator Adapter (§4.3): a uniform capability set over either the
//! local container runtime or a Kubernetes cluster. Callers never branch on
//! backend kind — they hold a `Arc<dyn Orchestrator>` and nothing else.

pub mod cluster;
pub mod local;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("external port already bound")]
    PortInUse,
    #[error("instance name already in use")]
    NameInUse,
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("ambiguous instance id prefix: {0}")]
    Ambiguous(String),
    #[error("orchestrator error: {0}")]
    Internal(String),
}

/// What to bind and how, for a single `Create` call.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub internal_novnc_port: u16,
    pub external_novnc_port: u16,
}

/// A handle to a created or looked-up instance. Opaque beyond id/name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: String,
    pub name: String,
}

/// Result of a short, non-interactive `Exec`.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A bidirectional byte stream attached to an interactive shell with TTY
/// semantics. `Read`/`Write`/`Close` per §4.3; no framing is imposed here.
pub struct AttachedPty {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub writer: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Fails `PortInUse` when the external port is already bound at the
    /// runtime level, `NameInUse` when the name collides, else `Internal`.
    /// Never retries — retry policy lives in the Instance Manager.
    async fn create(&self, spec: CreateSpec) -> Result<InstanceHandle, OrchestratorError>;

    /// Idempotent.
    async fn destroy(&self, id: &str) -> Result<(), OrchestratorError>;

    /// Prefix matching accepts a unique prefix; ambiguous prefixes fail.
    async fn lookup(&self, id_or_prefix: &str) -> Result<InstanceHandle, OrchestratorError>;

    /// Short, non-interactive command for scaffold checks and probes.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutcome, OrchestratorError>;

    /// Spawns an interactive process with a TTY attached.
    async fn attach(&self, id: &str, argv: &[String]) -> Result<AttachedPty, OrchestratorError>;

    /// Writes `content` to `path` inside the instance's materialized
    /// filesystem. Replaces the original's shell `echo`+quote-escaping with
    /// a direct, binary-safe write (§4.8 design note).
    async fn put_file(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), OrchestratorError>;

    /// Best-effort kill of any process whose command line matches `pattern`
    /// (used by the Run Coordinator to end a previous run, §4.9 step 4).
    async fn kill_by_pattern(&self, id: &str, pattern: &str) -> Result<(), OrchestratorError>;

    /// Ensures a directory exists, creating parents as needed.
    async fn ensure_dir(&self, id: &str, path: &str) -> Result<(), OrchestratorError>;

    /// Removes everything under `path` (used by the purge workspace policy).
    async fn purge_dir(&self, id: &str, path: &str) -> Result<(), OrchestratorError>;

    /// Lists every entry under `base_path` (relative paths, depth-first) with
    /// file contents inlined, so the API surface can read a workspace back
    /// as a FileTree (`GET /files/{id}`). Not part of the core §4 component
    /// set — an ambient read path the HTTP surface needs alongside it.
    async fn read_tree(&self, id: &str, base_path: &str) -> Result<Vec<PathEntry>, OrchestratorError>;

    /// Renames/moves a single path within the instance (`PATCH /files/{id}`).
    async fn move_path(&self, id: &str, old_path: &str, new_path: &str) -> Result<(), OrchestratorError>;

    /// Removes a single path within the instance (`DELETE /files/{id}`).
    async fn remove_path(&self, id: &str, path: &str) -> Result<(), OrchestratorError>;
}

/// One entry of a workspace listing (§9 design notes: ambient read path for
/// the `/files` HTTP surface, built the same exec-based way as the rest of
/// the adapter's filesystem operations).
#[derive(Debug, Clone)]
pub struct PathEntry {
    /// Path relative to the queried base, no leading `./`.
    pub relative_path: String,
    pub is_dir: bool,
    /// `None` for directories; lossy-UTF-8 text for files.
    pub content: Option<String>,
}

pub(crate) fn io_err(msg: impl std::fmt::Display) -> io::Error {
    io::Error::other(msg.to_string())
}
