//! Session Registry (§4.6): an indexed table keyed by `(instance id, session
//! id)` mapping to a PTY handle. The only process-wide mutable structure in
//! the broker — guarded by a single table-level lock, never exposed as
//! free-floating state (§9 Design Notes).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, RwLock};

/// `(instance id, session id)` — unique among live sessions (§3 Session).
pub type SessionKey = (String, String);

/// The write half of an attached PTY, shared between the Run Coordinator
/// (command injection) and the ingress pump (user keystrokes). Both writers
/// serialize through the same mutex so the shell sees one ordered stream.
pub type SharedPtyWriter = Arc<Mutex<Pin<Box<dyn AsyncWrite + Send>>>>;

#[derive(Clone)]
pub struct SessionHandle {
    pub writer: SharedPtyWriter,
    pub attached_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(writer: Pin<Box<dyn AsyncWrite + Send>>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            attached_at: Utc::now(),
        }
    }
}

/// A slot reserved by `insert_pending` before the PTY is actually attached
/// (§4.7 steps 3 and 6: reserve the key, then install the handle once the
/// shell is live).
enum Slot {
    Pending,
    Attached(SessionHandle),
}

#[derive(Debug, thiserror::Error)]
#[error("session id already in use")]
pub struct Conflict;

#[derive(Default)]
pub struct SessionRegistry {
    table: RwLock<HashMap<SessionKey, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `key` with no handle yet. Fails `Conflict` if the key is
    /// already present — the caller must reject the new channel without
    /// disturbing the incumbent (§4.6, §8 Session uniqueness).
    pub async fn insert_pending(&self, key: SessionKey) -> Result<(), Conflict> {
        let mut table = self.table.write().await;
        if table.contains_key(&key) {
            return Err(Conflict);
        }
        table.insert(key, Slot::Pending);
        Ok(())
    }

    /// Installs the live PTY handle into a previously reserved slot.
    pub async fn attach(&self, key: &SessionKey, handle: SessionHandle) {
        let mut table = self.table.write().await;
        table.insert(key.clone(), Slot::Attached(handle));
    }

    pub async fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        let table = self.table.read().await;
        match table.get(key) {
            Some(Slot::Attached(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub async fn remove(&self, key: &SessionKey) {
        let mut table = self.table.write().await;
        table.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }
}

/// Mints a fresh 128-bit random hex session id, shared by the PTY Broker
/// (when `sid` is absent) and `BuildAccessUrls` (when quoting a fresh id in
/// a terminal URL ahead of the client ever connecting).
pub fn fresh_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn key(instance: &str, sid: &str) -> SessionKey {
        (instance.to_string(), sid.to_string())
    }

    #[tokio::test]
    async fn insert_then_conflict() {
        let registry = SessionRegistry::new();
        registry.insert_pending(key("i1", "s1")).await.unwrap();
        assert!(registry.insert_pending(key("i1", "s1")).await.is_err());
    }

    #[tokio::test]
    async fn different_instances_do_not_conflict_on_same_sid() {
        let registry = SessionRegistry::new();
        registry.insert_pending(key("i1", "s1")).await.unwrap();
        assert!(registry.insert_pending(key("i2", "s1")).await.is_ok());
    }

    #[tokio::test]
    async fn attach_then_get_then_remove() {
        let registry = SessionRegistry::new();
        let k = key("i1", "s1");
        registry.insert_pending(k.clone()).await.unwrap();
        assert!(registry.get(&k).await.is_none());

        let (writer, _reader) = tokio::io::duplex(64);
        let handle = SessionHandle::new(Box::pin(writer));
        registry.attach(&k, handle).await;
        assert!(registry.get(&k).await.is_some());

        registry.remove(&k).await;
        assert!(registry.get(&k).await.is_none());
        // Conflict resolved: a fresh insert under the same key now succeeds.
        assert!(registry.insert_pending(k).await.is_ok());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.remove(&key("ghost", "ghost")).await;
        registry.remove(&key("ghost", "ghost")).await;
    }

    #[tokio::test]
    async fn shared_writer_serializes_concurrent_writes() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let handle = SessionHandle::new(Box::pin(writer));
        {
            let mut w = handle.writer.lock().await;
            w.write_all(b"hello ").await.unwrap();
        }
        {
            let mut w = handle.writer.lock().await;
            w.write_all(b"world").await.unwrap();
        }
        let mut buf = [0u8; 11];
        use tokio::io::AsyncReadExt;
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn fresh_session_ids_are_unique_hex() {
        let a = fresh_session_id();
        let b = fresh_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
