//! Workspace Materializer (§4.8): serializes a client-supplied FileTree into
//! files/folders inside an instance, rooted at a fixed base path, and
//! reports the absolute path of the designated entry node.
//!
//! Departs from the original source's shell-level `echo`+quote-escaping in
//! one place only: content reaches the instance via the Orchestrator's
//! `put_file` (a direct, binary-safe write), per the source's own design
//! note (spec.md §4.8, §9). Everything else — the recursive pre-order walk,
//! path-stack push/pop for named folders, pass-through for the synthetic
//! empty-name root, entry-path capture on id match — is unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::orchestrator::{Orchestrator, OrchestratorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// The `tree` half of the payload (§6): structure only, ids and children.
/// Also produced by `tree_from_entries` for the `GET /files/{id}` read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

/// One entry of the `fileMap` half of the payload (§6): per-id name/content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub content: Option<String>,
}

pub type FileMap = HashMap<String, FileMeta>;

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("entry node not found in tree")]
    NoEntry,
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Rebuilds a `(TreeNode, FileMap)` pair from a flat `Orchestrator::read_tree`
/// listing, for `GET /files/{id}` (§9 design notes: the read-back path is
/// the mirror image of `materialize`, reconstructed rather than cached since
/// the instance's disk is the source of truth).
pub fn tree_from_entries(entries: Vec<crate::orchestrator::PathEntry>) -> (TreeNode, FileMap) {
    let root_id = String::new();

    let mut file_map = FileMap::new();
    file_map.insert(root_id.clone(), FileMeta { name: String::new(), kind: NodeKind::Folder, content: None });

    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();

    for entry in &entries {
        let id = entry.relative_path.clone();
        let (parent_id, name) = match entry.relative_path.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (root_id.clone(), entry.relative_path.clone()),
        };
        let kind = if entry.is_dir { NodeKind::Folder } else { NodeKind::File };

        file_map.insert(id.clone(), FileMeta { name, kind, content: entry.content.clone() });
        children_of.entry(parent_id).or_default().push(id);
    }

    let root = build_node(&root_id, NodeKind::Folder, &children_of, &file_map);
    (root, file_map)
}

/// Builds one node of the tree, recursing depth-first into `children_of`.
fn build_node(
    id: &str,
    kind: NodeKind,
    children_of: &HashMap<String, Vec<String>>,
    file_map: &FileMap,
) -> TreeNode {
    let mut children: Vec<TreeNode> = children_of
        .get(id)
        .into_iter()
        .flatten()
        .map(|child_id| {
            let child_kind = file_map.get(child_id).map(|m| m.kind).unwrap_or(NodeKind::File);
            build_node(child_id, child_kind, children_of, file_map)
        })
        .collect();
    children.sort_by(|a, b| a.id.cmp(&b.id));

    TreeNode {
        id: id.to_string(),
        kind,
        children,
    }
}

/// Materializes `tree`/`file_map` under `base_path` inside `instance_id`,
/// returning the absolute path of the node whose id equals `entry_id`.
///
/// The caller (Run Coordinator) is responsible for ensuring `base_path`
/// exists and for the preserve-vs-purge policy before calling this (§4.8:
/// "the caller decides whether to clear the base path first").
pub async fn materialize(
    orchestrator: &dyn Orchestrator,
    instance_id: &str,
    base_path: &str,
    tree: &TreeNode,
    file_map: &FileMap,
    entry_id: &str,
) -> Result<String, MaterializeError> {
    let mut entry_path: Option<String> = None;
    walk(orchestrator, instance_id, base_path.trim_end_matches('/'), tree, file_map, entry_id, &mut entry_path).await?;
    entry_path.ok_or(MaterializeError::NoEntry)
}

// Async recursion needs an explicit boxed future — `async fn` can't recurse
// directly since its own future would be infinitely sized.
fn walk<'a>(
    orchestrator: &'a dyn Orchestrator,
    instance_id: &'a str,
    path_so_far: &'a str,
    node: &'a TreeNode,
    file_map: &'a FileMap,
    entry_id: &'a str,
    entry_path: &'a mut Option<String>,
) -> Pin<Box<dyn Future<Output = Result<(), MaterializeError>> + 'a>> {
    Box::pin(async move {
        match node.kind {
            NodeKind::Folder => {
                let name = file_map.get(&node.id).map(|m| m.name.as_str()).unwrap_or("");
                let next_path = if name.is_empty() {
                    // Synthetic root: pass through without touching the path.
                    path_so_far.to_string()
                } else {
                    let joined = format!("{path_so_far}/{name}");
                    orchestrator.ensure_dir(instance_id, &joined).await?;
                    joined
                };
                for child in &node.children {
                    walk(orchestrator, instance_id, &next_path, child, file_map, entry_id, entry_path).await?;
                }
            }
            NodeKind::File => {
                let meta = file_map.get(&node.id);
                let name = meta.map(|m| m.name.as_str()).unwrap_or(&node.id);
                let content = meta.and_then(|m| m.content.as_deref()).unwrap_or("");
                let full_path = format!("{path_so_far}/{name}");
                orchestrator.put_file(instance_id, &full_path, content.as_bytes()).await?;
                if node.id == entry_id {
                    *entry_path = Some(full_path);
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{AttachedPty, CreateSpec, ExecOutcome, InstanceHandle};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every directory created and file written, instead of talking
    /// to a real runtime — enough to assert the Materializer's own logic.
    #[derive(Default)]
    struct RecordingOrchestrator {
        dirs: Mutex<Vec<String>>,
        files: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Orchestrator for RecordingOrchestrator {
        fn kind(&self) -> &'static str {
            "recording"
        }
        async fn create(&self, _spec: CreateSpec) -> Result<InstanceHandle, OrchestratorError> {
            unimplemented!()
        }
        async fn destroy(&self, _id: &str) -> Result<(), OrchestratorError> {
            unimplemented!()
        }
        async fn lookup(&self, _id: &str) -> Result<InstanceHandle, OrchestratorError> {
            unimplemented!()
        }
        async fn exec(&self, _id: &str, _argv: &[String]) -> Result<ExecOutcome, OrchestratorError> {
            unimplemented!()
        }
        async fn attach(&self, _id: &str, _argv: &[String]) -> Result<AttachedPty, OrchestratorError> {
            unimplemented!()
        }
        async fn put_file(&self, _id: &str, path: &str, content: &[u8]) -> Result<(), OrchestratorError> {
            self.files.lock().unwrap().push((path.to_string(), content.to_vec()));
            Ok(())
        }
        async fn kill_by_pattern(&self, _id: &str, _pattern: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn ensure_dir(&self, _id: &str, path: &str) -> Result<(), OrchestratorError> {
            self.dirs.lock().unwrap().push(path.to_string());
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

    fn sample() -> (TreeNode, FileMap, String) {
        let tree = TreeNode {
            id: "root".into(),
            kind: NodeKind::Folder,
            children: vec![
                TreeNode {
                    id: "a.py".into(),
                    kind: NodeKind::File,
                    children: vec![],
                },
                TreeNode {
                    id: "sub".into(),
                    kind: NodeKind::Folder,
                    children: vec![TreeNode {
                        id: "b.py".into(),
                        kind: NodeKind::File,
                        children: vec![],
                    }],
                },
            ],
        };
        let mut map = FileMap::new();
        map.insert("root".into(), FileMeta { name: "".into(), kind: NodeKind::Folder, content: None });
        map.insert("a.py".into(), FileMeta { name: "a.py".into(), kind: NodeKind::File, content: Some("print(1)".into()) });
        map.insert("sub".into(), FileMeta { name: "sub".into(), kind: NodeKind::Folder, content: None });
        map.insert("b.py".into(), FileMeta { name: "b.py".into(), kind: NodeKind::File, content: Some("print(2)".into()) });
        (tree, map, "b.py".to_string())
    }

    #[tokio::test]
    async fn materializes_nested_tree_and_reports_entry_path() {
        let orch = RecordingOrchestrator::default();
        let (tree, map, entry) = sample();
        let path = materialize(&orch, "inst-1", "/home/user/workspace", &tree, &map, &entry)
            .await
            .unwrap();
        assert_eq!(path, "/home/user/workspace/sub/b.py");

        let files = orch.files.lock().unwrap();
        assert!(files.iter().any(|(p, c)| p == "/home/user/workspace/a.py" && c == b"print(1)"));
        assert!(files.iter().any(|(p, c)| p == "/home/user/workspace/sub/b.py" && c == b"print(2)"));

        let dirs = orch.dirs.lock().unwrap();
        assert!(dirs.iter().any(|d| d == "/home/user/workspace/sub"));
        // Synthetic root never gets its own mkdir.
        assert!(!dirs.iter().any(|d| d.ends_with("/workspace/")));
    }

    #[tokio::test]
    async fn missing_entry_id_fails() {
        let orch = RecordingOrchestrator::default();
        let (tree, map, _) = sample();
        let err = materialize(&orch, "inst-1", "/home/user/workspace", &tree, &map, "does-not-exist")
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::NoEntry));
    }

    #[test]
    fn tree_from_entries_rebuilds_nested_structure() {
        use crate::orchestrator::PathEntry;

        let entries = vec![
            PathEntry { relative_path: "a.py".into(), is_dir: false, content: Some("print(1)".into()) },
            PathEntry { relative_path: "sub".into(), is_dir: true, content: None },
            PathEntry { relative_path: "sub/b.py".into(), is_dir: false, content: Some("print(2)".into()) },
        ];

        let (root, file_map) = tree_from_entries(entries);
        assert_eq!(root.kind, NodeKind::Folder);
        assert_eq!(root.children.len(), 2);

        let a = root.children.iter().find(|n| n.id == "a.py").unwrap();
        assert_eq!(a.kind, NodeKind::File);
        assert_eq!(file_map[&a.id].content.as_deref(), Some("print(1)"));

        let sub = root.children.iter().find(|n| n.id == "sub").unwrap();
        assert_eq!(sub.kind, NodeKind::Folder);
        assert_eq!(sub.children.len(), 1);
        assert_eq!(sub.children[0].id, "sub/b.py");
        assert_eq!(file_map[&sub.children[0].id].content.as_deref(), Some("print(2)"));
    }

    #[tokio::test]
    async fn single_file_tree_entry_is_the_file_itself() {
        let orch = RecordingOrchestrator::default();
        let tree = TreeNode { id: "root".into(), kind: NodeKind::Folder, children: vec![TreeNode {
            id: "only.py".into(),
            kind: NodeKind::File,
            children: vec![],
        }] };
        let mut map = FileMap::new();
        map.insert("root".into(), FileMeta { name: "".into(), kind: NodeKind::Folder, content: None });
        map.insert("only.py".into(), FileMeta { name: "only.py".into(), kind: NodeKind::File, content: Some("x = 1".into()) });

        let path = materialize(&orch, "inst-1", "/ws", &tree, &map, "only.py").await.unwrap();
        assert_eq!(path, "/ws/only.py");
    }
}
