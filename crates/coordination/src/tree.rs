//! In-memory znode tree.
//!
//! Paths are absolute and slash-separated. A node can only be created under an
//! existing parent, ephemeral nodes belong to the session that created them and
//! cannot have children, and sequential nodes get a `%010d` suffix taken from
//! the parent's child-version counter.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// How a node is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Node metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// zxid of the create
    pub czxid: i64,
    /// zxid of the last data change
    pub mzxid: i64,
    pub ctime_ms: i64,
    pub mtime_ms: i64,
    /// Data version, bumped on every `set_data`
    pub version: i32,
    /// Child version, bumped on every child create/delete
    pub cversion: i32,
    /// Owning session for ephemeral nodes, `0` otherwise
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
}

#[derive(Debug)]
struct ZNode {
    data: String,
    stat: Stat,
    children: BTreeSet<String>,
}

impl ZNode {
    fn new(data: String, zxid: i64, owner: i64) -> Self {
        let now = now_ms();
        Self {
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                ctime_ms: now,
                mtime_ms: now,
                ephemeral_owner: owner,
                data_length: data_length(&data),
                ..Stat::default()
            },
            data,
            children: BTreeSet::new(),
        }
    }
}

/// The znode tree of one coordination service instance.
#[derive(Debug)]
pub struct ZNodeTree {
    nodes: HashMap<String, ZNode>,
    ephemerals: HashMap<i64, BTreeSet<String>>,
    last_zxid: i64,
}

impl Default for ZNodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ZNodeTree {
    /// Tree holding only `/`.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_owned(), ZNode::new(String::new(), 0, 0));
        Self {
            nodes,
            ephemerals: HashMap::new(),
            last_zxid: 0,
        }
    }

    /// zxid of the last applied mutation.
    pub fn last_zxid(&self) -> i64 {
        self.last_zxid
    }

    /// Number of nodes including `/`.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Create a node and return its actual path (with sequence suffix, if any).
    ///
    /// `session_id` owns the node when `mode` is ephemeral.
    pub fn create(
        &mut self,
        path: &str,
        data: &str,
        mode: CreateMode,
        session_id: i64,
    ) -> Result<String, NodeError> {
        validate_path(path)?;
        if path == "/" {
            return Err(NodeError::NodeExists {
                path: path.to_owned(),
            });
        }
        if mode.is_ephemeral() && session_id == 0 {
            return Err(NodeError::SessionRequired);
        }

        let parent_path = parent_of(path);
        let parent = self
            .nodes
            .get(parent_path)
            .ok_or_else(|| NodeError::NoNode {
                path: parent_path.to_owned(),
            })?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(NodeError::NoChildrenForEphemerals {
                path: parent_path.to_owned(),
            });
        }

        let actual = if mode.is_sequential() {
            format!("{path}{:010}", parent.stat.cversion)
        } else {
            path.to_owned()
        };
        if self.nodes.contains_key(&actual) {
            return Err(NodeError::NodeExists { path: actual });
        }

        let zxid = self.next_zxid();
        let owner = if mode.is_ephemeral() { session_id } else { 0 };
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.insert(name_of(&actual).to_owned());
            parent.stat.cversion += 1;
            parent.stat.num_children = child_count(&parent.children);
        }
        self.nodes
            .insert(actual.clone(), ZNode::new(data.to_owned(), zxid, owner));
        if owner != 0 {
            self.ephemerals
                .entry(owner)
                .or_default()
                .insert(actual.clone());
        }
        Ok(actual)
    }

    pub fn get_data(&self, path: &str) -> Result<(String, Stat), NodeError> {
        let node = self.node(path)?;
        Ok((node.data.clone(), node.stat))
    }

    pub fn exists(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| node.stat)
    }

    /// Replace node data. `version` of `None` skips the version check.
    pub fn set_data(
        &mut self,
        path: &str,
        data: &str,
        version: Option<i32>,
    ) -> Result<Stat, NodeError> {
        let actual = self.node(path)?.stat.version;
        check_version(path, version, actual)?;

        let zxid = self.next_zxid();
        let node = self.node_mut(path)?;
        node.data = data.to_owned();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime_ms = now_ms();
        node.stat.data_length = data_length(data);
        Ok(node.stat)
    }

    /// Child names in lexicographic order.
    pub fn get_children(&self, path: &str) -> Result<Vec<String>, NodeError> {
        Ok(self.node(path)?.children.iter().cloned().collect())
    }

    /// Delete a leaf node. `version` of `None` skips the version check.
    pub fn delete(&mut self, path: &str, version: Option<i32>) -> Result<(), NodeError> {
        validate_path(path)?;
        if path == "/" {
            return Err(NodeError::InvalidPath {
                path: path.to_owned(),
                reason: "the root node cannot be deleted".to_owned(),
            });
        }
        let node = self.node(path)?;
        if !node.children.is_empty() {
            return Err(NodeError::NotEmpty {
                path: path.to_owned(),
            });
        }
        check_version(path, version, node.stat.version)?;

        self.next_zxid();
        if let Some(removed) = self.nodes.remove(path) {
            let owner = removed.stat.ephemeral_owner;
            if owner != 0 {
                if let Some(owned) = self.ephemerals.get_mut(&owner) {
                    owned.remove(path);
                    if owned.is_empty() {
                        self.ephemerals.remove(&owner);
                    }
                }
            }
        }
        if let Some(parent) = self.nodes.get_mut(parent_of(path)) {
            parent.children.remove(name_of(path));
            parent.stat.cversion += 1;
            parent.stat.num_children = child_count(&parent.children);
        }
        Ok(())
    }

    /// Ephemeral paths owned by `session_id`.
    pub fn ephemerals_of(&self, session_id: i64) -> Vec<String> {
        self.ephemerals
            .get(&session_id)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every ephemeral node of a session; returns the removed paths.
    pub fn close_session(&mut self, session_id: i64) -> Vec<String> {
        let owned = self.ephemerals_of(session_id);
        let mut removed = Vec::with_capacity(owned.len());
        for path in owned {
            if self.delete(&path, None).is_ok() {
                removed.push(path);
            }
        }
        self.ephemerals.remove(&session_id);
        removed
    }

    fn next_zxid(&mut self) -> i64 {
        self.last_zxid += 1;
        self.last_zxid
    }

    fn node(&self, path: &str) -> Result<&ZNode, NodeError> {
        self.nodes.get(path).ok_or_else(|| NodeError::NoNode {
            path: path.to_owned(),
        })
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut ZNode, NodeError> {
        self.nodes.get_mut(path).ok_or_else(|| NodeError::NoNode {
            path: path.to_owned(),
        })
    }
}

/// Check that `path` is an absolute, normalized znode path.
pub fn validate_path(path: &str) -> Result<(), NodeError> {
    let invalid = |reason: &str| NodeError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };

    if path.is_empty() {
        return Err(invalid("path must not be empty"));
    }
    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("path must not end with '/'"));
    }
    if path.contains('\0') {
        return Err(invalid("path must not contain NUL"));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Parent path of a validated non-root path.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn check_version(path: &str, expected: Option<i32>, actual: i32) -> Result<(), NodeError> {
    match expected {
        Some(expected) if expected != actual => Err(NodeError::BadVersion {
            path: path.to_owned(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn data_length(data: &str) -> i32 {
    i32::try_from(data.len()).unwrap_or(i32::MAX)
}

fn child_count(children: &BTreeSet<String>) -> i32 {
    i32::try_from(children.len()).unwrap_or(i32::MAX)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(paths: &[&str]) -> ZNodeTree {
        let mut tree = ZNodeTree::new();
        for path in paths {
            tree.create(path, "", CreateMode::Persistent, 0).unwrap();
        }
        tree
    }

    #[test]
    fn new_tree_has_only_root() {
        let tree = ZNodeTree::new();
        assert!(tree.is_empty());
        assert!(tree.exists("/").is_some());
        assert_eq!(tree.last_zxid(), 0);
    }

    #[test]
    fn create_requires_parent() {
        let mut tree = ZNodeTree::new();
        let err = tree
            .create("/brokers/ids", "", CreateMode::Persistent, 0)
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::NoNode {
                path: "/brokers".to_owned()
            }
        );
    }

    #[test]
    fn create_twice_is_node_exists() {
        let mut tree = tree_with(&["/brokers"]);
        let err = tree
            .create("/brokers", "", CreateMode::Persistent, 0)
            .unwrap_err();
        assert!(matches!(err, NodeError::NodeExists { .. }));
    }

    #[test]
    fn create_updates_parent_stat() {
        let tree = tree_with(&["/brokers", "/brokers/ids", "/brokers/topics"]);
        let stat = tree.exists("/brokers").unwrap();
        assert_eq!(stat.num_children, 2);
        assert_eq!(stat.cversion, 2);
        assert_eq!(
            tree.get_children("/brokers").unwrap(),
            vec!["ids".to_owned(), "topics".to_owned()]
        );
        assert_eq!(tree.last_zxid(), 3);
    }

    #[test]
    fn sequential_nodes_get_padded_suffix() {
        let mut tree = tree_with(&["/queue"]);
        let first = tree
            .create("/queue/item-", "a", CreateMode::PersistentSequential, 0)
            .unwrap();
        let second = tree
            .create("/queue/item-", "b", CreateMode::PersistentSequential, 0)
            .unwrap();
        assert_eq!(first, "/queue/item-0000000000");
        assert_eq!(second, "/queue/item-0000000001");
    }

    #[test]
    fn set_data_checks_version() {
        let mut tree = ZNodeTree::new();
        tree.create("/controller_epoch", "1", CreateMode::Persistent, 0)
            .unwrap();

        let stat = tree.set_data("/controller_epoch", "2", Some(0)).unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(stat.data_length, 1);

        let err = tree
            .set_data("/controller_epoch", "3", Some(0))
            .unwrap_err();
        assert_eq!(
            err,
            NodeError::BadVersion {
                path: "/controller_epoch".to_owned(),
                expected: 0,
                actual: 1
            }
        );

        tree.set_data("/controller_epoch", "3", None).unwrap();
        assert_eq!(tree.get_data("/controller_epoch").unwrap().0, "3");
    }

    #[test]
    fn delete_refuses_non_empty_node() {
        let mut tree = tree_with(&["/brokers", "/brokers/ids"]);
        let err = tree.delete("/brokers", None).unwrap_err();
        assert!(matches!(err, NodeError::NotEmpty { .. }));

        tree.delete("/brokers/ids", None).unwrap();
        tree.delete("/brokers", None).unwrap();
        assert!(tree.exists("/brokers").is_none());
        assert_eq!(tree.exists("/").unwrap().num_children, 0);
    }

    #[test]
    fn delete_root_is_rejected() {
        let mut tree = ZNodeTree::new();
        assert!(matches!(
            tree.delete("/", None),
            Err(NodeError::InvalidPath { .. })
        ));
    }

    #[test]
    fn ephemeral_nodes_cannot_have_children() {
        let mut tree = ZNodeTree::new();
        tree.create("/controller", "{}", CreateMode::Ephemeral, 7)
            .unwrap();
        let err = tree
            .create("/controller/child", "", CreateMode::Persistent, 7)
            .unwrap_err();
        assert!(matches!(err, NodeError::NoChildrenForEphemerals { .. }));
    }

    #[test]
    fn ephemeral_without_session_is_rejected() {
        let mut tree = ZNodeTree::new();
        let err = tree
            .create("/controller", "", CreateMode::Ephemeral, 0)
            .unwrap_err();
        assert_eq!(err, NodeError::SessionRequired);
    }

    #[test]
    fn close_session_removes_only_its_ephemerals() {
        let mut tree = tree_with(&["/brokers", "/brokers/ids"]);
        tree.create("/brokers/ids/0", "{}", CreateMode::Ephemeral, 1)
            .unwrap();
        tree.create("/brokers/ids/1", "{}", CreateMode::Ephemeral, 2)
            .unwrap();
        tree.create("/controller", "{}", CreateMode::Ephemeral, 1)
            .unwrap();

        let mut removed = tree.close_session(1);
        removed.sort();
        assert_eq!(removed, vec!["/brokers/ids/0", "/controller"]);
        assert_eq!(tree.get_children("/brokers/ids").unwrap(), vec!["1"]);
        assert!(tree.ephemerals_of(1).is_empty());
        assert_eq!(tree.ephemerals_of(2), vec!["/brokers/ids/1"]);
    }

    #[test]
    fn explicit_delete_of_ephemeral_clears_ownership() {
        let mut tree = ZNodeTree::new();
        tree.create("/controller", "{}", CreateMode::Ephemeral, 5)
            .unwrap();
        tree.delete("/controller", None).unwrap();
        assert!(tree.ephemerals_of(5).is_empty());
        assert!(tree.close_session(5).is_empty());
    }

    #[test]
    fn validate_path_rules() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/brokers/topics/t-1").is_ok());
        for bad in ["", "brokers", "/brokers/", "//a", "/a//b", "/a/./b", "/a/.."] {
            assert!(validate_path(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_of("/brokers"), "/");
        assert_eq!(parent_of("/brokers/ids/0"), "/brokers/ids");
    }
}
