//! Coordination Client Module
//!
//! The capability contract the election engine and cleanup protocol
//! need from a hierarchical, watch-based coordination service, plus an
//! in-process implementation of it.

pub mod memory;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::error::{Error, Result};

pub use memory::{MemoryCoordinator, MemorySession};

/// Width of the server-assigned sequence suffix on sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Persistent with a sequence suffix
    PersistentSequential,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral with a sequence suffix
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// Session connection state, broadcast to every subscriber of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Session is connected and operations flow
    Connected,
    /// Connection dropped; the session may still be alive server-side
    Disconnected,
    /// The session is gone along with its ephemeral nodes
    Expired,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Event delivered to a one-shot watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedEvent {
    /// The watched node was deleted
    NodeDeleted(String),
    /// The watched node's data changed
    NodeDataChanged(String),
}

/// One-shot notification registered by [`CoordinationClient::exists_watch`]
pub type NodeWatch = oneshot::Receiver<WatchedEvent>;

/// Operations the coordination layer requires from a coordination service client.
///
/// Transient transport errors are the implementation's concern: an
/// implementation retries or parks an operation across a disconnect and
/// only surfaces outcomes the caller can act on.
#[async_trait::async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Connect string used for log lines
    fn connect_string(&self) -> &str;

    /// Current connection state of the session
    fn connection_state(&self) -> ConnectionState;

    /// Subscribe to connection state changes
    fn subscribe(&self) -> broadcast::Receiver<ConnectionState>;

    /// Create a node, returning its full path (including any sequence suffix).
    /// With `create_parents`, missing ancestors are created as persistent nodes.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String>;

    /// Delete a node. Fails with [`Error::NoNode`], [`Error::NotEmpty`] or
    /// [`Error::BadVersion`] as distinct outcomes.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// List child names of a node, sorted by name
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Check existence and, if the node exists, leave a one-shot watch on it.
    /// Returns `None` when the node does not exist.
    async fn exists_watch(&self, path: &str) -> Result<Option<NodeWatch>>;
}

/// Join a child name onto a parent path
pub fn join_path(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of an absolute path (`None` for the root)
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Validate an absolute node path
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("{} is not absolute", path)));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(Error::InvalidPath(format!("{} has a trailing slash", path)));
    }
    if path.contains("//") {
        return Err(Error::InvalidPath(format!("{} has an empty segment", path)));
    }
    Ok(())
}

/// Fixed-width sequence suffix of a sequential node name
pub fn sequence_suffix(name: &str) -> Option<&str> {
    let suffix = name.get(name.len().checked_sub(SEQUENCE_WIDTH)?..)?;
    if suffix.bytes().all(|b| b.is_ascii_digit()) {
        Some(suffix)
    } else {
        None
    }
}

/// Format a sequence number the way sequential node names carry it
pub fn format_sequence(seq: u64) -> String {
    format!("{:0width$}", seq, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "app"), "/app");
        assert_eq!(join_path("/app", "discovery"), "/app/discovery");
        assert_eq!(join_path("/app", "/instances"), "/app/instances");

        assert_eq!(parent_path("/app/discovery"), Some("/app"));
        assert_eq!(parent_path("/app"), Some("/"));
        assert_eq!(parent_path("/"), None);

        assert_eq!(node_name("/election/abc-0000000003"), "abc-0000000003");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn test_sequence_suffix() {
        assert_eq!(sequence_suffix("guid-0000000042"), Some("0000000042"));
        assert_eq!(sequence_suffix("0000000001"), Some("0000000001"));
        assert_eq!(sequence_suffix("short"), None);
        assert_eq!(sequence_suffix("guid-00000000x2"), None);
        assert_eq!(format_sequence(42), "0000000042");
        // Fixed width keeps lexical order equal to numeric order
        assert!(format_sequence(9) < format_sequence(10));
    }
}
