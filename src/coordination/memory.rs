//! In-Process Coordination Store
//!
//! A single-process implementation of [`CoordinationClient`] with the
//! semantics the coordination layer relies on: persistent, ephemeral and
//! sequential nodes, one-shot watches, and sessions that can be
//! disconnected, reconnected and expired.
//!
//! Operations issued while the store is suspended park until it resumes,
//! the way a real client holds requests across a reconnect.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex, MutexGuard};
use tokio::time::Instant;

use super::{
    format_sequence, node_name, parent_path, validate_path, ConnectionState, CoordinationClient,
    CreateMode, NodeWatch, WatchedEvent,
};
use crate::error::{Error, Result};

/// Capacity of each session's connection state broadcast
const STATE_CHANNEL_CAPACITY: usize = 64;

/// A stored node
#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    /// Owning session for ephemeral nodes
    ephemeral_owner: Option<u64>,
    /// Counter handing out sequence suffixes to children
    next_sequence: u64,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            next_sequence: 0,
            children: BTreeSet::new(),
        }
    }
}

/// Registered one-shot watch
struct WatchEntry {
    session: u64,
    tx: oneshot::Sender<WatchedEvent>,
}

/// Namespace tree plus session bookkeeping, guarded by one lock
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<WatchEntry>>,
    sessions: Vec<Weak<MemorySession>>,
    online: bool,
    /// Start of the current outage
    suspended_at: Option<Instant>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            watches: HashMap::new(),
            sessions: Vec::new(),
            online: true,
            suspended_at: None,
        }
    }

    fn fire(&mut self, path: &str, event: WatchedEvent) {
        if let Some(entries) = self.watches.remove(path) {
            for entry in entries {
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        if let Some(parent) = parent_path(path) {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.remove(node_name(path));
            }
        }
        self.fire(path, WatchedEvent::NodeDeleted(path.to_string()));
    }

    /// Remove everything a session owned: its ephemeral nodes and its watches
    fn release_session(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            tracing::debug!("Removing ephemeral node {} of session {:#x}", path, session);
            self.remove_node(&path);
        }

        for entries in self.watches.values_mut() {
            entries.retain(|entry| entry.session != session);
        }
        self.watches.retain(|_, entries| !entries.is_empty());
    }

    fn live_sessions(&mut self) -> Vec<Arc<MemorySession>> {
        self.sessions.retain(|weak| weak.strong_count() > 0);
        self.sessions.iter().filter_map(Weak::upgrade).collect()
    }

    fn insert(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: u64,
        create_parents: bool,
    ) -> Result<String> {
        let parent = parent_path(path)
            .ok_or_else(|| Error::InvalidPath(format!("cannot create {}", path)))?
            .to_string();

        if !self.nodes.contains_key(&parent) {
            if !create_parents {
                return Err(Error::NoNode(parent));
            }
            self.insert_parents(&parent)?;
        }

        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::NoNode(parent.clone()))?;

        if parent_node.ephemeral_owner.is_some() {
            return Err(Error::Coordination(format!(
                "ephemeral node {} cannot have children",
                parent
            )));
        }

        let full_path = if mode.is_sequential() {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{}", path, format_sequence(seq))
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&full_path) {
            return Err(Error::NodeExists(full_path));
        }

        let owner = if mode.is_ephemeral() { Some(session) } else { None };
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(node_name(&full_path).to_string());
        }
        self.nodes.insert(full_path.clone(), Node::new(data.to_vec(), owner));

        Ok(full_path)
    }

    /// Create all missing ancestors of `path` (inclusive) as persistent nodes
    fn insert_parents(&mut self, path: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if self.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = parent_path(p);
        }

        for p in missing.into_iter().rev() {
            match self.insert(&p, &[], CreateMode::Persistent, 0, false) {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct Inner {
    connect_string: String,
    /// Outages longer than this expire every session
    session_timeout: Option<Duration>,
    tree: Mutex<Tree>,
    next_session: AtomicU64,
}

/// In-process coordination service.
///
/// Cloning yields another handle to the same namespace.
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// Create an empty namespace containing only `/`
    pub fn new() -> Self {
        Self::with_connect_string("memory://local")
    }

    /// Create an empty namespace reporting the given connect string
    pub fn with_connect_string(connect_string: impl Into<String>) -> Self {
        Self::build(connect_string.into(), None)
    }

    /// Create an empty namespace whose sessions expire when an outage
    /// outlasts `session_timeout`
    pub fn with_session_timeout(connect_string: impl Into<String>, session_timeout: Duration) -> Self {
        Self::build(connect_string.into(), Some(session_timeout))
    }

    fn build(connect_string: String, session_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connect_string,
                session_timeout,
                tree: Mutex::new(Tree::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    fn allocate_session(&self) -> u64 {
        self.inner.next_session.fetch_add(1, Ordering::SeqCst)
    }

    /// Open a new session
    pub async fn connect(&self) -> Arc<MemorySession> {
        let mut tree = self.inner.tree.lock().await;
        let initial = if tree.online {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };

        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let session = Arc::new(MemorySession {
            coordinator: self.clone(),
            id: AtomicU64::new(self.allocate_session()),
            state: watch::Sender::new(initial),
            state_tx,
            closed: AtomicBool::new(false),
        });
        tree.sessions.push(Arc::downgrade(&session));

        tracing::debug!("Opened session {:#x}", session.session_id());
        session
    }

    /// Take the service offline: every session becomes DISCONNECTED and
    /// operations park until [`resume`](Self::resume).
    pub async fn suspend(&self) {
        let mut tree = self.inner.tree.lock().await;
        if !tree.online {
            return;
        }
        tree.online = false;
        tree.suspended_at = Some(Instant::now());
        tracing::info!("Coordination service {} suspended", self.inner.connect_string);

        for session in tree.live_sessions() {
            session.publish(ConnectionState::Disconnected);
        }
    }

    /// Bring the service back: sessions reconnect with their nodes and
    /// watches intact, unless the outage outlasted the session timeout, in
    /// which case every session expires.
    pub async fn resume(&self) {
        let mut tree = self.inner.tree.lock().await;
        if tree.online {
            return;
        }
        tree.online = true;
        let outage = tree.suspended_at.take().map(|at| at.elapsed());
        let expired = matches!(
            (outage, self.inner.session_timeout),
            (Some(outage), Some(limit)) if outage > limit
        );
        tracing::info!("Coordination service {} resumed", self.inner.connect_string);

        for session in tree.live_sessions() {
            if expired {
                self.expire_locked(&mut tree, &session);
            } else {
                session.publish(ConnectionState::Connected);
            }
        }
    }

    /// Expire a session server-side: its ephemeral nodes and watches are
    /// released, the client is issued a fresh session and observes EXPIRED
    /// followed by CONNECTED.
    pub async fn expire(&self, session: &MemorySession) {
        let mut tree = self.inner.tree.lock().await;
        if session.is_closed() {
            return;
        }
        self.expire_locked(&mut tree, session);
    }

    fn expire_locked(&self, tree: &mut Tree, session: &MemorySession) {
        let old = session.session_id();
        tree.release_session(old);
        let new = self.allocate_session();
        session.id.store(new, Ordering::SeqCst);

        tracing::info!("Session {:#x} expired, renewed as {:#x}", old, new);

        session.publish(ConnectionState::Expired);
        if tree.online {
            session.publish(ConnectionState::Connected);
        }
    }

    /// Check if a node exists
    pub async fn exists(&self, path: &str) -> bool {
        self.inner.tree.lock().await.nodes.contains_key(path)
    }

    /// Child names of a node, `None` if the node does not exist
    pub async fn children(&self, path: &str) -> Option<Vec<String>> {
        let tree = self.inner.tree.lock().await;
        tree.nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
    }

    /// Data stored on a node, `None` if the node does not exist
    pub async fn data(&self, path: &str) -> Option<Vec<u8>> {
        let tree = self.inner.tree.lock().await;
        tree.nodes.get(path).map(|node| node.data.clone())
    }

    /// Number of watches currently registered on a path
    pub async fn watch_count(&self, path: &str) -> usize {
        let tree = self.inner.tree.lock().await;
        tree.watches.get(path).map(Vec::len).unwrap_or(0)
    }
}

/// A client session against a [`MemoryCoordinator`]
pub struct MemorySession {
    coordinator: MemoryCoordinator,
    /// Current server-side session id; replaced on expiry
    id: AtomicU64,
    /// Gate for operations
    state: watch::Sender<ConnectionState>,
    /// Notifications for subscribers
    state_tx: broadcast::Sender<ConnectionState>,
    closed: AtomicBool,
}

impl MemorySession {
    /// Current server-side session id
    pub fn session_id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    /// The coordinator this session is attached to
    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// End the session, releasing its ephemeral nodes and watches.
    /// Operations issued afterwards fail with [`Error::ShuttingDown`].
    pub async fn close(&self) {
        let mut tree = self.coordinator.inner.tree.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tree.release_session(self.session_id());
        let me = self as *const MemorySession;
        tree.sessions
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), me));

        // Wake operations parked on the connection gate
        self.state.send_modify(|_| {});
        tracing::debug!("Closed session {:#x}", self.session_id());
    }

    fn publish(&self, state: ConnectionState) {
        if state != ConnectionState::Expired {
            self.state.send_replace(state);
        }
        let _ = self.state_tx.send(state);
    }

    /// Wait until the session is usable, then lock the tree
    async fn tree(&self) -> Result<(MutexGuard<'_, Tree>, u64)> {
        loop {
            if self.is_closed() {
                return Err(Error::ShuttingDown);
            }

            let mut rx = self.state.subscribe();
            rx.wait_for(|s| *s == ConnectionState::Connected || self.is_closed())
                .await
                .map_err(|_| Error::ConnectionLoss)?;

            let tree = self.coordinator.inner.tree.lock().await;
            if self.is_closed() {
                return Err(Error::ShuttingDown);
            }
            if tree.online {
                return Ok((tree, self.session_id()));
            }
        }
    }
}

#[async_trait::async_trait]
impl CoordinationClient for MemorySession {
    fn connect_string(&self) -> &str {
        &self.coordinator.inner.connect_string
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String> {
        if mode.is_sequential() {
            validate_path(parent_path(path).unwrap_or(path))?;
        } else {
            validate_path(path)?;
        }

        let (mut tree, session) = self.tree().await?;
        tree.insert(path, data, mode, session, create_parents)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::InvalidPath("cannot delete /".into()));
        }

        let (mut tree, _) = self.tree().await?;
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;

        if let Some(expected) = version {
            if expected != node.version {
                return Err(Error::BadVersion(path.to_string()));
            }
        }
        if !node.children.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        tree.remove_node(path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let (tree, _) = self.tree().await?;
        tree.nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn exists_watch(&self, path: &str) -> Result<Option<NodeWatch>> {
        validate_path(path)?;
        let (mut tree, session) = self.tree().await?;
        if !tree.nodes.contains_key(path) {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        tree.watches
            .entry(path.to_string())
            .or_default()
            .push(WatchEntry { session, tx });
        Ok(Some(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_ephemeral_nodes() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect().await;

        let first = session
            .create("/election/a-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();
        let second = session
            .create("/election/b-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();

        assert_eq!(first, "/election/a-0000000000");
        assert_eq!(second, "/election/b-0000000001");
        assert_eq!(
            session.get_children("/election").await.unwrap(),
            vec!["a-0000000000".to_string(), "b-0000000001".to_string()]
        );

        // Parent was created as a persistent node
        session.close().await;
        assert!(coordinator.exists("/election").await);
        assert_eq!(coordinator.children("/election").await, Some(vec![]));
    }

    #[tokio::test]
    async fn test_create_without_parent() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect().await;

        let err = session
            .create("/missing/child", b"", CreateMode::Persistent, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoNode(p) if p == "/missing"));

        session.create("/app", b"x", CreateMode::Persistent, false).await.unwrap();
        let err = session
            .create("/app", b"x", CreateMode::Persistent, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));
        assert_eq!(coordinator.data("/app").await, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect().await;

        session
            .create("/app/discovery/svc", b"", CreateMode::Persistent, true)
            .await
            .unwrap();

        assert!(matches!(
            session.delete("/app/discovery", None).await,
            Err(Error::NotEmpty(_))
        ));
        assert!(matches!(
            session.delete("/app/nothing", None).await,
            Err(Error::NoNode(_))
        ));
        assert!(matches!(
            session.delete("/app/discovery/svc", Some(3)).await,
            Err(Error::BadVersion(_))
        ));

        session.delete("/app/discovery/svc", Some(0)).await.unwrap();
        session.delete("/app/discovery", None).await.unwrap();
        assert!(!coordinator.exists("/app/discovery").await);
    }

    #[tokio::test]
    async fn test_watch_fires_on_delete() {
        let coordinator = MemoryCoordinator::new();
        let owner = coordinator.connect().await;
        let watcher = coordinator.connect().await;

        let path = owner
            .create("/e/n-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();

        let rx = watcher.exists_watch(&path).await.unwrap().expect("node exists");
        assert!(watcher.exists_watch("/e/other").await.unwrap().is_none());

        owner.close().await;
        assert_eq!(rx.await.unwrap(), WatchedEvent::NodeDeleted(path));
    }

    #[tokio::test]
    async fn test_expire_releases_ephemerals() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect().await;
        let mut states = session.subscribe();

        session
            .create("/e/n-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();
        let old_id = session.session_id();

        coordinator.expire(&session).await;

        assert_eq!(states.recv().await.unwrap(), ConnectionState::Expired);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);
        assert_ne!(session.session_id(), old_id);
        assert_eq!(coordinator.children("/e").await, Some(vec![]));

        // The renewed session keeps working
        let path = session
            .create("/e/n-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();
        assert_eq!(path, "/e/n-0000000001");
    }

    #[tokio::test]
    async fn test_operations_park_while_suspended() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect().await;
        let mut states = session.subscribe();

        coordinator.suspend().await;
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session.create("/parked", b"", CreateMode::Persistent, false).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert!(!coordinator.exists("/parked").await);

        coordinator.resume().await;
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);
        assert_eq!(pending.await.unwrap().unwrap(), "/parked");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.connect().await;
        coordinator.suspend().await;

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.get_children("/").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close().await;
        assert!(matches!(pending.await.unwrap(), Err(Error::ShuttingDown)));
        assert!(matches!(
            session.delete("/x", None).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_long_outage_expires_sessions() {
        let coordinator =
            MemoryCoordinator::with_session_timeout("memory://test", Duration::from_millis(50));
        let session = coordinator.connect().await;
        let mut states = session.subscribe();

        let node = session
            .create("/e/n-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();
        let old_id = session.session_id();

        coordinator.suspend().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.resume().await;

        assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Expired);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);
        assert_ne!(session.session_id(), old_id);
        assert!(!coordinator.exists(&node).await);

        // A short outage keeps the session and its nodes
        let node = session
            .create("/e/n-", b"", CreateMode::EphemeralSequential, true)
            .await
            .unwrap();
        let id = session.session_id();

        coordinator.suspend().await;
        coordinator.resume().await;

        assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);
        assert_eq!(session.session_id(), id);
        assert!(coordinator.exists(&node).await);
    }
}
