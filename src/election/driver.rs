//! Election driver task
//!
//! One task per participant. Every coordination call, watch notification
//! and connection change for the participant is handled here, so callbacks
//! are delivered in event order and never concurrently.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{ElectionEvent, ElectionHandler, ElectionState, Shared};
use crate::coordination::{
    join_path, node_name, sequence_suffix, validate_path, ConnectionState, CoordinationClient,
    CreateMode, NodeWatch, WatchedEvent,
};
use crate::error::{Error, Result};

/// Deletion watch on the immediate predecessor
struct WatchRegistration {
    predecessor: String,
    rx: NodeWatch,
}

pub(super) struct Driver {
    client: Arc<dyn CoordinationClient>,
    path: String,
    /// Prefix identifying this participant's candidate nodes
    guid: String,
    handler: Arc<dyn ElectionHandler>,
    shared: Arc<Shared>,
    candidate: Option<String>,
    watch: Option<WatchRegistration>,
    disconnected: bool,
    operation_timeout: Duration,
}

/// Attempts at creating a candidate before giving up
const MAX_REGISTER_ATTEMPTS: usize = 5;

impl Driver {
    pub(super) fn new(
        client: Arc<dyn CoordinationClient>,
        path: String,
        handler: Arc<dyn ElectionHandler>,
        shared: Arc<Shared>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            client,
            path,
            guid: uuid::Uuid::new_v4().simple().to_string(),
            handler,
            shared,
            candidate: None,
            watch: None,
            disconnected: false,
            operation_timeout,
        }
    }

    pub(super) async fn run(mut self) {
        let mut states = self.client.subscribe();

        let failure = match self.drive(&mut states).await {
            Ok(()) | Err(Error::Cancelled) => None,
            Err(e) => {
                tracing::error!("Election at {} terminated: {}", self.path, e);
                Some(e)
            }
        };

        self.finish(failure).await;
    }

    async fn drive(&mut self, states: &mut broadcast::Receiver<ConnectionState>) -> Result<()> {
        validate_path(&self.path)?;

        self.register().await?;
        self.evaluate().await?;
        self.shared.mark_running();

        loop {
            let event = self.next_event(states).await?;
            tracing::debug!("Election {} event: {:?}", self.path, event);

            match event {
                ElectionEvent::Stop => return Ok(()),
                ElectionEvent::PredecessorDeleted | ElectionEvent::WatchLost => {
                    self.evaluate().await?;
                }
                ElectionEvent::ConnectionChanged(ConnectionState::Disconnected) => {
                    self.disconnected = true;
                    if self.shared.transition(ElectionState::Follower, &*self.handler) {
                        tracing::info!("Disconnected from {}, stepping down", self.client.connect_string());
                    }
                }
                ElectionEvent::ConnectionChanged(ConnectionState::Connected) => {
                    if std::mem::take(&mut self.disconnected) {
                        self.evaluate().await?;
                    }
                }
                ElectionEvent::ConnectionChanged(ConnectionState::Expired) => {
                    tracing::info!(
                        "Session expired, re-registering candidate under {}",
                        self.path
                    );
                    self.disconnected = false;
                    self.watch = None;
                    self.set_candidate(None);
                    self.shared.transition(ElectionState::Follower, &*self.handler);
                    self.register().await?;
                    self.evaluate().await?;
                }
            }
        }
    }

    /// Run a coordination call, abandoning it if stop is requested
    async fn call<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(Error::Cancelled),
            result = op => result,
        }
    }

    fn set_candidate(&mut self, candidate: Option<String>) {
        self.candidate = candidate.clone();
        self.shared.candidate.send_replace(candidate);
    }

    /// Register a candidate node for the current session epoch
    async fn register(&mut self) -> Result<()> {
        let prefix = format!("{}-", self.guid);
        let request = join_path(&self.path, &prefix);

        for _ in 0..MAX_REGISTER_ATTEMPTS {
            // A create whose reply was lost may already have left our node behind
            match self.call(self.client.get_children(&self.path)).await {
                Ok(children) => {
                    if let Some(name) = children.iter().find(|c| c.starts_with(&prefix)) {
                        let node = join_path(&self.path, name);
                        tracing::info!("Adopting existing candidate {}", node);
                        self.set_candidate(Some(node));
                        return Ok(());
                    }
                }
                Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }

            match self
                .call(self.client.create(&request, &[], CreateMode::EphemeralSequential, true))
                .await
            {
                Ok(node) => {
                    tracing::info!("Registered candidate {}", node);
                    self.set_candidate(Some(node));
                    return Ok(());
                }
                Err(Error::NodeExists(path)) => {
                    tracing::debug!("Candidate {} already exists, retrying", path);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Election(format!(
            "no candidate registered under {} after {} attempts",
            self.path, MAX_REGISTER_ATTEMPTS
        )))
    }

    /// Decide leadership from the current child list. Followers leave a
    /// watch on their immediate predecessor.
    async fn evaluate(&mut self) -> Result<()> {
        loop {
            self.watch = None;

            let Some(candidate) = self.candidate.clone() else {
                self.register().await?;
                continue;
            };

            let children = match self.call(self.client.get_children(&self.path)).await {
                Ok(children) => children,
                Err(Error::NoNode(_)) => Vec::new(),
                Err(e) => return Err(e),
            };

            let ranked = rank_candidates(&children);
            let own = node_name(&candidate);

            match ranked.iter().position(|name| *name == own) {
                None => {
                    tracing::warn!("Candidate {} is gone, registering again", candidate);
                    self.set_candidate(None);
                }
                Some(0) => {
                    // The connection may have dropped since the listing
                    if self.client.connection_state() != ConnectionState::Connected {
                        self.disconnected = true;
                        self.shared.transition(ElectionState::Follower, &*self.handler);
                        tracing::info!(
                            "Candidate {} ranks first but the session is not connected",
                            candidate
                        );
                        return Ok(());
                    }
                    if self.shared.transition(ElectionState::Leader, &*self.handler) {
                        tracing::info!("Candidate {} is now LEADER", candidate);
                    }
                    return Ok(());
                }
                Some(idx) => {
                    if self.shared.transition(ElectionState::Follower, &*self.handler) {
                        tracing::info!("Candidate {} is FOLLOWER", candidate);
                    }

                    let predecessor = join_path(&self.path, ranked[idx - 1]);
                    match self.call(self.client.exists_watch(&predecessor)).await {
                        Ok(Some(rx)) => {
                            tracing::debug!("Watching predecessor {}", predecessor);
                            self.watch = Some(WatchRegistration { predecessor, rx });
                            return Ok(());
                        }
                        Ok(None) | Err(Error::NoNode(_)) => {
                            tracing::debug!(
                                "Predecessor {} vanished before the watch was set",
                                predecessor
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn next_event(
        &mut self,
        states: &mut broadcast::Receiver<ConnectionState>,
    ) -> Result<ElectionEvent> {
        let client = &self.client;
        let cancel = &self.shared.cancel;
        let slot = &mut self.watch;

        let fired = async move {
            match slot {
                Some(registration) => Some((&mut registration.rx).await),
                None => std::future::pending().await,
            }
        };

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => ElectionEvent::Stop,
            state = states.recv() => match state {
                Ok(state) => ElectionEvent::ConnectionChanged(state),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} connection state changes", missed);
                    ElectionEvent::ConnectionChanged(client.connection_state())
                }
                Err(RecvError::Closed) => {
                    return Err(Error::Coordination("connection state stream closed".into()));
                }
            },
            fired = fired => match fired {
                Some(Ok(WatchedEvent::NodeDeleted(_))) => ElectionEvent::PredecessorDeleted,
                _ => ElectionEvent::WatchLost,
            },
        };

        if matches!(event, ElectionEvent::PredecessorDeleted | ElectionEvent::WatchLost) {
            if let Some(registration) = self.watch.take() {
                tracing::debug!("Watch on {} fired", registration.predecessor);
            }
        }
        Ok(event)
    }

    async fn finish(mut self, failure: Option<Error>) {
        self.shared.enter_stopping();
        self.watch = None;

        if let Some(node) = self.candidate.take() {
            self.release(node).await;
        }
        self.shared.candidate.send_replace(None);

        if let Some(cause) = &failure {
            self.handler.failed(cause);
        }
        self.shared.terminate(failure.map(|e| e.to_string()));
        tracing::debug!("Election {} at {} stopped", self.shared.id, self.path);
    }

    /// Delete the candidate. While disconnected, or once the operation
    /// timeout passes, the delete proceeds in the background instead of
    /// holding up termination.
    async fn release(&self, node: String) {
        let client = Arc::clone(&self.client);
        let target = node.clone();
        let delete = tokio::spawn(async move {
            match client.delete(&node, None).await {
                Ok(()) => tracing::info!("Removed candidate {}", node),
                Err(Error::NoNode(_)) => tracing::debug!("Candidate {} already gone", node),
                Err(e) => tracing::warn!("Failed to remove candidate {}: {}", node, e),
            }
        });

        if self.client.connection_state() == ConnectionState::Connected
            && tokio::time::timeout(self.operation_timeout, delete).await.is_err()
        {
            tracing::warn!(
                "Removing candidate {} is taking longer than {:?}, continuing in the background",
                target,
                self.operation_timeout
            );
        }
    }
}

/// Candidate names ordered by sequence suffix, ignoring foreign children
fn rank_candidates(children: &[String]) -> Vec<&str> {
    let mut ranked: Vec<(&str, &str)> = children
        .iter()
        .filter_map(|name| sequence_suffix(name).map(|seq| (seq, name.as_str())))
        .collect();
    ranked.sort_unstable();
    ranked.into_iter().map(|(_, name)| name).collect()
}
