//! Election Handlers
//!
//! Callbacks a [`LeaderElection`](super::LeaderElection) delivers on
//! leadership transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Error;

/// Receives leadership transitions for one election participant.
///
/// Callbacks run on the election's driver task, one at a time and in
/// event order. They must not block on the election that invokes them;
/// calling [`LeaderElection::stop`](super::LeaderElection::stop) from
/// inside a callback is allowed.
pub trait ElectionHandler: Send + Sync + 'static {
    /// This participant became the leader
    fn leader(&self);

    /// This participant is not (or no longer) the leader
    fn follower(&self);

    /// The election terminated on an unrecoverable error. Invoked at most once,
    /// after which no other callback follows.
    fn failed(&self, cause: &Error) {
        tracing::error!("Leader election failed: {}", cause);
    }
}

/// Kind of a leadership transition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    Leader,
    Follower,
    Failed(String),
}

/// A transition reported by a [`ChannelHandler`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Participant label given to the handler
    pub participant: String,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

/// Handler forwarding every transition over an unbounded channel
pub struct ChannelHandler {
    participant: String,
    tx: mpsc::UnboundedSender<Transition>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its transitions
    pub fn new(participant: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Transition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_sender(participant, tx), rx)
    }

    /// Create a handler reporting into an existing channel, letting several
    /// participants share one receiver
    pub fn with_sender(participant: impl Into<String>, tx: mpsc::UnboundedSender<Transition>) -> Self {
        Self {
            participant: participant.into(),
            tx,
        }
    }

    fn send(&self, kind: TransitionKind) {
        let _ = self.tx.send(Transition {
            participant: self.participant.clone(),
            kind,
            at: Utc::now(),
        });
    }
}

impl ElectionHandler for ChannelHandler {
    fn leader(&self) {
        self.send(TransitionKind::Leader);
    }

    fn follower(&self) {
        self.send(TransitionKind::Follower);
    }

    fn failed(&self, cause: &Error) {
        tracing::error!("Leader election for {} failed: {}", self.participant, cause);
        self.send(TransitionKind::Failed(cause.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_handler_forwards() {
        let (handler, mut rx) = ChannelHandler::new("p-1");
        handler.follower();
        handler.leader();
        handler.failed(&Error::Coordination("boom".into()));

        let kinds: Vec<TransitionKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| {
                assert_eq!(t.participant, "p-1");
                t.kind
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                TransitionKind::Follower,
                TransitionKind::Leader,
                TransitionKind::Failed("Coordination error: boom".into()),
            ]
        );
    }
}
