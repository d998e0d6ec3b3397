//! Leader Election
//!
//! Elects a single leader among participants that share a coordination
//! service. Each participant registers an ephemeral, sequential candidate
//! node under the election path; the candidate with the lowest sequence
//! number leads, every other candidate watches its immediate predecessor
//! and re-evaluates when that node goes away.
//!
//! Connection loss demotes the leader until the session reconnects and
//! membership has been re-checked. Session expiry starts a fresh candidacy.

mod driver;
pub mod handler;

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordination::{ConnectionState, CoordinationClient};
use crate::error::{Error, Result};

pub use handler::{ChannelHandler, ElectionHandler, Transition, TransitionKind};

use driver::Driver;

/// Election state of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElectionState {
    /// Registering the first candidate
    Starting = 0,
    /// Candidate registered, another candidate leads
    Follower = 1,
    /// Candidate holds the lowest sequence number
    Leader = 2,
    /// Stop requested; no further callbacks
    Stopping = 3,
    /// Terminated, candidate released
    Stopped = 4,
}

impl ElectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ElectionState::Starting,
            1 => ElectionState::Follower,
            2 => ElectionState::Leader,
            3 => ElectionState::Stopping,
            _ => ElectionState::Stopped,
        }
    }

    /// Stopping or stopped
    pub fn is_winding_down(&self) -> bool {
        matches!(self, ElectionState::Stopping | ElectionState::Stopped)
    }
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Starting => write!(f, "STARTING"),
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Stopping => write!(f, "STOPPING"),
            ElectionState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Events that drive re-evaluation of a participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// The watched predecessor candidate was deleted
    PredecessorDeleted,
    /// The predecessor watch ended without a deletion
    WatchLost,
    /// The session's connection state changed
    ConnectionChanged(ConnectionState),
    /// Stop was requested
    Stop,
}

/// Startup/termination progress, observed by the completion handles
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Starting,
    Running,
    Terminated {
        failure: Option<String>,
        /// Whether the first evaluation had completed
        ran: bool,
    },
}

/// Default bound on the candidate delete issued while stopping
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ELECTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the election whose callback is running on this thread
    static DISPATCHING: Cell<u64> = const { Cell::new(0) };
}

/// Restores [`DISPATCHING`] even if a callback panics
struct DispatchGuard {
    previous: u64,
}

impl DispatchGuard {
    fn enter(id: u64) -> Self {
        DispatchGuard {
            previous: DISPATCHING.with(|d| d.replace(id)),
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(self.previous));
    }
}

/// State shared between an election handle and its driver task
struct Shared {
    id: u64,
    state: AtomicU8,
    /// Held while a callback is delivered and while stop flips the state,
    /// so no callback can begin after STOPPING has been entered
    gate: Mutex<()>,
    cancel: CancellationToken,
    progress: watch::Sender<Progress>,
    candidate: watch::Sender<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            id: NEXT_ELECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ElectionState::Starting as u8),
            gate: Mutex::new(()),
            cancel: CancellationToken::new(),
            progress: watch::Sender::new(Progress::Starting),
            candidate: watch::Sender::new(None),
        }
    }

    fn state(&self) -> ElectionState {
        ElectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn in_own_callback(&self) -> bool {
        DISPATCHING.with(|d| d.get()) == self.id
    }

    /// Move to `target` and deliver its callback, unless already there or
    /// winding down. Returns whether the callback was delivered.
    fn transition(&self, target: ElectionState, handler: &dyn ElectionHandler) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.state();
        if current.is_winding_down() || current == target {
            return false;
        }
        self.state.store(target as u8, Ordering::SeqCst);

        let _dispatch = DispatchGuard::enter(self.id);
        match target {
            ElectionState::Leader => handler.leader(),
            ElectionState::Follower => handler.follower(),
            _ => {}
        }
        true
    }

    /// Enter STOPPING. Returns false if already winding down.
    fn enter_stopping(&self) -> bool {
        // A stop from inside our own callback already runs under the gate
        let _gate = if self.in_own_callback() {
            None
        } else {
            Some(self.gate.lock().unwrap_or_else(PoisonError::into_inner))
        };

        if self.state().is_winding_down() {
            return false;
        }
        self.state.store(ElectionState::Stopping as u8, Ordering::SeqCst);
        true
    }

    fn request_stop(&self) {
        if self.enter_stopping() {
            tracing::debug!("Stop requested for election {}", self.id);
        }
        self.cancel.cancel();
    }

    fn mark_running(&self) {
        self.progress.send_if_modified(|progress| {
            if *progress == Progress::Starting {
                *progress = Progress::Running;
                true
            } else {
                false
            }
        });
    }

    fn terminate(&self, failure: Option<String>) {
        self.state.store(ElectionState::Stopped as u8, Ordering::SeqCst);
        self.progress.send_modify(|progress| {
            let ran = matches!(progress, Progress::Running);
            *progress = Progress::Terminated { failure, ran };
        });
    }
}

/// Handle to one participant in a leader election.
///
/// Dropping the handle requests stop.
pub struct LeaderElection {
    path: String,
    shared: Arc<Shared>,
}

impl LeaderElection {
    /// Join the election at `path`, spawning the participant on the current
    /// tokio runtime. Use [`await_running`](Self::await_running) to wait for
    /// the first evaluation.
    pub fn start<H: ElectionHandler>(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        handler: H,
    ) -> Self {
        Self::with_operation_timeout(client, path, handler, DEFAULT_OPERATION_TIMEOUT)
    }

    /// Like [`start`](Self::start), bounding how long stopping waits for the
    /// candidate delete by `operation_timeout`
    pub fn with_operation_timeout<H: ElectionHandler>(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        handler: H,
        operation_timeout: Duration,
    ) -> Self {
        let path = path.into();
        let shared = Arc::new(Shared::new());

        tracing::debug!(
            "Starting election {} at {}{}",
            shared.id,
            client.connect_string(),
            path
        );

        let driver = Driver::new(
            client,
            path.clone(),
            Arc::new(handler),
            Arc::clone(&shared),
            operation_timeout,
        );
        tokio::spawn(driver.run());

        Self { path, shared }
    }

    /// Election path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current state
    pub fn state(&self) -> ElectionState {
        self.shared.state()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    /// Full path of the current candidate node, if registered
    pub fn candidate(&self) -> Option<String> {
        self.shared.candidate.borrow().clone()
    }

    /// Wait until the first candidate is registered and evaluated, or the
    /// election terminated. Fails if it terminated on an error, or with
    /// [`Error::Cancelled`] if it was stopped before its first evaluation.
    pub async fn await_running(&self) -> Result<()> {
        let mut rx = self.shared.progress.subscribe();
        let progress = rx
            .wait_for(|p| *p != Progress::Starting)
            .await
            .map_err(|_| Error::Internal("election progress channel closed".into()))?
            .clone();

        match progress {
            Progress::Terminated { failure: Some(cause), .. } => Err(Error::Election(cause)),
            Progress::Terminated { ran: false, .. } => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Request the participant to leave the election. Idempotent and
    /// non-blocking; once the state is STOPPING no callback is delivered.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Wait until the participant has stopped. Fails if it terminated on an
    /// error rather than a stop request.
    pub async fn await_terminated(&self) -> Result<()> {
        let mut rx = self.shared.progress.subscribe();
        let progress = rx
            .wait_for(|p| matches!(p, Progress::Terminated { .. }))
            .await
            .map_err(|_| Error::Internal("election progress channel closed".into()))?
            .clone();

        match progress {
            Progress::Terminated { failure: Some(cause), .. } => Err(Error::Election(cause)),
            _ => Ok(()),
        }
    }

    /// Stop and wait for termination
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.await_terminated().await
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}
