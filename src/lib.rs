//! WolfCoord - Coordination primitives for distributed application runs
//!
//! Leader election and shared namespace cleanup on top of a hierarchical
//! coordination service with ephemeral and sequential nodes, one-shot watches
//! and session semantics (the ZooKeeper model).
//!
//! # Architecture
//!
//! Every election participant is driven by its own task, which owns the
//! participant's candidate node, its watch on the immediate predecessor and
//! its view of the session. Callbacks are delivered from that task, one at a
//! time, and never after the participant started winding down.
//!
//! # Features
//!
//! - Leader election with predecessor watches (no herd effect on leader loss)
//! - Automatic recovery from disconnects and session expiry
//! - Stop from any thread, including from inside a callback
//! - Leaf-to-root namespace cleanup that leaves peers' paths in place
//! - In-process coordinator for tests and single-process deployments

pub mod config;
pub mod error;
pub mod coordination;
pub mod election;
pub mod cleanup;

pub use config::WolfCoordConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfCoordConfig;
    pub use crate::error::{Error, Result};
    pub use crate::coordination::{
        ConnectionState, CoordinationClient, CreateMode, MemoryCoordinator, MemorySession,
    };
    pub use crate::election::{
        ChannelHandler, ElectionHandler, ElectionState, LeaderElection, Transition, TransitionKind,
    };
    pub use crate::cleanup::{cleanup, CleanupLevel, CleanupReport, CleanupTarget, SharedPathCleanup};
}
