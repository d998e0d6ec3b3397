//! Shared Path Cleanup
//!
//! Removes an application run's coordination namespace on shutdown without
//! disturbing peer runs that share it. The walk goes leaf to root and stops
//! at the first level a peer still occupies; the coordination service's
//! atomic not-empty check on delete is the only guard.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::coordination::{join_path, CoordinationClient};
use crate::error::{Error, Result};

/// Default bound on each coordination call
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A namespace level of the cleanup walk, leaf to root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupLevel {
    /// Per-instance markers
    Instances,
    /// Service discovery, one child per service name
    Discovery,
    /// The application root
    Root,
}

impl CleanupLevel {
    /// All levels in walk order
    pub const WALK: [CleanupLevel; 3] = [
        CleanupLevel::Instances,
        CleanupLevel::Discovery,
        CleanupLevel::Root,
    ];
}

impl std::fmt::Display for CleanupLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupLevel::Instances => write!(f, "instances"),
            CleanupLevel::Discovery => write!(f, "discovery"),
            CleanupLevel::Root => write!(f, "root"),
        }
    }
}

/// Paths of the levels to clean up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTarget {
    pub instances: String,
    pub discovery: String,
    pub root: String,
}

impl CleanupTarget {
    /// Standard layout under an application root
    pub fn for_application(root: &str) -> Self {
        Self::with_dirs(root, "instances", "discovery")
    }

    /// Layout with custom level names under an application root
    pub fn with_dirs(root: &str, instances: &str, discovery: &str) -> Self {
        Self {
            instances: join_path(root, instances),
            discovery: join_path(root, discovery),
            root: root.to_string(),
        }
    }

    /// Path of a level
    pub fn path(&self, level: CleanupLevel) -> &str {
        match level {
            CleanupLevel::Instances => &self.instances,
            CleanupLevel::Discovery => &self.discovery,
            CleanupLevel::Root => &self.root,
        }
    }
}

/// How far a cleanup walk got
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Levels removed (or found already gone), in walk order
    pub removed: Vec<CleanupLevel>,
    /// Level a peer still occupies, where the walk stopped
    pub blocked: Option<CleanupLevel>,
    /// Services under discovery a peer still has registrations for
    pub busy_services: Vec<String>,
}

impl CleanupReport {
    /// All levels were removed
    pub fn is_complete(&self) -> bool {
        self.blocked.is_none() && self.removed.len() == CleanupLevel::WALK.len()
    }
}

/// Outcome of deleting one node
enum Removal {
    Removed,
    InUse,
}

/// Tear-down of an application run's shared namespace
pub struct SharedPathCleanup {
    client: Arc<dyn CoordinationClient>,
    target: CleanupTarget,
    timeout: Duration,
}

impl SharedPathCleanup {
    pub fn new(client: Arc<dyn CoordinationClient>, target: CleanupTarget) -> Self {
        Self {
            client,
            target,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Bound each coordination call by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &CleanupTarget {
        &self.target
    }

    /// Walk the levels leaf to root, stopping at the first one in use
    pub async fn run(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for level in CleanupLevel::WALK {
            let removal = match level {
                CleanupLevel::Discovery => self.clear_discovery(&mut report).await?,
                _ => self.remove(self.target.path(level)).await?,
            };

            match removal {
                Removal::Removed => report.removed.push(level),
                Removal::InUse => {
                    tracing::info!(
                        "{} still in use by another instance, leaving the rest in place",
                        self.target.path(level)
                    );
                    report.blocked = Some(level);
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Delete every service under discovery, then discovery itself
    async fn clear_discovery(&self, report: &mut CleanupReport) -> Result<Removal> {
        let discovery = &self.target.discovery;
        let services = match self.bounded(discovery, self.client.get_children(discovery)).await {
            Ok(services) => services,
            Err(Error::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let removals = futures::future::join_all(
            services
                .iter()
                .map(|service| self.remove_service(service)),
        )
        .await;

        for (service, removal) in services.iter().zip(removals) {
            if let Removal::InUse = removal? {
                report.busy_services.push(service.clone());
            }
        }

        if !report.busy_services.is_empty() {
            tracing::info!(
                "Services {:?} still registered by another instance",
                report.busy_services
            );
            return Ok(Removal::InUse);
        }

        self.remove(discovery).await
    }

    async fn remove_service(&self, service: &str) -> Result<Removal> {
        self.remove(&join_path(&self.target.discovery, service)).await
    }

    /// Delete a node; a missing node counts as removed
    async fn remove(&self, path: &str) -> Result<Removal> {
        tracing::info!("Removing path: {}{}", self.client.connect_string(), path);
        match self.bounded(path, self.client.delete(path, None)).await {
            Ok(()) => Ok(Removal::Removed),
            Err(Error::NoNode(_)) => {
                tracing::debug!("{} already removed", path);
                Ok(Removal::Removed)
            }
            Err(Error::NotEmpty(_)) => Ok(Removal::InUse),
            Err(e) => Err(e),
        }
    }

    async fn bounded<T>(&self, path: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| Error::Timeout(format!("{} after {:?}", path, self.timeout)))?
    }
}

/// Run the cleanup walk once for `target`
pub async fn cleanup(
    client: Arc<dyn CoordinationClient>,
    target: &CleanupTarget,
) -> Result<CleanupReport> {
    SharedPathCleanup::new(client, target.clone()).run().await
}
