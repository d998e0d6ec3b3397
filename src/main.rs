//! WolfCoord - Coordination primitives for distributed application runs
//!
//! Command line front end: configuration management and an in-process
//! simulation of leader election and shutdown cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wolfcoord::cleanup::{CleanupReport, SharedPathCleanup};
use wolfcoord::config::WolfCoordConfig;
use wolfcoord::coordination::{
    join_path, CoordinationClient, CreateMode, MemoryCoordinator, MemorySession,
};
use wolfcoord::election::{ChannelHandler, LeaderElection, Transition, TransitionKind};
use wolfcoord::error::{Error, Result};

/// How long the simulation waits for a leader to emerge
const LEADER_WAIT: Duration = Duration::from_secs(10);

/// WolfCoord - Leader election and shared namespace cleanup
#[derive(Parser)]
#[command(name = "wolfcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcoord.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [logging] level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcoord.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Application name
        #[arg(long, default_value = "myapp")]
        app: String,
    },

    /// Validate configuration file
    Validate,

    /// Show the resolved coordination layout
    Info,

    /// Run an election and cleanup against an in-process coordinator
    Simulate {
        /// Number of election participants
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = WolfCoordConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Init { output, node_id, app } => run_init(output, node_id, app),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Simulate { participants, json } => {
            run_simulate(cli.config, participants, json).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let compact = format == "compact";
    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact.then(|| fmt::layer().compact().with_writer(std::io::stderr)))
        .with((!compact).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn config_template(node_id: &str, app: &str) -> String {
    format!(
        r#"# WolfCoord Configuration
# Generated configuration file

[node]
id = "{node_id}"

[coordination]
connect_string = "memory://local"
# connect_string = "zk-1.example.com:2181,zk-2.example.com:2181"
session_timeout_ms = 10000
operation_timeout_ms = 5000

[application]
name = "{app}"
namespace = "/wolfcoord"
# run_id = "2024-06-01-a"

[election]
# path = "/wolfcoord/{app}/leader"

[cleanup]
enabled = true
instances_dir = "instances"
discovery_dir = "discovery"
operation_timeout_ms = 5000

[logging]
level = "info"
format = "pretty"
"#
    )
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String, app: String) -> Result<()> {
    if output.exists() {
        eprintln!("✗ {} already exists", output.display());
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let content = config_template(&node_id, &app);
    WolfCoordConfig::from_str(&content)?;
    std::fs::write(&output, content)?;

    println!("✓ Configuration written to {}", output.display());
    println!("  Edit [coordination] and [application] before starting");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfCoordConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Coordination: {}", config.coordination.connect_string);
            println!("  Application Root: {}", config.app_root());
            println!("  Election Path: {}", config.election_path());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show the resolved coordination layout
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfCoordConfig::from_file(&config_path)?;
    let target = config.cleanup_target();

    println!("WolfCoord Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Coordination:     {}", config.coordination.connect_string);
    println!("Session Timeout:  {} ms", config.coordination.session_timeout_ms);
    println!("Op Timeout:       {} ms", config.coordination.operation_timeout_ms);
    println!();
    println!("Application:");
    println!("  Name:           {}", config.application.name);
    println!("  Run ID:         {}", config.application.run_id);
    println!("  Root:           {}", config.app_root());
    println!("  Election:       {}", config.election_path());
    println!();
    println!("Cleanup ({}):", if config.cleanup.enabled { "enabled" } else { "disabled" });
    println!("  Instances:      {}", target.instances);
    println!("  Discovery:      {}", target.discovery);
    println!("  Root:           {}", target.root);
    println!("  Timeout:        {} ms", config.cleanup.operation_timeout_ms);

    Ok(())
}

/// Outcome of a simulation run
#[derive(Serialize)]
struct SimulationReport {
    participants: usize,
    /// Participants in the order they became leader
    leaders: Vec<String>,
    transitions: Vec<Transition>,
    /// Cleanup attempted while a peer was still registered
    cleanup_with_peer: Option<CleanupReport>,
    /// Cleanup after every participant left
    cleanup_final: Option<CleanupReport>,
}

/// Participant of a simulation run
struct Participant {
    name: String,
    session: Arc<MemorySession>,
    election: LeaderElection,
}

/// Run the simulation against an in-process coordinator
async fn run_simulate(config_path: PathBuf, participants: usize, json: bool) -> Result<()> {
    if participants == 0 {
        return Err(Error::Config("at least one participant is required".into()));
    }

    let config = if config_path.exists() {
        WolfCoordConfig::from_file(&config_path)?
    } else {
        tracing::info!("{} not found, using built-in defaults", config_path.display());
        WolfCoordConfig::from_str(&config_template("node-1", "simulation"))?
    };

    let coordinator = MemoryCoordinator::with_session_timeout(
        &config.coordination.connect_string,
        config.session_timeout(),
    );
    let election_path = config.election_path();
    let target = config.cleanup_target();
    let (tx, mut rx) = mpsc::unbounded_channel();

    tracing::info!(
        "Simulating {} participants at {}{}",
        participants,
        config.coordination.connect_string,
        election_path
    );

    let mut active = Vec::with_capacity(participants);
    for i in 0..participants {
        let name = format!("{}-{}", config.node.id, i);
        let session = coordinator.connect().await;
        register_instance(&session, &target.instances, &target.discovery, &name).await?;

        let handler = ChannelHandler::with_sender(name.clone(), tx.clone());
        let election = LeaderElection::with_operation_timeout(
            session.clone(),
            election_path.clone(),
            handler,
            config.operation_timeout(),
        );
        election.await_running().await?;

        active.push(Participant { name, session, election });
    }

    let mut report = SimulationReport {
        participants,
        leaders: Vec::new(),
        transitions: Vec::new(),
        cleanup_with_peer: None,
        cleanup_final: None,
    };

    // Withdraw whoever leads until one participant remains
    while active.len() > 1 {
        let idx = wait_for_leader(&active).await?;
        let leader = active.remove(idx);
        report.leaders.push(leader.name.clone());
        drain(&mut rx, &mut report.transitions, json);

        leader.election.shutdown().await?;
        leader.session.close().await;
        tracing::info!("{} withdrew", leader.name);
    }

    if let Some(last) = active.first() {
        let idx = wait_for_leader(&active).await?;
        report.leaders.push(active[idx].name.clone());

        if config.cleanup.enabled {
            let cleaner = SharedPathCleanup::new(coordinator.connect().await, target.clone())
                .with_timeout(config.cleanup_timeout());
            let outcome = cleaner.run().await?;
            tracing::info!("Cleanup while {} is registered: {:?}", last.name, outcome);
            report.cleanup_with_peer = Some(outcome);
        }
    }

    for participant in active.drain(..) {
        participant.election.shutdown().await?;
        participant.session.close().await;
    }
    drain(&mut rx, &mut report.transitions, json);

    if config.cleanup.enabled {
        let session = coordinator.connect().await;
        match session.delete(&election_path, None).await {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => return Err(e),
        }

        let outcome = SharedPathCleanup::new(session.clone(), target)
            .with_timeout(config.cleanup_timeout())
            .run()
            .await?;
        report.cleanup_final = Some(outcome);
        session.close().await;
    } else {
        tracing::info!("Cleanup disabled, leaving {} in place", config.app_root());
    }

    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| Error::Internal(format!("failed to encode report: {}", e)))?;
        println!("{}", out);
    } else {
        println!();
        println!("Leaders:          {}", report.leaders.join(" -> "));
        println!("With peer:        {}", describe(&report.cleanup_with_peer));
        println!("After shutdown:   {}", describe(&report.cleanup_final));
    }

    Ok(())
}

/// Create the instance marker and a discovery entry for a participant
async fn register_instance(
    session: &MemorySession,
    instances: &str,
    discovery: &str,
    name: &str,
) -> Result<()> {
    session
        .create(&join_path(instances, name), b"", CreateMode::Ephemeral, true)
        .await?;
    session
        .create(
            &join_path(&join_path(discovery, "election"), name),
            name.as_bytes(),
            CreateMode::Ephemeral,
            true,
        )
        .await?;
    Ok(())
}

async fn wait_for_leader(active: &[Participant]) -> Result<usize> {
    let poll = async {
        loop {
            if let Some(idx) = active.iter().position(|p| p.election.is_leader()) {
                return idx;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    tokio::time::timeout(LEADER_WAIT, poll)
        .await
        .map_err(|_| Error::Timeout(format!("no leader after {:?}", LEADER_WAIT)))
}

/// Collect reported transitions, printing them unless the output is JSON
fn drain(rx: &mut mpsc::UnboundedReceiver<Transition>, into: &mut Vec<Transition>, quiet: bool) {
    while let Ok(transition) = rx.try_recv() {
        if !quiet {
            let kind = match &transition.kind {
                TransitionKind::Leader => "LEADER".to_string(),
                TransitionKind::Follower => "FOLLOWER".to_string(),
                TransitionKind::Failed(cause) => format!("FAILED ({})", cause),
            };
            println!(
                "{}  {:<16} {}",
                transition.at.format("%H:%M:%S%.3f"),
                transition.participant,
                kind
            );
        }
        into.push(transition);
    }
}

fn describe(report: &Option<CleanupReport>) -> String {
    let Some(report) = report else {
        return "skipped (cleanup disabled)".to_string();
    };
    let removed: Vec<String> = report.removed.iter().map(|l| l.to_string()).collect();
    match report.blocked {
        None => format!("removed [{}]", removed.join(", ")),
        Some(level) => format!("removed [{}], stopped at {} (in use)", removed.join(", "), level),
    }
}
