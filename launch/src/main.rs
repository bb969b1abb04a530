//! mesh-launch - Command Line Interface
//!
//! Runs the launcher against an in-process simulated cluster.
//!
//! ## Commands
//!
//! - `demo` - Split a task list across every rank and merge the results
//! - `bootstrap` - Initialize a process group on every rank
//! - `config init` - Write the default configuration file
//! - `config show` - Print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_launch::{
    cluster::parse_host, init_logging, init_process_group, ClusterClient, LaunchConfig, Launcher,
    LocalCluster, LocalRendezvous, NodeSpec, ProcessGroup, RankEnv,
};
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Fan a function out across every accelerator of a cluster
#[derive(Parser, Debug)]
#[command(name = "mesh-launch")]
#[command(about = "Rank dispatch and task splitting over a simulated cluster", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.meshlaunch/launch.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Double a list of numbers split across every rank, then merge in order
    Demo {
        /// Number of simulated nodes (the first is the head)
        #[arg(short, long, default_value = "2")]
        nodes: usize,

        /// Accelerator units per node
        #[arg(short, long, default_value = "2")]
        accelerators_per_node: usize,

        /// Number of tasks
        #[arg(short, long, default_value = "10")]
        tasks: u64,
    },

    /// Initialize a process group on every rank and wait on a barrier
    Bootstrap {
        /// Number of simulated nodes (the first is the head)
        #[arg(short, long, default_value = "2")]
        nodes: usize,

        /// Accelerator units per node
        #[arg(short, long, default_value = "2")]
        accelerators_per_node: usize,

        /// Rendezvous port; overrides the config file
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => LaunchConfig::default_path()?,
    };
    let config = LaunchConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let _log_guard = init_logging(&config.logging, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Demo {
            nodes,
            accelerators_per_node,
            tasks,
        } => run_demo(&config, nodes, accelerators_per_node, tasks).await,
        Commands::Bootstrap {
            nodes,
            accelerators_per_node,
            port,
        } => run_bootstrap(&config, nodes, accelerators_per_node, port).await,
        Commands::Config { action } => run_config(action, &config, &config_path),
    }
}

async fn run_demo(
    config: &LaunchConfig,
    nodes: usize,
    accelerators_per_node: usize,
    tasks: u64,
) -> Result<()> {
    let cluster = Arc::new(start_local_cluster(config, nodes, accelerators_per_node)?);
    let launcher = Launcher::new(cluster.clone(), config.dispatch.clone())?;

    let outcome = until_interrupted(&cluster, async {
        let placements = launcher
            .distribute(|env: &RankEnv, _: &()| Ok(env.node_address()), ())
            .await?;

        println!("\nRank placement ({} ranks):", placements.len());
        for (rank, node) in placements.iter().enumerate() {
            println!("  rank {:>3} -> {}", rank, node);
        }

        let doubled = launcher
            .parallelize(
                |slice: Vec<u64>, _: &()| {
                    info!(tasks = ?slice, "Processing slice");
                    Ok(slice.into_iter().map(|t| t * 2).collect::<Vec<u64>>())
                },
                (0..tasks).collect(),
                (),
            )
            .await?;

        println!("\nMerged results: {:?}", doubled);
        Ok::<(), anyhow::Error>(())
    })
    .await;

    launcher.stats().log_summary();
    cluster.shutdown().await?;
    outcome
}

async fn run_bootstrap(
    config: &LaunchConfig,
    nodes: usize,
    accelerators_per_node: usize,
    port: Option<u16>,
) -> Result<()> {
    let cluster = Arc::new(start_local_cluster(config, nodes, accelerators_per_node)?);
    let launcher = Launcher::new(cluster.clone(), config.dispatch.clone())?;
    let transport = config.process_group.transport;
    let port = port.unwrap_or(config.process_group.port);

    let outcome = until_interrupted(&cluster, async {
        let members = launcher
            .distribute(
                move |env: &RankEnv, rendezvous: &LocalRendezvous| {
                    let group = init_process_group(env, rendezvous, transport, Some(port))?;
                    Ok((env.node_address(), group.world_size()))
                },
                LocalRendezvous::new(),
            )
            .await?;

        println!("\n✓ Process group ready over {} on port {}", transport, port);
        for (rank, (node, world_size)) in members.iter().enumerate() {
            println!("  rank {:>3}/{} on {}", rank, world_size, node);
        }
        Ok::<(), anyhow::Error>(())
    })
    .await;

    launcher.stats().log_summary();
    cluster.shutdown().await?;
    outcome
}

fn run_config(action: ConfigAction, config: &LaunchConfig, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            LaunchConfig::default().save(path)?;
            println!("✓ Wrote default configuration to {}", path.display());
        }
        ConfigAction::Show => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}

/// Run `work`, shutting the cluster down on Ctrl+C.
async fn until_interrupted<F>(cluster: &LocalCluster, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = work => result,
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal (Ctrl+C)");
            cluster.shutdown().await?;
            anyhow::bail!("interrupted")
        }
    }
}

/// Start the simulated cluster and print its layout.
fn start_local_cluster(
    config: &LaunchConfig,
    nodes: usize,
    accelerators_per_node: usize,
) -> Result<LocalCluster> {
    if nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }

    let cluster_config = config.cluster_config()?;
    let head = parse_host(&cluster_config.address)?;
    let specs = node_addresses(head, nodes)?
        .into_iter()
        .map(|address| NodeSpec::new(address, accelerators_per_node))
        .collect();

    let cluster = LocalCluster::start(cluster_config, specs)?;

    println!(
        "Cluster {} (working dir {})",
        cluster.config().address,
        cluster.config().runtime_env.working_dir.display()
    );
    for node in cluster.nodes() {
        println!("  node {} with {} accelerators", node.address, node.accelerators);
    }
    Ok(cluster)
}

/// `count` consecutive addresses starting at the head.
fn node_addresses(head: IpAddr, count: usize) -> Result<Vec<IpAddr>> {
    (0..count).map(|offset| nth_address(head, offset)).collect()
}

/// The address `offset` places after `head`.
fn nth_address(head: IpAddr, offset: usize) -> Result<IpAddr> {
    let next = match head {
        IpAddr::V4(v4) => u32::try_from(offset)
            .ok()
            .and_then(|offset| u32::from(v4).checked_add(offset))
            .map(|n| IpAddr::V4(n.into())),
        IpAddr::V6(v6) => u128::try_from(offset)
            .ok()
            .and_then(|offset| u128::from(v6).checked_add(offset))
            .map(|n| IpAddr::V6(n.into())),
    };
    next.with_context(|| format!("no address {} places after {}", offset, head))
}
