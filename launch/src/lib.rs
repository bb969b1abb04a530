//! Fan a function out across every accelerator of a cluster.
//!
//! Each invocation gets a unique rank and the shared world size; results come
//! back to the caller in rank order. Built for bootstrapping distributed
//! training (one process per accelerator) and for splitting a task list
//! across workers.
//!
//! ```no_run
//! use mesh_launch::{
//!     init_process_group, ClusterConfig, DispatchConfig, Launcher, LocalCluster,
//!     LocalRendezvous, NodeSpec, RankEnv, RuntimeEnv, Transport,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cluster = LocalCluster::start(
//!     ClusterConfig {
//!         address: "10.0.0.1:6379".into(),
//!         runtime_env: RuntimeEnv { working_dir: std::env::current_dir()? },
//!     },
//!     vec![
//!         NodeSpec::new("10.0.0.1".parse()?, 2),
//!         NodeSpec::new("10.0.0.2".parse()?, 2),
//!     ],
//! )?;
//! let launcher = Launcher::new(Arc::new(cluster), DispatchConfig::default())?;
//!
//! // One call per rank
//! let rendezvous = LocalRendezvous::new();
//! launcher
//!     .distribute(
//!         |env: &RankEnv, rendezvous: &LocalRendezvous| {
//!             let _group = init_process_group(env, rendezvous, Transport::Nccl, None)?;
//!             Ok(())
//!         },
//!         rendezvous,
//!     )
//!     .await?;
//!
//! // Split a task list across ranks
//! let doubled = launcher
//!     .parallelize(
//!         |tasks: Vec<u64>, _: &()| Ok(tasks.into_iter().map(|t| t * 2).collect()),
//!         (0..10).collect(),
//!         (),
//!     )
//!     .await?;
//! assert_eq!(doubled, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod observability;
pub mod partition;
pub mod process_group;
pub mod stats;

pub use cluster::{
    AddressInfo, ClusterClient, ClusterConfig, LocalCluster, NodeAffinity, NodeSpec,
    ResourceRequest, RuntimeEnv, TaskHandle,
};
pub use config::{DispatchConfig, LaunchConfig, LoggingConfig, ProcessGroupConfig};
pub use dispatch::{Launcher, PlacementStrategy, RankEnv};
pub use errors::{LaunchError, Result};
pub use observability::init_logging;
pub use process_group::{
    init_process_group, verify_rank_zero_placement, LocalMember, LocalRendezvous, ProcessGroup,
    ProcessGroupBackend, RendezvousSpec, Transport, DEFAULT_PORT,
};
pub use stats::{DispatchStats, RankZeroPlacement, StatsSnapshot};
