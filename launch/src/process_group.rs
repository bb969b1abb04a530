//! Process group bootstrap
//!
//! Called from inside a rank function to join the distributed-training
//! process group. Rank 0 must be running on the coordinator node because the
//! rendezvous endpoint is built from the coordinator's address.
//!
//! ```no_run
//! # use mesh_launch::{init_process_group, LocalRendezvous, RankEnv, Transport};
//! # fn main_fn(env: &RankEnv, rendezvous: &LocalRendezvous) -> anyhow::Result<()> {
//! let group = init_process_group(env, rendezvous, Transport::Nccl, None)?;
//! // ... train ...
//! # drop(group);
//! # Ok(())
//! # }
//! ```

use crate::dispatch::RankEnv;
use crate::errors::{LaunchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Barrier, Mutex};
use tracing::{debug, info};

/// Rendezvous port used when none is given.
pub const DEFAULT_PORT: u16 = 29500;

/// Collective communication backend requested from the training library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Nccl,
    Gloo,
    Mpi,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Nccl => write!(f, "nccl"),
            Transport::Gloo => write!(f, "gloo"),
            Transport::Mpi => write!(f, "mpi"),
        }
    }
}

/// Everything the training library needs to join a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousSpec {
    pub transport: Transport,
    /// `tcp://<coordinator>:<port>`
    pub endpoint: String,
    pub rank: usize,
    pub world_size: usize,
}

/// An initialized process group membership.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every rank in the group reaches the barrier.
    fn barrier(&self) -> Result<()>;
}

/// Distributed-training initialization library.
pub trait ProcessGroupBackend: Send + Sync {
    type Group: ProcessGroup;

    /// Perform the rendezvous handshake for one rank.
    fn init(&self, spec: &RendezvousSpec) -> Result<Self::Group>;
}

/// Fail unless rank 0 runs on the coordinator node.
///
/// Other ranks may run anywhere.
pub fn verify_rank_zero_placement(env: &RankEnv) -> Result<()> {
    if env.rank != 0 {
        return Ok(());
    }

    let node = env.node_address();
    let coordinator = env.master_address()?;
    if node != coordinator {
        return Err(LaunchError::Placement {
            rank: env.rank,
            node,
            coordinator,
        });
    }

    Ok(())
}

/// Join the process group for this rank, then wait for all ranks.
///
/// `port` defaults to [`DEFAULT_PORT`].
pub fn init_process_group<B: ProcessGroupBackend>(
    env: &RankEnv,
    backend: &B,
    transport: Transport,
    port: Option<u16>,
) -> Result<B::Group> {
    verify_rank_zero_placement(env)?;

    let coordinator = env.master_address()?;
    let endpoint = SocketAddr::new(coordinator, port.unwrap_or(DEFAULT_PORT));
    let spec = RendezvousSpec {
        transport,
        endpoint: format!("tcp://{}", endpoint),
        rank: env.rank,
        world_size: env.world_size,
    };

    debug!(
        rank = spec.rank,
        world_size = spec.world_size,
        endpoint = %spec.endpoint,
        transport = %spec.transport,
        "Initializing process group"
    );

    let group = backend.init(&spec)?;
    group.barrier()?;

    info!(
        rank = spec.rank,
        world_size = spec.world_size,
        endpoint = %spec.endpoint,
        "Process group ready"
    );

    Ok(group)
}

struct LocalGroup {
    transport: Transport,
    world_size: usize,
    barrier: Barrier,
    joined: Mutex<HashSet<usize>>,
}

type Registry = Arc<Mutex<HashMap<String, Arc<LocalGroup>>>>;

/// In-memory rendezvous for ranks running in one process.
///
/// Ranks that init against the same endpoint form one group. The group is
/// torn down when its last member is dropped, so the endpoint can be reused
/// by a later dispatch.
#[derive(Clone, Default)]
pub struct LocalRendezvous {
    groups: Registry,
}

impl LocalRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranks currently joined on `endpoint`.
    pub fn members(&self, endpoint: &str) -> usize {
        let groups = match self.groups.lock() {
            Ok(groups) => groups,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups
            .get(endpoint)
            .map(|group| match group.joined.lock() {
                Ok(joined) => joined.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .unwrap_or(0)
    }
}

impl ProcessGroupBackend for LocalRendezvous {
    type Group = LocalMember;

    fn init(&self, spec: &RendezvousSpec) -> Result<LocalMember> {
        if spec.world_size == 0 || spec.rank >= spec.world_size {
            return Err(LaunchError::ProcessGroup(format!(
                "rank {} out of range for world size {}",
                spec.rank, spec.world_size
            )));
        }

        let mut groups = self
            .groups
            .lock()
            .map_err(|_| LaunchError::ProcessGroup("rendezvous registry poisoned".into()))?;

        let group = groups
            .entry(spec.endpoint.clone())
            .or_insert_with(|| {
                Arc::new(LocalGroup {
                    transport: spec.transport,
                    world_size: spec.world_size,
                    barrier: Barrier::new(spec.world_size),
                    joined: Mutex::new(HashSet::new()),
                })
            })
            .clone();

        if group.world_size != spec.world_size || group.transport != spec.transport {
            return Err(LaunchError::ProcessGroup(format!(
                "rank {} joined {} with world size {} over {}, group has {} over {}",
                spec.rank,
                spec.endpoint,
                spec.world_size,
                spec.transport,
                group.world_size,
                group.transport
            )));
        }

        let mut joined = group
            .joined
            .lock()
            .map_err(|_| LaunchError::ProcessGroup("group membership poisoned".into()))?;
        if !joined.insert(spec.rank) {
            return Err(LaunchError::ProcessGroup(format!(
                "rank {} already joined {}",
                spec.rank, spec.endpoint
            )));
        }
        drop(joined);

        debug!(rank = spec.rank, endpoint = %spec.endpoint, "Rank joined local group");

        Ok(LocalMember {
            rank: spec.rank,
            endpoint: spec.endpoint.clone(),
            group,
            registry: self.groups.clone(),
        })
    }
}

/// One rank's membership in a [`LocalRendezvous`] group.
pub struct LocalMember {
    rank: usize,
    endpoint: String,
    group: Arc<LocalGroup>,
    registry: Registry,
}

impl LocalMember {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ProcessGroup for LocalMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.group.barrier.wait();
        Ok(())
    }
}

impl Drop for LocalMember {
    fn drop(&mut self) {
        // Registry before membership, same order as init.
        let mut groups = match self.registry.lock() {
            Ok(groups) => groups,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut joined = match self.group.joined.lock() {
            Ok(joined) => joined,
            Err(poisoned) => poisoned.into_inner(),
        };

        joined.remove(&self.rank);
        if joined.is_empty() {
            if let Some(current) = groups.get(&self.endpoint) {
                if Arc::ptr_eq(current, &self.group) {
                    groups.remove(&self.endpoint);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::AddressInfo;
    use std::thread;
    use uuid::Uuid;

    fn env(rank: usize, world_size: usize, node: &str) -> RankEnv {
        RankEnv::new(
            Uuid::new_v4(),
            rank,
            world_size,
            AddressInfo {
                address: "10.0.0.1:6379".to_string(),
                node_ip_address: node.parse().unwrap(),
            },
        )
    }

    #[test]
    fn test_rank_zero_on_coordinator_passes() {
        assert!(verify_rank_zero_placement(&env(0, 4, "10.0.0.1")).is_ok());
    }

    #[test]
    fn test_rank_zero_elsewhere_fails() {
        let err = verify_rank_zero_placement(&env(0, 4, "10.0.0.2")).unwrap_err();
        match err {
            LaunchError::Placement {
                rank,
                node,
                coordinator,
            } => {
                assert_eq!(rank, 0);
                assert_eq!(node.to_string(), "10.0.0.2");
                assert_eq!(coordinator.to_string(), "10.0.0.1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_other_ranks_anywhere() {
        assert!(verify_rank_zero_placement(&env(1, 4, "10.0.0.2")).is_ok());
        assert!(verify_rank_zero_placement(&env(3, 4, "10.0.0.1")).is_ok());
    }

    #[test]
    fn test_init_rejects_misplaced_rank_zero_before_backend() {
        let rendezvous = LocalRendezvous::new();
        let result = init_process_group(&env(0, 1, "10.0.0.3"), &rendezvous, Transport::Nccl, None);
        assert!(matches!(result, Err(LaunchError::Placement { .. })));
        assert_eq!(rendezvous.members("tcp://10.0.0.1:29500"), 0);
    }

    #[test]
    fn test_single_rank_group() {
        let rendezvous = LocalRendezvous::new();
        let group =
            init_process_group(&env(0, 1, "10.0.0.1"), &rendezvous, Transport::Gloo, Some(23456))
                .unwrap();

        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        assert_eq!(group.endpoint(), "tcp://10.0.0.1:23456");
        assert_eq!(rendezvous.members("tcp://10.0.0.1:23456"), 1);

        drop(group);
        assert_eq!(rendezvous.members("tcp://10.0.0.1:23456"), 0);
    }

    #[test]
    fn test_ipv6_endpoint_is_bracketed() {
        let rendezvous = LocalRendezvous::new();
        let env = RankEnv::new(
            Uuid::new_v4(),
            0,
            1,
            AddressInfo {
                address: "[fd00::1]:6379".to_string(),
                node_ip_address: "fd00::1".parse().unwrap(),
            },
        );
        let group = init_process_group(&env, &rendezvous, Transport::Nccl, None).unwrap();
        assert_eq!(group.endpoint(), "tcp://[fd00::1]:29500");
    }

    #[test]
    fn test_barrier_across_threads() {
        let rendezvous = LocalRendezvous::new();
        let world_size = 4;

        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let rendezvous = rendezvous.clone();
                let node = if rank % 2 == 0 { "10.0.0.1" } else { "10.0.0.2" };
                let env = env(rank, world_size, node);
                thread::spawn(move || {
                    let group = init_process_group(&env, &rendezvous, Transport::Nccl, None)?;
                    group.barrier()?;
                    Ok::<_, LaunchError>(group.rank())
                })
            })
            .collect();

        let mut ranks: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert_eq!(rendezvous.members("tcp://10.0.0.1:29500"), 0);
    }

    #[test]
    fn test_duplicate_rank_rejected() {
        let rendezvous = LocalRendezvous::new();
        let spec = RendezvousSpec {
            transport: Transport::Nccl,
            endpoint: "tcp://10.0.0.1:29500".to_string(),
            rank: 1,
            world_size: 2,
        };

        let _first = rendezvous.init(&spec).unwrap();
        let err = rendezvous.init(&spec).err().unwrap();
        assert!(err.to_string().contains("already joined"));
    }

    #[test]
    fn test_world_size_mismatch_rejected() {
        let rendezvous = LocalRendezvous::new();
        let mut spec = RendezvousSpec {
            transport: Transport::Nccl,
            endpoint: "tcp://10.0.0.1:29500".to_string(),
            rank: 0,
            world_size: 2,
        };

        let _first = rendezvous.init(&spec).unwrap();
        spec.rank = 1;
        spec.world_size = 3;
        assert!(matches!(
            rendezvous.init(&spec),
            Err(LaunchError::ProcessGroup(_))
        ));
    }

    #[test]
    fn test_rank_out_of_range_rejected() {
        let rendezvous = LocalRendezvous::new();
        let spec = RendezvousSpec {
            transport: Transport::Nccl,
            endpoint: "tcp://10.0.0.1:29500".to_string(),
            rank: 2,
            world_size: 2,
        };
        assert!(matches!(
            rendezvous.init(&spec),
            Err(LaunchError::ProcessGroup(_))
        ));
    }
}
