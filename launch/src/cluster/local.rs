//! In-process cluster
//!
//! Simulates a multi-node cluster inside one tokio runtime. Each node owns a
//! semaphore with one permit per accelerator unit; a task holds its permits
//! for as long as it runs. Task bodies are synchronous and run on the
//! blocking pool, one thread per task, standing in for one process per
//! accelerator.
//!
//! Placement rules:
//! - `NodeAffinity::Node(ip)` waits for capacity on that node only
//! - `NodeAffinity::Any` picks the node with the most free permits, ties
//!   going to the node registered first (the head); when every node is full
//!   the task queues on all of them and takes the first permit released

use super::{AddressInfo, ClusterClient, ClusterConfig, NodeAffinity, ResourceRequest, TaskHandle};
use crate::errors::{LaunchError, Result};
use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument};

/// One simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpec {
    /// Node IP address
    pub address: IpAddr,

    /// Accelerator units on this node
    pub accelerators: usize,
}

impl NodeSpec {
    /// A node at `address` with `accelerators` units.
    pub fn new(address: IpAddr, accelerators: usize) -> Self {
        Self {
            address,
            accelerators,
        }
    }
}

struct LocalNode {
    spec: NodeSpec,
    permits: Arc<Semaphore>,
}

struct Inner {
    config: ClusterConfig,
    head: IpAddr,
    nodes: Vec<LocalNode>,
    shut_down: AtomicBool,
    next_task_id: AtomicU64,
}

/// Where a submitted task will run.
enum Reservation {
    /// Permits already taken on this node
    Ready(usize, OwnedSemaphorePermit),
    /// Waiting for capacity on any of these nodes
    Queued(Vec<usize>),
}

/// In-process cluster with a fixed set of nodes.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<Inner>,
}

impl LocalCluster {
    /// Start a cluster.
    ///
    /// The head node is the one whose address matches the host of
    /// `config.address`; the caller is treated as running on it.
    pub fn start(config: ClusterConfig, nodes: Vec<NodeSpec>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(LaunchError::Config("cluster needs at least one node".into()));
        }

        let head = super::parse_host(&config.address)?;
        let head_index = nodes
            .iter()
            .position(|n| n.address == head)
            .ok_or_else(|| {
                LaunchError::Config(format!("head address {} is not one of the cluster nodes", head))
            })?;

        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|other| other.address == node.address) {
                return Err(LaunchError::Config(format!(
                    "duplicate node address {}",
                    node.address
                )));
            }
        }

        if !config.runtime_env.working_dir.is_dir() {
            return Err(LaunchError::Config(format!(
                "working directory {} does not exist",
                config.runtime_env.working_dir.display()
            )));
        }

        // Head first so it wins placement ties.
        let mut ordered = nodes;
        let head_spec = ordered.remove(head_index);
        ordered.insert(0, head_spec);

        let nodes: Vec<LocalNode> = ordered
            .into_iter()
            .map(|spec| LocalNode {
                spec,
                permits: Arc::new(Semaphore::new(spec.accelerators)),
            })
            .collect();

        info!(
            address = %config.address,
            nodes = nodes.len(),
            accelerators = nodes.iter().map(|n| n.spec.accelerators).sum::<usize>(),
            working_dir = %config.runtime_env.working_dir.display(),
            "Local cluster started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                head,
                nodes,
                shut_down: AtomicBool::new(false),
                next_task_id: AtomicU64::new(1),
            }),
        })
    }

    /// Registered cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Nodes in placement order (head first).
    pub fn nodes(&self) -> Vec<NodeSpec> {
        self.inner.nodes.iter().map(|n| n.spec).collect()
    }

    /// Free accelerator units on a node, or `None` for an unknown address.
    pub fn available_accelerators(&self, node: IpAddr) -> Option<usize> {
        self.inner
            .nodes
            .iter()
            .find(|n| n.spec.address == node)
            .map(|n| n.permits.available_permits())
    }

    fn address_for(&self, node_index: usize) -> AddressInfo {
        AddressInfo {
            address: self.inner.config.address.clone(),
            node_ip_address: self.inner.nodes[node_index].spec.address,
        }
    }

    fn reserve(&self, request: &ResourceRequest) -> Result<Reservation> {
        let wanted = request.accelerators;
        let permits = u32::try_from(wanted)
            .map_err(|_| LaunchError::Cluster(format!("cannot reserve {} accelerators", wanted)))?;

        let candidates: Vec<usize> = match request.affinity {
            NodeAffinity::Node(address) => {
                let index = self
                    .inner
                    .nodes
                    .iter()
                    .position(|n| n.spec.address == address)
                    .ok_or_else(|| LaunchError::Cluster(format!("unknown node {}", address)))?;
                vec![index]
            }
            NodeAffinity::Any => {
                let mut indices: Vec<usize> = (0..self.inner.nodes.len()).collect();
                // Stable sort keeps registration order among equally loaded nodes.
                indices.sort_by_key(|&i| std::cmp::Reverse(self.inner.nodes[i].permits.available_permits()));
                indices
            }
        };

        let candidates: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| self.inner.nodes[i].spec.accelerators >= wanted)
            .collect();

        if candidates.is_empty() {
            return Err(LaunchError::Cluster(format!(
                "no node can satisfy a request for {} accelerators ({})",
                wanted, request.affinity
            )));
        }

        for &index in &candidates {
            let semaphore = self.inner.nodes[index].permits.clone();
            if let Ok(permit) = semaphore.try_acquire_many_owned(permits) {
                return Ok(Reservation::Ready(index, permit));
            }
        }

        Ok(Reservation::Queued(candidates))
    }
}

/// Wait until any of the candidate nodes has capacity.
async fn acquire_first(
    inner: Arc<Inner>,
    candidates: Vec<usize>,
    permits: u32,
) -> Result<(usize, OwnedSemaphorePermit)> {
    let waits: Vec<BoxFuture<'static, _>> = candidates
        .into_iter()
        .map(|index| {
            let semaphore = inner.nodes[index].permits.clone();
            let wait: BoxFuture<'static, _> = Box::pin(async move {
                semaphore
                    .acquire_many_owned(permits)
                    .await
                    .map(|permit| (index, permit))
            });
            wait
        })
        .collect();

    let (acquired, _, _) = future::select_all(waits).await;
    acquired.map_err(|_| LaunchError::Cluster("cluster shut down while task was queued".into()))
}

#[async_trait]
impl ClusterClient for LocalCluster {
    async fn node_accelerators(&self) -> Result<Vec<usize>> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(LaunchError::Cluster("cluster has been shut down".into()));
        }
        Ok(self.inner.nodes.iter().map(|n| n.spec.accelerators).collect())
    }

    fn supports_node_affinity(&self) -> bool {
        true
    }

    #[instrument(skip(self, task), fields(affinity = %request.affinity, accelerators = request.accelerators))]
    async fn submit<T, F>(&self, request: ResourceRequest, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(AddressInfo) -> Result<T> + Send + 'static,
    {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(LaunchError::Cluster("cluster has been shut down".into()));
        }

        let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let reservation = self.reserve(&request)?;

        if let Reservation::Ready(index, _) = &reservation {
            debug!(task_id, node = %self.inner.nodes[*index].spec.address, "Task placed");
        } else {
            debug!(task_id, "No free capacity, task queued");
        }

        let cluster = self.clone();
        let join = tokio::spawn(async move {
            let (index, permit) = match reservation {
                Reservation::Ready(index, permit) => (index, permit),
                Reservation::Queued(candidates) => {
                    let permits = request.accelerators as u32;
                    let placed = acquire_first(cluster.inner.clone(), candidates, permits).await?;
                    debug!(task_id, node = %cluster.inner.nodes[placed.0].spec.address, "Queued task placed");
                    placed
                }
            };

            let address_info = cluster.address_for(index);
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                task(address_info)
            })
            .await
            .map_err(|e| LaunchError::Cluster(format!("task {} did not complete: {}", task_id, e)))?
        });

        Ok(TaskHandle::new(async move {
            join.await
                .map_err(|e| LaunchError::Cluster(format!("task {} was lost: {}", task_id, e)))?
        }))
    }

    fn address_info(&self) -> AddressInfo {
        AddressInfo {
            address: self.inner.config.address.clone(),
            node_ip_address: self.inner.head,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for node in &self.inner.nodes {
            node.permits.close();
        }
        info!(address = %self.inner.config.address, "Local cluster shut down");
        Ok(())
    }
}
