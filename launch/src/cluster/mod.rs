//! Cluster client interface
//!
//! The resource manager that actually owns the accelerators lives outside this
//! crate. Everything the launcher needs from it is captured by [`ClusterClient`]:
//!
//! - accelerator units per node (which bound the world size of a dispatch)
//! - submission of one task that reserves N accelerator units
//! - waiting on a batch of task handles, in submission order
//! - the registered coordinator address and the local node address
//!
//! [`LocalCluster`] is an in-process implementation that simulates several
//! nodes on one tokio runtime.

pub mod local;

pub use local::{LocalCluster, NodeSpec};

use crate::errors::{LaunchError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Environment shipped to every worker before tasks run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    /// Directory packaged and made the working directory of remote tasks
    pub working_dir: PathBuf,
}

/// Connection settings for a cluster client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Registered coordinator address (`host:port`)
    pub address: String,

    /// Runtime environment for workers
    pub runtime_env: RuntimeEnv,
}

/// Addresses as seen by the cluster agent of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// Registered coordinator address (`host:port`)
    pub address: String,

    /// IP address of the node this agent runs on
    pub node_ip_address: IpAddr,
}

impl AddressInfo {
    /// IP address of the coordinator (head) node.
    pub fn master_address(&self) -> Result<IpAddr> {
        parse_host(&self.address)
    }

    /// IP address of the current node.
    pub fn node_address(&self) -> IpAddr {
        self.node_ip_address
    }

    /// Whether this task runs on the coordinator node.
    pub fn is_coordinator(&self) -> Result<bool> {
        Ok(self.master_address()? == self.node_ip_address)
    }
}

/// Extract the host IP from a registered `host:port` address.
///
/// Accepts `10.0.0.1:6379`, `[::1]:6379` and bare IPs.
pub fn parse_host(address: &str) -> Result<IpAddr> {
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Ok(socket.ip());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let host = address
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(address);

    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|e| LaunchError::Address(format!("invalid cluster address '{}': {}", address, e)))
}

/// Where the scheduler may place a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeAffinity {
    /// Any node with free capacity
    #[default]
    Any,
    /// Only the node with this address
    Node(IpAddr),
}

impl fmt::Display for NodeAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAffinity::Any => write!(f, "any"),
            NodeAffinity::Node(ip) => write!(f, "node:{}", ip),
        }
    }
}

/// Resources reserved for a single remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Accelerator units reserved exclusively for the task
    pub accelerators: usize,

    /// Placement constraint
    pub affinity: NodeAffinity,
}

impl ResourceRequest {
    /// Request `accelerators` units anywhere in the cluster.
    pub fn accelerators(accelerators: usize) -> Self {
        Self {
            accelerators,
            affinity: NodeAffinity::Any,
        }
    }

    /// Pin the task to one node.
    pub fn on_node(mut self, node: IpAddr) -> Self {
        self.affinity = NodeAffinity::Node(node);
        self
    }
}

/// Handle to a submitted task.
///
/// Resolves to the task's result once it finishes on its worker.
pub struct TaskHandle<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wrap a future that resolves when the remote task completes.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Handle for a task that has already completed.
    pub fn ready(result: Result<T>) -> Self {
        Self::new(futures::future::ready(result))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

/// Connection to the cluster resource manager.
///
/// Implementations are constructed explicitly (no process-wide context) and
/// torn down with [`ClusterClient::shutdown`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Accelerator units of each node, in the scheduler's node order.
    async fn node_accelerators(&self) -> Result<Vec<usize>>;

    /// Total accelerator units registered in the cluster.
    async fn accelerator_count(&self) -> Result<usize> {
        Ok(self.node_accelerators().await?.iter().sum())
    }

    /// Whether [`NodeAffinity::Node`] requests are honored.
    fn supports_node_affinity(&self) -> bool {
        false
    }

    /// Submit a task. `task` runs on the node the scheduler picks and
    /// receives that node's [`AddressInfo`].
    async fn submit<T, F>(&self, request: ResourceRequest, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(AddressInfo) -> Result<T> + Send + 'static;

    /// Wait for every handle and return results in the order given.
    ///
    /// Fails with the first error observed; remaining tasks are not cancelled.
    async fn wait_all<T>(&self, handles: Vec<TaskHandle<T>>) -> Result<Vec<T>>
    where
        T: Send + 'static,
    {
        futures::future::try_join_all(handles).await
    }

    /// Addresses as seen from the caller's node.
    fn address_info(&self) -> AddressInfo;

    /// Disconnect from the cluster. Later submissions fail.
    async fn shutdown(&self) -> Result<()>;
}
