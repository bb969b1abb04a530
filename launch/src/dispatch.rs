//! Rank dispatch
//!
//! [`Launcher::distribute`] runs one invocation of a function per rank, where
//! the world size is the number of ranks the cluster can host at once: each
//! node contributes its accelerator units divided (rounding down) by the
//! units reserved per rank. Every rank can therefore be running at the same
//! time, which collective rendezvous needs. Results come back in rank order.
//!
//! [`Launcher::parallelize`] builds on it: rank `r` of `W` processes tasks
//! `r, r + W, ...` and the per-rank outputs are interleaved back into input
//! order.
//!
//! ## Rank 0 placement
//!
//! Rank 0 has to land on the coordinator node, because the process group
//! rendezvous endpoint is the coordinator's address. With
//! [`PlacementStrategy::Pin`] and a scheduler that supports node affinity,
//! rank 0 is submitted with an explicit affinity for the coordinator. Without
//! affinity support the launcher falls back to a timing heuristic: rank 0 is
//! submitted alone, the other ranks only after `bias_window`, and each task
//! waits `task_start_delay` before running. On an otherwise idle cluster the
//! scheduler places rank 0 first, which usually means the coordinator. This
//! is best-effort; [`verify_rank_zero_placement`](crate::verify_rank_zero_placement)
//! catches the cases where it does not hold.

use crate::cluster::{AddressInfo, ClusterClient, NodeAffinity, ResourceRequest, TaskHandle};
use crate::config::DispatchConfig;
use crate::errors::{LaunchError, Result};
use crate::partition;
use crate::stats::{DispatchStats, RankZeroPlacement};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

/// How rank 0 is steered onto the coordinator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStrategy {
    /// Node affinity for rank 0, bias window if the scheduler lacks affinity
    #[default]
    Pin,
    /// Bias window only
    Bias,
}

/// What a rank invocation knows about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankEnv {
    /// This invocation's rank, in `0..world_size`
    pub rank: usize,

    /// Number of ranks in this dispatch
    pub world_size: usize,

    /// Identifier shared by every rank of one dispatch
    pub dispatch_id: Uuid,

    address_info: AddressInfo,
}

impl RankEnv {
    /// Environment for `rank` of a dispatch, running where `address_info` says.
    pub fn new(dispatch_id: Uuid, rank: usize, world_size: usize, address_info: AddressInfo) -> Self {
        Self {
            rank,
            world_size,
            dispatch_id,
            address_info,
        }
    }

    /// Coordinator node address, where rank 0 should be running.
    pub fn master_address(&self) -> Result<IpAddr> {
        self.address_info.master_address()
    }

    /// Address of the node this rank was placed on.
    pub fn node_address(&self) -> IpAddr {
        self.address_info.node_address()
    }

    /// Raw addresses reported by the cluster for this rank's node.
    pub fn address_info(&self) -> &AddressInfo {
        &self.address_info
    }

    /// Rank 0 hosts the process group rendezvous.
    pub fn is_rank_zero(&self) -> bool {
        self.rank == 0
    }
}

/// Fans functions out across every accelerator of a cluster.
pub struct Launcher<C> {
    client: Arc<C>,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,
}

impl<C: ClusterClient + 'static> Launcher<C> {
    /// Create a launcher.
    ///
    /// Fails on an invalid configuration without touching the cluster.
    pub fn new(client: Arc<C>, config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            stats: Arc::new(DispatchStats::new()),
        })
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Counters updated by every dispatch of this launcher.
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Coordinator node address.
    pub fn master_address(&self) -> Result<IpAddr> {
        self.client.address_info().master_address()
    }

    /// Address of the node the caller runs on.
    pub fn node_address(&self) -> IpAddr {
        self.client.address_info().node_address()
    }

    /// Current world size: ranks that fit on the cluster's nodes at once.
    pub async fn world_size(&self) -> Result<usize> {
        let nodes = self.client.node_accelerators().await?;
        match ranks_hosted(&nodes, self.config.accelerators_per_rank) {
            0 => Err(LaunchError::NoAccelerators),
            world_size => Ok(world_size),
        }
    }

    /// Run `f` once per rank and collect the results in rank order.
    ///
    /// `args` is shared read-only by every rank. The first rank error (or
    /// panic) fails the whole call; there is no retry and no partial result.
    #[instrument(skip_all, fields(dispatch_id = tracing::field::Empty, world_size = tracing::field::Empty))]
    pub async fn distribute<A, R, F>(&self, f: F, args: A) -> Result<Vec<R>>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&RankEnv, &A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let world_size = self.world_size().await?;
        let dispatch_id = Uuid::new_v4();
        Span::current().record("dispatch_id", tracing::field::display(dispatch_id));
        Span::current().record("world_size", world_size);

        self.stats.record_dispatch(world_size);
        let rank_zero_affinity = self.rank_zero_affinity()?;
        let use_bias_window = rank_zero_affinity == NodeAffinity::Any;

        info!(
            placement = ?self.config.placement,
            rank_zero_affinity = %rank_zero_affinity,
            "Dispatching ranks"
        );

        let f = Arc::new(f);
        let args = Arc::new(args);
        let mut handles = Vec::with_capacity(world_size);

        let request = ResourceRequest {
            accelerators: self.config.accelerators_per_rank,
            affinity: rank_zero_affinity,
        };
        handles.push(self.submit_rank(dispatch_id, 0, world_size, request, &f, &args).await?);

        if use_bias_window && world_size > 1 && !self.config.bias_window().is_zero() {
            debug!(
                bias_window_ms = self.config.bias_window_ms,
                "Waiting before submitting remaining ranks"
            );
            tokio::time::sleep(self.config.bias_window()).await;
        }

        let request = ResourceRequest::accelerators(self.config.accelerators_per_rank);
        for rank in 1..world_size {
            handles.push(self.submit_rank(dispatch_id, rank, world_size, request, &f, &args).await?);
        }

        match self.client.wait_all(handles).await {
            Ok(results) => {
                info!(ranks = results.len(), "All ranks completed");
                Ok(results)
            }
            Err(e) => {
                error!(error = %e, rank = ?e.rank(), "Dispatch failed");
                Err(e)
            }
        }
    }

    /// Split `tasks` across ranks, run `f` on each slice, and merge the
    /// outputs back into task order.
    ///
    /// `f` must return exactly one output per task it receives.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn parallelize<T, A, R, F>(&self, f: F, tasks: Vec<T>, args: A) -> Result<Vec<R>>
    where
        T: Clone + Send + Sync + 'static,
        A: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(Vec<T>, &A) -> anyhow::Result<Vec<R>> + Send + Sync + 'static,
    {
        let total = tasks.len();

        let per_rank = self
            .distribute(
                move |env: &RankEnv, shared: &(Vec<T>, A)| {
                    let (tasks, args) = shared;
                    let expected = partition::slice_len(tasks.len(), env.rank, env.world_size);
                    debug!(rank = env.rank, tasks = expected, "Processing task slice");
                    let outputs = f(partition::stride_slice(tasks, env.rank, env.world_size), args)?;
                    Ok((expected, outputs))
                },
                (tasks, args),
            )
            .await?;

        let mut outputs = Vec::with_capacity(per_rank.len());
        for (rank, (expected, rank_outputs)) in per_rank.into_iter().enumerate() {
            if rank_outputs.len() != expected {
                return Err(LaunchError::ResultLength {
                    rank,
                    expected,
                    got: rank_outputs.len(),
                });
            }
            outputs.push(rank_outputs);
        }

        let merged = partition::interleave(outputs);
        debug_assert_eq!(merged.len(), total);
        Ok(merged)
    }

    fn rank_zero_affinity(&self) -> Result<NodeAffinity> {
        match self.config.placement {
            PlacementStrategy::Pin if self.client.supports_node_affinity() => {
                Ok(NodeAffinity::Node(self.master_address()?))
            }
            PlacementStrategy::Pin => {
                warn!("Cluster has no node affinity support, placing rank 0 with the bias window");
                Ok(NodeAffinity::Any)
            }
            PlacementStrategy::Bias => Ok(NodeAffinity::Any),
        }
    }

    async fn submit_rank<A, R, F>(
        &self,
        dispatch_id: Uuid,
        rank: usize,
        world_size: usize,
        request: ResourceRequest,
        f: &Arc<F>,
        args: &Arc<A>,
    ) -> Result<TaskHandle<R>>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&RankEnv, &A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let f = Arc::clone(f);
        let args = Arc::clone(args);
        let stats = Arc::clone(&self.stats);
        let start_delay = self.config.task_start_delay();
        let pinned = request.affinity != NodeAffinity::Any;

        let handle = self
            .client
            .submit(request, move |address_info: AddressInfo| {
                run_rank(
                    RankEnv::new(dispatch_id, rank, world_size, address_info),
                    start_delay,
                    pinned,
                    &stats,
                    |env| (*f)(env, &*args),
                )
            })
            .await?;

        debug!(rank, affinity = %request.affinity, "Rank submitted");
        Ok(handle)
    }
}

/// Ranks `nodes` can host at once with `per_rank` units each.
fn ranks_hosted(nodes: &[usize], per_rank: usize) -> usize {
    nodes.iter().map(|units| units / per_rank).sum()
}

/// Body of one rank task, executed on its worker.
fn run_rank<R>(
    env: RankEnv,
    start_delay: Duration,
    pinned: bool,
    stats: &DispatchStats,
    body: impl FnOnce(&RankEnv) -> anyhow::Result<R>,
) -> Result<R> {
    if !start_delay.is_zero() {
        std::thread::sleep(start_delay);
    }

    debug!(
        dispatch_id = %env.dispatch_id,
        rank = env.rank,
        world_size = env.world_size,
        node = %env.node_address(),
        "Rank started"
    );

    if env.is_rank_zero() {
        if let Ok(on_coordinator) = env.address_info().is_coordinator() {
            stats.record_rank_zero(match (on_coordinator, pinned) {
                (false, _) => RankZeroPlacement::Misplaced,
                (true, true) => RankZeroPlacement::Pinned,
                (true, false) => RankZeroPlacement::Biased,
            });
        }
    }

    let timer = stats.begin_rank();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&env)));
    let execution_time_ms = timer.finish(matches!(outcome, Ok(Ok(_))));

    match outcome {
        Ok(Ok(value)) => {
            debug!(
                dispatch_id = %env.dispatch_id,
                rank = env.rank,
                execution_time_ms,
                "Rank completed"
            );
            Ok(value)
        }
        Ok(Err(e)) => {
            warn!(
                dispatch_id = %env.dispatch_id,
                rank = env.rank,
                error = %e,
                "Rank failed"
            );
            Err(LaunchError::remote(env.rank, e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(
                dispatch_id = %env.dispatch_id,
                rank = env.rank,
                panic = %message,
                "Rank panicked"
            );
            Err(LaunchError::remote(
                env.rank,
                anyhow::anyhow!("rank function panicked: {}", message),
            ))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Runs every task inline on a fixed node and records what was asked of it.
    struct RecordingCluster {
        nodes: Vec<usize>,
        affinity: bool,
        info: AddressInfo,
        requests: Mutex<Vec<ResourceRequest>>,
        submitted_at: Mutex<Vec<Instant>>,
    }

    impl RecordingCluster {
        fn new(accelerators: usize, affinity: bool) -> Arc<Self> {
            Self::with_nodes(vec![accelerators], affinity)
        }

        fn with_nodes(nodes: Vec<usize>, affinity: bool) -> Arc<Self> {
            Arc::new(Self {
                nodes,
                affinity,
                info: AddressInfo {
                    address: "10.0.0.1:6379".to_string(),
                    node_ip_address: "10.0.0.1".parse().unwrap(),
                },
                requests: Mutex::new(Vec::new()),
                submitted_at: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ResourceRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn submitted_at(&self) -> Vec<Instant> {
            self.submitted_at.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterClient for RecordingCluster {
        async fn node_accelerators(&self) -> Result<Vec<usize>> {
            Ok(self.nodes.clone())
        }

        fn supports_node_affinity(&self) -> bool {
            self.affinity
        }

        async fn submit<T, F>(&self, request: ResourceRequest, task: F) -> Result<TaskHandle<T>>
        where
            T: Send + 'static,
            F: FnOnce(AddressInfo) -> Result<T> + Send + 'static,
        {
            self.requests.lock().unwrap().push(request);
            self.submitted_at.lock().unwrap().push(Instant::now());
            Ok(TaskHandle::ready(task(self.info.clone())))
        }

        fn address_info(&self) -> AddressInfo {
            self.info.clone()
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_submission() {
        let cluster = RecordingCluster::new(4, true);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Pin);
        config.accelerators_per_rank = 0;

        let result = Launcher::new(cluster.clone(), config);
        assert!(matches!(result, Err(LaunchError::Config(_))));
        assert!(cluster.requests().is_empty());
    }

    #[tokio::test]
    async fn test_no_accelerators_fails_before_submission() {
        let cluster = RecordingCluster::new(0, true);
        let launcher =
            Launcher::new(cluster.clone(), DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let result = launcher.distribute(|env: &RankEnv, _: &()| Ok(env.rank), ()).await;
        assert!(matches!(result, Err(LaunchError::NoAccelerators)));
        assert!(cluster.requests().is_empty());
    }

    #[tokio::test]
    async fn test_results_in_rank_order() {
        let cluster = RecordingCluster::new(5, true);
        let launcher =
            Launcher::new(cluster.clone(), DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let results = launcher
            .distribute(
                |env: &RankEnv, base: &usize| Ok((env.rank, env.world_size, base + env.rank)),
                100,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        for (r, (rank, world_size, value)) in results.into_iter().enumerate() {
            assert_eq!(rank, r);
            assert_eq!(world_size, 5);
            assert_eq!(value, 100 + r);
        }
        let stats = launcher.stats().snapshot();
        assert_eq!(stats.ranks_finished(), 5);
        assert_eq!(stats.success_rate(), Some(1.0));
        assert_eq!(stats.last_world_size, 5);
        assert_eq!(stats.rank_zero_pinned, 1);
    }

    #[tokio::test]
    async fn test_pin_requests_affinity_for_rank_zero_only() {
        let cluster = RecordingCluster::new(3, true);
        let launcher =
            Launcher::new(cluster.clone(), DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        launcher.distribute(|_: &RankEnv, _: &()| Ok(()), ()).await.unwrap();

        let requests = cluster.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests[0].affinity,
            NodeAffinity::Node("10.0.0.1".parse().unwrap())
        );
        assert!(requests[1..].iter().all(|r| r.affinity == NodeAffinity::Any));
    }

    #[tokio::test]
    async fn test_pin_falls_back_without_affinity_support() {
        let cluster = RecordingCluster::new(3, false);
        let launcher =
            Launcher::new(cluster.clone(), DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        launcher.distribute(|_: &RankEnv, _: &()| Ok(()), ()).await.unwrap();
        assert!(cluster.requests().iter().all(|r| r.affinity == NodeAffinity::Any));
        assert_eq!(launcher.stats().snapshot().rank_zero_biased, 1);
    }

    #[tokio::test]
    async fn test_accelerators_per_rank_divides_world_size() {
        let cluster = RecordingCluster::new(8, true);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Bias);
        config.accelerators_per_rank = 2;
        let launcher = Launcher::new(cluster.clone(), config).unwrap();

        let world_sizes = launcher
            .distribute(|env: &RankEnv, _: &()| Ok(env.world_size), ())
            .await
            .unwrap();

        assert_eq!(world_sizes, vec![4; 4]);
        assert!(cluster.requests().iter().all(|r| r.accelerators == 2));
    }

    #[tokio::test]
    async fn test_world_size_counts_whole_ranks_per_node() {
        // 3 + 3 units hold 6 / 2 = 3 ranks in total but only one per node.
        let cluster = RecordingCluster::with_nodes(vec![3, 3], true);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Pin);
        config.accelerators_per_rank = 2;
        let launcher = Launcher::new(cluster.clone(), config).unwrap();

        assert_eq!(launcher.world_size().await.unwrap(), 2);
        let world_sizes = launcher
            .distribute(|env: &RankEnv, _: &()| Ok(env.world_size), ())
            .await
            .unwrap();
        assert_eq!(world_sizes, vec![2, 2]);
        assert_eq!(cluster.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_nodes_too_small_for_a_rank() {
        let cluster = RecordingCluster::with_nodes(vec![1, 1, 1], true);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Pin);
        config.accelerators_per_rank = 2;
        let launcher = Launcher::new(cluster.clone(), config).unwrap();

        let result = launcher.distribute(|env: &RankEnv, _: &()| Ok(env.rank), ()).await;
        assert!(matches!(result, Err(LaunchError::NoAccelerators)));
        assert!(cluster.requests().is_empty());
    }

    #[test]
    fn test_ranks_hosted() {
        assert_eq!(ranks_hosted(&[4, 4], 1), 8);
        assert_eq!(ranks_hosted(&[3, 3], 2), 2);
        assert_eq!(ranks_hosted(&[5, 2, 1], 2), 3);
        assert_eq!(ranks_hosted(&[], 1), 0);
    }

    #[tokio::test]
    async fn test_bias_window_delays_later_ranks() {
        let cluster = RecordingCluster::new(3, false);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Bias);
        config.bias_window_ms = 150;
        let launcher = Launcher::new(cluster.clone(), config).unwrap();

        launcher.distribute(|_: &RankEnv, _: &()| Ok(()), ()).await.unwrap();

        let submitted = cluster.submitted_at();
        assert_eq!(submitted.len(), 3);
        assert!(submitted[1].duration_since(submitted[0]) >= Duration::from_millis(150));
        // Only rank 0 is held back.
        assert!(submitted[2].duration_since(submitted[1]) < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_pinned_rank_zero_skips_bias_window() {
        let cluster = RecordingCluster::new(3, true);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Pin);
        config.bias_window_ms = 5_000;
        let launcher = Launcher::new(cluster.clone(), config).unwrap();

        let started = Instant::now();
        launcher.distribute(|_: &RankEnv, _: &()| Ok(()), ()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(cluster.submitted_at().len(), 3);
    }

    #[tokio::test]
    async fn test_single_rank_skips_bias_window() {
        let cluster = RecordingCluster::new(1, false);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Bias);
        config.bias_window_ms = 5_000;
        let launcher = Launcher::new(cluster, config).unwrap();

        let started = Instant::now();
        launcher.distribute(|_: &RankEnv, _: &()| Ok(()), ()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rank_waits_task_start_delay() {
        let cluster = RecordingCluster::new(2, true);
        let mut config = DispatchConfig::immediate(PlacementStrategy::Pin);
        config.task_start_delay_ms = 100;
        let launcher = Launcher::new(cluster.clone(), config).unwrap();

        let body_started = launcher
            .distribute(|_: &RankEnv, _: &()| Ok(Instant::now()), ())
            .await
            .unwrap();

        let submitted = cluster.submitted_at();
        for (rank, started) in body_started.iter().enumerate() {
            assert!(
                started.duration_since(submitted[rank]) >= Duration::from_millis(100),
                "rank {rank} started early"
            );
        }
    }

    #[tokio::test]
    async fn test_rank_error_names_rank() {
        let cluster = RecordingCluster::new(4, true);
        let launcher =
            Launcher::new(cluster, DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let err = launcher
            .distribute(
                |env: &RankEnv, _: &()| {
                    if env.rank == 2 {
                        anyhow::bail!("bad shard");
                    }
                    Ok(env.rank)
                },
                (),
            )
            .await
            .unwrap_err();

        assert_eq!(err.rank(), Some(2));
        assert_eq!(err.to_string(), "Rank 2 failed: bad shard");
        let stats = launcher.stats().snapshot();
        assert_eq!(stats.ranks_failed, 1);
        assert_eq!(stats.ranks_running, 0);
    }

    #[tokio::test]
    async fn test_rank_panic_becomes_error() {
        let cluster = RecordingCluster::new(2, true);
        let launcher =
            Launcher::new(cluster, DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let err = launcher
            .distribute(
                |env: &RankEnv, _: &()| -> anyhow::Result<()> {
                    if env.rank == 1 {
                        panic!("device lost");
                    }
                    Ok(())
                },
                (),
            )
            .await
            .unwrap_err();

        assert_eq!(err.rank(), Some(1));
        assert!(err.to_string().contains("device lost"));
        assert_eq!(launcher.stats().snapshot().ranks_failed, 1);
    }

    #[tokio::test]
    async fn test_parallelize_uneven_split() {
        let cluster = RecordingCluster::new(3, true);
        let launcher =
            Launcher::new(cluster, DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let tasks: Vec<u32> = (0..10).collect();
        let results = launcher
            .parallelize(
                |slice: Vec<u32>, offset: &u32| Ok(slice.into_iter().map(|t| t + offset).collect()),
                tasks,
                1000,
            )
            .await
            .unwrap();

        assert_eq!(results, (1000..1010).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_parallelize_empty_task_list() {
        let cluster = RecordingCluster::new(3, true);
        let launcher =
            Launcher::new(cluster.clone(), DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let results: Vec<u32> = launcher
            .parallelize(|slice: Vec<u32>, _: &()| Ok(slice), Vec::new(), ())
            .await
            .unwrap();

        assert!(results.is_empty());
        // Every rank still runs, on an empty slice.
        assert_eq!(cluster.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_parallelize_rejects_wrong_output_count() {
        let cluster = RecordingCluster::new(2, true);
        let launcher =
            Launcher::new(cluster, DispatchConfig::immediate(PlacementStrategy::Pin)).unwrap();

        let err = launcher
            .parallelize(
                |slice: Vec<u32>, _: &()| {
                    let mut out = slice;
                    out.push(99);
                    Ok(out)
                },
                vec![1, 2, 3],
                (),
            )
            .await
            .unwrap_err();

        match err {
            LaunchError::ResultLength {
                rank,
                expected,
                got,
            } => {
                assert_eq!(rank, 0);
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rank_env_addresses() {
        let env = RankEnv::new(
            Uuid::new_v4(),
            0,
            2,
            AddressInfo {
                address: "10.0.0.1:6379".to_string(),
                node_ip_address: "10.0.0.1".parse().unwrap(),
            },
        );
        assert!(env.is_rank_zero());
        assert_eq!(env.master_address().unwrap(), env.node_address());
        assert!(env.address_info().is_coordinator().unwrap());
    }

    #[test]
    fn test_panic_message_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
