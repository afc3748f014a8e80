//! Worker lifecycle: fork and idempotent shutdown

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vimap_config::PoolConfig;
use vimap_ipc::InputMessage;

use crate::channel::ChannelPair;
use crate::error::PoolError;
use crate::transform::WorkerSpec;

/// A running worker
#[async_trait]
pub trait WorkerHandle: Send {
    fn id(&self) -> usize;

    /// Whether the worker may still put messages on the output channel
    fn is_alive(&mut self) -> bool;

    /// Wait for the worker to exit
    async fn join(&mut self) -> Result<(), PoolError>;

    /// Stop the worker without waiting for its sentinel
    async fn kill(&mut self) -> Result<(), PoolError>;
}

/// Starts one worker bound to a descriptor and the pool's channel pair
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        index: usize,
        spec: &WorkerSpec,
        channels: &ChannelPair,
        config: &PoolConfig,
    ) -> Result<Box<dyn WorkerHandle>, PoolError>;
}

pub struct PoolLifecycle {
    specs: Vec<WorkerSpec>,
    launcher: Arc<dyn WorkerLauncher>,
    workers: Vec<Box<dyn WorkerHandle>>,
    forked: bool,
    finished: bool,
    broadcasts: usize,
}

impl PoolLifecycle {
    pub fn new(specs: Vec<WorkerSpec>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            specs,
            launcher,
            workers: Vec::new(),
            forked: false,
            finished: false,
            broadcasts: 0,
        }
    }

    /// Start one worker per descriptor
    ///
    /// If a launch fails, the workers already started stay registered so
    /// that shutdown still reaches them.
    pub async fn fork(&mut self, channels: &ChannelPair, config: &PoolConfig) -> Result<(), PoolError> {
        if self.finished {
            return Err(PoolError::PoolFinished);
        }
        if self.forked {
            return Err(PoolError::AlreadyForked);
        }
        if self.specs.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        self.forked = true;
        for (index, spec) in self.specs.iter().enumerate() {
            let handle = self.launcher.launch(index, spec, channels, config).await?;
            debug!(worker_id = index, transform = %spec.transform, "Worker launched");
            self.workers.push(handle);
        }

        info!("Forked {} workers", self.workers.len());
        Ok(())
    }

    pub fn any_alive(&mut self) -> bool {
        self.workers.iter_mut().any(|worker| worker.is_alive())
    }

    /// Send one sentinel per worker and wait for every worker to exit
    ///
    /// Only the first call does anything. Workers still running after
    /// `join_timeout` are killed.
    pub async fn shutdown(
        &mut self,
        channels: &ChannelPair,
        join_timeout: Option<Duration>,
    ) -> Result<(), PoolError> {
        if self.finished {
            debug!("Pool already finished");
            return Ok(());
        }
        self.finished = true;

        if !self.forked {
            return Ok(());
        }

        for _ in 0..self.workers.len() {
            channels.input.send(InputMessage::Sentinel).await?;
        }
        self.broadcasts += 1;
        debug!("Sent {} sentinels", self.workers.len());

        let mut first_error = None;
        for worker in self.workers.iter_mut() {
            if let Err(e) = join_worker(worker.as_mut(), join_timeout).await {
                warn!(worker_id = worker.id(), "Failed to join worker: {}", e);
                first_error.get_or_insert(e);
            }
        }

        info!("Pool finished, {} workers joined", self.workers.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Best-effort shutdown when the pool is dropped without `finish`
    ///
    /// Queues the sentinels without waiting and hands the workers back so
    /// the caller can reap them.
    pub fn abandon(&mut self, channels: &ChannelPair) -> Vec<Box<dyn WorkerHandle>> {
        if self.finished || !self.forked {
            return Vec::new();
        }
        self.finished = true;

        for _ in 0..self.workers.len() {
            if channels.input.try_send(InputMessage::Sentinel).is_err() {
                break;
            }
        }
        self.broadcasts += 1;
        std::mem::take(&mut self.workers)
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of workers started by `fork`
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// How many times sentinels were broadcast; at most once
    pub fn sentinel_broadcasts(&self) -> usize {
        self.broadcasts
    }
}

pub(crate) async fn join_worker(
    worker: &mut dyn WorkerHandle,
    join_timeout: Option<Duration>,
) -> Result<(), PoolError> {
    let Some(limit) = join_timeout else {
        return worker.join().await;
    };

    match tokio::time::timeout(limit, worker.join()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(worker_id = worker.id(), "Worker did not exit in {:?}, killing", limit);
            worker.kill().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeWorker {
        id: usize,
        alive: bool,
        hangs: bool,
        killed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHandle for FakeWorker {
        fn id(&self) -> usize {
            self.id
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }

        async fn join(&mut self) -> Result<(), PoolError> {
            if self.hangs {
                std::future::pending::<()>().await;
            }
            self.alive = false;
            Ok(())
        }

        async fn kill(&mut self) -> Result<(), PoolError> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            self.alive = false;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: AtomicUsize,
        killed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            index: usize,
            spec: &WorkerSpec,
            _channels: &ChannelPair,
            _config: &PoolConfig,
        ) -> Result<Box<dyn WorkerHandle>, PoolError> {
            if spec.transform == "broken" {
                return Err(PoolError::SpawnError("no such program".to_string()));
            }
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeWorker {
                id: index,
                alive: true,
                hangs: spec.transform == "hang",
                killed: self.killed.clone(),
            }))
        }
    }

    fn specs(names: &[&str]) -> Vec<WorkerSpec> {
        names.iter().map(|name| WorkerSpec::new(*name)).collect()
    }

    #[tokio::test]
    async fn test_fork_and_shutdown_once() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut lifecycle = PoolLifecycle::new(specs(&["a", "b", "c"]), launcher.clone());
        let channels = ChannelPair::default();
        let config = PoolConfig::default();

        lifecycle.fork(&channels, &config).await.unwrap();
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
        assert!(lifecycle.any_alive());
        assert!(matches!(
            lifecycle.fork(&channels, &config).await,
            Err(PoolError::AlreadyForked)
        ));

        lifecycle.shutdown(&channels, None).await.unwrap();
        lifecycle.shutdown(&channels, None).await.unwrap();

        assert_eq!(lifecycle.sentinel_broadcasts(), 1);
        assert_eq!(channels.input.depth(), Some(3));
        assert!(!lifecycle.any_alive());
        assert!(lifecycle.is_finished());
    }

    #[tokio::test]
    async fn test_fork_without_workers() {
        let mut lifecycle = PoolLifecycle::new(Vec::new(), Arc::new(FakeLauncher::default()));
        let result = lifecycle.fork(&ChannelPair::default(), &PoolConfig::default()).await;
        assert!(matches!(result, Err(PoolError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_failed_launch_keeps_started_workers() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut lifecycle = PoolLifecycle::new(specs(&["a", "broken", "c"]), launcher);
        let channels = ChannelPair::default();

        let result = lifecycle.fork(&channels, &PoolConfig::default()).await;
        assert!(matches!(result, Err(PoolError::SpawnError(_))));
        assert_eq!(lifecycle.worker_count(), 1);

        lifecycle.shutdown(&channels, None).await.unwrap();
        assert_eq!(channels.input.depth(), Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_before_fork_is_noop() {
        let mut lifecycle = PoolLifecycle::new(specs(&["a"]), Arc::new(FakeLauncher::default()));
        let channels = ChannelPair::default();

        lifecycle.shutdown(&channels, None).await.unwrap();
        assert_eq!(lifecycle.sentinel_broadcasts(), 0);
        assert!(matches!(
            lifecycle.fork(&channels, &PoolConfig::default()).await,
            Err(PoolError::PoolFinished)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_kills_hung_worker() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut lifecycle = PoolLifecycle::new(specs(&["a", "hang"]), launcher.clone());
        let channels = ChannelPair::default();

        lifecycle.fork(&channels, &PoolConfig::default()).await.unwrap();
        lifecycle
            .shutdown(&channels, Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(launcher.killed.load(Ordering::SeqCst), 1);
        assert!(!lifecycle.any_alive());
    }

    #[tokio::test]
    async fn test_abandon_queues_sentinels() {
        let mut lifecycle = PoolLifecycle::new(specs(&["a", "b"]), Arc::new(FakeLauncher::default()));
        let channels = ChannelPair::default();
        lifecycle.fork(&channels, &PoolConfig::default()).await.unwrap();

        let workers = lifecycle.abandon(&channels);
        assert_eq!(workers.len(), 2);
        assert_eq!(channels.input.depth(), Some(2));
        assert!(lifecycle.abandon(&channels).is_empty());

        lifecycle.shutdown(&channels, None).await.unwrap();
        assert_eq!(lifecycle.sentinel_broadcasts(), 1);
    }
}
