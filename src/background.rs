//! Background workers: periodic keyword-index checkpoints and the
//! session/cache maintenance sweep.
//!
//! Query tasks never wait on either worker. Mutations only *notify* the
//! checkpoint worker through a bounded channel; if the channel is full the
//! notice is dropped and the next interval tick picks the change up, since
//! the worker checkpoints whenever the index is dirty.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    engine::RetrievalCore,
    error::{Error, Result},
    keyword_index::{CheckpointConfig, CheckpointInfo, IncrementalKeywordIndex},
    services::{EmbeddingService, VectorStore},
};

#[derive(Debug)]
enum CheckpointCommand {
    MutationNotice,
    CheckpointNow(oneshot::Sender<Result<Option<CheckpointInfo>>>),
    Shutdown,
}

/// Cheap handle for talking to a running [`CheckpointWorker`].
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    tx: mpsc::Sender<CheckpointCommand>,
}

impl CheckpointHandle {
    /// Tell the worker the index changed. Never blocks.
    pub fn notify_mutation(&self) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.tx.try_send(CheckpointCommand::MutationNotice)
        {
            debug!("checkpoint channel full, deferring to the next tick");
        }
    }

    /// Checkpoint now if the index is dirty and wait for the result.
    pub async fn checkpoint_now(&self) -> Result<Option<CheckpointInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CheckpointCommand::CheckpointNow(reply))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }
}

/// Writes keyword-index checkpoints every `interval`, after
/// `mutation_threshold` mutation notices, on request, and once more on
/// shutdown.
#[derive(Debug)]
pub struct CheckpointWorker {
    handle: CheckpointHandle,
    task: JoinHandle<Result<Option<CheckpointInfo>>>,
}

impl CheckpointWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(
        index: Arc<IncrementalKeywordIndex>,
        config: &CheckpointConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let task = tokio::spawn(run_checkpoints(
            index,
            rx,
            config.interval,
            config.mutation_threshold.max(1),
        ));
        Self {
            handle: CheckpointHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> CheckpointHandle {
        self.handle.clone()
    }

    /// Stop the worker after a final checkpoint, returning that
    /// checkpoint (`None` if the index was already clean).
    pub async fn shutdown(self) -> Result<Option<CheckpointInfo>> {
        // A closed channel means the task already ended; its result is in
        // the join handle either way.
        let _ = self.handle.tx.send(CheckpointCommand::Shutdown).await;
        self.task.await?
    }
}

async fn run_checkpoints(
    index: Arc<IncrementalKeywordIndex>,
    mut rx: mpsc::Receiver<CheckpointCommand>,
    interval: Duration,
    mutation_threshold: usize,
) -> Result<Option<CheckpointInfo>> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut pending = 0usize;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log_outcome(checkpoint_if_dirty(&index).await, "interval");
                pending = 0;
            }
            command = rx.recv() => match command {
                Some(CheckpointCommand::MutationNotice) => {
                    pending += 1;
                    if pending >= mutation_threshold {
                        log_outcome(
                            checkpoint_if_dirty(&index).await,
                            "mutation threshold",
                        );
                        pending = 0;
                        ticker.reset();
                    }
                }
                Some(CheckpointCommand::CheckpointNow(reply)) => {
                    let _ = reply.send(checkpoint_if_dirty(&index).await);
                    pending = 0;
                }
                Some(CheckpointCommand::Shutdown) | None => break,
            },
        }
    }

    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let CheckpointCommand::CheckpointNow(reply) = command {
            let _ = reply.send(Err(Error::ShuttingDown));
        }
    }

    let last = checkpoint_if_dirty(&index).await;
    if let Ok(Some(info)) = &last {
        info!(version = info.version, "final checkpoint written");
    }
    match last {
        Err(Error::RebuildRequired { .. }) => Ok(None),
        other => other,
    }
}

async fn checkpoint_if_dirty(
    index: &Arc<IncrementalKeywordIndex>,
) -> Result<Option<CheckpointInfo>> {
    let index = Arc::clone(index);
    tokio::task::spawn_blocking(move || index.checkpoint_if_dirty()).await?
}

fn log_outcome(outcome: Result<Option<CheckpointInfo>>, trigger: &str) {
    match outcome {
        Ok(Some(info)) => debug!(
            trigger,
            version = info.version,
            documents = info.documents,
            "checkpoint written"
        ),
        Ok(None) => {}
        Err(Error::RebuildRequired { .. }) => {
            debug!(trigger, "index awaiting rebuild, checkpoint skipped")
        }
        Err(err) => warn!(trigger, error = %err, "checkpoint failed"),
    }
}

/// Runs [`RetrievalCore::sweep`] every `interval`.
#[derive(Debug)]
pub struct MaintenanceWorker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceWorker {
    pub fn spawn<E, V>(core: Arc<RetrievalCore<E, V>>, interval: Duration) -> Self
    where
        E: EmbeddingService + 'static,
        V: VectorStore + 'static,
    {
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        core.sweep();
                    }
                    _ = &mut stopped => break,
                }
            }
        });
        Self { stop, task }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(());
        self.task.await?;
        Ok(())
    }
}

/// Both workers of a running [`RetrievalCore`].
#[derive(Debug)]
pub struct BackgroundTasks {
    checkpoints: CheckpointWorker,
    maintenance: MaintenanceWorker,
}

impl BackgroundTasks {
    pub(crate) fn spawn<E, V>(core: Arc<RetrievalCore<E, V>>) -> Self
    where
        E: EmbeddingService + 'static,
        V: VectorStore + 'static,
    {
        let checkpoints = CheckpointWorker::spawn(
            Arc::clone(core.keyword_index()),
            &core.config().checkpoint,
        );
        let sweep_interval = core.config().session.sweep_interval;
        let maintenance = MaintenanceWorker::spawn(core, sweep_interval);
        Self {
            checkpoints,
            maintenance,
        }
    }

    pub fn checkpoint_handle(&self) -> CheckpointHandle {
        self.checkpoints.handle()
    }

    /// Stop the sweep, then write the final checkpoint.
    pub async fn shutdown(self) -> Result<Option<CheckpointInfo>> {
        self.maintenance.shutdown().await?;
        self.checkpoints.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetrievalConfig,
        data_dir::DataDir,
        filter::MetadataFilter,
        ingestion::Chunk,
        keyword_index::Bm25Params,
        services::{HashingEmbedder, InMemoryVectorStore},
        session::SessionId,
    };

    fn index(dir: &std::path::Path) -> Arc<IncrementalKeywordIndex> {
        Arc::new(
            IncrementalKeywordIndex::open(
                dir,
                Bm25Params::default(),
                &CheckpointConfig::default(),
            )
            .unwrap(),
        )
    }

    fn config(interval: Duration, threshold: usize) -> CheckpointConfig {
        CheckpointConfig {
            interval,
            mutation_threshold: threshold,
            ..CheckpointConfig::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn checkpoint_now_reports_only_dirty_state() {
        let tmp = tempfile::tempdir().unwrap();
        let index = index(tmp.path());
        let worker =
            CheckpointWorker::spawn(index.clone(), &config(Duration::from_secs(3600), 1000));
        let handle = worker.handle();

        assert_eq!(handle.checkpoint_now().await.unwrap(), None);

        index.add_document(1, &["cat", "sat"]).unwrap();
        let info = handle.checkpoint_now().await.unwrap().unwrap();
        assert_eq!(info.documents, 1);
        assert_eq!(handle.checkpoint_now().await.unwrap(), None);

        assert_eq!(worker.shutdown().await.unwrap(), None);
    }

    #[tokio::test]
    async fn mutation_threshold_triggers_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let index = index(tmp.path());
        let worker =
            CheckpointWorker::spawn(index.clone(), &config(Duration::from_secs(3600), 2));
        let handle = worker.handle();

        index.add_document(1, &["cat"]).unwrap();
        handle.notify_mutation();
        index.add_document(2, &["dog"]).unwrap();
        handle.notify_mutation();

        assert!(wait_until(|| !index.stats().is_dirty()).await);
        assert_eq!(index.stats().checkpointed_version, Some(index.stats().version));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn interval_triggers_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let index = index(tmp.path());
        let worker =
            CheckpointWorker::spawn(index.clone(), &config(Duration::from_millis(20), 1000));

        index.add_document(1, &["cat"]).unwrap();
        assert!(wait_until(|| !index.stats().is_dirty()).await);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_writes_final_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let index = index(tmp.path());
        let worker =
            CheckpointWorker::spawn(index.clone(), &config(Duration::from_secs(3600), 1000));
        let handle = worker.handle();

        index.add_document(1, &["cat"]).unwrap();
        index.add_document(2, &["dog"]).unwrap();
        let last = worker.shutdown().await.unwrap().unwrap();
        assert_eq!(last.documents, 2);

        assert!(matches!(
            handle.checkpoint_now().await,
            Err(Error::ShuttingDown)
        ));

        let reopened = self::index(tmp.path());
        reopened.recover().unwrap();
        assert_eq!(reopened.stats().documents, 2);
    }

    #[tokio::test]
    async fn maintenance_sweep_expires_idle_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = RetrievalConfig::default();
        config.session.inactivity_timeout = Duration::from_millis(1);
        config.session.sweep_interval = Duration::from_millis(10);
        let core = Arc::new(
            RetrievalCore::open(
                DataDir::resolve(Some(tmp.path())).unwrap(),
                config,
                Arc::new(HashingEmbedder::new(32)),
                Arc::new(InMemoryVectorStore::new()),
            )
            .unwrap(),
        );
        let tasks = core.start_background();

        core.ingest(&[Chunk::new(1, "cat sat mat")]).await.unwrap();
        core.retrieve(
            &SessionId::new("idle").unwrap(),
            "cat",
            1,
            &MetadataFilter::new(),
        )
        .await
        .unwrap();

        assert!(wait_until(|| core.sessions().is_empty()).await);
        assert!(core.query_cache().is_empty());

        let last = tasks.shutdown().await.unwrap();
        assert_eq!(last.map(|info| info.documents), Some(1));
    }
}
