//! Wiring of one partition: log, sequencer, appender, state, stream processor,
//! snapshots and log deletion.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::appender::LogAppender;
use crate::codec::Record;
use crate::commit::CommitListenerRegistry;
use crate::compactor::LogDeletionService;
use crate::config::PartitionConfig;
use crate::error::StorageError;
use crate::processor::{RecordProcessor, StreamProcessorBuilder, StreamProcessorHandle};
use crate::sequencer::Sequencer;
use crate::storage::log::SegmentedLogStorage;
use crate::storage::snapshot::{FileSnapshotStore, PersistedSnapshot};
use crate::storage::state::StateDb;
use crate::traits::{AppendListener, AppendResult, BrokerResult, LogStreamWriter, StorageResult};
use crate::types::{PartitionId, Position};

/// Sequencer and appender of the current leadership term.
struct LeaderWriter {
    sequencer: Arc<Sequencer>,
    appender: Arc<LogAppender>,
    task: Option<JoinHandle<()>>,
}

impl LeaderWriter {
    async fn open(
        config: &PartitionConfig,
        log: &Arc<SegmentedLogStorage>,
        registry: &Arc<CommitListenerRegistry>,
    ) -> BrokerResult<Self> {
        let (sequencer, batches) =
            Sequencer::open(config.partition_id, log.clone(), config.sequencer_options()).await?;
        let appender = LogAppender::new(
            config.partition_id,
            log.clone(),
            registry.clone(),
            config.appender.clone(),
        );
        let task = tokio::spawn(appender.clone().run(batches));
        Ok(Self {
            sequencer: Arc::new(sequencer),
            appender,
            task: Some(task),
        })
    }

    /// Close the appender and wait for its task to end.
    async fn shutdown(appender: Arc<LogAppender>, task: Option<JoinHandle<()>>) {
        appender.close();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Appender task ended abnormally: {}", e);
            }
        }
    }
}

pub struct Partition {
    config: PartitionConfig,
    log: Arc<SegmentedLogStorage>,
    registry: Arc<CommitListenerRegistry>,
    writer: Mutex<LeaderWriter>,
    state: Arc<StateDb>,
    processor: StreamProcessorHandle,
    snapshots: FileSnapshotStore,
    deletion: Arc<LogDeletionService>,
}

impl Partition {
    /// Open (or recover) the partition and start its tasks.
    ///
    /// State is restored from the latest snapshot when the state directory is empty;
    /// the stream processor then replays the log from there.
    pub async fn open(
        config: PartitionConfig,
        processors: Vec<Box<dyn RecordProcessor>>,
    ) -> BrokerResult<Self> {
        let partition_id = config.partition_id;
        info!(
            "Opening partition {} at {:?}",
            partition_id,
            config.partition_dir()
        );

        let registry = Arc::new(CommitListenerRegistry::new());
        let log = Arc::new(SegmentedLogStorage::open(
            partition_id,
            config.segment_options(),
            registry.clone(),
        )?);

        let snapshots = FileSnapshotStore::new(partition_id, config.snapshot_options())?;
        let state = Self::open_state(&config, &snapshots).await?;

        let writer = LeaderWriter::open(&config, &log, &registry).await?;

        let deletion = LogDeletionService::start(partition_id, log.clone());
        snapshots.add_listener(deletion.clone());

        let processor = StreamProcessorBuilder::new(
            partition_id,
            log.clone(),
            writer.sequencer.clone(),
            state.clone(),
            registry.clone(),
        )
        .options(config.processor.clone())
        .processors(processors)
        .start();

        Ok(Self {
            config,
            log,
            registry,
            writer: Mutex::new(writer),
            state,
            processor,
            snapshots,
            deletion,
        })
    }

    async fn open_state(
        config: &PartitionConfig,
        snapshots: &FileSnapshotStore,
    ) -> StorageResult<Arc<StateDb>> {
        let options = config.state_options();
        if StateDb::is_empty_dir(&options.dir) {
            if let Some(snapshot) = snapshots.latest()? {
                let data = snapshots.load_data(&snapshot).await?;
                info!(
                    "Restoring state of partition {} from {}",
                    config.partition_id, snapshot.id
                );
                return StateDb::open_from_export(options, &data);
            }
        }
        StateDb::open(options)
    }

    pub fn partition_id(&self) -> PartitionId {
        self.config.partition_id
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<SegmentedLogStorage> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<CommitListenerRegistry> {
        &self.registry
    }

    /// Sequencer of the current leadership term.
    pub fn sequencer(&self) -> Arc<Sequencer> {
        self.writer.lock().sequencer.clone()
    }

    pub fn state(&self) -> &Arc<StateDb> {
        &self.state
    }

    pub fn processor(&self) -> &StreamProcessorHandle {
        &self.processor
    }

    pub fn snapshots(&self) -> &FileSnapshotStore {
        &self.snapshots
    }

    pub fn deletion_service(&self) -> &Arc<LogDeletionService> {
        &self.deletion
    }

    /// Sequence `records` as one batch; returns the first assigned position.
    pub fn write(&self, records: Vec<Record>, source_position: Position) -> AppendResult<Position> {
        self.sequencer().write(records, source_position)
    }

    pub fn write_with_listener(
        &self,
        records: Vec<Record>,
        source_position: Position,
        listener: Arc<dyn AppendListener>,
    ) -> AppendResult<Position> {
        self.sequencer()
            .write_with_listener(records, source_position, Some(listener))
    }

    /// Give up leadership: writes fail with `NotLeader` and processing pauses.
    ///
    /// Appends still in flight fail with `NotLeader` as well, which closes the
    /// current appender.
    pub fn step_down(&self) -> BrokerResult<()> {
        self.log.step_down();
        self.processor.pause()?;
        Ok(())
    }

    /// Take over leadership: open a fresh sequencer and appender at the log's last
    /// written position, hand the sequencer to the stream processor and resume it.
    ///
    /// Callers whose writes failed with `NotLeader` resubmit once this returns.
    pub async fn become_leader(&self) -> BrokerResult<()> {
        let partition_id = self.partition_id();
        self.log.become_leader();

        let (appender, task) = {
            let mut writer = self.writer.lock();
            (writer.appender.clone(), writer.task.take())
        };
        LeaderWriter::shutdown(appender, task).await;

        let writer = LeaderWriter::open(&self.config, &self.log, &self.registry).await?;
        let sequencer = writer.sequencer.clone();
        *self.writer.lock() = writer;

        self.processor.set_writer(sequencer)?;
        // Also retries a command whose follow-ups were lost with the old term
        self.processor.resume()?;
        info!("Partition {} opened a new writer as leader", partition_id);
        Ok(())
    }

    /// Persist the processor's state at its last processed position.
    ///
    /// Returns `None` when nothing was processed yet. Listeners of the snapshot
    /// store, the log deletion service among them, are notified on success.
    pub async fn take_snapshot(&self) -> BrokerResult<Option<PersistedSnapshot>> {
        let snapshot = self.processor.take_snapshot().await?;
        if snapshot.processed_position < 0 {
            info!(
                "Partition {}: nothing processed yet, skipping snapshot",
                self.partition_id()
            );
            return Ok(None);
        }

        let persisted = self
            .snapshots
            .persist(snapshot.processed_position, snapshot.data)
            .await?;

        // The snapshot covers the state; the transaction log can start over from it
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || state.checkpoint())
            .await
            .map_err(|e| StorageError::Internal(format!("State checkpoint task failed: {}", e)))??;

        Ok(Some(persisted))
    }

    /// Stop processing and appending, then flush storage.
    pub async fn close(&self) -> BrokerResult<()> {
        self.processor.close().await?;

        let (appender, task) = {
            let mut writer = self.writer.lock();
            (writer.appender.clone(), writer.task.take())
        };
        LeaderWriter::shutdown(appender, task).await;

        self.log.close()?;
        self.state.flush()?;
        info!("Partition {} closed", self.partition_id());
        Ok(())
    }
}
