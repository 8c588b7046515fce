#![allow(dead_code)]

pub mod memory_log;
pub mod order_processor;

use std::sync::Arc;
use std::time::Duration;

use stream_broker::processor::{StreamProcessorListener, TypedRecord};
use stream_broker::storage::state::{StateDb, StateDbOptions};
use stream_broker::{
    AppenderOptions, CommitListenerRegistry, LogAppender, PartitionId, Position, ProcessorOptions,
    Sequencer, SequencerOptions, StreamProcessorBuilder, StreamProcessorHandle,
};
use tempfile::TempDir;

use memory_log::MemoryLog;
use order_processor::{OrderProcessor, Probe};

pub const PARTITION: PartitionId = 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn fast_retries() -> AppenderOptions {
    AppenderOptions {
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Fail the test instead of hanging when `future` does not complete.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

/// Records which positions a stream processor skipped.
#[derive(Default)]
pub struct SkipRecorder {
    pub skipped: parking_lot::Mutex<Vec<Position>>,
    pub processed: parking_lot::Mutex<Vec<Position>>,
}

impl StreamProcessorListener for SkipRecorder {
    fn on_processed(&self, record: &TypedRecord) {
        self.processed.lock().push(record.position);
    }

    fn on_skipped(&self, position: Position) {
        self.skipped.lock().push(position);
    }
}

/// One partition over an in-memory log: sequencer, appender and on-disk state.
pub struct TestPartition {
    pub dir: TempDir,
    pub registry: Arc<CommitListenerRegistry>,
    pub log: Arc<MemoryLog>,
    pub sequencer: Arc<Sequencer>,
    pub appender: Arc<LogAppender>,
    pub state: Arc<StateDb>,
    pub probe: Arc<Probe>,
    pub recorder: Arc<SkipRecorder>,
}

impl TestPartition {
    pub async fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(CommitListenerRegistry::new());
        let log = MemoryLog::new(registry.clone());

        let (sequencer, batches) =
            Sequencer::open(PARTITION, log.clone(), SequencerOptions::default())
                .await
                .unwrap();
        let appender = LogAppender::new(PARTITION, log.clone(), registry.clone(), fast_retries());
        tokio::spawn(appender.clone().run(batches));

        let state = StateDb::open(Self::state_options(&dir)).unwrap();

        Self {
            dir,
            registry,
            log,
            sequencer: Arc::new(sequencer),
            appender,
            state,
            probe: Arc::new(Probe::default()),
            recorder: Arc::new(SkipRecorder::default()),
        }
    }

    fn state_options(dir: &TempDir) -> StateDbOptions {
        StateDbOptions {
            dir: dir.path().join("state"),
            sync_on_commit: false,
        }
    }

    /// Builder with the order processor and skip recorder installed.
    pub fn builder(&self) -> StreamProcessorBuilder {
        StreamProcessorBuilder::new(
            PARTITION,
            self.log.clone(),
            self.sequencer.clone(),
            self.state.clone(),
            self.registry.clone(),
        )
        .processor(OrderProcessor::new(self.probe.clone()))
        .listener(self.recorder.clone())
    }

    pub fn start_processor(&self) -> StreamProcessorHandle {
        self.builder().start()
    }

    pub fn start_processor_with(&self, options: ProcessorOptions) -> StreamProcessorHandle {
        self.builder().options(options).start()
    }

    /// Reopen sequencer and appender on top of whatever the log holds now, as a
    /// new leader would.
    pub async fn reopen_writer(&mut self) {
        self.appender.close();
        let (sequencer, batches) =
            Sequencer::open(PARTITION, self.log.clone(), SequencerOptions::default())
                .await
                .unwrap();
        self.appender =
            LogAppender::new(PARTITION, self.log.clone(), self.registry.clone(), fast_retries());
        tokio::spawn(self.appender.clone().run(batches));
        self.sequencer = Arc::new(sequencer);
    }

    /// Close `processor`, reopen the state from disk and start a fresh processor
    /// with a clean probe.
    pub async fn restart(&mut self, processor: StreamProcessorHandle) -> StreamProcessorHandle {
        processor.close().await.unwrap();
        self.state = StateDb::open(Self::state_options(&self.dir)).unwrap();
        self.probe = Arc::new(Probe::default());
        self.recorder = Arc::new(SkipRecorder::default());
        self.start_processor()
    }
}
