use std::sync::Arc;

use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{LoggedEntry, Record, RecordType};
use crate::commit::{CommitListenerRegistry, ListenerId};
use crate::error::ProcessingError;
use crate::storage::state::{KeyGenerator, LastProcessedPositionState, StateDb, Transaction};
use crate::traits::{
    CodecResult, CommitListener, LogReadStorage, LogStreamWriter, ProcessingResult,
};
use crate::types::{Commit, PartitionId, Position, UNSET_POSITION};

use super::context::{ProcessingContext, ProcessingResultBuilder};
use super::listener::{StreamProcessorLifecycleAware, StreamProcessorListener};
use super::record::TypedRecord;
use super::{ErrorHandling, Phase, ProcessorOptions, RecordProcessor};

/// Consistent copy of a partition's state.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Last position whose effects `data` contains
    pub processed_position: Position,
    pub data: Vec<u8>,
}

enum ProcessorCommand {
    Pause,
    Resume,
    SetWriter(Arc<dyn LogStreamWriter>),
    TakeSnapshot(oneshot::Sender<ProcessingResult<StateSnapshot>>),
    Close(oneshot::Sender<()>),
}

/// Wakes the processor actor on every commit.
struct CommitWakeup {
    notify: Arc<Notify>,
}

impl CommitListener for CommitWakeup {
    fn on_commit(&self, commit: Commit) {
        trace!("Waking stream processor on {}", commit);
        self.notify.notify_one();
    }
}

fn find_processor(
    processors: &mut [Box<dyn RecordProcessor>],
    value_type: u16,
) -> Option<&mut Box<dyn RecordProcessor>> {
    processors.iter_mut().find(|p| p.accepts(value_type))
}

pub struct StreamProcessorBuilder {
    partition_id: PartitionId,
    log: Arc<dyn LogReadStorage>,
    writer: Arc<dyn LogStreamWriter>,
    state: Arc<StateDb>,
    registry: Arc<CommitListenerRegistry>,
    options: ProcessorOptions,
    processors: Vec<Box<dyn RecordProcessor>>,
    listeners: Vec<Arc<dyn StreamProcessorListener>>,
    lifecycle: Vec<Arc<dyn StreamProcessorLifecycleAware>>,
}

impl StreamProcessorBuilder {
    pub fn new(
        partition_id: PartitionId,
        log: Arc<dyn LogReadStorage>,
        writer: Arc<dyn LogStreamWriter>,
        state: Arc<StateDb>,
        registry: Arc<CommitListenerRegistry>,
    ) -> Self {
        Self {
            partition_id,
            log,
            writer,
            state,
            registry,
            options: ProcessorOptions::default(),
            processors: Vec::new(),
            listeners: Vec::new(),
            lifecycle: Vec::new(),
        }
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn processor(mut self, processor: impl RecordProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn processors(mut self, processors: Vec<Box<dyn RecordProcessor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StreamProcessorListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn lifecycle_listener(
        mut self,
        listener: Arc<dyn StreamProcessorLifecycleAware>,
    ) -> Self {
        self.lifecycle.push(listener);
        self
    }

    /// Spawn the processor actor. Must be called within a tokio runtime.
    pub fn start(self) -> StreamProcessorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Initializing);
        let (position_tx, position_rx) = watch::channel(UNSET_POSITION);

        // Registered before replay so commits arriving meanwhile leave a wakeup behind
        let notify = Arc::new(Notify::new());
        let listener_id = self.registry.add(Arc::new(CommitWakeup {
            notify: notify.clone(),
        }));

        let txn = self.state.transaction();
        let processor = StreamProcessor {
            partition_id: self.partition_id,
            options: self.options,
            log: self.log,
            writer: self.writer,
            state: self.state,
            registry: self.registry,
            listener_id,
            processors: self.processors,
            listeners: self.listeners,
            lifecycle: self.lifecycle,
            key_generator: KeyGenerator::new(self.partition_id),
            last_processed: LastProcessedPositionState::new(),
            txn,
            last_processed_position: UNSET_POSITION,
            cursor: 0,
            phase_tx,
            position_tx,
        };

        tokio::spawn(processor.run(commands_rx, notify));

        StreamProcessorHandle {
            partition_id: self.partition_id,
            commands: commands_tx,
            phase: phase_rx,
            position: position_rx,
        }
    }
}

/// Control surface of a running stream processor.
#[derive(Clone)]
pub struct StreamProcessorHandle {
    partition_id: PartitionId,
    commands: mpsc::UnboundedSender<ProcessorCommand>,
    phase: watch::Receiver<Phase>,
    position: watch::Receiver<Position>,
}

impl StreamProcessorHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Position of the last entry handled (processed, skipped or replayed).
    pub fn position(&self) -> Position {
        *self.position.borrow()
    }

    fn send(&self, command: ProcessorCommand) -> ProcessingResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ProcessingError::Closed(self.partition_id))
    }

    pub async fn wait_for_phase(&self, phase: Phase) -> ProcessingResult<()> {
        let mut rx = self.phase.clone();
        loop {
            if *rx.borrow_and_update() == phase {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(ProcessingError::Closed(self.partition_id));
            }
        }
    }

    /// Wait until the entry at `position` has been handled.
    pub async fn wait_for_position(&self, position: Position) -> ProcessingResult<()> {
        let mut rx = self.position.clone();
        loop {
            if *rx.borrow_and_update() >= position {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(ProcessingError::Closed(self.partition_id));
            }
        }
    }

    pub fn pause(&self) -> ProcessingResult<()> {
        self.send(ProcessorCommand::Pause)
    }

    /// Continue after `pause`, or retry the failed position after an error.
    pub fn resume(&self) -> ProcessingResult<()> {
        self.send(ProcessorCommand::Resume)
    }

    /// Route follow-up records through `writer` from the next command on, as
    /// after a leader transition opened a fresh sequencer.
    pub fn set_writer(&self, writer: Arc<dyn LogStreamWriter>) -> ProcessingResult<()> {
        self.send(ProcessorCommand::SetWriter(writer))
    }

    pub async fn take_snapshot(&self) -> ProcessingResult<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(ProcessorCommand::TakeSnapshot(tx))?;
        rx.await
            .map_err(|_| ProcessingError::Closed(self.partition_id))?
    }

    pub async fn close(&self) -> ProcessingResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.send(ProcessorCommand::Close(tx)).is_err() {
            // Already gone
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

struct StreamProcessor {
    partition_id: PartitionId,
    options: ProcessorOptions,
    log: Arc<dyn LogReadStorage>,
    writer: Arc<dyn LogStreamWriter>,
    state: Arc<StateDb>,
    registry: Arc<CommitListenerRegistry>,
    listener_id: ListenerId,
    processors: Vec<Box<dyn RecordProcessor>>,
    listeners: Vec<Arc<dyn StreamProcessorListener>>,
    lifecycle: Vec<Arc<dyn StreamProcessorLifecycleAware>>,
    key_generator: KeyGenerator,
    last_processed: LastProcessedPositionState,
    txn: Transaction,
    /// Last position whose effects are committed to the state
    last_processed_position: Position,
    /// Next position to read while processing
    cursor: Position,
    phase_tx: watch::Sender<Phase>,
    position_tx: watch::Sender<Position>,
}

impl StreamProcessor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ProcessorCommand>,
        notify: Arc<Notify>,
    ) {
        info!("Stream processor of partition {} starting", self.partition_id);

        let started = match self.init_processors() {
            Ok(()) => self.recover().await,
            Err(e) => Err(e),
        };
        match started {
            Ok(()) => {
                self.set_phase(Phase::Processing);
                self.drain().await;
            }
            Err(e) => self.fail(self.cursor, e),
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ProcessorCommand::Close(reply)) => {
                        self.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close();
                        break;
                    }
                },
                _ = notify.notified() => self.drain().await,
            }
        }
    }

    fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            info!(
                "Stream processor of partition {}: {} -> {}",
                self.partition_id, previous, phase
            );
        }
    }

    async fn handle_command(&mut self, command: ProcessorCommand) {
        match command {
            ProcessorCommand::Pause => {
                if self.phase() == Phase::Processing {
                    self.set_phase(Phase::Paused);
                    for hook in &self.lifecycle {
                        hook.on_paused(self.partition_id);
                    }
                }
            }
            ProcessorCommand::Resume => match self.phase() {
                Phase::Paused => {
                    self.set_phase(Phase::Processing);
                    for hook in &self.lifecycle {
                        hook.on_resumed(self.partition_id);
                    }
                    self.drain().await;
                }
                Phase::Error => {
                    // Follow-ups of the failed command may already be in the log;
                    // replaying them settles the state before the retry.
                    self.txn.rollback();
                    match self.recover().await {
                        Ok(()) => {
                            self.set_phase(Phase::Processing);
                            for hook in &self.lifecycle {
                                hook.on_resumed(self.partition_id);
                            }
                            self.drain().await;
                        }
                        Err(e) => self.fail(self.cursor, e),
                    }
                }
                phase => debug!(
                    "Ignoring resume of partition {} in phase {}",
                    self.partition_id, phase
                ),
            },
            ProcessorCommand::SetWriter(writer) => {
                debug!(
                    "Stream processor of partition {} got a new writer",
                    self.partition_id
                );
                self.writer = writer;
            }
            ProcessorCommand::TakeSnapshot(reply) => {
                let snapshot = self
                    .state
                    .export()
                    .map(|data| StateSnapshot {
                        processed_position: self.last_processed_position,
                        data,
                    })
                    .map_err(ProcessingError::from);
                let _ = reply.send(snapshot);
            }
            // Handled by the run loop
            ProcessorCommand::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn init_processors(&mut self) -> ProcessingResult<()> {
        let processors = &mut self.processors;
        let txn = &mut self.txn;
        let key_generator = &self.key_generator;
        for processor in processors.iter_mut() {
            let mut ctx = ProcessingContext::new(self.partition_id, txn, key_generator);
            processor.init(&mut ctx)?;
        }
        self.txn.commit()?;
        Ok(())
    }

    /// Replay committed events after the last processed position up to the tail
    /// seen now, then position the cursor for processing.
    async fn recover(&mut self) -> ProcessingResult<()> {
        self.set_phase(Phase::Replaying);

        let recovered = self.last_processed.get(&self.txn)?;
        self.last_processed_position = recovered;
        let tail = self.log.commit_position();
        let mut next = recovered + 1;
        let mut replayed = 0usize;

        info!(
            "Partition {} replaying from position {} to {}",
            self.partition_id, next, tail
        );

        'replay: while next <= tail {
            let entries = self
                .log
                .read_from(next, self.options.replay_batch_size)
                .await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if entry.position > tail {
                    break 'replay;
                }
                next = entry.position + 1;
                if self.replay_entry(&entry, recovered)? {
                    replayed += 1;
                }
            }
            self.txn.commit()?;
        }
        self.txn.commit()?;

        self.cursor = self.last_processed_position + 1;
        self.position_tx.send_replace(self.last_processed_position);

        info!(
            "Partition {} recovered: {} events replayed, last processed position {}",
            self.partition_id, replayed, self.last_processed_position
        );
        for hook in &self.lifecycle {
            hook.on_recovered(self.partition_id, self.last_processed_position);
        }
        Ok(())
    }

    /// Apply one logged event if its command was not processed before `recovered`.
    ///
    /// Events without a source were never produced by this partition's processing
    /// and are skipped, as they are while processing.
    fn replay_entry(&mut self, entry: &LoggedEntry, recovered: Position) -> ProcessingResult<bool> {
        let Some(record) = TypedRecord::from_entry(entry)? else {
            return Ok(false);
        };
        if !record.is_event() || !record.has_source() {
            return Ok(false);
        }
        let source = record.source_position;
        if source <= recovered {
            return Ok(false);
        }

        self.key_generator.set_key_if_higher(&mut self.txn, record.key)?;
        if let Some(processor) = find_processor(&mut self.processors, record.value_type()) {
            let mut ctx =
                ProcessingContext::new(self.partition_id, &mut self.txn, &self.key_generator);
            processor.replay(&record, &mut ctx)?;
        }

        if source > self.last_processed_position {
            self.last_processed_position = source;
            self.last_processed
                .mark_as_processed(&mut self.txn, source)?;
        }

        trace!(
            "Partition {} replayed event at {} (source {})",
            self.partition_id, record.position, source
        );
        for listener in &self.listeners {
            listener.on_replayed(&record);
        }
        Ok(true)
    }

    /// Handle committed entries from the cursor on while in `Processing`.
    async fn drain(&mut self) {
        while self.phase() == Phase::Processing {
            if self.cursor > self.log.commit_position() {
                break;
            }
            let entries = match self
                .log
                .read_from(self.cursor, self.options.read_batch_size)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    self.fail(self.cursor, e.into());
                    return;
                }
            };
            if entries.is_empty() {
                break;
            }

            for entry in entries {
                if let Err(e) = self.process_entry(&entry) {
                    self.fail(entry.position, e);
                    return;
                }
                self.cursor = entry.position + 1;
                self.position_tx.send_replace(entry.position);
            }
        }
    }

    fn skip(&self, position: Position) {
        trace!("Partition {} skipping entry {}", self.partition_id, position);
        for listener in &self.listeners {
            listener.on_skipped(position);
        }
    }

    fn process_entry(&mut self, entry: &LoggedEntry) -> ProcessingResult<()> {
        let Some(record) = TypedRecord::from_entry(entry)? else {
            self.skip(entry.position);
            return Ok(());
        };
        // Events and rejections carry no new work; inline-processed commands were
        // handled together with their cause.
        if !record.is_command() || record.metadata.processed {
            self.skip(entry.position);
            return Ok(());
        }
        self.process_command(&record)
    }

    fn process_command(&mut self, record: &TypedRecord) -> ProcessingResult<()> {
        let mut result = ProcessingResultBuilder::new();

        if let Err(error) = self.process_in_transaction(record, &mut result) {
            self.txn.rollback();
            result.reset();
            if !self.handle_processing_error(record, &error, &mut result)? {
                return Err(error);
            }
            warn!(
                "Partition {} handled error processing position {}: {}",
                self.partition_id, record.position, error
            );
        }

        let (follow_ups, tasks) = result.take();
        if !follow_ups.is_empty() {
            let records = follow_ups
                .iter()
                .map(|r| r.to_record())
                .collect::<CodecResult<Vec<Record>>>()?;
            let first = self.writer.write(records, record.position)?;
            trace!(
                "Partition {} wrote {} follow-ups of {} from position {}",
                self.partition_id,
                follow_ups.len(),
                record.position,
                first
            );
        }

        self.last_processed
            .mark_as_processed(&mut self.txn, record.position)?;
        self.txn.commit()?;
        self.last_processed_position = record.position;

        for task in tasks {
            if let Err(e) = task() {
                warn!(
                    "Partition {} post-commit task of position {} failed: {:#}",
                    self.partition_id, record.position, e
                );
            }
        }

        debug!(
            "Partition {} processed command at {}",
            self.partition_id, record.position
        );
        for listener in &self.listeners {
            listener.on_processed(record);
        }
        Ok(())
    }

    /// Run the command and every follow-up it triggers inside the open transaction.
    fn process_in_transaction(
        &mut self,
        record: &TypedRecord,
        result: &mut ProcessingResultBuilder,
    ) -> ProcessingResult<()> {
        let partition_id = self.partition_id;
        let processor = find_processor(&mut self.processors, record.value_type()).ok_or(
            ProcessingError::NoProcessor {
                value_type: record.value_type(),
                position: record.position,
            },
        )?;
        let mut ctx = ProcessingContext::new(partition_id, &mut self.txn, &self.key_generator);
        processor.process(record, &mut ctx, result)?;

        self.apply_follow_ups(record, result, 0, true)
    }

    /// Apply events and process inline commands appended to `result` from `from` on.
    fn apply_follow_ups(
        &mut self,
        record: &TypedRecord,
        result: &mut ProcessingResultBuilder,
        from: usize,
        process_commands: bool,
    ) -> ProcessingResult<()> {
        let mut commands = 1usize;
        let mut index = from;

        while let Some(follow_up) = result.records().get(index).cloned() {
            let value_type = follow_up.metadata.value_type;
            let Some(processor) = find_processor(&mut self.processors, value_type) else {
                index += 1;
                continue;
            };

            if follow_up.metadata.record_type == RecordType::Event {
                let event = TypedRecord::inline(
                    record.position,
                    record.timestamp,
                    follow_up.key,
                    follow_up.metadata,
                    follow_up.value,
                );
                let mut ctx =
                    ProcessingContext::new(self.partition_id, &mut self.txn, &self.key_generator);
                processor.replay(&event, &mut ctx)?;
            } else if follow_up.metadata.record_type == RecordType::Command
                && process_commands
                && commands < self.options.max_commands_in_batch
            {
                let mut metadata = follow_up.metadata;
                metadata.processed = true;
                if let Some(logged) = result.record_mut(index) {
                    logged.metadata.processed = true;
                }
                let command = TypedRecord::inline(
                    record.position,
                    record.timestamp,
                    follow_up.key,
                    metadata,
                    follow_up.value,
                );
                let mut ctx =
                    ProcessingContext::new(self.partition_id, &mut self.txn, &self.key_generator);
                processor.process(&command, &mut ctx, result)?;
                commands += 1;
            }
            index += 1;
        }
        Ok(())
    }

    /// Give the processor a chance to turn an error into a regular outcome.
    fn handle_processing_error(
        &mut self,
        record: &TypedRecord,
        error: &ProcessingError,
        result: &mut ProcessingResultBuilder,
    ) -> ProcessingResult<bool> {
        let Some(processor) = find_processor(&mut self.processors, record.value_type()) else {
            return Ok(false);
        };
        let mut ctx = ProcessingContext::new(self.partition_id, &mut self.txn, &self.key_generator);
        match processor.on_processing_error(error, record, &mut ctx, result) {
            ErrorHandling::Handled => {
                self.apply_follow_ups(record, result, 0, false)?;
                Ok(true)
            }
            ErrorHandling::Unhandled => Ok(false),
        }
    }

    fn fail(&mut self, position: Position, error: ProcessingError) {
        self.txn.rollback();
        error!(
            "Stream processor of partition {} halted at position {}: {}",
            self.partition_id, position, error
        );
        self.set_phase(Phase::Error);
        for hook in &self.lifecycle {
            hook.on_failed(self.partition_id, position, &error);
        }
    }

    fn close(&mut self) {
        self.set_phase(Phase::Closing);
        self.registry.remove(self.listener_id);
        self.txn.rollback();
        if let Err(e) = self.state.flush() {
            warn!(
                "Failed to flush state of partition {} on close: {}",
                self.partition_id, e
            );
        }
        for hook in &self.lifecycle {
            hook.on_close(self.partition_id);
        }
        self.set_phase(Phase::Closed);
    }
}
