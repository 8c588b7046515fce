use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stream_broker::error::{AppendError, ReplicationError};
use stream_broker::traits::{AppendListener, LogReadStorage};
use stream_broker::{LogIndex, Position, Record, UNKEYED, UNSET_POSITION};

mod common;
use common::memory_log::MemoryLog;
use common::{TestPartition, within};

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<String> {
        within(async {
            loop {
                let events = self.snapshot();
                if events.len() >= count {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
    }
}

impl AppendListener for Events {
    fn on_write(&self, index: LogIndex) {
        self.0.lock().push(format!("write:{}", index));
    }

    fn on_write_error(&self, error: &AppendError) {
        self.0.lock().push(format!("write_error:{:?}", error));
    }

    fn on_commit(&self, index: LogIndex) {
        self.0.lock().push(format!("commit:{}", index));
    }

    fn on_commit_error(&self, index: LogIndex, error: &ReplicationError) {
        self.0.lock().push(format!("commit_error:{}:{:?}", index, error));
    }
}

async fn wait_for_commit(log: &MemoryLog, position: Position) {
    within(async {
        while log.commit_position() < position {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}

#[tokio::test]
async fn test_first_record_lands_at_position_one() {
    let partition = TestPartition::new().await;

    let position = partition
        .sequencer
        .write_with_listener(vec![Record::unkeyed("createOrder")], UNSET_POSITION, None)
        .unwrap();
    assert_eq!(position, 1);

    wait_for_commit(&partition.log, 1).await;
    let entries = partition.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].position, 1);
    assert_eq!(entries[0].source_position, UNSET_POSITION);
    assert_eq!(entries[0].key, UNKEYED);
    assert_eq!(entries[0].value, b"createOrder".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_get_gap_free_positions() {
    let partition = TestPartition::new().await;
    let sequencer = partition.sequencer.clone();

    let mut tasks = Vec::new();
    for writer in 0..8 {
        let sequencer = sequencer.clone();
        tasks.push(tokio::spawn(async move {
            let mut batches = Vec::new();
            for i in 0..25usize {
                let size = 1 + (writer + i) % 3;
                let records = (0..size)
                    .map(|r| Record::unkeyed(format!("w{}-{}-{}", writer, i, r)))
                    .collect();
                let first = sequencer
                    .write_with_listener(records, UNSET_POSITION, None)
                    .unwrap();
                batches.push((first, size as i64));
                tokio::task::yield_now().await;
            }
            batches
        }));
    }

    let mut batches = Vec::new();
    for task in tasks {
        batches.extend(task.await.unwrap());
    }
    let total: i64 = batches.iter().map(|(_, size)| size).sum();
    assert_eq!(sequencer.last_position(), total);

    // Every batch owns a contiguous range and the ranges tile [1, total]
    batches.sort();
    let mut expected = 1;
    for (first, size) in &batches {
        assert_eq!(*first, expected);
        expected += size;
    }

    wait_for_commit(&partition.log, total).await;
    let positions: Vec<_> = partition.log.entries().iter().map(|e| e.position).collect();
    assert_eq!(positions, (1..=total).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_transient_failures_retry_identical_append() {
    let partition = TestPartition::new().await;
    partition
        .log
        .script(vec![Err(ReplicationError::Io("disk full".into())), Ok(-1)]);
    let events = Arc::new(Events::default());

    let position = partition
        .sequencer
        .write_with_listener(
            vec![Record::unkeyed("a"), Record::unkeyed("b")],
            UNSET_POSITION,
            Some(events.clone()),
        )
        .unwrap();
    assert_eq!(position, 1);

    assert_eq!(events.wait_for(2).await, vec!["write:1", "commit:1"]);

    let calls = partition.log.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|call| *call == calls[0]));
    assert_eq!((calls[0].0, calls[0].1), (1, 2));

    let positions: Vec<_> = partition.log.entries().iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![1, 2]);
    assert_eq!(partition.appender.last_written_index(), 1);
}

#[tokio::test]
async fn test_follower_rejects_writes_without_consuming_positions() {
    let partition = TestPartition::new().await;
    partition.log.set_leader(false);

    assert_eq!(
        partition
            .sequencer
            .write_with_listener(vec![Record::unkeyed("x")], UNSET_POSITION, None),
        Err(AppendError::NotLeader)
    );
    assert_eq!(partition.sequencer.last_position(), 0);
    assert!(partition.log.calls().is_empty());

    partition.log.set_leader(true);
    assert_eq!(
        partition
            .sequencer
            .write_with_listener(vec![Record::unkeyed("x")], UNSET_POSITION, None),
        Ok(1)
    );
}

#[tokio::test]
async fn test_leadership_loss_fails_outstanding_appends() {
    let partition = TestPartition::new().await;
    partition.log.script(vec![Err(ReplicationError::NotLeader)]);
    let first = Arc::new(Events::default());
    let second = Arc::new(Events::default());

    // Both batches are queued before the appender gets to run
    partition
        .sequencer
        .write_with_listener(vec![Record::unkeyed("a")], UNSET_POSITION, Some(first.clone()))
        .unwrap();
    partition
        .sequencer
        .write_with_listener(vec![Record::unkeyed("b")], UNSET_POSITION, Some(second.clone()))
        .unwrap();

    assert_eq!(first.wait_for(1).await, vec!["write_error:NotLeader"]);
    assert_eq!(second.wait_for(1).await, vec!["write_error:NotLeader"]);

    // Nothing behind the failed batch may reach the log
    assert_eq!(partition.log.calls().len(), 1);
    assert!(partition.log.entries().is_empty());

    within(async {
        while !partition.appender.is_closed() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert_eq!(
        partition
            .sequencer
            .write_with_listener(vec![Record::unkeyed("c")], UNSET_POSITION, None),
        Err(AppendError::Closed)
    );

    // Once the log reports the lost leadership, so does the stale sequencer
    partition.log.set_leader(false);
    assert_eq!(
        partition
            .sequencer
            .write_with_listener(vec![Record::unkeyed("d")], UNSET_POSITION, None),
        Err(AppendError::NotLeader)
    );
}

#[tokio::test]
async fn test_listeners_see_commit_once_per_batch() {
    let partition = TestPartition::new().await;
    let listeners: Vec<Arc<Events>> = (0..5).map(|_| Arc::new(Events::default())).collect();

    for (i, listener) in listeners.iter().enumerate() {
        partition
            .sequencer
            .write_with_listener(
                vec![Record::unkeyed(format!("batch-{}", i))],
                UNSET_POSITION,
                Some(listener.clone()),
            )
            .unwrap();
    }

    let mut indexes = HashSet::new();
    for listener in &listeners {
        let events = listener.wait_for(2).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("write:"));
        assert_eq!(events[0].replace("write:", "commit:"), events[1]);
        indexes.insert(events[0].clone());
    }
    assert_eq!(indexes.len(), 5);
}
