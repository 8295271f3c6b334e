// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An in-memory partitioned log implementing the log client traits, for
//! tests and demos that should run without a broker.

use std::future::{ready, Future};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::trace;

use crate::message::{ConsumerMessage, TopicPartition, OFFSET_NEWEST, OFFSET_OLDEST};
use crate::{AppError, AppResult};

use super::client::{
    Close, HighWaterMark, LogClient, LogConnector, OffsetManager, PartitionCursor,
    PartitionReader,
};

/// A collaborator operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFault {
    Connect,
    OffsetManager,
    ManagePartition,
    ConsumePartition,
    CloseClient,
    CloseOffsetManager,
    ClosePartitionCursor,
    ClosePartitionReader,
}

#[derive(Debug, Default)]
struct PartitionData {
    records: Vec<ConsumerMessage>,
    closed: bool,
}

/// What a reader finds at its position.
enum ReadAt {
    Record(ConsumerMessage),
    Ended,
    Pending,
}

#[derive(Debug)]
struct MemoryPartition {
    /// appends and close share this lock, so a reader never sees the stream
    /// end ahead of an acknowledged append
    data: RwLock<PartitionData>,
    high_water_mark: HighWaterMark,
    /// bumped on every append and on close
    changes: watch::Sender<u64>,
}

impl MemoryPartition {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        MemoryPartition {
            data: RwLock::new(PartitionData::default()),
            high_water_mark: HighWaterMark::default(),
            changes,
        }
    }

    fn read_at(&self, offset: i64) -> ReadAt {
        let data = self.data.read();
        let record = usize::try_from(offset)
            .ok()
            .and_then(|index| data.records.get(index).cloned());
        match record {
            Some(record) => ReadAt::Record(record),
            None if data.closed => ReadAt::Ended,
            None => ReadAt::Pending,
        }
    }

    fn end_offset(&self) -> i64 {
        self.data.read().records.len() as i64
    }
}

#[derive(Debug, Default)]
struct LogState {
    partitions: DashMap<TopicPartition, Arc<MemoryPartition>>,
    /// (group, topic partition) -> (offset, metadata)
    commits: DashMap<(String, TopicPartition), (i64, String)>,
    faults: DashSet<MemoryFault>,
    closed_resources: Mutex<Vec<&'static str>>,
}

impl LogState {
    fn check(&self, fault: MemoryFault) -> AppResult<()> {
        if self.faults.contains(&fault) {
            return Err(AppError::ClientClosed(format!("injected {:?} failure", fault)));
        }
        Ok(())
    }

    fn close(&self, resource: &'static str, fault: MemoryFault) -> AppResult<()> {
        self.closed_resources.lock().push(resource);
        trace!("memory log closed {}", resource);
        if self.faults.contains(&fault) {
            return Err(AppError::CloseError(format!("{} refused to close", resource)));
        }
        Ok(())
    }

    fn partition(&self, topic_partition: &TopicPartition) -> AppResult<Arc<MemoryPartition>> {
        self.partitions
            .get(topic_partition)
            .map(|partition| partition.clone())
            .ok_or_else(|| AppError::UnknownTopicOrPartition(topic_partition.id()))
    }
}

/// An in-memory log shared by clone. Offsets of a partition start at 0.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<LogState>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `partitions` empty partitions. Existing ones are kept.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        for partition in 0..partitions {
            self.state
                .partitions
                .entry(TopicPartition::new(topic, partition))
                .or_insert_with(|| Arc::new(MemoryPartition::new()));
        }
    }

    /// Appends a record and returns its offset.
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
    ) -> AppResult<i64> {
        let log = self.state.partition(&TopicPartition::new(topic, partition))?;
        let offset = {
            let mut data = log.data.write();
            if data.closed {
                return Err(AppError::IllegalStateError(format!(
                    "partition {}-{} is closed",
                    topic, partition
                )));
            }
            let offset = data.records.len() as i64;
            data.records.push(ConsumerMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                value: value.into(),
                timestamp: Utc::now(),
            });
            log.high_water_mark.set(offset);
            offset
        };
        log.changes.send_modify(|version| *version += 1);
        Ok(offset)
    }

    /// Ends the partition's stream. Readers drain what is left, then see the
    /// end of the stream.
    pub fn close_partition(&self, topic: &str, partition: i32) -> AppResult<()> {
        let log = self.state.partition(&TopicPartition::new(topic, partition))?;
        log.data.write().closed = true;
        log.changes.send_modify(|version| *version += 1);
        Ok(())
    }

    pub fn high_water_mark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .partition(&TopicPartition::new(topic, partition))
            .ok()
            .map(|log| log.high_water_mark.get())
    }

    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64, metadata: &str) {
        self.state.commits.insert(
            (group.to_string(), TopicPartition::new(topic, partition)),
            (offset, metadata.to_string()),
        );
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<(i64, String)> {
        self.state
            .commits
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .map(|entry| entry.value().clone())
    }

    /// Makes `fault`'s operation fail from now on.
    pub fn inject_fault(&self, fault: MemoryFault) {
        self.state.faults.insert(fault);
    }

    /// Names of the resources closed so far, in closing order.
    pub fn closed_resources(&self) -> Vec<&'static str> {
        self.state.closed_resources.lock().clone()
    }
}

impl LogConnector for MemoryLog {
    type Client = MemoryClient;

    fn connect(&self, addrs: &[String]) -> impl Future<Output = AppResult<MemoryClient>> + Send {
        trace!("memory log connect, ignoring brokers {:?}", addrs);
        let client = self.state.check(MemoryFault::Connect).map(|_| MemoryClient {
            state: self.state.clone(),
            closed: false,
        });
        ready(client)
    }
}

#[derive(Debug)]
pub struct MemoryClient {
    state: Arc<LogState>,
    closed: bool,
}

impl MemoryClient {
    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(AppError::ClientClosed("memory client".to_string()));
        }
        Ok(())
    }

    fn open_reader(&self, topic: &str, partition: i32, offset: i64) -> AppResult<MemoryReader> {
        self.ensure_open()?;
        self.state.check(MemoryFault::ConsumePartition)?;
        let log = self.state.partition(&TopicPartition::new(topic, partition))?;
        let end = log.end_offset();
        let next = match offset {
            OFFSET_OLDEST => 0,
            OFFSET_NEWEST => end,
            offset if (0..=end).contains(&offset) => offset,
            offset => return Err(AppError::OffsetOutOfRange(offset)),
        };
        Ok(MemoryReader {
            state: self.state.clone(),
            changes: log.changes.subscribe(),
            log,
            next,
            closed: false,
        })
    }
}

impl Close for MemoryClient {
    fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state.close("client", MemoryFault::CloseClient)
    }
}

impl LogClient for MemoryClient {
    type OffsetManager = MemoryOffsetManager;
    type Reader = MemoryReader;

    fn offset_manager(
        &self,
        group: &str,
    ) -> impl Future<Output = AppResult<MemoryOffsetManager>> + Send {
        let manager = self
            .ensure_open()
            .and_then(|_| self.state.check(MemoryFault::OffsetManager))
            .map(|_| MemoryOffsetManager {
                state: self.state.clone(),
                group: group.to_string(),
                closed: false,
            });
        ready(manager)
    }

    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> impl Future<Output = AppResult<MemoryReader>> + Send {
        ready(self.open_reader(topic, partition, offset))
    }
}

#[derive(Debug)]
pub struct MemoryOffsetManager {
    state: Arc<LogState>,
    group: String,
    closed: bool,
}

impl Close for MemoryOffsetManager {
    fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state.close("offset_manager", MemoryFault::CloseOffsetManager)
    }
}

impl OffsetManager for MemoryOffsetManager {
    type Cursor = MemoryCursor;

    fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> impl Future<Output = AppResult<MemoryCursor>> + Send {
        let topic_partition = TopicPartition::new(topic, partition);
        let cursor = self
            .state
            .check(MemoryFault::ManagePartition)
            .and_then(|_| self.state.partition(&topic_partition))
            .map(|_| {
                let key = (self.group.clone(), topic_partition);
                let committed = self.state.commits.get(&key).map(|e| e.value().clone());
                MemoryCursor {
                    state: self.state.clone(),
                    key,
                    committed,
                    marked: Mutex::new(None),
                    closed: false,
                }
            });
        ready(cursor)
    }
}

/// Marks are staged in memory and committed to the log on close.
#[derive(Debug)]
pub struct MemoryCursor {
    state: Arc<LogState>,
    key: (String, TopicPartition),
    committed: Option<(i64, String)>,
    marked: Mutex<Option<(i64, String)>>,
    closed: bool,
}

impl PartitionCursor for MemoryCursor {
    fn next_offset(&self) -> (i64, String) {
        self.marked
            .lock()
            .clone()
            .or_else(|| self.committed.clone())
            .unwrap_or((OFFSET_NEWEST, String::new()))
    }

    fn mark_offset(&self, offset: i64, metadata: &str) {
        *self.marked.lock() = Some((offset, metadata.to_string()));
    }
}

impl Close for MemoryCursor {
    fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mark) = self.marked.lock().take() {
            self.state.commits.insert(self.key.clone(), mark);
        }
        self.state
            .close("partition_cursor", MemoryFault::ClosePartitionCursor)
    }
}

#[derive(Debug)]
pub struct MemoryReader {
    state: Arc<LogState>,
    log: Arc<MemoryPartition>,
    changes: watch::Receiver<u64>,
    next: i64,
    closed: bool,
}

impl PartitionReader for MemoryReader {
    async fn next_message(&mut self) -> Option<ConsumerMessage> {
        loop {
            if self.closed {
                return None;
            }
            // the offset only advances once a record is handed out, so
            // dropping this future never loses one
            match self.log.read_at(self.next) {
                ReadAt::Record(msg) => {
                    self.next += 1;
                    return Some(msg);
                }
                ReadAt::Ended => return None,
                ReadAt::Pending => {}
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    fn position(&self) -> i64 {
        self.next
    }

    fn high_water_mark(&self) -> HighWaterMark {
        self.log.high_water_mark.clone()
    }
}

impl Close for MemoryReader {
    fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state
            .close("partition_reader", MemoryFault::ClosePartitionReader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn log_with(records: usize) -> MemoryLog {
        let log = MemoryLog::new();
        log.create_topic("topic", 2);
        for i in 0..records {
            log.append("topic", 0, None, format!("value {}", i)).unwrap();
        }
        log
    }

    async fn reader_at(log: &MemoryLog, offset: i64) -> AppResult<MemoryReader> {
        let client = log.connect(&[]).await?;
        client.consume_partition("topic", 0, offset).await
    }

    #[test]
    fn test_append_assigns_offsets() -> AppResult<()> {
        let log = log_with(0);
        assert_eq!(log.high_water_mark("topic", 0), Some(-1));
        assert_eq!(log.append("topic", 0, None, "a")?, 0);
        assert_eq!(log.append("topic", 0, Some(Bytes::from("k")), "b")?, 1);
        assert_eq!(log.high_water_mark("topic", 0), Some(1));
        // partitions are independent
        assert_eq!(log.append("topic", 1, None, "c")?, 0);
        assert!(matches!(
            log.append("other", 0, None, "d"),
            Err(AppError::UnknownTopicOrPartition(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_yields_in_order_then_ends() -> AppResult<()> {
        let log = log_with(3);
        log.close_partition("topic", 0)?;
        let mut reader = reader_at(&log, 1).await?;
        assert_eq!(reader.next_message().await.map(|m| m.offset), Some(1));
        assert_eq!(reader.next_message().await.map(|m| m.offset), Some(2));
        assert_eq!(reader.next_message().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_special_offsets() -> AppResult<()> {
        let log = log_with(2);
        let mut oldest = reader_at(&log, OFFSET_OLDEST).await?;
        assert_eq!(oldest.next_message().await.map(|m| m.offset), Some(0));

        let mut newest = reader_at(&log, OFFSET_NEWEST).await?;
        log.append("topic", 0, None, "new")?;
        assert_eq!(newest.next_message().await.map(|m| m.offset), Some(2));

        assert!(matches!(
            reader_at(&log, 5).await,
            Err(AppError::OffsetOutOfRange(5))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_position_resolves_sentinels() -> AppResult<()> {
        let log = log_with(3);
        assert_eq!(reader_at(&log, OFFSET_OLDEST).await?.position(), 0);
        assert_eq!(reader_at(&log, OFFSET_NEWEST).await?.position(), 3);

        let mut reader = reader_at(&log, 1).await?;
        assert_eq!(reader.position(), 1);
        reader.next_message().await;
        assert_eq!(reader.position(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_after_close_fails() -> AppResult<()> {
        let log = log_with(1);
        log.close_partition("topic", 0)?;
        assert!(matches!(
            log.append("topic", 0, None, "late"),
            Err(AppError::IllegalStateError(_))
        ));
        assert_eq!(log.high_water_mark("topic", 0), Some(0));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_appends_delivers_every_acknowledged_record() -> AppResult<()> {
        for _ in 0..20 {
            let log = log_with(0);
            let mut reader = reader_at(&log, 0).await?;
            let drain = tokio::spawn(async move {
                let mut delivered = 0;
                while reader.next_message().await.is_some() {
                    delivered += 1;
                }
                delivered
            });

            let writer = log.clone();
            let appender = tokio::task::spawn_blocking(move || {
                let mut acknowledged = 0;
                while writer.append("topic", 0, None, "v").is_ok() {
                    acknowledged += 1;
                }
                acknowledged
            });

            tokio::time::sleep(Duration::from_millis(1)).await;
            log.close_partition("topic", 0)?;

            let acknowledged = appender.await.unwrap();
            let delivered = timeout(Duration::from_secs(5), drain)
                .await
                .expect("reader should see the end of the stream")
                .unwrap();
            assert_eq!(delivered, acknowledged);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_waits_for_appends() -> AppResult<()> {
        let log = log_with(0);
        let mut reader = reader_at(&log, 0).await?;
        assert!(timeout(Duration::from_millis(50), reader.next_message())
            .await
            .is_err());

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append("topic", 0, None, "late").unwrap();
        });
        let msg = timeout(Duration::from_secs(1), reader.next_message())
            .await
            .expect("append should wake the reader");
        assert_eq!(msg.map(|m| m.value), Some(Bytes::from("late")));
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_reader_ends_stream() -> AppResult<()> {
        let log = log_with(2);
        let mut reader = reader_at(&log, 0).await?;
        reader.close()?;
        reader.close()?;
        assert_eq!(reader.next_message().await, None);
        assert_eq!(log.closed_resources(), vec!["partition_reader"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cursor_commits_on_close() -> AppResult<()> {
        let log = log_with(0);
        log.commit("group", "topic", 0, 122, "m");
        let client = log.connect(&[]).await?;
        let manager = client.offset_manager("group").await?;

        let mut cursor = manager.manage_partition("topic", 0).await?;
        assert_eq!(cursor.next_offset(), (122, "m".to_string()));
        cursor.mark_offset(130, "n");
        assert_eq!(cursor.next_offset(), (130, "n".to_string()));
        assert_eq!(log.committed("group", "topic", 0), Some((122, "m".to_string())));
        cursor.close()?;
        assert_eq!(log.committed("group", "topic", 0), Some((130, "n".to_string())));

        let fresh = manager.manage_partition("topic", 1).await?;
        assert_eq!(fresh.next_offset(), (OFFSET_NEWEST, String::new()));
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_faults() -> AppResult<()> {
        let log = log_with(0);
        log.inject_fault(MemoryFault::CloseClient);
        let mut client = log.connect(&[]).await?;
        assert!(matches!(client.close(), Err(AppError::CloseError(_))));
        assert!(client.offset_manager("group").await.is_err());

        log.inject_fault(MemoryFault::Connect);
        assert!(log.connect(&[]).await.is_err());
        Ok(())
    }
}
