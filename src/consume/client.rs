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

//! What the consume loop needs from a log client. The wire protocol,
//! broker discovery and offset storage all live behind these traits.

use std::future::Future;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;

use crate::message::ConsumerMessage;
use crate::AppResult;

/// A resource that has to be released explicitly.
pub trait Close {
    fn close(&mut self) -> AppResult<()>;
}

/// Opens client sessions against a set of brokers.
pub trait LogConnector: Send + Sync {
    type Client: LogClient;

    fn connect(&self, addrs: &[String]) -> impl Future<Output = AppResult<Self::Client>> + Send;
}

/// A client session.
pub trait LogClient: Close + Send + Sync {
    type OffsetManager: OffsetManager;
    type Reader: PartitionReader;

    /// Offset manager for the given consumer group.
    fn offset_manager(
        &self,
        group: &str,
    ) -> impl Future<Output = AppResult<Self::OffsetManager>> + Send;

    /// Starts reading `topic`/`partition` sequentially from `offset`.
    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> impl Future<Output = AppResult<Self::Reader>> + Send;
}

pub trait OffsetManager: Close + Send + Sync {
    type Cursor: PartitionCursor;

    fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> impl Future<Output = AppResult<Self::Cursor>> + Send;
}

/// The committed position of one consumer group in one partition.
pub trait PartitionCursor: Close + Send + Sync {
    /// The offset to resume from and the metadata stored alongside it.
    fn next_offset(&self) -> (i64, String);

    /// Marks `offset` as processed. The metadata should let the consumer
    /// reconstruct where it left off. When the mark is persisted is up to
    /// the client, but at the latest on `close`.
    fn mark_offset(&self, offset: i64, metadata: &str);
}

/// A sequential, non-restartable reader over one partition.
pub trait PartitionReader: Close + Send {
    /// The next record, or `None` once the stream has closed.
    ///
    /// Must be cancel safe: the consume loop selects on it together with
    /// its stop signal, and a record must not be lost when the stop wins.
    fn next_message(&mut self) -> impl Future<Output = Option<ConsumerMessage>> + Send;

    /// Offset of the record `next_message` returns next. Sentinel start
    /// offsets are already resolved.
    fn position(&self) -> i64;

    /// Shared handle to the newest known offset of the partition.
    fn high_water_mark(&self) -> HighWaterMark;
}

/// The newest known offset of a partition, readable from any task.
#[derive(Debug, Clone)]
pub struct HighWaterMark(Arc<AtomicCell<i64>>);

impl HighWaterMark {
    pub fn new(offset: i64) -> Self {
        HighWaterMark(Arc::new(AtomicCell::new(offset)))
    }

    pub fn get(&self) -> i64 {
        self.0.load()
    }

    pub fn set(&self, offset: i64) {
        self.0.store(offset);
    }
}

impl Default for HighWaterMark {
    fn default() -> Self {
        Self::new(-1)
    }
}
