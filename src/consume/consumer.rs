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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::logger::{Closing, EventData, Logger};
use crate::message::ConsumerMessage;
use crate::stop::Stopper;
use crate::{AppError, AppResult};

use super::client::{
    HighWaterMark, LogClient, LogConnector, OffsetManager, PartitionCursor, PartitionReader,
};

/// How often the consumer lag gauge is reported.
pub const LAG_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// A service that reads records from one topic partition and acts on them.
///
/// `consume` processes a single record and is responsible for marking the
/// cursor. An error it returns is reported as a `consume_error` event and the
/// loop moves on to the next record, so retries are the consumer's business.
///
/// `start_offset` returns the offset reading starts at. If it fails, no
/// record is read.
pub trait Consumer: Logger + 'static {
    type Stop: Stopper;

    /// The stop signal the consume loop is bound to.
    fn stopper(&self) -> &Self::Stop;

    fn consume<P: PartitionCursor>(
        &self,
        msg: &ConsumerMessage,
        cursor: &P,
    ) -> impl Future<Output = AppResult<()>> + Send;

    fn start_offset<P: PartitionCursor>(
        &self,
        cursor: &P,
    ) -> impl Future<Output = AppResult<i64>> + Send;
}

/// Fires `stopped` when dropped, whichever way the loop exits.
struct NotifyStopped<'a, S: Stopper>(&'a S);

impl<S: Stopper> Drop for NotifyStopped<'_, S> {
    fn drop(&mut self) {
        self.0.stopped();
    }
}

/// Reads `topic`/`partition` sequentially and hands every record to the
/// consumer, until the consumer's stopper is stopped or the partition stream
/// closes.
///
/// Resources are acquired in this order and released in reverse on every
/// exit path: client session, offset manager, partition cursor, partition
/// reader. The consumer's `stopped` is always called on return.
///
/// # Returns
/// `Ok(())` after a stop request or the end of the stream.
/// `AppError::Setup` when the loop could not be started; nothing was read.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(group = %group, topic = %topic, partition = partition)
)]
pub async fn consume<C, K>(
    consumer: Arc<C>,
    connector: &K,
    addrs: &[String],
    group: &str,
    topic: &str,
    partition: i32,
) -> AppResult<()>
where
    C: Consumer,
    K: LogConnector,
{
    let _notify_stopped = NotifyStopped(consumer.stopper());

    // every resource is released by the time consume_partition returns
    consume_partition(&consumer, connector, addrs, group, topic, partition).await?;

    consumer.event("stopped", None, None);
    Ok(())
}

async fn consume_partition<C, K>(
    consumer: &Arc<C>,
    connector: &K,
    addrs: &[String],
    group: &str,
    topic: &str,
    partition: i32,
) -> AppResult<()>
where
    C: Consumer,
    K: LogConnector,
{
    let logger: &C = consumer;

    let client = connector
        .connect(addrs)
        .await
        .map_err(|err| AppError::setup("creating client", err))?;
    let client = Closing::new(client, logger, "close_client");

    let offset_manager = client
        .offset_manager(group)
        .await
        .map_err(|err| AppError::setup("creating offset manager", err))?;
    let offset_manager = Closing::new(offset_manager, logger, "close_offset_manager");

    let cursor = offset_manager
        .manage_partition(topic, partition)
        .await
        .map_err(|err| AppError::setup("managing partition", err))?;
    let cursor = Closing::new(cursor, logger, "close_partition_manager");

    let offset = consumer
        .start_offset(&*cursor)
        .await
        .map_err(|err| AppError::setup("getting start offset", err))?;

    let reader = client
        .consume_partition(topic, partition, offset)
        .await
        .map_err(|err| AppError::setup("consuming partition", err))?;
    let mut reader = Closing::new(reader, logger, "close_partition_consumer");

    // the record before the reader's resolved position counts as processed
    let last_offset = Arc::new(AtomicCell::new(reader.position() - 1));
    let lag_cancel = CancellationToken::new();
    let lag_task = tokio::spawn(report_lag(
        consumer.clone(),
        reader.high_water_mark(),
        last_offset.clone(),
        lag_cancel.clone(),
    ));
    // also cancels the sampler if the consumer panics
    let lag_guard = lag_cancel.drop_guard();

    let mut data = EventData::from([
        ("offset".to_string(), offset.to_string()),
        ("topic".to_string(), topic.to_string()),
        ("partition".to_string(), partition.to_string()),
    ]);
    consumer.event("start", None, Some(&data));

    let stopper = consumer.stopper();
    loop {
        tokio::select! {
            biased;
            _ = stopper.wait_for_stop() => {
                consumer.event("stopping", None, None);
                break;
            }
            msg = reader.next_message() => {
                let Some(msg) = msg else {
                    debug!("partition stream closed");
                    break;
                };
                last_offset.store(msg.offset);
                trace!(offset = msg.offset, "consuming record");
                if let Err(err) = consumer.consume(&msg, &*cursor).await {
                    data.insert("offset".to_string(), msg.offset.to_string());
                    consumer.event("consume_error", Some(&err), Some(&data));
                }
            }
        }
    }

    drop(lag_guard);
    if let Err(err) = lag_task.await {
        error!("lag reporter exited abnormally: {:?}", err);
    }
    Ok(())
}

/// Reports `high water mark - last processed offset` every
/// [`LAG_REPORT_INTERVAL`]. The first sample is taken one interval in.
async fn report_lag<L: Logger + ?Sized>(
    logger: Arc<L>,
    high_water_mark: HighWaterMark,
    last_offset: Arc<AtomicCell<i64>>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + LAG_REPORT_INTERVAL, LAG_REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let lag = high_water_mark.get() - last_offset.load();
                logger.gauge("lag", lag as f64);
            }
        }
    }
    trace!("lag reporter exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consume::memory::{MemoryFault, MemoryLog};
    use crate::logger::MemoryLogger;
    use crate::message::{OFFSET_NEWEST, OFFSET_OLDEST};
    use crate::stop::ChannelStopper;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const GROUP: &str = "group";
    const TOPIC: &str = "topic";

    /// Consumes from the oldest record unless told otherwise, and optionally
    /// parks on the first one.
    #[derive(Default)]
    struct TestConsumer {
        logger: MemoryLogger,
        stopper: ChannelStopper,
        consumed: AtomicUsize,
        fail_start: bool,
        start_at: Option<i64>,
        hold_first: Option<Arc<Notify>>,
    }

    impl Logger for TestConsumer {
        fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>) {
            self.logger.event(event, err, data)
        }

        fn gauge(&self, gauge: &str, value: f64) {
            self.logger.gauge(gauge, value)
        }
    }

    impl Consumer for TestConsumer {
        type Stop = ChannelStopper;

        fn stopper(&self) -> &ChannelStopper {
            &self.stopper
        }

        async fn consume<P: PartitionCursor>(
            &self,
            msg: &ConsumerMessage,
            cursor: &P,
        ) -> AppResult<()> {
            if self.consumed.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(hold) = &self.hold_first {
                    hold.notified().await;
                }
            }
            cursor.mark_offset(msg.offset, "");
            Ok(())
        }

        async fn start_offset<P: PartitionCursor>(&self, _cursor: &P) -> AppResult<i64> {
            if self.fail_start {
                return Err(AppError::InvalidValue("no start offset".to_string()));
            }
            Ok(self.start_at.unwrap_or(OFFSET_OLDEST))
        }
    }

    fn seeded_log(records: usize) -> MemoryLog {
        let log = MemoryLog::new();
        log.create_topic(TOPIC, 1);
        for i in 0..records {
            log.append(TOPIC, 0, None, format!("record {}", i)).unwrap();
        }
        log
    }

    #[rstest]
    #[case(MemoryFault::Connect, "creating client", vec![])]
    #[case(MemoryFault::OffsetManager, "creating offset manager", vec!["client"])]
    #[case(
        MemoryFault::ManagePartition,
        "managing partition",
        vec!["offset_manager", "client"]
    )]
    #[case(
        MemoryFault::ConsumePartition,
        "consuming partition",
        vec!["partition_cursor", "offset_manager", "client"]
    )]
    #[tokio::test]
    async fn test_setup_failure_is_fatal(
        #[case] fault: MemoryFault,
        #[case] stage: &str,
        #[case] released: Vec<&str>,
    ) {
        let log = seeded_log(2);
        log.inject_fault(fault);
        let consumer = Arc::new(TestConsumer::default());

        let err = consume(consumer.clone(), &log, &[], GROUP, TOPIC, 0)
            .await
            .unwrap_err();

        assert_eq!(err.setup_stage(), Some(stage));
        assert!(consumer.stopper.is_stopped());
        assert!(consumer.logger.events().is_empty());
        assert_eq!(consumer.consumed.load(Ordering::SeqCst), 0);
        assert_eq!(log.closed_resources(), released);
    }

    #[tokio::test]
    async fn test_start_offset_failure_is_fatal() {
        let log = seeded_log(2);
        let consumer = Arc::new(TestConsumer {
            fail_start: true,
            ..Default::default()
        });

        let err = consume(consumer.clone(), &log, &[], GROUP, TOPIC, 0)
            .await
            .unwrap_err();

        assert_eq!(err.setup_stage(), Some("getting start offset"));
        assert!(consumer.stopper.is_stopped());
        assert!(consumer.logger.events().is_empty());
        assert_eq!(
            log.closed_resources(),
            vec!["partition_cursor", "offset_manager", "client"]
        );
    }

    #[tokio::test]
    async fn test_unknown_partition_is_fatal() {
        let log = seeded_log(1);
        let consumer = Arc::new(TestConsumer::default());

        let err = consume(consumer.clone(), &log, &[], GROUP, TOPIC, 9)
            .await
            .unwrap_err();

        assert_eq!(err.setup_stage(), Some("managing partition"));
        assert!(matches!(
            err,
            AppError::Setup { ref source, .. }
                if matches!(**source, AppError::UnknownTopicOrPartition(_))
        ));
        assert!(consumer.stopper.is_stopped());
    }

    #[tokio::test]
    async fn test_resources_released_in_reverse_order() -> AppResult<()> {
        let log = seeded_log(3);
        log.close_partition(TOPIC, 0)?;
        let consumer = Arc::new(TestConsumer::default());

        consume(consumer.clone(), &log, &[], GROUP, TOPIC, 0).await?;

        assert_eq!(consumer.consumed.load(Ordering::SeqCst), 3);
        assert_eq!(
            log.closed_resources(),
            vec![
                "partition_reader",
                "partition_cursor",
                "offset_manager",
                "client"
            ]
        );
        // the cursor flushes the last mark when it is closed
        assert_eq!(log.committed(GROUP, TOPIC, 0), Some((2, String::new())));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_failure_is_logged_not_returned() -> AppResult<()> {
        let log = seeded_log(1);
        log.close_partition(TOPIC, 0)?;
        log.inject_fault(MemoryFault::CloseOffsetManager);
        let consumer = Arc::new(TestConsumer::default());

        consume(consumer.clone(), &log, &[], GROUP, TOPIC, 0).await?;

        assert_eq!(
            consumer.logger.event_names(),
            vec!["start", "close_offset_manager", "stopped"]
        );
        // the client is still closed after the offset manager failed to
        assert_eq!(log.closed_resources().last(), Some(&"client"));
        assert!(consumer.stopper.is_stopped());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_reported_every_interval() {
        let log = seeded_log(10);
        let hold = Arc::new(Notify::new());
        let consumer = Arc::new(TestConsumer {
            hold_first: Some(hold.clone()),
            ..Default::default()
        });

        let task = {
            let log = log.clone();
            let consumer = consumer.clone();
            tokio::spawn(async move { consume(consumer, &log, &[], GROUP, TOPIC, 0).await })
        };

        // parked on offset 0 while the newest offset is 9
        time::sleep(Duration::from_millis(2500)).await;
        let gauges = consumer.logger.gauges();
        assert_eq!(gauges.len(), 2);
        assert!(gauges.iter().all(|g| g.gauge == "lag" && g.value == 9.0));

        hold.notify_one();
        time::sleep(Duration::from_secs(1)).await;
        let gauges = consumer.logger.gauges();
        assert_eq!(gauges.len(), 3);
        assert_eq!(gauges[2].value, 0.0);

        consumer.stopper.stop();
        task.await.unwrap().unwrap();
        assert!(consumer.stopper.is_stopped());

        // the sampler is gone once the loop returned
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(consumer.logger.gauges().len(), 3);
    }

    #[rstest]
    #[case::empty_from_oldest(0, OFFSET_OLDEST)]
    #[case::empty_from_newest(0, OFFSET_NEWEST)]
    #[case::caught_up_from_newest(10, OFFSET_NEWEST)]
    #[case::caught_up_from_offset(10, 10)]
    #[tokio::test(start_paused = true)]
    async fn test_no_lag_before_first_record_when_caught_up(
        #[case] records: usize,
        #[case] start_at: i64,
    ) {
        let log = seeded_log(records);
        let consumer = Arc::new(TestConsumer {
            start_at: Some(start_at),
            ..Default::default()
        });

        let task = {
            let log = log.clone();
            let consumer = consumer.clone();
            tokio::spawn(async move { consume(consumer, &log, &[], GROUP, TOPIC, 0).await })
        };

        time::sleep(Duration::from_millis(1500)).await;
        let gauges = consumer.logger.gauges();
        assert_eq!(gauges.len(), 1);
        assert_eq!(gauges[0].value, 0.0);
        assert_eq!(consumer.consumed.load(Ordering::SeqCst), 0);

        consumer.stopper.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_counts_records_behind_resume_point() {
        let log = seeded_log(10);
        let hold = Arc::new(Notify::new());
        let consumer = Arc::new(TestConsumer {
            start_at: Some(7),
            hold_first: Some(hold.clone()),
            ..Default::default()
        });

        let task = {
            let log = log.clone();
            let consumer = consumer.clone();
            tokio::spawn(async move { consume(consumer, &log, &[], GROUP, TOPIC, 0).await })
        };

        // parked on offset 7, two newer records are still unread
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(consumer.logger.gauges()[0].value, 2.0);

        hold.notify_one();
        consumer.stopper.stop();
        task.await.unwrap().unwrap();
    }

    /// Driven by a shared stopper instead of the stock one.
    #[derive(Default)]
    struct SharedStopConsumer {
        logger: MemoryLogger,
        stopper: Arc<ChannelStopper>,
    }

    impl Logger for SharedStopConsumer {
        fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>) {
            self.logger.event(event, err, data)
        }

        fn gauge(&self, gauge: &str, value: f64) {
            self.logger.gauge(gauge, value)
        }
    }

    impl Consumer for SharedStopConsumer {
        type Stop = Arc<ChannelStopper>;

        fn stopper(&self) -> &Arc<ChannelStopper> {
            &self.stopper
        }

        async fn consume<P: PartitionCursor>(
            &self,
            _msg: &ConsumerMessage,
            _cursor: &P,
        ) -> AppResult<()> {
            Ok(())
        }

        async fn start_offset<P: PartitionCursor>(&self, _cursor: &P) -> AppResult<i64> {
            Ok(OFFSET_NEWEST)
        }
    }

    #[tokio::test]
    async fn test_any_stopper_drives_the_loop() {
        let log = seeded_log(1);
        let consumer = Arc::new(SharedStopConsumer::default());
        let stopper = consumer.stopper.clone();

        let task = {
            let log = log.clone();
            let consumer = consumer.clone();
            tokio::spawn(async move { consume(consumer, &log, &[], GROUP, TOPIC, 0).await })
        };
        stopper.stop();
        task.await.unwrap().unwrap();

        assert!(stopper.is_stopped());
        assert_eq!(
            consumer.logger.event_names(),
            vec!["start", "stopping", "stopped"]
        );
    }
}
