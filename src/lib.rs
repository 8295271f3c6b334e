//! Cooperative shutdown for groups of workers, and a sequential consume loop
//! for partitioned logs built on it.
//!
//! A [`ChannelStopper`] is told to stop and reports when it has stopped; a
//! [`StopGroup`] cascades one stop to many of them and waits for all. The
//! [`consume`] loop binds a [`Consumer`] to its stopper and reads one topic
//! partition through a [`LogConnector`] until it is stopped or the stream
//! ends.

pub mod consume;
pub mod logger;
pub mod message;
pub mod produce;
pub mod service;
pub mod stop;

pub use consume::{consume, Consumer, LogConnector};
pub use logger::{EventData, Logger, MemoryLogger, NoopLogger, TracingLogger};
pub use message::{ConsumerMessage, TopicPartition};
pub use produce::Producer;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, FranzConfig,
    GLOBAL_CONFIG,
};
pub use stop::{ChannelStopper, StopGroup, Stopper};
