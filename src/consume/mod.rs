pub use client::{
    Close, HighWaterMark, LogClient, LogConnector, OffsetManager, PartitionCursor,
    PartitionReader,
};
pub use consumer::{consume, Consumer, LAG_REPORT_INTERVAL};

mod client;
mod consumer;
pub mod memory;
