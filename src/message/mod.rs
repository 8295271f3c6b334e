pub use consumer_message::{ConsumerMessage, OFFSET_NEWEST, OFFSET_OLDEST};
pub use topic_partition::TopicPartition;

mod consumer_message;
mod topic_partition;
