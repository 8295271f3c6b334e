pub use stop_group::StopGroup;
pub use stopper::{ChannelStopper, Stopper};

mod latch;
mod stop_group;
mod stopper;
