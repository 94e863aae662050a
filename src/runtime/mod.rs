mod channel;

pub(crate) use channel::EVENT_QUEUE_SIZE;
pub use channel::{Channel, ChannelEvent, ChannelOptions};
