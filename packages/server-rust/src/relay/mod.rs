//! Publishing to and consuming from the event queue.

pub mod consumer;
pub mod feed;
pub mod publisher;

pub use consumer::Consumer;
pub use feed::MessageFeed;
pub use publisher::{PublishReceipt, Publisher};
