pub mod feed;
pub mod feed_adapter;
pub mod pipeline;
pub mod watermark;
pub mod ws_listener;

pub use feed::{Backoff, EventStream, FeedError, FeedSource};
pub use feed_adapter::{FeedAdapter, FeedItem};
pub use watermark::{WatermarkHold, WatermarkTracker};
