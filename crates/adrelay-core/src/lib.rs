// adrelay-core - Delivery primitives shared by every ingestion front end
//
// - BoundedHistory: FIFO buffer of recently delivered payloads for pull clients
// - DeliveryFanout: one-to-many push of serialized frames to live consumers
// - Types describing what was delivered and where it came from

pub mod fanout;
pub mod history;
pub mod types;

pub use fanout::{BroadcastReport, ConsumerId, DeliveryFanout, FanoutError, Subscription};
pub use history::{BoundedHistory, HistorySlice};
pub use types::{DeliveryFrame, DeliverySource, HistoryEntry};
