//! Transport-agnostic ingestion for chunked payloads
//!
//! Header parsing, body decoding, the error taxonomy, and the processor that
//! connects the batch accumulator to history and live delivery. The HTTP
//! server is a thin adapter over this crate.

pub mod chunk;
pub mod error;
pub mod processor;
pub mod scheduler;

pub use chunk::{
    decode_body, generate_request_id, ChunkHeaders, BATCH_ID_HEADER, BATCH_INDEX_HEADER,
    BATCH_TOTAL_HEADER, ITEM_ID_HEADER, REQUEST_ID_HEADER,
};
pub use error::IngestError;
pub use processor::{ChunkAck, Delivered, IngestProcessor, Subscriber};
pub use scheduler::TimeoutScheduler;
