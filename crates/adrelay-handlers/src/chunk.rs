//! Chunk metadata and body decoding
//!
//! Batch metadata travels in request headers so the body can stay the raw
//! JSON payload. Every header is optional; absent or blank values fall back to
//! the unbatched defaults.

use adrelay_batch::{Chunk, SINGLE_BATCH_ID};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;

use crate::error::IngestError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const BATCH_ID_HEADER: &str = "x-batch-id";
pub const BATCH_INDEX_HEADER: &str = "x-batch-index";
pub const BATCH_TOTAL_HEADER: &str = "x-batch-total";
pub const ITEM_ID_HEADER: &str = "x-item-id";

const REQUEST_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const REQUEST_ID_SUFFIX_LEN: usize = 9;

/// Parsed batch metadata for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeaders {
    pub request_id: String,
    pub batch_id: String,
    pub index: usize,
    pub total: usize,
    /// Echoed back to the caller, never interpreted.
    pub item_id: String,
}

impl ChunkHeaders {
    /// Read batch metadata through a case-insensitive header lookup.
    /// `max_total` bounds the chunk count a batch may declare.
    pub fn parse<'a, F>(lookup: F, max_total: usize) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let present = |name: &str| lookup(name).map(str::trim).filter(|v| !v.is_empty());

        let batch_id = present(BATCH_ID_HEADER).unwrap_or(SINGLE_BATCH_ID).to_string();
        let index = parse_count(BATCH_INDEX_HEADER, present(BATCH_INDEX_HEADER))?.unwrap_or(0);
        let total = parse_count(BATCH_TOTAL_HEADER, present(BATCH_TOTAL_HEADER))?.unwrap_or(1);

        if batch_id != SINGLE_BATCH_ID {
            if total == 0 {
                return Err(IngestError::InvalidRequest {
                    message: format!("{} must be at least 1", BATCH_TOTAL_HEADER),
                    hint: None,
                });
            }
            if total > max_total {
                return Err(IngestError::InvalidRequest {
                    message: format!(
                        "{} {} exceeds the limit of {} chunks",
                        BATCH_TOTAL_HEADER, total, max_total
                    ),
                    hint: Some(
                        "Send fewer, larger chunks or increase ADRELAY_BATCH_MAX_TOTAL".into(),
                    ),
                });
            }
            if index >= total {
                return Err(IngestError::InvalidRequest {
                    message: format!(
                        "{} {} is out of range for {} {}",
                        BATCH_INDEX_HEADER, index, BATCH_TOTAL_HEADER, total
                    ),
                    hint: Some("Chunk indices start at 0".into()),
                });
            }
        }

        let request_id = present(REQUEST_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);
        let item_id = present(ITEM_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", batch_id, index));

        Ok(Self {
            request_id,
            batch_id,
            index,
            total,
            item_id,
        })
    }

    pub fn is_unbatched(&self) -> bool {
        self.batch_id == SINGLE_BATCH_ID
    }

    pub fn to_chunk(&self, payload: Value) -> Chunk {
        Chunk {
            batch_id: self.batch_id.clone(),
            index: self.index,
            total: self.total,
            payload,
        }
    }
}

fn parse_count(header: &str, value: Option<&str>) -> Result<Option<usize>, IngestError> {
    value
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| IngestError::invalid_header(header, raw, "a non-negative integer"))
        })
        .transpose()
}

/// Decode a request body into a JSON payload.
pub fn decode_body(body: &[u8], max_payload_bytes: usize) -> Result<Value, IngestError> {
    if body.len() > max_payload_bytes {
        return Err(IngestError::PayloadTooLarge {
            limit: max_payload_bytes,
        });
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::NoPayload);
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Null) => Err(IngestError::NoPayload),
        Ok(value) => Ok(value),
        Err(e) => Err(IngestError::InvalidJson {
            message: e.to_string(),
        }),
    }
}

/// `req_<unix millis>_<random suffix>`
pub fn generate_request_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..REQUEST_ID_SUFFIX_LEN)
        .map(|_| REQUEST_ID_ALPHABET[rng.gen_range(0..REQUEST_ID_ALPHABET.len())] as char)
        .collect();
    format!("req_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    const MAX_TOTAL: usize = 1_000;

    fn parse(pairs: &[(&str, &str)]) -> Result<ChunkHeaders, IngestError> {
        let headers: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ChunkHeaders::parse(|name| headers.get(name).map(String::as_str), MAX_TOTAL)
    }

    #[test]
    fn defaults_describe_an_unbatched_chunk() {
        let headers = parse(&[]).unwrap();
        assert!(headers.is_unbatched());
        assert_eq!(headers.index, 0);
        assert_eq!(headers.total, 1);
        assert_eq!(headers.item_id, "single_0");
        assert!(headers.request_id.starts_with("req_"));
    }

    #[test]
    fn reads_batch_headers() {
        let headers = parse(&[
            (REQUEST_ID_HEADER, "req_abc"),
            (BATCH_ID_HEADER, "b1"),
            (BATCH_INDEX_HEADER, "2"),
            (BATCH_TOTAL_HEADER, " 3 "),
        ])
        .unwrap();

        assert_eq!(headers.request_id, "req_abc");
        assert_eq!(headers.batch_id, "b1");
        assert_eq!(headers.index, 2);
        assert_eq!(headers.total, 3);
        assert_eq!(headers.item_id, "b1_2");

        let chunk = headers.to_chunk(json!({"x": 1}));
        assert_eq!(chunk.batch_id, "b1");
        assert_eq!(chunk.index, 2);
    }

    #[test]
    fn blank_headers_fall_back_to_defaults() {
        let headers = parse(&[(BATCH_ID_HEADER, "  "), (ITEM_ID_HEADER, "")]).unwrap();
        assert!(headers.is_unbatched());
        assert_eq!(headers.item_id, "single_0");
    }

    #[test]
    fn rejects_malformed_numbers() {
        for (header, value) in [
            (BATCH_INDEX_HEADER, "abc"),
            (BATCH_INDEX_HEADER, "-1"),
            (BATCH_TOTAL_HEADER, "2.5"),
        ] {
            let err = parse(&[(BATCH_ID_HEADER, "b"), (header, value)]).unwrap_err();
            assert_eq!(err.status_code(), 400, "{}={}", header, value);
        }
    }

    #[test]
    fn rejects_out_of_range_chunks() {
        let err = parse(&[
            (BATCH_ID_HEADER, "b"),
            (BATCH_INDEX_HEADER, "3"),
            (BATCH_TOTAL_HEADER, "3"),
        ])
        .unwrap_err();
        assert_eq!(err.error_type(), "InvalidRequest");

        let err = parse(&[(BATCH_ID_HEADER, "b"), (BATCH_TOTAL_HEADER, "0")]).unwrap_err();
        assert!(err.message().contains("at least 1"));
    }

    #[test]
    fn rejects_totals_past_the_limit() {
        let err = parse(&[
            (BATCH_ID_HEADER, "big"),
            (BATCH_TOTAL_HEADER, "200000000"),
        ])
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_type(), "InvalidRequest");
        assert!(err.hint().unwrap().contains("ADRELAY_BATCH_MAX_TOTAL"));

        let at_limit = parse(&[
            (BATCH_ID_HEADER, "edge"),
            (BATCH_INDEX_HEADER, "999"),
            (BATCH_TOTAL_HEADER, "1000"),
        ])
        .unwrap();
        assert_eq!(at_limit.total, MAX_TOTAL);

        // the sentinel ignores its declared total
        let single = parse(&[(BATCH_TOTAL_HEADER, "200000000")]).unwrap();
        assert!(single.is_unbatched());
    }

    #[test]
    fn decode_body_rejects_empty_invalid_and_oversize() {
        assert_eq!(decode_body(b"", 100).unwrap_err(), IngestError::NoPayload);
        assert_eq!(decode_body(b"  \n", 100).unwrap_err(), IngestError::NoPayload);
        assert_eq!(decode_body(b"null", 100).unwrap_err(), IngestError::NoPayload);
        assert_eq!(decode_body(b"{oops", 100).unwrap_err().error_type(), "InvalidJson");
        assert_eq!(decode_body(b"[1,2,3]", 4).unwrap_err().status_code(), 413);

        assert_eq!(decode_body(br#"{"a":1}"#, 100).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn request_ids_are_distinct() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);

        let parts: Vec<_> = a.splitn(3, '_').collect();
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), REQUEST_ID_SUFFIX_LEN);
    }
}
