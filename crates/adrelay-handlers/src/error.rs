use adrelay_batch::ChunkError;
use thiserror::Error;

/// Error classification for chunk ingestion
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    // 400-level: Client errors
    #[error("{message}")]
    InvalidRequest {
        message: String,
        hint: Option<String>,
    },
    #[error("no payload")]
    NoPayload,
    #[error("invalid JSON body: {message}")]
    InvalidJson { message: String },
    #[error("Payload exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error(transparent)]
    Rejected(#[from] ChunkError),

    // 500-level: Server errors
    #[error("{message}")]
    Internal { message: String },
}

impl IngestError {
    pub fn invalid_header(header: &str, value: &str, expected: &str) -> Self {
        Self::InvalidRequest {
            message: format!("invalid {} header '{}': expected {}", header, value, expected),
            hint: None,
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::NoPayload => 400,
            Self::InvalidJson { .. } => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::Rejected(ChunkError::TooManyBatches { .. }) => 503,
            Self::Rejected(_) => 400,
            Self::Internal { .. } => 500,
        }
    }

    /// Error type string for responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::NoPayload => "NoPayload",
            Self::InvalidJson { .. } => "InvalidJson",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::Rejected(ChunkError::TotalMismatch { .. }) => "TotalMismatch",
            Self::Rejected(ChunkError::TooManyBatches { .. }) => "TooManyBatches",
            Self::Rejected(_) => "MalformedChunk",
            Self::Internal { .. } => "InternalError",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }

    /// Human-readable message
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Optional hint for fixing the error
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::InvalidRequest { hint, .. } => hint.clone(),
            Self::NoPayload => Some("Send a JSON object or array as the request body".into()),
            Self::PayloadTooLarge { .. } => {
                Some("Split the payload into more chunks or increase ADRELAY_MAX_PAYLOAD_BYTES".into())
            }
            Self::Rejected(ChunkError::TotalMismatch { .. }) => {
                Some("Every chunk of a batch must declare the same x-batch-total".into())
            }
            Self::Rejected(ChunkError::TooManyBatches { .. }) => {
                Some("Retry once in-flight batches complete or time out".into())
            }
            Self::Rejected(ChunkError::TotalTooLarge { .. }) => {
                Some("Send fewer, larger chunks or increase ADRELAY_BATCH_MAX_TOTAL".into())
            }
            _ => None,
        }
    }
}
