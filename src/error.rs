use crate::guard::HashedField;
use crate::types::DocumentState;

/// Every failure a chain operation can surface to the host.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("field `{0}` cannot change once the document is hashed")]
    ImmutableField(HashedField),
    #[error("document hash is already set")]
    HashAlreadySet,
    #[error("signing unavailable: {0}")]
    SigningUnavailable(String),
    #[error("chain corrupt at document {document_id}: {reason}")]
    ChainCorrupt { document_id: String, reason: String },
    #[error("malformed hash `{0}`")]
    MalformedHash(String),
    #[error("series `{0}` has no registered series code")]
    SeriesNotRegistered(String),
    #[error("document {0} not found")]
    DocumentNotFound(String),
    #[error("document {document_id} is {state}: {reason}")]
    InvalidState {
        document_id: String,
        state: DocumentState,
        reason: &'static str,
    },
    #[error(
        "sequence number {sequence_number} is not after hashed sequence {last_hashed} of chain {chain}"
    )]
    OutOfOrderPosting {
        chain: String,
        sequence_number: u64,
        last_hashed: u64,
    },
    #[error("no exchange rate for {currency} on {date}")]
    RateUnavailable { currency: String, date: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Document is missing a company")]
    MissingCompany,
    #[error("Document is missing a series prefix")]
    MissingSeries,
    #[error("Series prefix `{0}` may not contain '/' or control characters")]
    InvalidSeries(String),
    #[error("Document is missing a document type")]
    MissingDocumentType,
    #[error("Document is missing an issue date")]
    MissingIssueDate,
    #[error("Document is missing a gross total")]
    MissingTotal,
    #[error("Sequence numbers start at 1")]
    ZeroSequence,
    #[error("Currency code `{0}` is not a three letter ISO code")]
    InvalidCurrency(String),
    #[error("{field} is {len} bytes long, the limit is 65535")]
    ComponentTooLong { field: &'static str, len: usize },
}

impl ChainError {
    /// Stable code of the error, as reported across the host interface.
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::ImmutableField(_) => "IMMUTABLE_FIELD",
            ChainError::HashAlreadySet => "HASH_ALREADY_SET",
            ChainError::SigningUnavailable(_) => "SIGNING_UNAVAILABLE",
            ChainError::ChainCorrupt { .. } => "CHAIN_CORRUPT",
            ChainError::MalformedHash(_) => "MALFORMED_HASH",
            ChainError::SeriesNotRegistered(_) => "SERIES_NOT_REGISTERED",
            ChainError::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
            ChainError::InvalidState { .. } => "INVALID_STATE",
            ChainError::OutOfOrderPosting { .. } => "OUT_OF_ORDER_POSTING",
            ChainError::RateUnavailable { .. } => "RATE_UNAVAILABLE",
            ChainError::Validation(_) => "VALIDATION",
            ChainError::Config(_) => "CONFIG",
            ChainError::Storage(_) => "STORAGE",
            ChainError::Encoding(_) => "ENCODING",
        }
    }

    /// Transient failures leave no state behind and may be retried as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::SigningUnavailable(_))
    }

    pub(crate) fn corrupt(document_id: &str, reason: impl Into<String>) -> Self {
        ChainError::ChainCorrupt {
            document_id: document_id.to_owned(),
            reason: reason.into(),
        }
    }
}

impl From<minicbor::decode::Error> for ChainError {
    fn from(err: minicbor::decode::Error) -> Self {
        ChainError::Encoding(err.to_string())
    }
}

impl From<minicbor::encode::Error<std::convert::Infallible>> for ChainError {
    fn from(err: minicbor::encode::Error<std::convert::Infallible>) -> Self {
        ChainError::Encoding(err.to_string())
    }
}

impl From<config::ConfigError> for ChainError {
    fn from(err: config::ConfigError) -> Self {
        ChainError::Config(err.to_string())
    }
}
