pub mod chain;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod export;
pub mod guard;
pub mod lease;
pub mod qr;
pub mod serializer;
pub mod service;
pub mod session;
pub mod signer;
pub mod store;
pub mod types;
pub mod utils;
pub mod verifier;

pub use config::{ChainConfig, KeyConfigProvider};
pub use document::{Document, DocumentDraft, TaxCategory};
pub use error::{ChainError, ValidationError};
pub use guard::{ChangeSet, HashedField};
pub use service::{DocumentService, RenderedCodes};
pub use session::Session;
pub use types::{Amount, ChainKey, DocumentId, DocumentState, DocumentType, IssueDate, TimeStamp};
pub use verifier::{VerificationResult, VerificationStatus};
