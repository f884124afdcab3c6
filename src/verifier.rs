//! Re-walks chains and reports the first document whose stored hash does
//! not match its recomputed signature.
//!
//! Every run is recorded in the `verifications` tree so auditors can see when
//! a chain was last checked and with which key.
use chrono::Utc;
use tracing::{info, warn};

use crate::document::{Document, HasDocumentNumber};
use crate::engine;
use crate::error::ChainError;
use crate::serializer::serialize;
use crate::session::Session;
use crate::signer;
use crate::types::{ChainKey, DocumentType, IssueDate, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    #[n(0)]
    Verified {
        #[n(0)]
        first_date: IssueDate,
        #[n(1)]
        last_date: IssueDate,
        #[n(2)]
        first_number: String,
        #[n(3)]
        last_number: String,
        #[n(4)]
        first_hash: String,
        #[n(5)]
        last_hash: String,
    },
    #[n(1)]
    Corrupted {
        #[n(0)]
        document_id: String,
        #[n(1)]
        document_number: Option<String>,
        #[n(2)]
        reason: String,
    },
    #[n(2)]
    Empty,
}

impl VerificationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            VerificationStatus::Verified { .. } => "verified",
            VerificationStatus::Corrupted { .. } => "corrupted",
            VerificationStatus::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub chain: ChainKey,
    pub status: VerificationStatus,
    pub documents_checked: u64,
}

impl VerificationResult {
    pub fn is_verified(&self) -> bool {
        matches!(self.status, VerificationStatus::Verified { .. })
    }
}

/// One stored verification run.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    #[n(0)]
    pub chain: String,
    #[n(1)]
    pub status: VerificationStatus,
    #[n(2)]
    pub documents_checked: u64,
    #[n(3)]
    pub checked_at: TimeStamp<Utc>,
    #[n(4)]
    pub key_version: u32,
    #[n(5)]
    pub key_fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub company: String,
    pub results: Vec<VerificationResult>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.results
            .iter()
            .all(|r| !matches!(r.status, VerificationStatus::Corrupted { .. }))
    }

    pub fn corrupted(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, VerificationStatus::Corrupted { .. }))
    }
}

pub fn verify(
    session: &Session,
    company: &str,
    series_prefix: &str,
    doc_type: DocumentType,
) -> Result<VerificationResult, ChainError> {
    verify_chain(session, &ChainKey::new(company, series_prefix, doc_type))
}

/// Hashes any pending tail, then checks every member in order. Never writes documents.
pub fn verify_chain(session: &Session, key: &ChainKey) -> Result<VerificationResult, ChainError> {
    let store = session.store();

    if let Some(last) = store.last_member(key)? {
        if !last.is_hashed() {
            match engine::ensure_hashed(session, &last.id) {
                // reported below at the offending document
                Ok(_) | Err(ChainError::ChainCorrupt { .. }) | Err(ChainError::MalformedHash(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    let (status, documents_checked) = walk(session, key)?;
    let result = VerificationResult {
        chain: key.clone(),
        status,
        documents_checked,
    };
    record(session, &result)?;

    match &result.status {
        VerificationStatus::Corrupted {
            document_id, reason, ..
        } => warn!(chain = %key, document = %document_id, reason = %reason, "chain is corrupted"),
        status => info!(
            chain = %key,
            status = status.label(),
            checked = documents_checked,
            "chain verification finished"
        ),
    }
    Ok(result)
}

/// Verifies every chain of the company.
pub fn check_integrity(session: &Session, company: &str) -> Result<IntegrityReport, ChainError> {
    let results = session
        .store()
        .chain_keys(company)?
        .iter()
        .map(|key| verify_chain(session, key))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IntegrityReport {
        company: company.to_owned(),
        results,
    })
}

/// Runs recorded for the chain, oldest first.
pub fn verification_history(session: &Session, key: &ChainKey) -> Result<Vec<VerificationRecord>, ChainError> {
    session
        .store()
        .verifications()
        .scan_prefix(key.storage_prefix())
        .map(|entry| -> Result<VerificationRecord, ChainError> {
            let (_, raw) = entry?;
            Ok(minicbor::decode(&raw)?)
        })
        .collect()
}

fn walk(session: &Session, key: &ChainKey) -> Result<(VerificationStatus, u64), ChainError> {
    let store = session.store();
    let batch_size = session.provider().integrity_batch_size();

    let mut previous_signature = String::new();
    let mut first: Option<Document> = None;
    let mut last: Option<Document> = None;
    let mut checked = 0u64;
    let mut cursor: Option<Vec<u8>> = None;

    loop {
        let (batch, last_key) = store.members_batch(key, cursor.as_deref(), batch_size)?;
        if batch.is_empty() {
            break;
        }
        for doc in batch {
            session.yield_now();
            checked += 1;
            match check_document(session, &doc, &previous_signature)? {
                Ok(signature) => previous_signature = signature,
                Err(reason) => {
                    let status = VerificationStatus::Corrupted {
                        document_id: doc.id.to_string(),
                        document_number: doc.document_number().map(str::to_owned),
                        reason,
                    };
                    return Ok((status, checked));
                }
            }
            if first.is_none() {
                first = Some(doc.clone());
            }
            last = Some(doc);
        }
        cursor = last_key;
    }

    let status = match (first, last) {
        (Some(first), Some(last)) => VerificationStatus::Verified {
            first_date: first.issue_date,
            last_date: last.issue_date,
            first_number: first.document_number.unwrap_or_default(),
            last_number: last.document_number.unwrap_or_default(),
            first_hash: first.hash.unwrap_or_default(),
            last_hash: last.hash.unwrap_or_default(),
        },
        _ => VerificationStatus::Empty,
    };
    Ok((status, checked))
}

/// Outer error aborts the run; inner error is the corruption reason.
fn check_document(
    session: &Session,
    doc: &Document,
    previous_signature: &str,
) -> Result<Result<String, String>, ChainError> {
    let provider = session.provider();

    let Some(stored) = doc.hash.as_deref() else {
        return Ok(Err("document is not hashed".into()));
    };
    let (version, signature) = match signer::split(stored) {
        Ok(parts) => parts,
        Err(err) => return Ok(Err(err.to_string())),
    };
    if !provider.has_version(version) {
        return Ok(Err(format!("no signing key for hash version {version}")));
    }
    if let Err(err) = engine::check_hash_fields(doc) {
        return Ok(Err(err.to_string()));
    }
    let canonical = match serialize(doc, previous_signature) {
        Ok(bytes) => bytes,
        Err(err) => return Ok(Err(err.to_string())),
    };

    if provider.sign_with(version, &canonical)? != stored {
        return Ok(Err("stored hash does not match the document".into()));
    }
    Ok(Ok(signature.to_owned()))
}

fn record(session: &Session, result: &VerificationResult) -> Result<(), ChainError> {
    let provider = session.provider();
    let version = provider.active_version();
    let record = VerificationRecord {
        chain: result.chain.to_string(),
        status: result.status.clone(),
        documents_checked: result.documents_checked,
        checked_at: session.now(),
        key_version: version,
        key_fingerprint: provider.fingerprint(version),
    };

    let mut key = result.chain.storage_prefix();
    key.extend_from_slice(&session.store().generate_id()?.to_be_bytes());
    session
        .store()
        .verifications()
        .insert(key, minicbor::to_vec(&record)?)?;
    Ok(())
}
