//! Audit file of hashed documents for a company and period
use serde::Serialize;

use crate::chain;
use crate::document::{Document, HasDocumentNumber};
use crate::engine;
use crate::error::ChainError;
use crate::session::Session;
use crate::signer;
use crate::types::{Amount, DocumentState, IssueDate};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub document_number: String,
    pub document_type: String,
    /// `N` normal, `A` cancelled.
    pub status: String,
    pub hash: String,
    pub hash_control: String,
    pub issue_date: String,
    pub system_entry_date: String,
    pub gross_total: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditFile {
    pub company: String,
    pub start_date: String,
    pub end_date: String,
    pub number_of_entries: usize,
    pub total_debit: String,
    pub total_credit: String,
    pub documents: Vec<AuditRecord>,
}

impl AuditFile {
    pub fn to_json(&self) -> Result<String, ChainError> {
        serde_json::to_string_pretty(self).map_err(|e| ChainError::Encoding(e.to_string()))
    }
}

/// Hashes anything pending, then lists every chain member issued in `[from, to]`.
pub fn export_audit_file(
    session: &Session,
    company: &str,
    from: IssueDate,
    to: IssueDate,
) -> Result<AuditFile, ChainError> {
    engine::ensure_hashed_all(session, company)?;

    let mut documents = Vec::new();
    let mut debit = Amount::ZERO;
    let mut credit = Amount::ZERO;

    for key in session.store().chain_keys(company)? {
        for doc in chain::chain(session.store(), &key)? {
            if doc.issue_date < from || doc.issue_date > to {
                continue;
            }
            if doc.state != DocumentState::Cancelled {
                if doc.doc_type.is_refund() {
                    debit = debit + doc.total_gross.abs();
                } else {
                    credit = credit + doc.total_gross.abs();
                }
            }
            documents.push(audit_record(&doc)?);
        }
    }

    Ok(AuditFile {
        company: company.to_owned(),
        start_date: from.iso(),
        end_date: to.iso(),
        number_of_entries: documents.len(),
        total_debit: debit.canonical(),
        total_credit: credit.canonical(),
        documents,
    })
}

fn audit_record(doc: &Document) -> Result<AuditRecord, ChainError> {
    let hash = doc
        .hash
        .clone()
        .ok_or_else(|| ChainError::corrupt(doc.id.as_str(), "exported document is not hashed"))?;
    let (version, _) = signer::split(&hash)?;
    let instant = doc
        .system_entry_instant
        .as_ref()
        .ok_or_else(|| ChainError::corrupt(doc.id.as_str(), "system entry instant is not set"))?;

    Ok(AuditRecord {
        document_number: doc.document_number().unwrap_or_default().to_owned(),
        document_type: doc.doc_type.tag().to_owned(),
        status: match doc.state {
            DocumentState::Cancelled => "A",
            _ => "N",
        }
        .to_owned(),
        hash_control: version.to_string(),
        hash,
        issue_date: doc.issue_date.iso(),
        system_entry_date: instant.iso_seconds(),
        gross_total: doc.total_gross.canonical(),
    })
}
