//! Canonical byte encoding of the fields a document hash covers
use chrono::Utc;

use crate::document::{Document, HasDocumentNumber};
use crate::error::ChainError;
use crate::types::{Amount, IssueDate, TimeStamp};

pub const FIELD_SEPARATOR: char = ';';

/// The only fields serialization may read.
#[derive(Debug, Clone, Copy)]
pub struct HashInput<'a> {
    pub issue_date: IssueDate,
    pub system_entry_instant: &'a TimeStamp<Utc>,
    pub document_number: &'a str,
    pub total_gross: Amount,
}

pub trait Hashable {
    fn hash_input(&self) -> Result<HashInput<'_>, ChainError>;
}

impl Hashable for Document {
    fn hash_input(&self) -> Result<HashInput<'_>, ChainError> {
        let system_entry_instant = self
            .system_entry_instant
            .as_ref()
            .ok_or_else(|| ChainError::corrupt(self.id.as_str(), "system entry instant is not set"))?;
        let document_number = self
            .document_number()
            .ok_or_else(|| ChainError::corrupt(self.id.as_str(), "document number is not set"))?;

        Ok(HashInput {
            issue_date: self.issue_date,
            system_entry_instant,
            document_number,
            total_gross: self.total_gross,
        })
    }
}

/// `date;instant;number;total;previous_signature` as UTF-8.
pub fn serialize<H: Hashable + ?Sized>(doc: &H, previous_signature: &str) -> Result<Vec<u8>, ChainError> {
    let input = doc.hash_input()?;

    let line = [
        input.issue_date.iso(),
        input.system_entry_instant.iso_seconds(),
        input.document_number.to_owned(),
        input.total_gross.canonical(),
        previous_signature.to_owned(),
    ]
    .join(&FIELD_SEPARATOR.to_string());

    Ok(line.into_bytes())
}
