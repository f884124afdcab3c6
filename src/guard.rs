//! Write protection for the fields a stored hash covers
use std::fmt;

use chrono::Utc;

use crate::document::{Counterparty, Document, TaxLine};
use crate::error::ChainError;
use crate::types::{Amount, DocumentState, DocumentType, IssueDate, PaymentState, TimeStamp};

/// Fields frozen once a document carries a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashedField {
    Hash,
    IssueDate,
    SystemEntryInstant,
    TotalGross,
    DocumentNumber,
    SequenceNumber,
    SeriesPrefix,
    DocType,
    Company,
    State,
}

impl HashedField {
    pub const ALL: [HashedField; 9] = [
        HashedField::Hash,
        HashedField::IssueDate,
        HashedField::SystemEntryInstant,
        HashedField::TotalGross,
        HashedField::DocumentNumber,
        HashedField::SequenceNumber,
        HashedField::SeriesPrefix,
        HashedField::DocType,
        HashedField::Company,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HashedField::Hash => "hash",
            HashedField::IssueDate => "issue_date",
            HashedField::SystemEntryInstant => "system_entry_instant",
            HashedField::TotalGross => "total_gross",
            HashedField::DocumentNumber => "document_number",
            HashedField::SequenceNumber => "sequence_number",
            HashedField::SeriesPrefix => "series_prefix",
            HashedField::DocType => "type",
            HashedField::Company => "company",
            HashedField::State => "state",
        }
    }
}

impl fmt::Display for HashedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Proposed update of a document. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub(crate) hash: Option<String>,
    pub(crate) issue_date: Option<IssueDate>,
    pub(crate) system_entry_instant: Option<TimeStamp<Utc>>,
    pub(crate) total_gross: Option<Amount>,
    pub(crate) document_number: Option<String>,
    pub(crate) sequence_number: Option<u64>,
    pub(crate) series_prefix: Option<String>,
    pub(crate) doc_type: Option<DocumentType>,
    pub(crate) company: Option<String>,
    pub(crate) state: Option<DocumentState>,
    pub(crate) counterparty: Option<Counterparty>,
    pub(crate) currency: Option<String>,
    pub(crate) tax_lines: Option<Vec<TaxLine>>,
    pub(crate) narration: Option<String>,
    pub(crate) reference: Option<String>,
    pub(crate) payment_state: Option<PaymentState>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_hash(mut self, hash: &str) -> Self {
        self.hash = Some(hash.to_owned());
        self
    }
    pub fn set_issue_date(mut self, date: IssueDate) -> Self {
        self.issue_date = Some(date);
        self
    }
    pub fn set_system_entry_instant(mut self, instant: TimeStamp<Utc>) -> Self {
        self.system_entry_instant = Some(instant);
        self
    }
    pub fn set_total_gross(mut self, amount: Amount) -> Self {
        self.total_gross = Some(amount);
        self
    }
    pub fn set_document_number(mut self, number: &str) -> Self {
        self.document_number = Some(number.to_owned());
        self
    }
    pub fn set_sequence_number(mut self, sequence: u64) -> Self {
        self.sequence_number = Some(sequence);
        self
    }
    pub fn set_series(mut self, series_prefix: &str) -> Self {
        self.series_prefix = Some(series_prefix.to_owned());
        self
    }
    pub fn set_doc_type(mut self, doc_type: DocumentType) -> Self {
        self.doc_type = Some(doc_type);
        self
    }
    pub fn set_company(mut self, company: &str) -> Self {
        self.company = Some(company.to_owned());
        self
    }
    pub fn set_state(mut self, state: DocumentState) -> Self {
        self.state = Some(state);
        self
    }
    pub fn set_counterparty(mut self, tax_id: &str, country_code: &str) -> Self {
        self.counterparty = Some(Counterparty {
            tax_id: Some(tax_id.to_owned()),
            country_code: Some(country_code.to_owned()),
        });
        self
    }
    pub fn set_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_owned());
        self
    }
    pub fn set_tax_lines(mut self, tax_lines: Vec<TaxLine>) -> Self {
        self.tax_lines = Some(tax_lines);
        self
    }
    pub fn set_narration(mut self, narration: &str) -> Self {
        self.narration = Some(narration.to_owned());
        self
    }
    pub fn set_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_owned());
        self
    }
    pub fn set_payment_state(mut self, payment_state: PaymentState) -> Self {
        self.payment_state = Some(payment_state);
        self
    }

    /// Hash-covered fields this change writes, in declaration order.
    pub fn hashed_fields(&self) -> Vec<HashedField> {
        let written = [
            self.hash.is_some(),
            self.issue_date.is_some(),
            self.system_entry_instant.is_some(),
            self.total_gross.is_some(),
            self.document_number.is_some(),
            self.sequence_number.is_some(),
            self.series_prefix.is_some(),
            self.doc_type.is_some(),
            self.company.is_some(),
        ];
        HashedField::ALL
            .into_iter()
            .zip(written)
            .filter_map(|(field, set)| set.then_some(field))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hashed_fields().is_empty()
            && self.state.is_none()
            && self.counterparty.is_none()
            && self.currency.is_none()
            && self.tax_lines.is_none()
            && self.narration.is_none()
            && self.reference.is_none()
            && self.payment_state.is_none()
    }
}

/// Rejects changes a hashed document may not take. Writing a covered field
/// counts even when the value is unchanged.
pub fn check(doc: &Document, changes: &ChangeSet) -> Result<(), ChainError> {
    if changes.hash.is_some() {
        if doc.is_hashed() {
            return Err(ChainError::HashAlreadySet);
        }
        return Err(ChainError::InvalidState {
            document_id: doc.id.to_string(),
            state: doc.state,
            reason: "hashes are only written by hashing the chain",
        });
    }
    if !doc.is_hashed() {
        return Ok(());
    }

    if let Some(field) = changes.hashed_fields().into_iter().next() {
        return Err(ChainError::ImmutableField(field));
    }
    match changes.state {
        Some(state) if state != doc.state && state != DocumentState::Cancelled => {
            Err(ChainError::ImmutableField(HashedField::State))
        }
        _ => Ok(()),
    }
}

/// Copies every set field onto `doc`. Callers run `check` first.
pub(crate) fn apply(doc: &mut Document, changes: ChangeSet) {
    let ChangeSet {
        hash,
        issue_date,
        system_entry_instant,
        total_gross,
        document_number,
        sequence_number,
        series_prefix,
        doc_type,
        company,
        state,
        counterparty,
        currency,
        tax_lines,
        narration,
        reference,
        payment_state,
    } = changes;

    if hash.is_some() {
        doc.hash = hash;
    }
    if let Some(issue_date) = issue_date {
        doc.issue_date = issue_date;
    }
    if system_entry_instant.is_some() {
        doc.system_entry_instant = system_entry_instant;
    }
    if let Some(total_gross) = total_gross {
        doc.total_gross = total_gross;
    }
    if document_number.is_some() {
        doc.document_number = document_number;
    }
    if sequence_number.is_some() {
        doc.sequence_number = sequence_number;
    }
    if let Some(series_prefix) = series_prefix {
        doc.series_prefix = series_prefix;
    }
    if let Some(doc_type) = doc_type {
        doc.doc_type = doc_type;
    }
    if let Some(company) = company {
        doc.company = company;
    }
    if let Some(state) = state {
        doc.state = state;
    }
    if let Some(counterparty) = counterparty {
        doc.counterparty = counterparty;
    }
    if let Some(currency) = currency {
        doc.currency = currency;
    }
    if let Some(tax_lines) = tax_lines {
        doc.tax_lines = tax_lines;
    }
    if narration.is_some() {
        doc.narration = narration;
    }
    if reference.is_some() {
        doc.reference = reference;
    }
    if let Some(payment_state) = payment_state {
        doc.payment_state = payment_state;
    }
}
