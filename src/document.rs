//! Documents taking part in signing chains and the draft builder that creates them
use chrono::Utc;

use crate::error::{ChainError, ValidationError};
use crate::signer;
use crate::types::{
    Amount, ChainKey, DocumentId, DocumentState, DocumentType, IssueDate, PaymentState, TimeStamp,
    check_key_component,
};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaxCategory {
    #[n(0)]
    Exempt,
    #[n(1)]
    Reduced,
    #[n(2)]
    Intermediate,
    #[n(3)]
    Normal,
}

/// Per-category subtotal in the document currency, as aggregated by the host.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TaxLine {
    #[n(0)]
    pub category: TaxCategory,
    #[n(1)]
    pub base: Amount,
    #[n(2)]
    pub tax: Amount,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Counterparty {
    #[n(0)]
    pub tax_id: Option<String>,
    #[n(1)]
    pub country_code: Option<String>,
}

/// Anything carrying a number derived from its type and position in a chain.
pub trait HasDocumentNumber {
    fn document_number(&self) -> Option<&str>;
}

/// `"<TAG> <series>/<sequence>"`, e.g. `FT 2017/3`.
pub fn format_document_number(doc_type: DocumentType, series_prefix: &str, sequence: u64) -> String {
    format!("{} {}/{}", doc_type.tag(), series_prefix, sequence)
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Document {
    #[n(0)]
    pub(crate) id: DocumentId,
    #[n(1)]
    pub(crate) company: String,
    #[n(2)]
    pub(crate) series_prefix: String,
    #[n(3)]
    pub(crate) doc_type: DocumentType,
    #[n(4)]
    pub(crate) sequence_number: Option<u64>,
    #[n(5)]
    pub(crate) document_number: Option<String>,
    #[n(6)]
    pub(crate) issue_date: IssueDate,
    #[n(7)]
    pub(crate) system_entry_instant: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub(crate) total_gross: Amount,
    #[n(9)]
    pub(crate) hash: Option<String>,
    #[n(10)]
    pub(crate) state: DocumentState,
    // descriptive fields, free to evolve after hashing
    #[n(11)]
    pub(crate) counterparty: Counterparty,
    #[n(12)]
    pub(crate) currency: String,
    #[n(13)]
    pub(crate) tax_lines: Vec<TaxLine>,
    #[n(14)]
    pub(crate) narration: Option<String>,
    #[n(15)]
    pub(crate) reference: Option<String>,
    #[n(16)]
    pub(crate) payment_state: PaymentState,
    // rendered outputs, cached once computed
    #[n(17)]
    pub(crate) sequence_code: Option<String>,
    #[n(18)]
    pub(crate) short_code: Option<String>,
    #[n(19)]
    pub(crate) qr_payload: Option<String>,
}

impl Document {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }
    pub fn company(&self) -> &str {
        &self.company
    }
    pub fn series_prefix(&self) -> &str {
        &self.series_prefix
    }
    pub fn doc_type(&self) -> DocumentType {
        self.doc_type
    }
    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }
    pub fn issue_date(&self) -> IssueDate {
        self.issue_date
    }
    pub fn system_entry_instant(&self) -> Option<&TimeStamp<Utc>> {
        self.system_entry_instant.as_ref()
    }
    pub fn total_gross(&self) -> Amount {
        self.total_gross
    }
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }
    pub fn state(&self) -> DocumentState {
        self.state
    }
    pub fn counterparty(&self) -> &Counterparty {
        &self.counterparty
    }
    pub fn currency(&self) -> &str {
        &self.currency
    }
    pub fn tax_lines(&self) -> &[TaxLine] {
        &self.tax_lines
    }
    pub fn narration(&self) -> Option<&str> {
        self.narration.as_deref()
    }
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
    pub fn payment_state(&self) -> PaymentState {
        self.payment_state
    }
    pub fn sequence_code(&self) -> Option<&str> {
        self.sequence_code.as_deref()
    }
    pub fn short_code(&self) -> Option<&str> {
        self.short_code.as_deref()
    }
    pub fn qr_payload(&self) -> Option<&str> {
        self.qr_payload.as_deref()
    }

    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(&self.company, &self.series_prefix, self.doc_type)
    }

    pub fn is_hashed(&self) -> bool {
        self.hash.is_some()
    }

    /// Posted documents belong to their chain. A cancelled document keeps its
    /// place only if it was hashed first, since successors link to its hash.
    pub fn is_chain_member(&self) -> bool {
        match self.state {
            DocumentState::Posted => self.sequence_number.is_some(),
            DocumentState::Cancelled => self.sequence_number.is_some() && self.hash.is_some(),
            DocumentState::Draft => false,
        }
    }

    /// Signature half of the stored hash, the value successors chain onto.
    pub fn signature(&self) -> Result<Option<&str>, ChainError> {
        match self.hash.as_deref() {
            Some(hash) => signer::split(hash).map(|(_, sig)| Some(sig)),
            None => Ok(None),
        }
    }

    /// True when both carry identical values for every hash-contributing field.
    pub(crate) fn same_hash_fields(&self, other: &Document) -> bool {
        self.company == other.company
            && self.series_prefix == other.series_prefix
            && self.doc_type == other.doc_type
            && self.sequence_number == other.sequence_number
            && self.document_number == other.document_number
            && self.issue_date == other.issue_date
            && self.total_gross.value() == other.total_gross.value()
    }
}

impl HasDocumentNumber for Document {
    fn document_number(&self) -> Option<&str> {
        self.document_number.as_deref()
    }
}

// Also used for constructing drafts
#[derive(Debug, Default)]
pub struct DocumentDraft {
    id: Option<DocumentId>,
    company: Option<String>,
    series_prefix: Option<String>,
    doc_type: Option<DocumentType>,
    issue_date: Option<IssueDate>,
    total_gross: Option<Amount>,
    counterparty: Counterparty,
    currency: Option<String>,
    tax_lines: Vec<TaxLine>,
    narration: Option<String>,
    reference: Option<String>,
}

impl DocumentDraft {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_id(mut self, id: impl Into<DocumentId>) -> Self {
        self.id = Some(id.into());
        self
    }
    pub fn set_company(mut self, company: &str) -> Self {
        self.company = Some(company.to_owned());
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
    pub fn set_issue_date(mut self, date: IssueDate) -> Self {
        self.issue_date = Some(date);
        self
    }
    pub fn set_total_gross(mut self, amount: Amount) -> Self {
        self.total_gross = Some(amount);
        self
    }
    pub fn set_counterparty(mut self, tax_id: &str, country_code: &str) -> Self {
        self.counterparty = Counterparty {
            tax_id: Some(tax_id.to_owned()),
            country_code: Some(country_code.to_owned()),
        };
        self
    }
    pub fn set_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_owned());
        self
    }
    pub fn add_tax_line(mut self, category: TaxCategory, base: Amount, tax: Amount) -> Self {
        self.tax_lines.push(TaxLine {
            category,
            base,
            tax,
        });
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

    // Checks fields and returns a draft document ready to be stored
    pub fn validate_and_finalise(self) -> Result<Document, ChainError> {
        let company = self
            .company
            .filter(|c| !c.trim().is_empty())
            .ok_or(ValidationError::MissingCompany)?;
        let series_prefix = self
            .series_prefix
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingSeries)?;
        if series_prefix.contains('/') || series_prefix.chars().any(char::is_control) {
            return Err(ValidationError::InvalidSeries(series_prefix).into());
        }
        check_key_component("company", &company)?;
        check_key_component("series prefix", &series_prefix)?;
        let doc_type = self.doc_type.ok_or(ValidationError::MissingDocumentType)?;
        let issue_date = self.issue_date.ok_or(ValidationError::MissingIssueDate)?;
        let total_gross = self.total_gross.ok_or(ValidationError::MissingTotal)?;

        let currency = self.currency.unwrap_or_else(|| "EUR".to_owned());
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ValidationError::InvalidCurrency(currency).into());
        }

        let id = match self.id {
            Some(id) => id,
            None => DocumentId::generate()?,
        };

        Ok(Document {
            id,
            company,
            series_prefix,
            doc_type,
            sequence_number: None,
            document_number: None,
            issue_date,
            system_entry_instant: None,
            total_gross,
            hash: None,
            state: DocumentState::Draft,
            counterparty: self.counterparty,
            currency,
            tax_lines: self.tax_lines,
            narration: self.narration,
            reference: self.reference,
            payment_state: PaymentState::NotPaid,
            sequence_code: None,
            short_code: None,
            qr_payload: None,
        })
    }
}
