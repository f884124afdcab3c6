//! Externally printed codes derived from a document hash
use std::collections::HashMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rust_decimal::Decimal;

use crate::config::KeyConfigProvider;
use crate::document::{Document, HasDocumentNumber, TaxCategory};
use crate::error::ChainError;
use crate::signer;
use crate::types::{Amount, DocumentState, IssueDate};

const SHORT_CODE_POSITIONS: [usize; 4] = [0, 10, 20, 30];
const UNKNOWN_TAX_ID: &str = "999999990";
const UNKNOWN_COUNTRY: &str = "Desconhecido";
const PAIR_SEPARATOR: char = '*';

// unreserved characters stay readable, everything else is escaped
const VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Conversion rates into the canonical currency.
pub trait RateSource: Send + Sync {
    /// Canonical units per unit of `currency` on `date`.
    fn rate(&self, currency: &str, date: IssueDate) -> Option<Decimal>;
}

/// Fixed rates, the same on every date.
#[derive(Debug, Clone, Default)]
pub struct StaticRates {
    rates: HashMap<String, Decimal>,
}

impl StaticRates {
    pub fn with_rate(mut self, currency: &str, rate: Decimal) -> Self {
        self.rates.insert(currency.to_owned(), rate);
        self
    }
}

impl RateSource for StaticRates {
    fn rate(&self, currency: &str, _date: IssueDate) -> Option<Decimal> {
        self.rates.get(currency).copied()
    }
}

/// Characters 0, 10, 20 and 30 of the signature half of `hash`.
pub fn short_code(hash: &str) -> Result<String, ChainError> {
    let (_, signature) = signer::split(hash)?;
    let chars: Vec<char> = signature.chars().collect();

    SHORT_CODE_POSITIONS
        .iter()
        .map(|&i| chars.get(i).copied())
        .collect::<Option<String>>()
        .ok_or_else(|| ChainError::MalformedHash(hash.to_owned()))
}

/// `"<registered series code>-<sequence>"`.
pub fn sequence_code(provider: &KeyConfigProvider, doc: &Document) -> Result<String, ChainError> {
    let sequence = doc.sequence_number.ok_or_else(|| ChainError::InvalidState {
        document_id: doc.id.to_string(),
        state: doc.state,
        reason: "document has no sequence number",
    })?;
    let code = provider.series_code(&doc.series_prefix)?;
    Ok(format!("{code}-{sequence}"))
}

/// Ordered `key:value` pairs joined by `*`. The document must already be hashed.
pub fn qr_payload(
    provider: &KeyConfigProvider,
    rates: &dyn RateSource,
    doc: &Document,
) -> Result<String, ChainError> {
    let hash = doc.hash.as_deref().ok_or_else(|| ChainError::InvalidState {
        document_id: doc.id.to_string(),
        state: doc.state,
        reason: "document must be hashed before its payload is rendered",
    })?;
    let document_number = doc
        .document_number()
        .ok_or_else(|| ChainError::corrupt(doc.id.as_str(), "document number is not set"))?;
    let rate = conversion_rate(provider, rates, doc)?;
    let convert = |amount: Amount| Amount::new(amount.value() * rate).abs().canonical();

    let mut pairs: Vec<(&str, String)> = vec![
        ("A", provider.issuer_tax_id().to_owned()),
        (
            "B",
            doc.counterparty.tax_id.clone().unwrap_or_else(|| UNKNOWN_TAX_ID.to_owned()),
        ),
        (
            "C",
            doc.counterparty
                .country_code
                .clone()
                .unwrap_or_else(|| UNKNOWN_COUNTRY.to_owned()),
        ),
        ("D", doc.doc_type.tag().to_owned()),
        ("E", status_flag(doc.state).to_owned()),
        ("F", doc.issue_date.compact()),
        ("G", document_number.to_owned()),
        ("H", sequence_code(provider, doc)?),
        ("I1", provider.tax_region().to_owned()),
    ];

    for category in [
        TaxCategory::Exempt,
        TaxCategory::Reduced,
        TaxCategory::Intermediate,
        TaxCategory::Normal,
    ] {
        let lines: Vec<_> = doc.tax_lines.iter().filter(|l| l.category == category).collect();
        if lines.is_empty() {
            continue;
        }
        let base: Amount = lines.iter().map(|l| l.base).sum();
        let tax: Amount = lines.iter().map(|l| l.tax).sum();
        match category {
            TaxCategory::Exempt => pairs.push(("I2", convert(base))),
            TaxCategory::Reduced => {
                pairs.push(("I3", convert(base)));
                pairs.push(("I4", convert(tax)));
            }
            TaxCategory::Intermediate => {
                pairs.push(("I5", convert(base)));
                pairs.push(("I6", convert(tax)));
            }
            TaxCategory::Normal => {
                pairs.push(("I7", convert(base)));
                pairs.push(("I8", convert(tax)));
            }
        }
    }

    let total_tax: Amount = doc.tax_lines.iter().map(|l| l.tax).sum();
    pairs.push(("N", convert(total_tax)));
    pairs.push(("O", convert(doc.total_gross)));
    pairs.push(("Q", short_code(hash)?));
    pairs.push(("R", provider.certification_number().to_owned()));

    Ok(pairs
        .iter()
        .map(|(key, value)| format!("{key}:{}", utf8_percent_encode(value, VALUE)))
        .collect::<Vec<_>>()
        .join(&PAIR_SEPARATOR.to_string()))
}

fn status_flag(state: DocumentState) -> &'static str {
    match state {
        DocumentState::Cancelled => "A",
        _ => "N",
    }
}

fn conversion_rate(
    provider: &KeyConfigProvider,
    rates: &dyn RateSource,
    doc: &Document,
) -> Result<Decimal, ChainError> {
    if doc.currency == provider.canonical_currency() {
        return Ok(Decimal::ONE);
    }
    rates
        .rate(&doc.currency, doc.issue_date)
        .ok_or_else(|| ChainError::RateUnavailable {
            currency: doc.currency.clone(),
            date: doc.issue_date.iso(),
        })
}
