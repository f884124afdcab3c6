//! Value types shared by documents, the store and the wire formats
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, SubsecRound, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{ChainError, ValidationError};
use crate::utils;

/// Wall-clock instant truncated to whole seconds.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now().trunc_subsecs(0))
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// `YYYY-MM-DDTHH:MM:SS`, no offset and no fraction.
    pub fn iso_seconds(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
    pub fn plus_seconds(&self, seconds: i64) -> Self {
        Self(self.0 + Duration::seconds(seconds))
    }
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp<Utc> {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value.trunc_subsecs(0))
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0.timestamp())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let secs = d.i64()?;

        DateTime::from_timestamp(secs, 0)
            .map(TimeStamp)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert timestamp to utc",
            ))
    }
}

/// Calendar date a document represents (Gregorian).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct IssueDate(NaiveDate);

impl IssueDate {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }
    pub fn naive(&self) -> NaiveDate {
        self.0
    }
    /// `YYYY-MM-DD`
    pub fn iso(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
    /// `YYYYMMDD`, as printed in QR payloads.
    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }
}

impl From<NaiveDate> for IssueDate {
    fn from(value: NaiveDate) -> Self {
        IssueDate(value)
    }
}

impl FromStr for IssueDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map(IssueDate)
    }
}

impl fmt::Display for IssueDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.iso())
    }
}

impl<C> minicbor::Encode<C> for IssueDate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i32(self.0.num_days_from_ce())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for IssueDate {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let days = d.i32()?;

        NaiveDate::from_num_days_from_ce_opt(days)
            .map(IssueDate)
            .ok_or(minicbor::decode::Error::message("issue date out of range"))
    }
}

/// Signed monetary amount. Compared numerically, rendered with two decimals.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }
    pub fn value(&self) -> Decimal {
        self.0
    }
    /// Banker's rounding to two decimals.
    pub fn rounded(&self) -> Decimal {
        let mut rounded = self
            .0
            .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
        if rounded.is_zero() {
            rounded = Decimal::ZERO;
        }
        rounded.rescale(2);
        rounded
    }
    /// Locale independent rendering: optional minus, dot, exactly two decimals.
    pub fn canonical(&self) -> String {
        self.rounded().to_string()
    }
    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount(value)
    }
}

impl FromStr for Amount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str_exact(s).map(Amount)
    }
}

impl std::ops::Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

// stored as its exact decimal text so no precision is lost at rest
impl<C> minicbor::Encode<C> for Amount {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Amount {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;

        Decimal::from_str_exact(text)
            .map(Amount)
            .map_err(|_| minicbor::decode::Error::message("invalid decimal amount"))
    }
}

/// Stable opaque document identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    /// bech32 encoded uuid7 with the `doc` prefix.
    pub fn generate() -> Result<Self, ChainError> {
        utils::new_uuid_to_bech32("doc")
            .map(DocumentId)
            .map_err(|e| ChainError::Encoding(e.to_string()))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        DocumentId(value.to_owned())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        DocumentId(value)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<C> minicbor::Encode<C> for DocumentId {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for DocumentId {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(DocumentId(d.str()?.to_owned()))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocumentType {
    #[n(0)]
    Invoice,
    #[n(1)]
    Refund,
    #[n(2)]
    DebitNote,
    #[n(3)]
    InvoiceReceipt,
    #[n(4)]
    Bill,
    #[n(5)]
    RefundBill,
    #[n(6)]
    Payroll,
    #[n(7)]
    PayrollAdjustment,
}

impl DocumentType {
    pub const ALL: [DocumentType; 8] = [
        DocumentType::Invoice,
        DocumentType::Refund,
        DocumentType::DebitNote,
        DocumentType::InvoiceReceipt,
        DocumentType::Bill,
        DocumentType::RefundBill,
        DocumentType::Payroll,
        DocumentType::PayrollAdjustment,
    ];

    /// Document type tag used in document numbers and QR payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "FT",
            DocumentType::Refund => "NC",
            DocumentType::DebitNote => "ND",
            DocumentType::InvoiceReceipt => "FR",
            DocumentType::Bill => "FC",
            DocumentType::RefundBill => "NF",
            DocumentType::Payroll => "NE",
            DocumentType::PayrollAdjustment => "NA",
        }
    }
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
    /// Documents that reverse a previous one and count as debits in audit totals.
    pub fn is_refund(&self) -> bool {
        matches!(self, DocumentType::Refund | DocumentType::RefundBill)
    }
    fn code(&self) -> u8 {
        match self {
            DocumentType::Invoice => 0,
            DocumentType::Refund => 1,
            DocumentType::DebitNote => 2,
            DocumentType::InvoiceReceipt => 3,
            DocumentType::Bill => 4,
            DocumentType::RefundBill => 5,
            DocumentType::Payroll => 6,
            DocumentType::PayrollAdjustment => 7,
        }
    }
    fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    #[n(0)]
    Draft,
    #[n(1)]
    Posted,
    #[n(2)]
    Cancelled,
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentState::Draft => "draft",
            DocumentState::Posted => "posted",
            DocumentState::Cancelled => "cancelled",
        })
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentState {
    #[default]
    #[n(0)]
    NotPaid,
    #[n(1)]
    Partial,
    #[n(2)]
    Paid,
}

/// `(company, series_prefix, type)`: documents sharing it form one chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainKey {
    pub company: String,
    pub series_prefix: String,
    pub doc_type: DocumentType,
}

impl ChainKey {
    pub fn new(company: &str, series_prefix: &str, doc_type: DocumentType) -> Self {
        Self {
            company: company.to_owned(),
            series_prefix: series_prefix.to_owned(),
            doc_type,
        }
    }

    /// Byte prefix shared by every index entry of the company.
    pub(crate) fn company_prefix(company: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(company.len() + 2);
        push_component(&mut out, company.as_bytes());
        out
    }

    /// Length-prefixed encoding, so distinct keys never share a prefix.
    pub(crate) fn storage_prefix(&self) -> Vec<u8> {
        let mut out = Self::company_prefix(&self.company);
        push_component(&mut out, self.series_prefix.as_bytes());
        out.push(self.doc_type.code());
        out
    }

    /// Decodes a key written by `storage_prefix`, returning it with the bytes consumed.
    pub(crate) fn from_storage(bytes: &[u8]) -> Result<(Self, usize), ChainError> {
        let (company, rest) = take_component(bytes)?;
        let (series, rest) = take_component(rest)?;
        let (&code, rest) = rest
            .split_first()
            .ok_or_else(|| ChainError::Encoding("truncated chain key".into()))?;
        let doc_type = DocumentType::from_code(code)
            .ok_or_else(|| ChainError::Encoding(format!("unknown document type code {code}")))?;

        let key = ChainKey {
            company: company.to_owned(),
            series_prefix: series.to_owned(),
            doc_type,
        };
        Ok((key, bytes.len() - rest.len()))
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.company, self.series_prefix, self.doc_type)
    }
}

/// Longest company or series prefix, in bytes, a chain key can hold.
pub const MAX_KEY_COMPONENT_LEN: usize = u16::MAX as usize;

// callers keep components within MAX_KEY_COMPONENT_LEN; see `check_key_component`
fn push_component(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(MAX_KEY_COMPONENT_LEN);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&bytes[..len]);
}

pub(crate) fn check_key_component(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_KEY_COMPONENT_LEN {
        return Err(ValidationError::ComponentTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn take_component(bytes: &[u8]) -> Result<(&str, &[u8]), ChainError> {
    if bytes.len() < 2 {
        return Err(ChainError::Encoding("truncated chain key".into()));
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if rest.len() < len {
        return Err(ChainError::Encoding("truncated chain key".into()));
    }
    let text = std::str::from_utf8(&rest[..len])
        .map_err(|e| ChainError::Encoding(format!("chain key is not utf-8: {e}")))?;
    Ok((text, &rest[len..]))
}
