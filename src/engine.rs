//! Lazy hashing of chain tails, strictly in sequence order
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::chain::{self, ChainTail};
use crate::document::{Document, format_document_number};
use crate::error::ChainError;
use crate::lease::ChainLease;
use crate::serializer::serialize;
use crate::session::Session;
use crate::signer;
use crate::store::CommitOutcome;
use crate::types::{DocumentId, TimeStamp};

const MAX_WALK_ATTEMPTS: usize = 3;

/// Returns the stored hash of `id`, hashing it and every unhashed member
/// before it first.
pub fn ensure_hashed(session: &Session, id: &DocumentId) -> Result<String, ChainError> {
    hash_through(session, id).map(|(hash, _)| hash)
}

/// Hashes every pending chain tail of the company. Returns the number of
/// documents signed.
pub fn ensure_hashed_all(session: &Session, company: &str) -> Result<usize, ChainError> {
    let store = session.store();
    let mut signed = 0;

    for key in store.chain_keys(company)? {
        let Some(last) = store.last_member(&key)? else {
            continue;
        };
        if last.is_hashed() {
            continue;
        }
        signed += hash_through(session, &last.id)?.1;
    }

    if signed > 0 {
        info!(company, signed, "hashed pending documents of company");
    }
    Ok(signed)
}

/// Hashes every document queued by posting in this session.
pub fn flush_pending_hashes(session: &Session) -> Result<usize, ChainError> {
    let pending = session.take_pending();
    let mut signed = 0;

    let mut ids = pending.iter();
    while let Some(id) = ids.next() {
        let doc = match session.store().try_load(id)? {
            Some(doc) if doc.is_chain_member() && !doc.is_hashed() => doc,
            _ => continue,
        };
        match hash_through(session, &doc.id) {
            Ok((_, count)) => signed += count,
            Err(err) => {
                session.mark_pending(id.clone());
                for rest in ids.by_ref() {
                    session.mark_pending(rest.clone());
                }
                return Err(err);
            }
        }
    }
    Ok(signed)
}

fn hash_through(session: &Session, id: &DocumentId) -> Result<(String, usize), ChainError> {
    let store = session.store();
    let provider = session.provider();

    let doc = store.load(id)?;
    if let Some(hash) = doc.hash {
        return Ok((hash, 0));
    }
    if !doc.is_chain_member() {
        return Err(ChainError::InvalidState {
            document_id: doc.id.to_string(),
            state: doc.state,
            reason: "only posted documents can be hashed",
        });
    }

    let key = doc.chain_key();
    let _lease = ChainLease::acquire(store.leases(), &key, provider.lease_wait(), provider.lease_ttl())?;

    for attempt in 1..=MAX_WALK_ATTEMPTS {
        // another holder may have hashed it while we waited
        let doc = store.load(id)?;
        if let Some(hash) = doc.hash {
            debug!(document = %id, "hash produced by a concurrent walk");
            return Ok((hash, 0));
        }

        let walked = sign_tail(session, chain::chain_from_last_hashed(store, &doc)?)?;
        match store.commit_hashes(&walked)? {
            CommitOutcome::Applied => {
                info!(chain = %key, document = %id, signed = walked.len(), "hashed chain tail");
                let hash = walked
                    .last()
                    .and_then(|d| d.hash.clone())
                    .ok_or_else(|| ChainError::corrupt(id.as_str(), "walk produced no hash"))?;
                return Ok((hash, walked.len()));
            }
            CommitOutcome::Stale => {
                warn!(chain = %key, document = %id, attempt, "chain changed during walk, retrying");
            }
        }
    }

    Err(ChainError::SigningUnavailable(format!(
        "chain {key} kept changing while hashing {id}"
    )))
}

/// Signs each document of the tail in memory. Nothing is persisted here.
///
/// The signing deadline is measured after each signature returns; an overrun
/// fails the whole walk, but a signer that hangs blocks the caller.
fn sign_tail(session: &Session, tail: ChainTail) -> Result<Vec<Document>, ChainError> {
    let provider = session.provider();
    let deadline = provider.signing_deadline();

    let (mut previous_signature, mut previous_instant) = match &tail.previous {
        Some(previous) => anchor(previous)?,
        None => (String::new(), None),
    };

    let mut walked = Vec::with_capacity(tail.documents.len());
    for mut doc in tail.documents {
        check_hash_fields(&doc)?;

        let now = session.now();
        let instant = match previous_instant {
            Some(before) if now.to_datetime_utc() <= before => TimeStamp::from(before + Duration::seconds(1)),
            _ => now,
        };
        doc.system_entry_instant = Some(instant.clone());

        let canonical = serialize(&doc, &previous_signature)?;
        let started = Instant::now();
        let hash = provider.sign_active(&canonical)?;
        if started.elapsed() > deadline {
            return Err(ChainError::SigningUnavailable(format!(
                "signing {} exceeded the {} ms deadline",
                doc.id,
                deadline.as_millis()
            )));
        }
        debug!(document = %doc.id, sequence = ?doc.sequence_number, "document signed");

        previous_signature = signer::split(&hash)?.1.to_owned();
        previous_instant = Some(instant.to_datetime_utc());
        doc.hash = Some(hash);
        walked.push(doc);
    }
    Ok(walked)
}

/// Signature and instant of the hashed member the tail links onto.
fn anchor(previous: &Document) -> Result<(String, Option<DateTime<Utc>>), ChainError> {
    let signature = previous
        .signature()?
        .ok_or_else(|| ChainError::corrupt(previous.id.as_str(), "anchor document has no hash"))?;
    let instant = previous.system_entry_instant.as_ref().ok_or_else(|| {
        ChainError::corrupt(previous.id.as_str(), "hashed document has no system entry instant")
    })?;
    Ok((signature.to_owned(), Some(instant.to_datetime_utc())))
}

pub(crate) fn check_hash_fields(doc: &Document) -> Result<(), ChainError> {
    let sequence = doc
        .sequence_number
        .ok_or_else(|| ChainError::corrupt(doc.id.as_str(), "posted document has no sequence number"))?;
    let expected = format_document_number(doc.doc_type, &doc.series_prefix, sequence);
    if doc.document_number.as_deref() != Some(expected.as_str()) {
        return Err(ChainError::corrupt(
            doc.id.as_str(),
            format!("document number does not match {expected}"),
        ));
    }
    Ok(())
}
