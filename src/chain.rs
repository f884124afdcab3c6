//! Predecessor lookups within one `(company, series, type)` chain
use tracing::warn;

use crate::document::Document;
use crate::error::ChainError;
use crate::store::DocumentStore;
use crate::types::ChainKey;

/// Unhashed end of a chain, in sequence order, with the member it links onto.
#[derive(Debug, Clone)]
pub struct ChainTail {
    /// Last hashed member before the tail, `None` when the tail starts the chain.
    pub previous: Option<Document>,
    pub documents: Vec<Document>,
}

pub fn chain_key(doc: &Document) -> ChainKey {
    doc.chain_key()
}

/// Nearest chain member before `doc`.
pub fn predecessor(store: &DocumentStore, doc: &Document) -> Result<Option<Document>, ChainError> {
    let Some(previous) = store.members_before(doc)?.next().transpose()? else {
        return Ok(None);
    };
    if previous.sequence_number == doc.sequence_number {
        warn!(
            document = %doc.id,
            sibling = %previous.id,
            sequence = ?doc.sequence_number,
            "duplicate sequence number in chain, ordering by id"
        );
    }
    Ok(Some(previous))
}

/// Every unhashed member from the first one after the last hashed member up
/// to and including `doc`.
pub fn chain_from_last_hashed(store: &DocumentStore, doc: &Document) -> Result<ChainTail, ChainError> {
    if !doc.is_chain_member() {
        return Err(ChainError::InvalidState {
            document_id: doc.id.to_string(),
            state: doc.state,
            reason: "only posted documents take part in a chain",
        });
    }

    // hashes are written front to back, so nothing after an unhashed member may carry one
    if let Some(later) = store.first_hashed_after(doc)? {
        return Err(ChainError::corrupt(
            doc.id.as_str(),
            format!("unhashed, but later member {} is hashed", later.id),
        ));
    }

    let mut documents = vec![doc.clone()];
    let mut previous = None;
    for member in store.members_before(doc)? {
        let member = member?;
        if member.is_hashed() {
            previous = Some(member);
            break;
        }
        documents.push(member);
    }
    documents.reverse();

    Ok(ChainTail { previous, documents })
}

/// All members of the chain in sequence order.
pub fn chain(store: &DocumentStore, key: &ChainKey) -> Result<Vec<Document>, ChainError> {
    let mut members = Vec::new();
    let mut cursor: Option<Vec<u8>> = None;
    loop {
        let (batch, last_key) = store.members_batch(key, cursor.as_deref(), 256)?;
        members.extend(batch);
        match last_key {
            Some(last) if cursor.as_deref() != Some(last.as_slice()) => cursor = Some(last),
            _ => break,
        }
    }
    Ok(members)
}
