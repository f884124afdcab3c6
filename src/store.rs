//! sled-backed persistence for documents, the chain index and run records
use std::ops::Bound;
use std::sync::Arc;

use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::warn;

use crate::document::Document;
use crate::error::ChainError;
use crate::guard::{self, ChangeSet};
use crate::types::{ChainKey, DocumentId};

const DOCUMENTS: &str = "documents";
const CHAIN_INDEX: &str = "chain_index";
const LEASES: &str = "leases";
const VERIFICATIONS: &str = "verifications";

/// Outcome of persisting a hashed walk.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Applied,
    /// A document of the walk changed underneath it; the walk must be redone.
    Stale,
}

enum CommitAbort {
    Stale,
    Encoding(String),
}

#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<sled::Db>,
    documents: sled::Tree,
    chain_index: sled::Tree,
    leases: sled::Tree,
    verifications: sled::Tree,
}

impl DocumentStore {
    pub fn open(db: Arc<sled::Db>) -> Result<Self, ChainError> {
        Ok(Self {
            documents: db.open_tree(DOCUMENTS)?,
            chain_index: db.open_tree(CHAIN_INDEX)?,
            leases: db.open_tree(LEASES)?,
            verifications: db.open_tree(VERIFICATIONS)?,
            db,
        })
    }

    pub(crate) fn leases(&self) -> &sled::Tree {
        &self.leases
    }

    pub(crate) fn verifications(&self) -> &sled::Tree {
        &self.verifications
    }

    pub(crate) fn generate_id(&self) -> Result<u64, ChainError> {
        Ok(self.db.generate_id()?)
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.db.flush()?;
        Ok(())
    }

    /// Stores a new draft. Fails if the id is taken.
    pub(crate) fn insert_draft(&self, doc: &Document) -> Result<(), ChainError> {
        let encoded = minicbor::to_vec(doc)?;
        let swapped = self
            .documents
            .compare_and_swap(doc.id.as_bytes(), None::<&[u8]>, Some(encoded))?;

        swapped.map_err(|_| ChainError::InvalidState {
            document_id: doc.id.to_string(),
            state: doc.state,
            reason: "a document with this id already exists",
        })
    }

    pub fn try_load(&self, id: &DocumentId) -> Result<Option<Document>, ChainError> {
        match self.documents.get(id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn load(&self, id: &DocumentId) -> Result<Document, ChainError> {
        self.try_load(id)?
            .ok_or_else(|| ChainError::DocumentNotFound(id.to_string()))
    }

    /// Swaps `current` for `next` if nobody wrote the document in between.
    /// Returns false on a lost race.
    pub(crate) fn replace(&self, current: &Document, next: &Document) -> Result<bool, ChainError> {
        let old = minicbor::to_vec(current)?;
        let new = minicbor::to_vec(next)?;
        let swapped = self
            .documents
            .compare_and_swap(current.id.as_bytes(), Some(old), Some(new))?;
        Ok(swapped.is_ok())
    }

    /// Writes a freshly posted document and its index entry atomically. With
    /// `replacing`, the write only happens if the stored document still equals
    /// it; returns false otherwise.
    pub(crate) fn save_posted(&self, doc: &Document, replacing: Option<&Document>) -> Result<bool, ChainError> {
        let index_key = index_key(doc)?;
        let encoded = minicbor::to_vec(doc)?;
        let expected = replacing.map(minicbor::to_vec).transpose()?;

        let result = (&self.documents, &self.chain_index).transaction(|(documents, index)| {
            if let Some(expected) = &expected {
                let current = documents.get(doc.id.as_bytes())?;
                if current.as_deref() != Some(expected.as_slice()) {
                    return Err(ConflictableTransactionError::Abort(()));
                }
            }
            documents.insert(doc.id.as_bytes(), encoded.clone())?;
            index.insert(index_key.clone(), doc.id.as_bytes())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(true),
            Err(TransactionError::Abort(())) => Ok(false),
            Err(TransactionError::Storage(e)) => Err(ChainError::Storage(e)),
        }
    }

    /// Applies `changes` without consulting the immutability guard. Meant for
    /// administrative repair; any edit of a hash-covered field breaks verification.
    pub fn overwrite_unguarded(&self, id: &DocumentId, changes: ChangeSet) -> Result<Document, ChainError> {
        let mut doc = self.load(id)?;
        guard::apply(&mut doc, changes);
        warn!(document = %doc.id, "document overwritten without guard");
        self.documents
            .insert(doc.id.as_bytes(), minicbor::to_vec(&doc)?)?;
        Ok(doc)
    }

    /// Persists every hashed document of a walk in one transaction, only if
    /// none of them changed since the walk read them.
    pub(crate) fn commit_hashes(&self, walked: &[Document]) -> Result<CommitOutcome, ChainError> {
        let result = self.documents.transaction(|tx| {
            for doc in walked {
                let Some(raw) = tx.get(doc.id.as_bytes())? else {
                    return Err(ConflictableTransactionError::Abort(CommitAbort::Stale));
                };
                let mut current: Document = minicbor::decode(&raw).map_err(|e| {
                    ConflictableTransactionError::Abort(CommitAbort::Encoding(e.to_string()))
                })?;
                if current.hash.is_some()
                    || current.state != doc.state
                    || !current.same_hash_fields(doc)
                {
                    return Err(ConflictableTransactionError::Abort(CommitAbort::Stale));
                }

                current.hash = doc.hash.clone();
                current.system_entry_instant = doc.system_entry_instant.clone();
                let encoded = minicbor::to_vec(&current).map_err(|e| {
                    ConflictableTransactionError::Abort(CommitAbort::Encoding(e.to_string()))
                })?;
                tx.insert(doc.id.as_bytes(), encoded)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(CommitOutcome::Applied),
            Err(TransactionError::Abort(CommitAbort::Stale)) => Ok(CommitOutcome::Stale),
            Err(TransactionError::Abort(CommitAbort::Encoding(e))) => Err(ChainError::Encoding(e)),
            Err(TransactionError::Storage(e)) => Err(ChainError::Storage(e)),
        }
    }

    /// Chain members ordered by `(sequence_number, id)` strictly before `doc`,
    /// nearest first.
    pub(crate) fn members_before<'a>(
        &'a self,
        doc: &Document,
    ) -> Result<impl Iterator<Item = Result<Document, ChainError>> + use<'a>, ChainError> {
        let prefix = doc.chain_key().storage_prefix();
        let upper = index_key(doc)?;

        let iter = self
            .chain_index
            .range(prefix..upper)
            .rev()
            .map(move |entry| self.load_indexed(entry))
            .filter(|doc| doc.as_ref().map_or(true, Document::is_chain_member));
        Ok(iter)
    }

    /// First hashed chain member positioned after `doc`.
    pub(crate) fn first_hashed_after(&self, doc: &Document) -> Result<Option<Document>, ChainError> {
        let prefix = doc.chain_key().storage_prefix();
        let lower = index_key(doc)?;

        for entry in self.chain_index.range((Bound::Excluded(lower), Bound::Unbounded)) {
            let (index_key, id) = entry?;
            if !index_key.starts_with(&prefix) {
                break;
            }
            let member = self.load(&id_from_bytes(&id)?)?;
            if member.is_chain_member() && member.is_hashed() {
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    /// Up to `limit` members of the chain after index position `after`,
    /// with the index key of the last one returned.
    pub(crate) fn members_batch(
        &self,
        key: &ChainKey,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<(Vec<Document>, Option<Vec<u8>>), ChainError> {
        let prefix = key.storage_prefix();
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.clone()),
        };

        let mut members = Vec::new();
        let mut last_key = None;
        for entry in self.chain_index.range((lower, Bound::Unbounded)) {
            let (index_key, id) = entry?;
            if !index_key.starts_with(&prefix) {
                break;
            }
            last_key = Some(index_key.to_vec());
            let doc = self.load(&id_from_bytes(&id)?)?;
            if doc.is_chain_member() {
                members.push(doc);
                if members.len() >= limit {
                    break;
                }
            }
        }
        Ok((members, last_key))
    }

    /// Chain member with the highest position.
    pub(crate) fn last_member(&self, key: &ChainKey) -> Result<Option<Document>, ChainError> {
        for entry in self.chain_index.scan_prefix(key.storage_prefix()).rev() {
            let doc = self.load_indexed(entry)?;
            if doc.is_chain_member() {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    /// Highest sequence number already hashed in the chain.
    pub(crate) fn last_hashed_sequence(&self, key: &ChainKey) -> Result<Option<u64>, ChainError> {
        for entry in self.chain_index.scan_prefix(key.storage_prefix()).rev() {
            let doc = self.load_indexed(entry)?;
            if doc.is_chain_member() && doc.is_hashed() {
                return Ok(doc.sequence_number);
            }
        }
        Ok(None)
    }

    /// Highest sequence number ever indexed in the chain, members or not.
    pub(crate) fn last_indexed_sequence(&self, key: &ChainKey) -> Result<Option<u64>, ChainError> {
        let prefix = key.storage_prefix();
        match self.chain_index.scan_prefix(&prefix).next_back() {
            Some(entry) => {
                let (index_key, _) = entry?;
                Ok(Some(sequence_from_index_key(&index_key, prefix.len())?))
            }
            None => Ok(None),
        }
    }

    /// Every chain of the company that has at least one indexed document.
    pub fn chain_keys(&self, company: &str) -> Result<Vec<ChainKey>, ChainError> {
        let mut keys: Vec<ChainKey> = Vec::new();
        for entry in self.chain_index.scan_prefix(ChainKey::company_prefix(company)) {
            let (index_key, _) = entry?;
            let (key, _) = ChainKey::from_storage(&index_key)?;
            keys.push(key);
        }
        keys.dedup();
        Ok(keys)
    }

    fn load_indexed(&self, entry: sled::Result<(sled::IVec, sled::IVec)>) -> Result<Document, ChainError> {
        let (index_key, id) = entry?;
        let id = id_from_bytes(&id)?;
        self.try_load(&id)?.ok_or_else(|| {
            ChainError::Encoding(format!(
                "index entry {} points at missing document {id}",
                String::from_utf8_lossy(&index_key)
            ))
        })
    }
}

/// `chain prefix ‖ sequence (big-endian) ‖ id`, ordering ties by id.
pub(crate) fn index_key(doc: &Document) -> Result<Vec<u8>, ChainError> {
    let sequence = doc.sequence_number.ok_or_else(|| ChainError::InvalidState {
        document_id: doc.id.to_string(),
        state: doc.state,
        reason: "document has no sequence number",
    })?;
    let mut key = doc.chain_key().storage_prefix();
    key.extend_from_slice(&sequence.to_be_bytes());
    key.extend_from_slice(doc.id.as_bytes());
    Ok(key)
}

fn sequence_from_index_key(index_key: &[u8], prefix_len: usize) -> Result<u64, ChainError> {
    index_key
        .get(prefix_len..prefix_len + 8)
        .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| ChainError::Encoding("truncated chain index key".into()))
}

fn id_from_bytes(raw: &[u8]) -> Result<DocumentId, ChainError> {
    std::str::from_utf8(raw)
        .map(DocumentId::from)
        .map_err(|e| ChainError::Encoding(format!("document id is not utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentDraft;
    use crate::types::{DocumentState, DocumentType, IssueDate};
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("store.db")).unwrap();
        let store = DocumentStore::open(Arc::new(db)).unwrap();
        (dir, store)
    }

    fn posted(series: &str, sequence: u64) -> Document {
        let mut doc = DocumentDraft::new()
            .set_company("acme")
            .set_series(series)
            .set_doc_type(DocumentType::Invoice)
            .set_issue_date(IssueDate::from_ymd(2017, 3, 10).unwrap())
            .set_total_gross("10.00".parse().unwrap())
            .validate_and_finalise()
            .unwrap();
        doc.sequence_number = Some(sequence);
        doc.state = DocumentState::Posted;
        doc
    }

    #[test]
    fn draft_ids_are_unique() {
        let (_dir, store) = open_store();
        let doc = posted("A", 1);

        store.insert_draft(&doc).unwrap();
        assert!(store.insert_draft(&doc).is_err());
        assert_eq!(store.load(doc.id()).unwrap(), doc);
    }

    #[test]
    fn members_before_walks_backwards() {
        let (_dir, store) = open_store();
        let docs: Vec<_> = [1, 3, 7].into_iter().map(|n| posted("A", n)).collect();
        for doc in &docs {
            store.save_posted(doc, None).unwrap();
        }
        store.save_posted(&posted("B", 2), None).unwrap();

        let before: Vec<u64> = store
            .members_before(&docs[2])
            .unwrap()
            .map(|d| d.unwrap().sequence_number().unwrap())
            .collect();
        assert_eq!(before, vec![3, 1]);
        assert_eq!(store.last_indexed_sequence(&docs[0].chain_key()).unwrap(), Some(7));
    }

    #[test]
    fn chain_keys_lists_each_chain_once() {
        let (_dir, store) = open_store();
        for (series, n) in [("A", 1), ("A", 2), ("B", 1)] {
            store.save_posted(&posted(series, n), None).unwrap();
        }

        let keys = store.chain_keys("acme").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(store.chain_keys("other").unwrap().is_empty());
    }

    #[test]
    fn stale_walk_is_not_committed() {
        let (_dir, store) = open_store();
        let doc = posted("A", 1);
        store.save_posted(&doc, None).unwrap();

        let mut walked = doc.clone();
        walked.hash = Some("1$QUJD".into());
        walked.total_gross = "11.00".parse().unwrap();

        assert_eq!(store.commit_hashes(&[walked]).unwrap(), CommitOutcome::Stale);
        assert!(store.load(doc.id()).unwrap().hash().is_none());
    }

    #[test]
    fn batches_resume_after_last_key() {
        let (_dir, store) = open_store();
        for n in 1..=5 {
            store.save_posted(&posted("A", n), None).unwrap();
        }
        let key = posted("A", 1).chain_key();

        let (first, cursor) = store.members_batch(&key, None, 2).unwrap();
        let (second, _) = store.members_batch(&key, cursor.as_deref(), 10).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(
            second.iter().map(|d| d.sequence_number().unwrap()).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }
}
