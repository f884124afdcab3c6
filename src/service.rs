//! Service layer API for document chain operations
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chain;
use crate::config::KeyConfigProvider;
use crate::document::{Document, DocumentDraft, format_document_number};
use crate::engine;
use crate::error::{ChainError, ValidationError};
use crate::export::{self, AuditFile};
use crate::guard::{self, ChangeSet};
use crate::lease::ChainLease;
use crate::qr;
use crate::session::Session;
use crate::store::DocumentStore;
use crate::types::{ChainKey, DocumentId, DocumentState, DocumentType, IssueDate, check_key_component};
use crate::verifier::{self, IntegrityReport, VerificationRecord, VerificationResult};

const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Codes printed on a rendered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCodes {
    pub hash: String,
    pub short_code: String,
    pub sequence_code: String,
    pub qr_payload: String,
}

pub struct DocumentService {
    session: Arc<Session>,
}

impl DocumentService {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn open(instance: Arc<sled::Db>, provider: KeyConfigProvider) -> Result<Self, ChainError> {
        let store = DocumentStore::open(instance)?;
        Ok(Self::new(Arc::new(Session::new(store, Arc::new(provider)))))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Load a document from the database
    pub fn load(&self, id: &DocumentId) -> Result<Document, ChainError> {
        self.session.store().load(id)
    }

    /// Validate a draft and store it
    pub fn create_draft(&self, draft: DocumentDraft) -> Result<Document, ChainError> {
        let doc = draft.validate_and_finalise()?;
        self.session.store().insert_draft(&doc)?;
        debug!(document = %doc.id, chain = %doc.chain_key(), "draft created");
        Ok(doc)
    }

    /// Post a draft under a sequence number chosen by the caller. No signing
    /// happens here; the document is queued for the next flush.
    pub fn post(&self, id: &DocumentId, sequence_number: u64) -> Result<Document, ChainError> {
        if sequence_number == 0 {
            return Err(ValidationError::ZeroSequence.into());
        }
        self.post_with(id, Some(sequence_number))
    }

    /// Post a draft under the next free sequence number of its chain
    pub fn post_next(&self, id: &DocumentId) -> Result<Document, ChainError> {
        self.post_with(id, None)
    }

    fn post_with(&self, id: &DocumentId, requested: Option<u64>) -> Result<Document, ChainError> {
        let store = self.session.store();
        let provider = self.session.provider();

        let key = store.load(id)?.chain_key();
        let _lease = ChainLease::acquire(store.leases(), &key, provider.lease_wait(), provider.lease_ttl())?;

        let draft = store.load(id)?;
        if draft.state != DocumentState::Draft {
            return Err(ChainError::InvalidState {
                document_id: id.to_string(),
                state: draft.state,
                reason: "only drafts can be posted",
            });
        }
        if draft.chain_key() != key {
            return Err(ChainError::InvalidState {
                document_id: id.to_string(),
                state: draft.state,
                reason: "draft moved to another chain while posting",
            });
        }

        let sequence_number = match requested {
            Some(sequence_number) => {
                if let Some(last_hashed) = store.last_hashed_sequence(&key)? {
                    if sequence_number <= last_hashed {
                        return Err(ChainError::OutOfOrderPosting {
                            chain: key.to_string(),
                            sequence_number,
                            last_hashed,
                        });
                    }
                }
                sequence_number
            }
            None => store
                .last_indexed_sequence(&key)?
                .unwrap_or(0)
                .checked_add(1)
                .ok_or_else(|| ChainError::InvalidState {
                    document_id: id.to_string(),
                    state: draft.state,
                    reason: "chain has no sequence numbers left",
                })?,
        };

        let mut posted = draft.clone();
        posted.sequence_number = Some(sequence_number);
        posted.document_number = Some(format_document_number(
            posted.doc_type,
            &posted.series_prefix,
            sequence_number,
        ));
        posted.state = DocumentState::Posted;

        if !store.save_posted(&posted, Some(&draft))? {
            return Err(ChainError::InvalidState {
                document_id: id.to_string(),
                state: draft.state,
                reason: "draft changed while posting, retry",
            });
        }
        if let Some(sibling) = chain::predecessor(store, &posted)? {
            if sibling.sequence_number == posted.sequence_number {
                warn!(chain = %key, sequence = sequence_number, "sequence number posted twice");
            }
        }

        self.session.mark_pending(posted.id.clone());
        info!(
            document = %posted.id,
            chain = %key,
            sequence = sequence_number,
            "document posted"
        );
        Ok(posted)
    }

    /// Update a document through the immutability guard
    pub fn update(&self, id: &DocumentId, changes: ChangeSet) -> Result<Document, ChainError> {
        let store = self.session.store();

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = store.load(id)?;
            guard::check(&current, &changes)?;
            check_lifecycle(&current, &changes)?;
            if let Some(currency) = &changes.currency {
                if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                    return Err(ValidationError::InvalidCurrency(currency.clone()).into());
                }
            }
            if let Some(company) = &changes.company {
                check_key_component("company", company)?;
            }
            if let Some(series_prefix) = &changes.series_prefix {
                check_key_component("series prefix", series_prefix)?;
            }

            let mut next = current.clone();
            guard::apply(&mut next, changes.clone());
            if store.replace(&current, &next)? {
                debug!(document = %id, "document updated");
                return Ok(next);
            }
            debug!(document = %id, "concurrent write, retrying update");
        }

        Err(ChainError::InvalidState {
            document_id: id.to_string(),
            state: store.load(id)?.state,
            reason: "document kept changing during update",
        })
    }

    /// Cancel a document. A hashed document keeps its hash and its place in the chain.
    pub fn cancel(&self, id: &DocumentId) -> Result<Document, ChainError> {
        let doc = self.update(id, ChangeSet::new().set_state(DocumentState::Cancelled))?;
        info!(document = %id, hashed = doc.is_hashed(), "document cancelled");
        Ok(doc)
    }

    pub fn ensure_hashed(&self, id: &DocumentId) -> Result<String, ChainError> {
        engine::ensure_hashed(&self.session, id)
    }

    pub fn ensure_hashed_all(&self, company: &str) -> Result<usize, ChainError> {
        engine::ensure_hashed_all(&self.session, company)
    }

    pub fn flush_pending_hashes(&self) -> Result<usize, ChainError> {
        engine::flush_pending_hashes(&self.session)
    }

    /// Hash the document if needed and produce its printed codes. Codes are
    /// cached on the document the first time they are produced.
    pub fn render(&self, id: &DocumentId) -> Result<RenderedCodes, ChainError> {
        let hash = engine::ensure_hashed(&self.session, id)?;
        let store = self.session.store();

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = store.load(id)?;
            if let Some(codes) = cached_codes(&current) {
                return Ok(codes);
            }

            let mut next = current.clone();
            next.short_code = Some(qr::short_code(&hash)?);
            next.sequence_code = Some(qr::sequence_code(self.session.provider(), &current)?);
            next.qr_payload = Some(qr::qr_payload(
                self.session.provider(),
                self.session.rates(),
                &current,
            )?);

            if store.replace(&current, &next)? {
                debug!(document = %id, "document codes rendered");
                if let Some(codes) = cached_codes(&next) {
                    return Ok(codes);
                }
            }
        }

        Err(ChainError::InvalidState {
            document_id: id.to_string(),
            state: store.load(id)?.state,
            reason: "document kept changing while rendering",
        })
    }

    pub fn verify(
        &self,
        company: &str,
        series_prefix: &str,
        doc_type: DocumentType,
    ) -> Result<VerificationResult, ChainError> {
        verifier::verify(&self.session, company, series_prefix, doc_type)
    }

    pub fn check_integrity(&self, company: &str) -> Result<IntegrityReport, ChainError> {
        verifier::check_integrity(&self.session, company)
    }

    pub fn verification_history(&self, key: &ChainKey) -> Result<Vec<VerificationRecord>, ChainError> {
        verifier::verification_history(&self.session, key)
    }

    pub fn export_audit_file(
        &self,
        company: &str,
        from: IssueDate,
        to: IssueDate,
    ) -> Result<AuditFile, ChainError> {
        export::export_audit_file(&self.session, company, from, to)
    }
}

/// Placement and state rules the hash guard does not cover.
fn check_lifecycle(doc: &Document, changes: &ChangeSet) -> Result<(), ChainError> {
    let invalid = |reason| ChainError::InvalidState {
        document_id: doc.id.to_string(),
        state: doc.state,
        reason,
    };

    if changes.sequence_number.is_some()
        || changes.document_number.is_some()
        || changes.system_entry_instant.is_some()
    {
        return Err(invalid("numbering and entry instants are assigned by posting and hashing"));
    }
    if doc.state != DocumentState::Draft
        && (changes.series_prefix.is_some() || changes.doc_type.is_some() || changes.company.is_some())
    {
        return Err(invalid("a posted document cannot move to another chain"));
    }
    match changes.state {
        Some(state) if state == doc.state => Ok(()),
        Some(DocumentState::Cancelled) => Ok(()),
        Some(DocumentState::Posted) if doc.state == DocumentState::Draft => {
            Err(invalid("drafts are posted through post"))
        }
        Some(_) => Err(invalid("document cannot return to an earlier state")),
        None => Ok(()),
    }
}

fn cached_codes(doc: &Document) -> Option<RenderedCodes> {
    Some(RenderedCodes {
        hash: doc.hash.clone()?,
        short_code: doc.short_code.clone()?,
        sequence_code: doc.sequence_code.clone()?,
        qr_payload: doc.qr_payload.clone()?,
    })
}
