//! Property-based tests for chain hashing, verification and the guard
//!
//! Each case opens its own sled database and signs with a real RSA key, so
//! case counts are kept small. The properties are the ones a chain must hold
//! no matter how many documents it carries or which amounts and dates they use.

use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

use document_chain::{
    Amount, ChainConfig, ChainError, ChangeSet, DocumentDraft, DocumentId, DocumentService,
    DocumentType, HashedField, IssueDate, KeyConfigProvider, Session, TimeStamp, VerificationStatus,
    serializer,
    session::ManualClock,
    store::DocumentStore,
};

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

// These property tests cover:
//
// 1. Determinism of serialize then sign
// 2. Chain linkage - verify fails exactly at a tampered document
// 3. Immutability of every hash-covered field after hashing
// 4. Idempotence of ensure_hashed
// 5. Ordering - hashing a document hashes everything before it, in order
// 6. Lazy cost - one signature per unhashed document up to the target

fn service(dir: &std::path::Path) -> DocumentService {
    let config = ChainConfig::from_toml_str(&format!(
        r#"
        active_version = 1
        issuer_tax_id = "507477758"

        [[keys]]
        version = 1
        pem_path = "{FIXTURES}/signing_key_v1.pem"
        "#
    ))
    .unwrap();
    let db = sled::open(dir.join("chain.db")).unwrap();
    let store = DocumentStore::open(Arc::new(db)).unwrap();
    let clock = Arc::new(ManualClock::new(TimeStamp::new_with(2017, 9, 16, 10, 0, 0).unwrap()));
    let session = Session::new(store, Arc::new(KeyConfigProvider::from_config(config))).with_clock(clock);
    DocumentService::new(Arc::new(session))
}

/// Amounts in cents, positive or negative
fn amount_strategy() -> impl Strategy<Value = Amount> {
    (-10_000_000i64..10_000_000i64).prop_map(|cents| Amount::new(rust_decimal::Decimal::new(cents, 2)))
}

fn date_strategy() -> impl Strategy<Value = IssueDate> {
    (2000i32..2030, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| IssueDate::from_ymd(y, m, d).unwrap())
}

fn chain_strategy() -> impl Strategy<Value = Vec<(IssueDate, Amount)>> {
    prop::collection::vec((date_strategy(), amount_strategy()), 1..=5)
}

fn post_all(service: &DocumentService, docs: &[(IssueDate, Amount)]) -> Vec<DocumentId> {
    docs.iter()
        .map(|(date, total)| {
            let doc = service
                .create_draft(
                    DocumentDraft::new()
                        .set_company("acme")
                        .set_series("P")
                        .set_doc_type(DocumentType::Invoice)
                        .set_issue_date(*date)
                        .set_total_gross(*total),
                )
                .unwrap();
            service.post_next(doc.id()).unwrap();
            doc.id().clone()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Property: a document with a pinned instant always serializes and signs identically
    #[test]
    fn prop_serialize_and_sign_are_deterministic(docs in chain_strategy()) {
        let dir = tempdir().unwrap();
        let service = service(dir.path());
        let ids = post_all(&service, &docs);
        service.ensure_hashed(ids.last().unwrap()).unwrap();

        let provider = service.session().provider();
        let mut previous = String::new();
        for id in &ids {
            let doc = service.load(id).unwrap();
            let first = provider.sign_active(&serializer::serialize(&doc, &previous).unwrap()).unwrap();
            let second = provider.sign_active(&serializer::serialize(&doc, &previous).unwrap()).unwrap();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(Some(first.as_str()), doc.hash());
            previous = doc.signature().unwrap().unwrap().to_owned();
        }
    }

    /// Property: verify reports the first tampered document and nothing else
    #[test]
    fn prop_tampering_is_found_where_it_happened(
        docs in chain_strategy(),
        pick in any::<prop::sample::Index>(),
        tamper_date in any::<bool>(),
    ) {
        let dir = tempdir().unwrap();
        let service = service(dir.path());
        let ids = post_all(&service, &docs);
        service.ensure_hashed(ids.last().unwrap()).unwrap();

        let clean = service.verify("acme", "P", DocumentType::Invoice).unwrap();
        prop_assert!(clean.is_verified());

        let target = pick.index(ids.len());
        let doc = service.load(&ids[target]).unwrap();
        let changes = if tamper_date {
            let moved = doc.issue_date().naive().succ_opt().unwrap();
            ChangeSet::new().set_issue_date(IssueDate::from(moved))
        } else {
            let bumped = Amount::new(doc.total_gross().value() + rust_decimal::Decimal::new(1, 2));
            ChangeSet::new().set_total_gross(bumped)
        };
        service.session().store().overwrite_unguarded(&ids[target], changes).unwrap();

        let result = service.verify("acme", "P", DocumentType::Invoice).unwrap();
        match result.status {
            VerificationStatus::Corrupted { document_id, .. } => {
                prop_assert_eq!(document_id, ids[target].to_string());
            }
            other => prop_assert!(false, "expected corruption, got {:?}", other),
        }
    }

    /// Property: every hash-covered field is frozen once hashed; descriptive ones are not
    #[test]
    fn prop_hashed_fields_are_immutable(docs in chain_strategy(), narration in "[a-z ]{1,20}") {
        let dir = tempdir().unwrap();
        let service = service(dir.path());
        let ids = post_all(&service, &docs);
        let id = &ids[0];
        service.ensure_hashed(id).unwrap();
        let before = service.load(id).unwrap();

        let attempts = [
            (ChangeSet::new().set_hash("1$QUJD"), None),
            (ChangeSet::new().set_issue_date(IssueDate::from_ymd(2031, 1, 1).unwrap()), Some(HashedField::IssueDate)),
            (ChangeSet::new().set_system_entry_instant(TimeStamp::new()), Some(HashedField::SystemEntryInstant)),
            (ChangeSet::new().set_total_gross(before.total_gross()), Some(HashedField::TotalGross)),
            (ChangeSet::new().set_document_number("FT P/99"), Some(HashedField::DocumentNumber)),
            (ChangeSet::new().set_sequence_number(99), Some(HashedField::SequenceNumber)),
            (ChangeSet::new().set_series("Q"), Some(HashedField::SeriesPrefix)),
            (ChangeSet::new().set_doc_type(DocumentType::Refund), Some(HashedField::DocType)),
            (ChangeSet::new().set_company("other"), Some(HashedField::Company)),
        ];
        for (changes, field) in attempts {
            match (service.update(id, changes), field) {
                (Err(ChainError::ImmutableField(rejected)), Some(field)) => prop_assert_eq!(rejected, field),
                (Err(ChainError::HashAlreadySet), None) => {}
                (other, _) => prop_assert!(false, "unexpected outcome {:?}", other),
            }
        }
        prop_assert_eq!(&service.load(id).unwrap(), &before);

        let updated = service.update(id, ChangeSet::new().set_narration(&narration)).unwrap();
        prop_assert_eq!(updated.narration(), Some(narration.as_str()));
    }

    /// Property: ensure_hashed called repeatedly never changes the stored hash
    #[test]
    fn prop_ensure_hashed_is_idempotent(docs in chain_strategy(), repeats in 2usize..5) {
        let dir = tempdir().unwrap();
        let service = service(dir.path());
        let ids = post_all(&service, &docs);
        let last = ids.last().unwrap();

        let first = service.ensure_hashed(last).unwrap();
        let signed = service.session().provider().signatures_issued();
        for _ in 0..repeats {
            prop_assert_eq!(&service.ensure_hashed(last).unwrap(), &first);
        }
        prop_assert_eq!(service.session().provider().signatures_issued(), signed);
    }

    /// Property: hashing document k hashes exactly documents 0..=k with
    /// non-decreasing instants, costing one signature each
    #[test]
    fn prop_hashing_follows_sequence_order(
        docs in chain_strategy(),
        pick in any::<prop::sample::Index>(),
    ) {
        let dir = tempdir().unwrap();
        let service = service(dir.path());
        let ids = post_all(&service, &docs);
        prop_assert_eq!(service.session().provider().signatures_issued(), 0);

        let target = pick.index(ids.len());
        service.ensure_hashed(&ids[target]).unwrap();
        prop_assert_eq!(service.session().provider().signatures_issued(), target as u64 + 1);

        let stored: Vec<_> = ids.iter().map(|id| service.load(id).unwrap()).collect();
        for (i, doc) in stored.iter().enumerate() {
            prop_assert_eq!(doc.is_hashed(), i <= target);
        }
        let instants: Vec<_> = stored[..=target]
            .iter()
            .map(|d| d.system_entry_instant().unwrap().to_datetime_utc())
            .collect();
        prop_assert!(instants.windows(2).all(|w| w[0] <= w[1]));
    }
}
