use anyhow::Context;
use sled::open;
use std::sync::Arc;
use std::thread;

use document_chain::{
    ChainConfig, ChainError, ChangeSet, DocumentDraft, DocumentService, DocumentState, DocumentType,
    HashedField, IssueDate, KeyConfigProvider, Session, TaxCategory, TimeStamp, VerificationStatus,
    qr, serializer,
    session::ManualClock,
    store::DocumentStore,
};

use tempfile::tempdir; // Use for test db cleanup.

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

fn config(active_version: u32) -> anyhow::Result<ChainConfig> {
    let config = ChainConfig::from_toml_str(&format!(
        r#"
        active_version = {active_version}
        issuer_tax_id = "507477758"
        certification_number = "9999"

        [[keys]]
        version = 1
        pem_path = "{FIXTURES}/signing_key_v1.pem"

        [[keys]]
        version = 2
        pem_path = "{FIXTURES}/signing_key_v2.pem"

        [series_codes]
        "2017" = "JJ37MMMM"
        "#
    ))?;
    Ok(config)
}

fn service_on(db: Arc<sled::Db>, active_version: u32, clock: Arc<ManualClock>) -> anyhow::Result<DocumentService> {
    let store = DocumentStore::open(db)?;
    let provider = KeyConfigProvider::from_config(config(active_version)?);
    let session = Session::new(store, Arc::new(provider)).with_clock(clock);
    Ok(DocumentService::new(Arc::new(session)))
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        TimeStamp::new_with(2017, 9, 16, 10, 0, 0).expect("valid instant"),
    ))
}

fn draft(doc_type: DocumentType, date: &str, total: &str) -> anyhow::Result<DocumentDraft> {
    Ok(DocumentDraft::new()
        .set_company("acme")
        .set_series("2017")
        .set_doc_type(doc_type)
        .set_issue_date(date.parse::<IssueDate>()?)
        .set_total_gross(total.parse()?))
}

/// Posts the three invoices used by most scenarios and hashes the last one.
fn three_invoice_chain(service: &DocumentService) -> anyhow::Result<Vec<document_chain::DocumentId>> {
    let mut ids = Vec::new();
    for (n, (date, total)) in [("2017-03-10", "28.07"), ("2017-09-16", "235.15"), ("2017-09-16", "679.61")]
        .into_iter()
        .enumerate()
    {
        let doc = service.create_draft(draft(DocumentType::Invoice, date, total)?)?;
        service.post(doc.id(), n as u64 + 1)?;
        ids.push(doc.id().clone());
    }
    service.ensure_hashed(&ids[2]).context("Hashing the third invoice: ")?;
    Ok(ids)
}

#[test]
fn three_document_chain_verifies() -> anyhow::Result<()> {
    // Sled locks its files, so every test gets its own database on temp.
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_three_document_chain.db"))?);
    let service = service_on(db, 1, clock())?;

    let ids = three_invoice_chain(&service)?;
    for id in &ids {
        assert!(service.load(id)?.is_hashed());
    }

    let result = service.verify("acme", "2017", DocumentType::Invoice)?;
    match result.status {
        VerificationStatus::Verified {
            first_date,
            last_date,
            first_number,
            last_number,
            ..
        } => {
            assert_eq!(first_date.iso(), "2017-03-10");
            assert_eq!(last_date.iso(), "2017-09-16");
            assert_eq!(first_number, "FT 2017/1");
            assert_eq!(last_number, "FT 2017/3");
        }
        other => panic!("expected verified chain, got {other:?}"),
    }
    assert_eq!(result.documents_checked, 3);

    Ok(())
}

#[test]
fn tampered_issue_date_is_detected() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_corruption.db"))?);
    let service = service_on(db, 1, clock())?;
    let ids = three_invoice_chain(&service)?;

    // bypass the guard the way a direct database edit would
    service.session().store().overwrite_unguarded(
        &ids[1],
        ChangeSet::new().set_issue_date("2022-01-07".parse()?),
    )?;

    let result = service.verify("acme", "2017", DocumentType::Invoice)?;
    match result.status {
        VerificationStatus::Corrupted {
            document_id,
            document_number,
            ..
        } => {
            assert_eq!(document_id, ids[1].to_string());
            assert_eq!(document_number.as_deref(), Some("FT 2017/2"));
        }
        other => panic!("expected corrupted chain, got {other:?}"),
    }

    let report = service.check_integrity("acme")?;
    assert!(!report.is_clean());

    Ok(())
}

#[test]
fn guard_rejects_amount_edit() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_guard.db"))?);
    let service = service_on(db, 1, clock())?;
    let ids = three_invoice_chain(&service)?;
    let before = service.load(&ids[0])?;

    let err = service
        .update(&ids[0], ChangeSet::new().set_total_gross("666.00".parse()?))
        .unwrap_err();
    assert!(matches!(err, ChainError::ImmutableField(HashedField::TotalGross)));
    assert_eq!(service.load(&ids[0])?, before);

    // descriptive fields still evolve
    let updated = service.update(&ids[0], ChangeSet::new().set_narration("settled"))?;
    assert_eq!(updated.narration(), Some("settled"));
    assert_eq!(updated.hash(), before.hash());

    Ok(())
}

#[test]
fn new_type_starts_new_chain() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_new_chain.db"))?);
    let service = service_on(db, 1, clock())?;
    three_invoice_chain(&service)?;

    let refund = service.create_draft(draft(DocumentType::Refund, "2017-09-20", "-28.07")?)?;
    service.post(refund.id(), 1)?;
    let hash = service.ensure_hashed(refund.id())?;

    let refund = service.load(refund.id())?;
    let canonical = serializer::serialize(&refund, "")?;
    assert_eq!(service.session().provider().sign_with(1, &canonical)?, hash);
    assert!(String::from_utf8(canonical)?.ends_with(";-28.07;"));

    let report = service.check_integrity("acme")?;
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.is_verified()));

    Ok(())
}

#[test]
fn hashing_is_lazy() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_lazy.db"))?);
    let clock = clock();
    let service = service_on(db, 1, clock.clone())?;

    let mut ids = Vec::new();
    for total in ["28.07", "235.15", "679.61"] {
        let doc = service.create_draft(
            draft(DocumentType::Invoice, "2017-09-16", total)?
                .add_tax_line(TaxCategory::Normal, total.parse()?, "0.00".parse()?),
        )?;
        service.post_next(doc.id())?;
        ids.push(doc.id().clone());
        clock.advance(5);
    }
    for id in &ids {
        assert!(service.load(id)?.hash().is_none());
    }
    assert_eq!(service.session().provider().signatures_issued(), 0);

    let codes = service.render(&ids[2])?;
    assert_eq!(service.session().provider().signatures_issued(), 3);
    assert_eq!(codes.sequence_code, "JJ37MMMM-3");
    assert!(codes.qr_payload.contains("*G:FT%202017%2F3*H:JJ37MMMM-3*"));

    let docs = ids
        .iter()
        .map(|id| service.load(id))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(
        docs.iter().map(|d| d.sequence_number()).collect::<Vec<_>>(),
        vec![Some(1), Some(2), Some(3)]
    );
    let instants: Vec<_> = docs
        .iter()
        .map(|d| d.system_entry_instant().map(|t| t.to_datetime_utc()))
        .collect::<Option<_>>()
        .context("every document carries an instant")?;
    assert!(instants.windows(2).all(|w| w[0] <= w[1]));

    // cached codes come back without signing again
    assert_eq!(service.render(&ids[2])?, codes);
    assert_eq!(service.session().provider().signatures_issued(), 3);

    Ok(())
}

#[test]
fn short_code_from_known_signature() -> anyhow::Result<()> {
    let code = qr::short_code("1$vfinNfF+rToGp3dWF1LV6mEctQ76hAeZm+PlhBnV4wokN//N")?;
    assert_eq!(code, "vo6e");
    Ok(())
}

#[test]
fn unregistered_series_still_hashes() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_unregistered.db"))?);
    let service = service_on(db, 1, clock())?;

    let doc = service.create_draft(draft(DocumentType::Invoice, "2018-01-02", "10.00")?.set_series("2018"))?;
    service.post(doc.id(), 1)?;

    let err = service.render(doc.id()).unwrap_err();
    assert!(matches!(err, ChainError::SeriesNotRegistered(ref s) if s == "2018"));
    assert!(service.load(doc.id())?.is_hashed());

    Ok(())
}

#[test]
fn cancelled_hashed_document_keeps_its_place() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_cancel.db"))?);
    let service = service_on(db, 1, clock())?;
    let ids = three_invoice_chain(&service)?;

    let cancelled = service.cancel(&ids[1])?;
    assert_eq!(cancelled.state(), DocumentState::Cancelled);
    assert!(cancelled.is_hashed());

    let next = service.create_draft(draft(DocumentType::Invoice, "2017-09-17", "12.00")?)?;
    service.post_next(next.id())?;
    assert_eq!(service.load(next.id())?.sequence_number(), Some(4));
    service.ensure_hashed(next.id())?;

    assert!(service.verify("acme", "2017", DocumentType::Invoice)?.is_verified());

    let audit = service.export_audit_file("acme", "2017-01-01".parse()?, "2017-12-31".parse()?)?;
    assert_eq!(audit.number_of_entries, 4);
    assert_eq!(audit.documents[1].status, "A");
    assert_eq!(audit.total_credit, "719.68");
    assert_eq!(audit.total_debit, "0.00");
    assert!(audit.to_json()?.contains("\"hash_control\": \"1\""));

    Ok(())
}

#[test]
fn posting_below_hashed_sequence_is_rejected() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_out_of_order.db"))?);
    let service = service_on(db, 1, clock())?;
    three_invoice_chain(&service)?;

    let late = service.create_draft(draft(DocumentType::Invoice, "2017-09-16", "1.00")?)?;
    let err = service.post(late.id(), 2).unwrap_err();
    assert!(matches!(
        err,
        ChainError::OutOfOrderPosting {
            sequence_number: 2,
            last_hashed: 3,
            ..
        }
    ));
    assert_eq!(service.load(late.id())?.state(), DocumentState::Draft);

    Ok(())
}

#[test]
fn rotated_key_keeps_old_links_valid() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_rotation.db"))?);
    let clock = clock();
    let first = service_on(db.clone(), 1, clock.clone())?;
    let ids = three_invoice_chain(&first)?;
    drop(first);

    let rotated = service_on(db, 2, clock)?;
    let doc = rotated.create_draft(draft(DocumentType::Invoice, "2017-09-18", "5.00")?)?;
    rotated.post_next(doc.id())?;
    let hash = rotated.ensure_hashed(doc.id())?;

    assert!(hash.starts_with("2$"));
    assert!(rotated.load(&ids[0])?.hash().is_some_and(|h| h.starts_with("1$")));
    assert!(rotated.verify("acme", "2017", DocumentType::Invoice)?.is_verified());

    let history = rotated.verification_history(&rotated.load(doc.id())?.chain_key())?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].key_version, 2);
    assert!(history[0].key_fingerprint.is_some());

    Ok(())
}

#[test]
fn concurrent_callers_share_one_hash() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("test_concurrent.db"))?);
    let service = Arc::new(service_on(db, 1, clock())?);

    let mut ids = Vec::new();
    for n in 1..=5 {
        let doc = service.create_draft(draft(DocumentType::Invoice, "2017-09-16", "10.00")?)?;
        service.post(doc.id(), n)?;
        ids.push(doc.id().clone());
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            let last = ids[4].clone();
            thread::spawn(move || service.ensure_hashed(&last))
        })
        .collect();
    let hashes = handles
        .into_iter()
        .map(|h| h.join().expect("hashing thread panicked"))
        .collect::<Result<Vec<_>, _>>()?;

    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(service.session().provider().signatures_issued(), 5);
    assert!(service.verify("acme", "2017", DocumentType::Invoice)?.is_verified());

    Ok(())
}
