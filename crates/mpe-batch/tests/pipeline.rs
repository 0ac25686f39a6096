//! Integration tests: upload request -> ready queue -> claim -> decrypt -> terminal directory.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};

use chrono::{DateTime, FixedOffset};
use tempfile::TempDir;
use tracing::Span;

use mpe_batch::{
    claim, ingest, BatchProcessor, ClaimOutcome, Disposition, FailureManifest, IngestOutcome,
    UploadPart,
};
use mpe_core::Layout;
use mpe_crypto::{EnrollmentKey, KeyStore};

struct Fixture {
    _tmp: TempDir,
    layout: Layout,
    keys: KeyStore,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path().join("pipeline"));
        layout.ensure().unwrap();
        let keys = KeyStore::new(tmp.path().join("keys"));
        Self {
            _tmp: tmp,
            layout,
            keys,
        }
    }

    fn processor(&self) -> BatchProcessor {
        BatchProcessor::new(self.layout.clone(), self.keys.clone(), 1024, Span::none())
    }
}

fn ts(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).unwrap()
}

/// An upload part encrypted the way a device would produce it.
fn encrypted_part(key: &EnrollmentKey, created_at: &str, data_type: &str, ext: &str, plain: &[u8]) -> UploadPart {
    let (ciphertext, iv) = mpe_crypto::encrypt(key, plain);
    let name = mpe_crypto::encode(&key.fingerprint(), &ts(created_at), data_type, &iv, ext).unwrap();
    UploadPart::new(name, ciphertext)
}

fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn two_valid_one_invalid() {
    let fx = Fixture::new();
    let key = fx.keys.generate_and_persist().unwrap();

    let parts = vec![
        encrypted_part(&key, "2025-09-20T09:25:42-05:00", "image", "png", b"png bytes"),
        encrypted_part(&key, "2025-09-20T09:26:00-05:00", "data", "csv", b"a,b\n1,2\n"),
        UploadPart::new("invalid.png", b"whatever".to_vec()),
    ];
    let report = ingest(&fx.layout, &parts, 1 << 20, Span::none()).unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.outcome(), IngestOutcome::Partial);
    assert_eq!(report.message(), "2 files uploaded successfully, 1 error");
    assert_eq!(report.failures[0].filename, "invalid.png");
    assert!(report.failures[0].to_string().contains("invalid.png"));

    // The rejected file never reached disk.
    let batch = report.batch.unwrap();
    assert_eq!(count_entries(&fx.layout.ready().join(&batch)), 2);
    assert!(report.files.iter().all(|f| f.path().starts_with(fx.layout.ready())));
    assert_eq!(count_entries(&fx.layout.incoming()), 0);
}

#[test]
fn utc_and_east_of_utc_offsets_are_accepted() {
    let fx = Fixture::new();
    let key = fx.keys.generate_and_persist().unwrap();

    let parts = vec![
        encrypted_part(&key, "2025-09-20T09:25:42+00:00", "image", "png", b"utc"),
        encrypted_part(&key, "2025-09-20T09:25:42+05:30", "data", "csv", b"ist"),
        encrypted_part(&key, "2025-09-20T09:25:42-05:00", "text", "txt", b"cdt"),
    ];
    let report = ingest(&fx.layout, &parts, 1 << 20, Span::none()).unwrap();

    assert_eq!(report.outcome(), IngestOutcome::Success, "{:?}", report.failures);
    assert_eq!(report.succeeded(), 3);
    let names: Vec<String> = report
        .files
        .iter()
        .map(|f| f.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.contains("T092542+0000_image_")));
    assert!(names.iter().any(|n| n.contains("T092542+0530_data_")));

    let summaries = fx.processor().sweep_ready().unwrap();
    assert_eq!(summaries[0].decrypted, 3);
    assert!(summaries[0].is_processed());
}

#[test]
fn empty_upload_creates_nothing() {
    let fx = Fixture::new();
    let report = ingest(&fx.layout, &[], 1 << 20, Span::none()).unwrap();

    assert_eq!(report.outcome(), IngestOutcome::Empty);
    assert_eq!(report.message(), "No files provided");
    assert!(report.batch.is_none());
    assert_eq!(count_entries(&fx.layout.incoming()), 0);
    assert_eq!(count_entries(&fx.layout.ready()), 0);
}

#[test]
fn all_rejected_is_not_queued() {
    let fx = Fixture::new();
    let parts = vec![
        UploadPart::new("invalid.png", b"x".to_vec()),
        UploadPart::new("../..", b"y".to_vec()),
    ];
    let report = ingest(&fx.layout, &parts, 1 << 20, Span::none()).unwrap();

    assert_eq!(report.outcome(), IngestOutcome::Failed);
    assert_eq!(report.message(), "0 files uploaded, 2 errors");
    assert!(report.batch.is_none());
    assert_eq!(count_entries(&fx.layout.incoming()), 0);
    assert_eq!(count_entries(&fx.layout.ready()), 0);
}

#[test]
fn concurrent_claims_have_one_winner() {
    for round in 0..20 {
        let fx = Fixture::new();
        let name = format!("batch-race-{round}");
        fs::create_dir_all(fx.layout.ready().join(&name)).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let layout = fx.layout.clone();
                let barrier = barrier.clone();
                let name = name.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    claim(&layout, &name).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(winners, 1, "round {round}: {outcomes:?}");
        assert!(outcomes.contains(&ClaimOutcome::AlreadyClaimed));
    }
}

#[test]
fn end_to_end_decrypt_into_processed_layout() {
    let fx = Fixture::new();
    let key = fx.keys.generate_and_persist().unwrap();
    let fp = key.fingerprint();
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let parts = vec![
        encrypted_part(&key, "2025-09-20T09:25:42-05:00", "image", "png", b"tiny"),
        encrypted_part(&key, "2025-09-21T23:59:59+02:00", "data", "bin", &big),
    ];
    let batch = ingest(&fx.layout, &parts, 1 << 20, Span::none()).unwrap().batch.unwrap();

    let summaries = fx.processor().sweep_ready().unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.decrypted, 2);
    assert!(summary.errors.is_empty());

    let out = fx.layout.processed().join(&batch);
    assert_eq!(summary.disposition, Disposition::Processed(out.clone()));

    let image = out
        .join(fp.as_str())
        .join("2025-09-20/image")
        .join(format!("{fp}_2025-09-20T092542-0500_image.png"));
    assert_eq!(fs::read(image).unwrap(), b"tiny");

    let data = out
        .join(fp.as_str())
        .join("2025-09-21/data")
        .join(format!("{fp}_2025-09-21T235959+0200_data.bin"));
    assert_eq!(fs::read(data).unwrap(), big);

    // Nothing left behind in the pipeline.
    assert_eq!(count_entries(&fx.layout.ready()), 0);
    assert_eq!(count_entries(&fx.layout.processing_in()), 0);
    assert_eq!(count_entries(&fx.layout.processing_out()), 0);
}

#[test]
fn missing_key_fails_only_that_file_and_routes_batch_to_failed() {
    let fx = Fixture::new();
    let known = fx.keys.generate_and_persist().unwrap();
    let unknown = EnrollmentKey::generate();

    let parts = vec![
        encrypted_part(&known, "2025-09-20T09:25:42-05:00", "image", "png", b"ok"),
        encrypted_part(&unknown, "2025-09-20T09:25:43-05:00", "image", "png", b"orphan"),
    ];
    let batch = ingest(&fx.layout, &parts, 1 << 20, Span::none()).unwrap().batch.unwrap();

    let summary = fx.processor().run_batch(&batch).unwrap().unwrap();
    assert_eq!(summary.decrypted, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].class, "not_found");
    assert!(summary.errors[0].file.starts_with(unknown.fingerprint().as_str()));

    let failed = fx.layout.failed().join(&batch);
    assert_eq!(summary.disposition, Disposition::Failed(failed.clone()));
    assert_eq!(count_entries(&failed.join("in")), 2);
    assert!(failed.join("out").join(known.fingerprint().as_str()).is_dir());

    let manifest: FailureManifest = serde_json::from_slice(
        &fs::read(fx.layout.failed().join(format!("{batch}.failure.json"))).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest.decrypted, 1);
    assert_eq!(manifest.failed, 1);
    assert_eq!(manifest.moved, vec!["in", "out"]);

    assert_eq!(count_entries(&fx.layout.processing_in()), 0);
    assert_eq!(count_entries(&fx.layout.processing_out()), 0);
}

#[test]
fn files_sharing_an_output_name_do_not_overwrite_each_other() {
    let fx = Fixture::new();
    let key = fx.keys.generate_and_persist().unwrap();
    let fp = key.fingerprint();

    // Same fingerprint, timestamp, type and extension: only the IV differs,
    // so both map to one IV-free output name.
    let parts = vec![
        encrypted_part(&key, "2025-09-20T09:25:42-05:00", "image", "png", b"first frame"),
        encrypted_part(&key, "2025-09-20T09:25:42-05:00", "image", "png", b"second frame"),
    ];
    let report = ingest(&fx.layout, &parts, 1 << 20, Span::none()).unwrap();
    assert_eq!(report.succeeded(), 2);
    let batch = report.batch.unwrap();

    let summary = fx.processor().run_batch(&batch).unwrap().unwrap();
    assert_eq!(summary.decrypted, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].class, "validation");
    assert!(summary.errors[0].reason.contains("overwrite"), "{}", summary.errors[0].reason);

    let failed = fx.layout.failed().join(&batch);
    assert_eq!(summary.disposition, Disposition::Failed(failed.clone()));
    assert_eq!(count_entries(&failed.join("in")), 2);

    let out_dir = failed.join("out").join(fp.as_str()).join("2025-09-20/image");
    assert_eq!(count_entries(&out_dir), 1);
    let kept = fs::read(out_dir.join(format!("{fp}_2025-09-20T092542-0500_image.png"))).unwrap();
    assert!(kept == b"first frame" || kept == b"second frame");
    assert_eq!(count_entries(&fx.layout.processed()), 0);
}

#[test]
fn wrong_key_is_integrity_failure() {
    let fx = Fixture::new();
    let key = fx.keys.generate_and_persist().unwrap();

    // Bytes encrypted under another key but named for `key`. A wrong key
    // occasionally decrypts to valid-looking padding, so pick a ciphertext
    // that `key` demonstrably rejects.
    let scratch = fx.layout.root().join("scratch.bin");
    let (ciphertext, iv) = loop {
        let (ciphertext, iv) = mpe_crypto::encrypt(&EnrollmentKey::generate(), &[7u8; 64]);
        fs::write(&scratch, &ciphertext).unwrap();
        if mpe_crypto::decrypt(&key, &iv, &scratch, 1024).is_err() {
            break (ciphertext, iv);
        }
    };
    let name = mpe_crypto::encode(&key.fingerprint(), &ts("2025-09-20T09:25:42Z"), "data", &iv, "bin").unwrap();
    let dir = fx.layout.ready().join("batch-wrong-key");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(&name), ciphertext).unwrap();

    let summary = fx.processor().run_batch("batch-wrong-key").unwrap().unwrap();
    assert!(!summary.is_processed());
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].class, "integrity");
}

#[test]
fn stray_files_in_ready_batch_are_per_file_failures() {
    let fx = Fixture::new();
    let dir = fx.layout.ready().join("batch-stray");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("notes.txt"), b"hello").unwrap();
    fs::write(dir.join("deadbeef_1695200000_image.png"), b"legacy").unwrap();

    let summary = fx.processor().run_batch("batch-stray").unwrap().unwrap();
    assert_eq!(summary.errors.len(), 2);
    assert!(summary.errors.iter().all(|e| e.class == "validation"));
    assert!(!summary.is_processed());
}

#[test]
fn second_run_of_claimed_batch_is_noop() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.layout.ready().join("batch-once")).unwrap();
    let p = fx.processor();

    assert!(p.run_batch("batch-once").unwrap().is_some());
    assert!(p.run_batch("batch-once").unwrap().is_none());
}

#[test]
fn stale_processing_batch_moves_to_failed() {
    let fx = Fixture::new();
    let stuck = fx.layout.processing_in().join("batch-stuck");
    fs::create_dir_all(&stuck).unwrap();
    fs::write(stuck.join("f.bin"), b"x").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let moved = fx
        .processor()
        .sweep_stale(std::time::Duration::from_millis(1), &HashSet::new())
        .unwrap();
    assert_eq!(moved, vec!["batch-stuck"]);
    assert!(fx.layout.failed().join("batch-stuck/in/f.bin").is_file());

    let manifest: FailureManifest = serde_json::from_slice(
        &fs::read(fx.layout.failed().join("batch-stuck.failure.json")).unwrap(),
    )
    .unwrap();
    assert!(manifest.reason.starts_with("stale"));
}
