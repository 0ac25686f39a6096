//! Decrypting claimed batches and routing them to a terminal directory.
//!
//! ```text
//! ready/{b} --claim--> processing/in/{b} --decrypt--> processing/out/{b}
//!                                                        |
//!                          all files ok: processed/{b} <-+-> failed/{b}/{queued,in,out}
//!                                                            failed/{b}.failure.json
//! ```
//!
//! Per-file failures are collected and never stop the rest of the batch. A
//! batch never stays in `processing/` once [`BatchProcessor::run_batch`]
//! returns.

use std::collections::HashSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Span};

use mpe_core::{ErrorClass, Layout};
use mpe_crypto::KeyStore;

use crate::claim::{claim, ClaimOutcome, ClaimedBatch};
use crate::error::{BatchError, BatchResult};
use crate::file::EncryptedFile;

/// One file that could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub file: String,
    pub class: String,
    pub reason: String,
}

impl FileError {
    fn new(file: &Path, class: ErrorClass, reason: impl std::fmt::Display) -> Self {
        Self {
            file: file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            class: class.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Written next to a failed batch as `failed/{batch}.failure.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureManifest {
    pub batch: String,
    pub reason: String,
    pub failed_at: String,
    pub decrypted: usize,
    pub failed: usize,
    pub errors: Vec<FileError>,
    /// Which pipeline locations were found and moved (`queued`, `in`, `out`).
    pub moved: Vec<String>,
}

/// Result of decrypting the files of one claimed batch.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub decrypted: usize,
    pub errors: Vec<FileError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Processed(PathBuf),
    Failed(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub name: String,
    pub decrypted: usize,
    pub errors: Vec<FileError>,
    pub disposition: Disposition,
}

impl BatchSummary {
    pub fn is_processed(&self) -> bool {
        matches!(self.disposition, Disposition::Processed(_))
    }
}

pub struct BatchProcessor {
    layout: Layout,
    keys: KeyStore,
    chunk_size: usize,
    span: Span,
}

impl BatchProcessor {
    pub fn new(layout: Layout, keys: KeyStore, chunk_size: usize, span: Span) -> Self {
        Self {
            layout,
            keys,
            chunk_size,
            span,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Names of batches waiting in `ready/`, oldest name first.
    pub fn pending(&self) -> BatchResult<Vec<String>> {
        list_dir_names(&self.layout.ready())
    }

    /// Claim, decrypt and finalize one queued batch.
    ///
    /// Returns `Ok(None)` when another claimer got there first. Once the
    /// claim succeeds the batch ends up in `processed/` or `failed/`.
    pub fn run_batch(&self, name: &str) -> BatchResult<Option<BatchSummary>> {
        let claimed = match claim(&self.layout, name)? {
            ClaimOutcome::Claimed(c) => c,
            ClaimOutcome::AlreadyClaimed => {
                debug!(parent: &self.span, batch = name, "already claimed");
                return Ok(None);
            }
        };
        info!(parent: &self.span, batch = name, "claimed");

        let report = match self.process_claimed(&claimed) {
            Ok(r) => r,
            Err(e) => {
                error!(parent: &self.span, batch = name, error = %e, "batch processing failed");
                let dest = self.move_to_failed(name, &format!("processing error: {e}"), &ProcessReport::default())?;
                return Ok(Some(BatchSummary {
                    name: name.to_string(),
                    decrypted: 0,
                    errors: Vec::new(),
                    disposition: Disposition::Failed(dest),
                }));
            }
        };

        match self.finalize(&claimed, &report) {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                error!(parent: &self.span, batch = name, error = %e, "finalize failed");
                let dest = self.move_to_failed(name, &format!("finalize error: {e}"), &report)?;
                Ok(Some(BatchSummary {
                    name: name.to_string(),
                    decrypted: report.decrypted,
                    errors: report.errors,
                    disposition: Disposition::Failed(dest),
                }))
            }
        }
    }

    /// Decrypt every file of a claimed batch into its output directory.
    ///
    /// Only a failure to list the input directory is an error; everything
    /// per file is collected into the report.
    pub fn process_claimed(&self, claimed: &ClaimedBatch) -> BatchResult<ProcessReport> {
        if !claimed.input.is_dir() {
            return Err(BatchError::BatchNotFound(claimed.input.clone()));
        }

        let mut report = ProcessReport::default();
        let mut entries: Vec<PathBuf> = fs::read_dir(&claimed.input)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();

        for path in entries {
            if !path.is_file() {
                warn!(parent: &self.span, batch = %claimed.name, path = %path.display(), "skipping non-file entry");
                continue;
            }
            match self.decrypt_one(&path, &claimed.output) {
                Ok(dst) => {
                    debug!(parent: &self.span, batch = %claimed.name, src = %path.display(), dst = %dst.display(), "decrypted");
                    report.decrypted += 1;
                }
                Err(e) => {
                    warn!(parent: &self.span, batch = %claimed.name, file = %path.display(), error = %e, "file failed");
                    report.errors.push(FileError::new(&path, e.class(), &e));
                }
            }
        }
        Ok(report)
    }

    fn decrypt_one(&self, src: &Path, out_root: &Path) -> BatchResult<PathBuf> {
        let file = EncryptedFile::from_path(src)?;
        let key = self.keys.load(file.fingerprint())?;
        let dst = out_root.join(file.output_relative_path());
        mpe_crypto::decrypt_to_path(&key, &file.name().iv, src, &dst, self.chunk_size)?;
        Ok(dst)
    }

    /// Move a processed batch to its terminal directory.
    pub fn finalize(&self, claimed: &ClaimedBatch, report: &ProcessReport) -> BatchResult<BatchSummary> {
        if !report.errors.is_empty() {
            let reason = format!("{} of {} files failed", report.errors.len(), report.errors.len() + report.decrypted);
            let dest = self.move_to_failed(&claimed.name, &reason, report)?;
            return Ok(BatchSummary {
                name: claimed.name.clone(),
                decrypted: report.decrypted,
                errors: report.errors.clone(),
                disposition: Disposition::Failed(dest),
            });
        }

        let dest = self.layout.processed().join(&claimed.name);
        fs::create_dir_all(self.layout.processed())?;
        fs::rename(&claimed.output, &dest)?;
        fs::remove_dir_all(&claimed.input)?;

        info!(parent: &self.span, batch = %claimed.name, files = report.decrypted, "batch processed");
        Ok(BatchSummary {
            name: claimed.name.clone(),
            decrypted: report.decrypted,
            errors: Vec::new(),
            disposition: Disposition::Processed(dest),
        })
    }

    /// Move whatever exists of a batch under `failed/{name}/` and write its
    /// failure manifest. Locations are checked in claim order.
    pub fn move_to_failed(&self, name: &str, reason: &str, report: &ProcessReport) -> BatchResult<PathBuf> {
        crate::claim::check_batch_name(name)?;

        let dest = self.layout.failed().join(name);
        fs::create_dir_all(&dest)?;

        let mut moved = Vec::new();
        for (label, src) in [
            ("queued", self.layout.ready().join(name)),
            ("in", self.layout.processing_in().join(name)),
            ("out", self.layout.processing_out().join(name)),
        ] {
            if !src.exists() {
                continue;
            }
            let target = unique_path(&dest.join(label));
            fs::rename(&src, &target)?;
            moved.push(label.to_string());
        }

        let manifest = FailureManifest {
            batch: name.to_string(),
            reason: reason.to_string(),
            failed_at: chrono::Utc::now().to_rfc3339(),
            decrypted: report.decrypted,
            failed: report.errors.len(),
            errors: report.errors.clone(),
            moved,
        };
        let manifest_path = self.layout.failed().join(format!("{name}.failure.json"));
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

        warn!(parent: &self.span, batch = name, reason, dest = %dest.display(), "batch moved to failed");
        Ok(dest)
    }

    /// Process every batch currently in `ready/`.
    ///
    /// A batch that errors or panics is routed to `failed/` and the sweep
    /// moves on to the next one.
    pub fn sweep_ready(&self) -> BatchResult<Vec<BatchSummary>> {
        let mut summaries = Vec::new();
        for name in self.pending()? {
            match panic::catch_unwind(AssertUnwindSafe(|| self.run_batch(&name))) {
                Ok(Ok(Some(summary))) => summaries.push(summary),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!(parent: &self.span, batch = %name, error = %e, "batch errored");
                    self.fail_after_error(&name, &format!("error: {e}"));
                }
                Err(_) => {
                    error!(parent: &self.span, batch = %name, "batch panicked");
                    self.fail_after_error(&name, "panic during processing");
                }
            }
        }
        Ok(summaries)
    }

    /// Route a batch to `failed/` after an unexpected error, but only if it
    /// was already claimed. An unclaimed batch stays queued for the next sweep.
    pub fn fail_after_error(&self, name: &str, reason: &str) {
        let claimed = [self.layout.processing_in(), self.layout.processing_out()]
            .iter()
            .any(|dir| dir.join(name).exists());
        if !claimed {
            return;
        }
        if let Err(e) = self.move_to_failed(name, reason, &ProcessReport::default()) {
            error!(parent: &self.span, batch = name, error = %e, "could not move batch to failed");
        }
    }

    /// Move batches stuck in `processing/` for longer than `max_age` to
    /// `failed/`. Batches named in `busy` are being worked on and are skipped.
    ///
    /// The age of a batch is that of its most recently modified location, so
    /// a batch whose output is still being written is never stale.
    pub fn sweep_stale(&self, max_age: Duration, busy: &HashSet<String>) -> BatchResult<Vec<String>> {
        let now = SystemTime::now();
        let mut names: Vec<String> = list_dir_names(&self.layout.processing_in())?;
        names.extend(list_dir_names(&self.layout.processing_out())?);
        names.sort();
        names.dedup();

        let mut moved = Vec::new();
        for name in names {
            if busy.contains(&name) {
                continue;
            }
            let newest = [self.layout.processing_in(), self.layout.processing_out()]
                .iter()
                .filter_map(|dir| newest_mtime(&dir.join(&name)))
                .max();
            let Some(newest) = newest else { continue };
            let age = now.duration_since(newest).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            let reason = format!("stale: in processing for {}s", age.as_secs());
            self.move_to_failed(&name, &reason, &ProcessReport::default())?;
            moved.push(name);
        }
        if !moved.is_empty() {
            info!(parent: &self.span, count = moved.len(), "stale batches moved to failed");
        }
        Ok(moved)
    }
}

fn list_dir_names(dir: &Path) -> BatchResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Most recent modification time of `path` or anything beneath it.
///
/// Output files land several levels below `out/{batch}`, and writing them
/// does not touch the batch directory's own mtime.
fn newest_mtime(path: &Path) -> Option<SystemTime> {
    let meta = fs::symlink_metadata(path).ok()?;
    let mut newest = meta.modified().ok();
    if meta.is_dir() {
        for entry in fs::read_dir(path).ok()?.flatten() {
            newest = newest.max(newest_mtime(&entry.path()));
        }
    }
    newest
}

/// `path`, or `path.1`, `path.2`, ... if it is already taken.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    (1..)
        .map(|i| PathBuf::from(format!("{}.{i}", path.display())))
        .find(|p| !p.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(root: &Path) -> BatchProcessor {
        let layout = Layout::new(root.join("pipeline"));
        layout.ensure().unwrap();
        BatchProcessor::new(layout, KeyStore::new(root.join("keys")), 4096, Span::none())
    }

    #[test]
    fn test_move_to_failed_collects_every_location() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = processor(tmp.path());
        let layout = p.layout().clone();
        fs::create_dir_all(layout.processing_in().join("batch-x")).unwrap();
        fs::create_dir_all(layout.processing_out().join("batch-x")).unwrap();
        fs::write(layout.processing_in().join("batch-x/a.bin"), b"a").unwrap();

        let report = ProcessReport {
            decrypted: 0,
            errors: vec![FileError {
                file: "a.bin".into(),
                class: "validation".into(),
                reason: "bad name".into(),
            }],
        };
        let dest = p.move_to_failed("batch-x", "1 of 1 files failed", &report).unwrap();

        assert!(dest.join("in/a.bin").is_file());
        assert!(dest.join("out").is_dir());
        assert!(!layout.processing_in().join("batch-x").exists());
        assert!(!layout.processing_out().join("batch-x").exists());

        let manifest: FailureManifest =
            serde_json::from_slice(&fs::read(layout.failed().join("batch-x.failure.json")).unwrap()).unwrap();
        assert_eq!(manifest.reason, "1 of 1 files failed");
        assert_eq!(manifest.failed, 1);
        assert_eq!(manifest.moved, vec!["in", "out"]);
        assert_eq!(manifest.errors[0].file, "a.bin");
    }

    #[test]
    fn test_move_to_failed_from_ready() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = processor(tmp.path());
        fs::create_dir_all(p.layout().ready().join("batch-q")).unwrap();

        let dest = p.move_to_failed("batch-q", "operator", &ProcessReport::default()).unwrap();
        assert!(dest.join("queued").is_dir());
    }

    #[test]
    fn test_empty_batch_is_processed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = processor(tmp.path());
        fs::create_dir_all(p.layout().ready().join("batch-e")).unwrap();

        let summary = p.run_batch("batch-e").unwrap().unwrap();
        assert!(summary.is_processed());
        assert!(p.layout().processed().join("batch-e").is_dir());
        assert!(!p.layout().processing_in().join("batch-e").exists());
    }

    #[test]
    fn test_stale_sweep_respects_age_and_busy() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = processor(tmp.path());
        fs::create_dir_all(p.layout().processing_in().join("batch-old")).unwrap();
        fs::create_dir_all(p.layout().processing_in().join("batch-busy")).unwrap();

        // Nothing is older than an hour.
        let moved = p.sweep_stale(Duration::from_secs(3600), &HashSet::new()).unwrap();
        assert!(moved.is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let busy: HashSet<String> = ["batch-busy".to_string()].into();
        let moved = p.sweep_stale(Duration::from_millis(1), &busy).unwrap();
        assert_eq!(moved, vec!["batch-old"]);
        assert!(p.layout().failed().join("batch-old/in").is_dir());
        assert!(p.layout().processing_in().join("batch-busy").is_dir());
    }

    fn set_mtime(path: &Path, at: SystemTime) {
        let file = fs::File::open(path).unwrap();
        file.set_times(fs::FileTimes::new().set_modified(at)).unwrap();
    }

    #[test]
    fn test_stale_sweep_sees_deep_output_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = processor(tmp.path());
        let input = p.layout().processing_in().join("batch-long");
        let output = p.layout().processing_out().join("batch-long");
        let deep = output.join("8ce4d5e6/2025-09-20/image");
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("latest.png"), b"just written").unwrap();

        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        for dir in [
            input.clone(),
            output.clone(),
            output.join("8ce4d5e6"),
            output.join("8ce4d5e6/2025-09-20"),
            deep.clone(),
        ] {
            set_mtime(&dir, hour_ago);
        }

        // Every directory looks an hour old, but a file deep in the output is fresh.
        let moved = p.sweep_stale(Duration::from_secs(600), &HashSet::new()).unwrap();
        assert!(moved.is_empty());
        assert!(input.is_dir());

        set_mtime(&deep.join("latest.png"), hour_ago);
        let moved = p.sweep_stale(Duration::from_secs(600), &HashSet::new()).unwrap();
        assert_eq!(moved, vec!["batch-long"]);
    }

    #[test]
    fn test_newest_mtime_missing_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(newest_mtime(&tmp.path().join("absent")), None);
    }

    #[test]
    fn test_unique_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("in");
        assert_eq!(unique_path(&a), a);
        fs::create_dir(&a).unwrap();
        assert_eq!(unique_path(&a), tmp.path().join("in.1"));
    }
}
