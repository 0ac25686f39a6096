//! Staging and promotion of one upload request.
//!
//! A [`Batch`] owns a uniquely named directory under `incoming/`. Files are
//! validated by name before a single byte is written, so a rejected file
//! never reaches disk. [`Batch::promote`] hands the directory to the
//! orchestrator with one `rename(2)` into `ready/`; after that the batch
//! belongs to the processor.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn, Span};

use mpe_core::Layout;

use crate::error::{BatchError, BatchResult};
use crate::file::{sanitize_filename, EncryptedFile};

/// One file part of an upload request.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub filename: String,
    pub data: Vec<u8>,
}

impl UploadPart {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }
}

/// A rejected file: the name exactly as the client sent it, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub filename: String,
    pub reason: String,
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.filename, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// No file parts in the request; no batch was created.
    Empty,
    Success,
    Partial,
    /// Every file was rejected; nothing was queued.
    Failed,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Name of the queued batch, if one was promoted.
    pub batch: Option<String>,
    pub attempted: usize,
    pub files: Vec<EncryptedFile>,
    pub failures: Vec<FileFailure>,
}

impl IngestReport {
    fn empty() -> Self {
        Self {
            batch: None,
            attempted: 0,
            files: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.files.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn outcome(&self) -> IngestOutcome {
        match (self.attempted, self.succeeded(), self.failed()) {
            (0, _, _) => IngestOutcome::Empty,
            (_, 0, _) => IngestOutcome::Failed,
            (_, _, 0) => IngestOutcome::Success,
            _ => IngestOutcome::Partial,
        }
    }

    /// Operator-facing summary, e.g. `2 files uploaded successfully, 1 error`.
    pub fn message(&self) -> String {
        let files = |n: usize| if n == 1 { "file" } else { "files" };
        let errors = |n: usize| if n == 1 { "error" } else { "errors" };
        let (ok, bad) = (self.succeeded(), self.failed());

        match self.outcome() {
            IngestOutcome::Empty => "No files provided".to_string(),
            IngestOutcome::Success => format!("{ok} {} uploaded successfully", files(ok)),
            IngestOutcome::Failed => format!("0 files uploaded, {bad} {}", errors(bad)),
            IngestOutcome::Partial => format!(
                "{ok} {} uploaded successfully, {bad} {}",
                files(ok),
                errors(bad)
            ),
        }
    }
}

/// One upload transaction being staged under `incoming/`.
pub struct Batch {
    name: String,
    staging: PathBuf,
    ready: PathBuf,
    attempted: usize,
    files: Vec<EncryptedFile>,
    failures: Vec<FileFailure>,
    span: Span,
}

impl Batch {
    /// Allocate a batch name. The directory is created on the first accepted file.
    pub fn new(layout: &Layout, span: Span) -> Self {
        let name = format!("batch-{}", uuid::Uuid::new_v4().simple());
        Self {
            staging: layout.incoming().join(&name),
            ready: layout.ready().join(&name),
            name,
            attempted: 0,
            files: Vec::new(),
            failures: Vec::new(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn files(&self) -> &[EncryptedFile] {
        &self.files
    }

    pub fn failures(&self) -> &[FileFailure] {
        &self.failures
    }

    /// Validate and store one part. Rejections are recorded, not returned:
    /// only I/O failures on the staging directory itself are errors.
    pub fn add(&mut self, part: &UploadPart) -> BatchResult<bool> {
        self.attempted += 1;
        match self.store(part) {
            Ok(file) => {
                debug!(parent: &self.span, file = %file.path().display(), "staged");
                self.files.push(file);
                Ok(true)
            }
            Err(e @ BatchError::Io(_)) => Err(e),
            Err(e) => {
                warn!(parent: &self.span, filename = %part.filename, error = %e, "rejected upload file");
                self.failures.push(FileFailure {
                    filename: part.filename.clone(),
                    reason: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    fn store(&mut self, part: &UploadPart) -> BatchResult<EncryptedFile> {
        let safe = sanitize_filename(&part.filename)
            .ok_or_else(|| BatchError::InvalidFilename(part.filename.clone()))?;
        mpe_crypto::decode(&safe)?;

        fs::create_dir_all(&self.staging)?;
        let dest = self.staging.join(&safe);
        let mut out = match fs::OpenOptions::new().write(true).create_new(true).open(&dest) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BatchError::DuplicateFile(safe));
            }
            Err(e) => return Err(e.into()),
        };
        out.write_all(&part.data)?;
        out.sync_all()?;

        // The record is built from the saved path, not the pre-save name.
        match EncryptedFile::from_path(&dest) {
            Ok(file) => Ok(file),
            Err(e) => {
                fs::remove_file(&dest)?;
                Err(e)
            }
        }
    }

    /// Queue the batch for processing, or discard it if nothing was accepted.
    pub fn promote(self) -> BatchResult<IngestReport> {
        let Batch {
            name,
            staging,
            ready,
            attempted,
            files,
            failures,
            span,
        } = self;
        let mut report = IngestReport {
            batch: None,
            attempted,
            files: Vec::new(),
            failures,
        };

        if files.is_empty() {
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            info!(parent: &span, batch = %name, failed = report.failed(), "nothing accepted, batch discarded");
            return Ok(report);
        }

        if let Some(parent) = ready.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staging, &ready)?;

        report.files = files
            .iter()
            .map(|f| {
                let moved = ready.join(f.path().file_name().unwrap_or_default());
                EncryptedFile::from_path(moved)
            })
            .collect::<BatchResult<_>>()?;
        report.batch = Some(name.clone());

        info!(
            parent: &span,
            batch = %name,
            files = report.succeeded(),
            failed = report.failed(),
            "batch queued"
        );
        Ok(report)
    }
}

/// Run a whole upload request through staging and promotion.
///
/// An empty request never creates a batch; a request larger than
/// `max_bytes` is refused before anything touches disk.
pub fn ingest(
    layout: &Layout,
    parts: &[UploadPart],
    max_bytes: u64,
    span: Span,
) -> BatchResult<IngestReport> {
    if parts.is_empty() {
        return Ok(IngestReport::empty());
    }

    let size: u64 = parts.iter().map(|p| p.data.len() as u64).sum();
    if size > max_bytes {
        return Err(BatchError::PayloadTooLarge {
            size,
            limit: max_bytes,
        });
    }

    let mut batch = Batch::new(layout, span);
    for part in parts {
        if let Err(e) = batch.add(part) {
            // Staging is unusable; do not leave a half-written directory behind.
            let _ = fs::remove_dir_all(batch.staging_path());
            return Err(e);
        }
    }
    batch.promote()
}
