//! Claiming a queued batch.
//!
//! The claim is a single `rename(ready/{name}, processing/in/{name})`. Only
//! one caller can move a given source directory, so the rename is the
//! mutual exclusion between orchestrator instances; there is no lock file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use mpe_core::Layout;

use crate::error::{BatchError, BatchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub name: String,
    /// `processing/in/{name}`: the encrypted files.
    pub input: PathBuf,
    /// `processing/out/{name}`: decrypted output being assembled.
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimedBatch),
    /// Someone else moved the batch first, or it vanished. Not an error.
    AlreadyClaimed,
}

/// Try to take ownership of `ready/{name}`.
pub fn claim(layout: &Layout, name: &str) -> BatchResult<ClaimOutcome> {
    check_batch_name(name)?;

    let source = layout.ready().join(name);
    let input = layout.processing_in().join(name);
    let output = layout.processing_out().join(name);
    fs::create_dir_all(layout.processing_in())?;

    match fs::rename(&source, &input) {
        Ok(()) => {}
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::NotFound | ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty
            ) =>
        {
            tracing::debug!(batch = name, error = %e, "claim lost");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        Err(e) => return Err(e.into()),
    }

    fs::create_dir_all(&output)?;
    Ok(ClaimOutcome::Claimed(ClaimedBatch {
        name: name.to_string(),
        input,
        output,
    }))
}

/// Reject anything that is not a single normal path component.
pub fn check_batch_name(name: &str) -> BatchResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(BatchError::InvalidBatchName(name.to_string())),
    }
}

/// The batch a watcher event under the ready root belongs to.
pub fn queued_batch_name(ready_root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(ready_root).ok()?;
    match rel.components().next()? {
        Component::Normal(name) => name.to_str().map(str::to_string),
        _ => None,
    }
}
