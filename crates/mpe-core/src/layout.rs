//! On-disk layout of the batch pipeline.
//!
//! ```text
//! {root}/incoming/{batch}          staging, written by ingest
//! {root}/ready/{batch}             queued, visible to the orchestrator
//! {root}/processing/in/{batch}     claimed input
//! {root}/processing/out/{batch}    decrypted output being assembled
//! {root}/processed/{batch}         done, ready for upload
//! {root}/failed/{batch}            terminal failure (+ {batch}.failure.json)
//! ```
//!
//! Every directory lives under one root so that each transition is a
//! same-filesystem `rename(2)`.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn incoming(&self) -> PathBuf {
        self.root.join("incoming")
    }

    pub fn ready(&self) -> PathBuf {
        self.root.join("ready")
    }

    pub fn processing_in(&self) -> PathBuf {
        self.root.join("processing").join("in")
    }

    pub fn processing_out(&self) -> PathBuf {
        self.root.join("processing").join("out")
    }

    pub fn processed(&self) -> PathBuf {
        self.root.join("processed")
    }

    pub fn failed(&self) -> PathBuf {
        self.root.join("failed")
    }

    /// Create every pipeline directory. Idempotent.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.incoming(),
            self.ready(),
            self.processing_in(),
            self.processing_out(),
            self.processed(),
            self.failed(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        tracing::debug!(root = %self.root.display(), "pipeline layout ready");
        Ok(())
    }
}
