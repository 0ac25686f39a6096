//! mpe-batch: the directory state machine that carries an upload from
//! request to decrypted output.
//!
//! ```text
//! incoming/{b} --promote--> ready/{b} --claim--> processing/{in,out}/{b}
//!                                                  --> processed/{b}
//!                                                  --> failed/{b}
//! ```
//!
//! Every transition is a `rename(2)` under one root. Components take a
//! `tracing::Span` at construction and log inside it; nothing here installs
//! or touches a global subscriber.

pub mod claim;
pub mod debounce;
pub mod error;
pub mod file;
pub mod ingest;
pub mod processor;

pub use claim::{claim, queued_batch_name, ClaimOutcome, ClaimedBatch};
pub use debounce::Quiescence;
pub use error::{BatchError, BatchResult};
pub use file::{sanitize_filename, EncryptedFile, FileInfo};
pub use ingest::{ingest, Batch, FileFailure, IngestOutcome, IngestReport, UploadPart};
pub use processor::{
    BatchProcessor, BatchSummary, Disposition, FailureManifest, FileError, ProcessReport,
};
