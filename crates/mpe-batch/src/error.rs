use std::path::PathBuf;
use thiserror::Error;

use mpe_core::ErrorClass;
use mpe_crypto::{CryptoError, NameError};

pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid upload filename '{0}'")]
    InvalidFilename(String),

    #[error("duplicate filename '{0}' in one upload")]
    DuplicateFile(String),

    #[error("request payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("invalid batch name '{0}'")]
    InvalidBatchName(String),

    #[error("batch directory not found: {}", .0.display())]
    BatchNotFound(PathBuf),

    #[error("failure manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BatchError::Name(_)
            | BatchError::InvalidFilename(_)
            | BatchError::DuplicateFile(_)
            | BatchError::PayloadTooLarge { .. }
            | BatchError::InvalidBatchName(_) => ErrorClass::Validation,
            BatchError::BatchNotFound(_) => ErrorClass::NotFound,
            BatchError::Crypto(e) => crypto_class(e),
            BatchError::Manifest(_) => ErrorClass::Io,
            BatchError::Io(e) => io_class(e),
        }
    }
}

fn crypto_class(e: &CryptoError) -> ErrorClass {
    match e {
        CryptoError::InvalidKey(_)
        | CryptoError::InvalidFingerprint(_)
        | CryptoError::InvalidSearchTerm(_)
        | CryptoError::PathEscape(_)
        | CryptoError::OutputExists(_) => ErrorClass::Validation,
        CryptoError::KeyNotFound { .. } => ErrorClass::NotFound,
        CryptoError::KeyExhausted { .. } => ErrorClass::ResourceExhaustion,
        CryptoError::Integrity(_) => ErrorClass::Integrity,
        CryptoError::Io(e) => io_class(e),
    }
}

fn io_class(e: &std::io::Error) -> ErrorClass {
    if e.kind() == std::io::ErrorKind::NotFound {
        ErrorClass::NotFound
    } else {
        ErrorClass::Io
    }
}
