use std::path::PathBuf;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid fingerprint '{0}': expected 8 hex characters")]
    InvalidFingerprint(String),

    #[error("no enrollment key for fingerprint {fingerprint} ({})", path.display())]
    KeyNotFound { fingerprint: String, path: PathBuf },

    #[error("could not generate a unique key in {} after {attempts} attempts", store.display())]
    KeyExhausted { store: PathBuf, attempts: usize },

    #[error("invalid search term '{0}': expected an 8-hex fingerprint or a 64-hex key")]
    InvalidSearchTerm(String),

    #[error("path escapes key store: {}", .0.display())]
    PathEscape(PathBuf),

    #[error("decryption integrity check failed: {0}")]
    Integrity(String),

    #[error("refusing to overwrite existing output {}", .0.display())]
    OutputExists(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
