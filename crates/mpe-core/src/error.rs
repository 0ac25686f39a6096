use thiserror::Error;

pub type MpeResult<T> = Result<T, MpeError>;

#[derive(Debug, Error)]
pub enum MpeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid size string '{input}': {reason}")]
    Size { input: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification shared by every error type in the workspace.
///
/// Callers use it to decide whether a failure is reported per item
/// (`Validation`, `NotFound`, `Integrity`) or needs an operator
/// (`ResourceExhaustion`, `Config`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed filename, key material, or search term.
    Validation,
    /// Missing key file or batch directory.
    NotFound,
    /// Padding check failed: wrong key, wrong IV, or corrupted ciphertext.
    Integrity,
    /// Fingerprint collision retry bound exceeded.
    ResourceExhaustion,
    Io,
    Config,
}

impl MpeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MpeError::Config(_) | MpeError::Size { .. } => ErrorClass::Config,
            MpeError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorClass::NotFound,
            MpeError::Io(_) => ErrorClass::Io,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Integrity => "integrity",
            ErrorClass::ResourceExhaustion => "resource_exhaustion",
            ErrorClass::Io => "io",
            ErrorClass::Config => "config",
        };
        f.write_str(s)
    }
}
