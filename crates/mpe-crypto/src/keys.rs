//! Enrollment keys and the on-disk key store
//!
//! Store layout: one `{fingerprint}.key` file per key, holding the key as 64
//! lowercase hex characters. Files are created once with `O_EXCL` and never
//! rewritten or deleted.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{FINGERPRINT_LEN, KEY_SIZE};

/// Generation attempts before a fingerprint collision is treated as fatal.
pub const MAX_GENERATION_ATTEMPTS: usize = 100;

/// A 256-bit enrollment key. This is the AES-256 key itself. Zeroized on drop.
#[derive(Clone)]
pub struct EnrollmentKey {
    bytes: [u8; KEY_SIZE],
}

impl EnrollmentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generate a random key from the OS CSPRNG. No side effects.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Parse 64 hex characters (surrounding whitespace and case are ignored).
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let s = s.trim();
        if s.len() != KEY_SIZE * 2 {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                KEY_SIZE * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("not hexadecimal: {e}")))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Lowercase hex, the on-disk representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.bytes)
    }
}

impl Drop for EnrollmentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EnrollmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentKey")
            .field("fingerprint", &self.fingerprint())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// First 8 hex characters of SHA-256 over raw key bytes. Always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(key_bytes: &[u8]) -> Self {
        let digest = Sha256::digest(key_bytes);
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        Fingerprint(hex)
    }

    /// Accepts 8 hex characters in any case and normalizes to lowercase.
    pub fn parse(s: &str) -> CryptoResult<Self> {
        if s.len() == FINGERPRINT_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Fingerprint(s.to_ascii_lowercase()))
        } else {
            Err(CryptoError::InvalidFingerprint(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::parse(s)
    }
}

/// Directory of `{fingerprint}.key` files.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!("{fingerprint}.key"))
    }

    /// Generate a key and persist it under its fingerprint.
    ///
    /// The key file is created exclusively, so concurrent generators never
    /// clobber each other; an existing fingerprint triggers a fresh key.
    pub fn generate_and_persist(&self) -> CryptoResult<EnrollmentKey> {
        self.persist_with(EnrollmentKey::generate)
    }

    pub(crate) fn persist_with<F>(&self, mut next_key: F) -> CryptoResult<EnrollmentKey>
    where
        F: FnMut() -> EnrollmentKey,
    {
        std::fs::create_dir_all(&self.root)?;

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let key = next_key();
            let fingerprint = key.fingerprint();
            let path = self.key_path(&fingerprint);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    warn!(%fingerprint, attempt, "fingerprint already in store, regenerating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = file.write_all(key.to_hex().as_bytes()).and_then(|_| file.sync_all()) {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }

            info!(%fingerprint, "enrollment key created");
            return Ok(key);
        }

        Err(CryptoError::KeyExhausted {
            store: self.root.clone(),
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }

    /// Load the key stored under `fingerprint`.
    pub fn load(&self, fingerprint: &Fingerprint) -> CryptoResult<EnrollmentKey> {
        let path = self.key_path(fingerprint);
        debug!(path = %path.display(), "reading enrollment key");
        self.read_key_file(&path, fingerprint.as_str())
    }

    /// Resolve an operator-supplied search term: a fingerprint or a full key.
    ///
    /// The term is lowercased and stripped of every non-hex character. A
    /// direct `{term}.key` lookup is tried first; on a miss the term is taken
    /// as a full key and looked up by its fingerprint.
    pub fn resolve(&self, term: &str) -> CryptoResult<EnrollmentKey> {
        let filtered: String = term
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect();
        if filtered.is_empty() {
            return Err(CryptoError::InvalidSearchTerm(term.to_string()));
        }

        let candidate = contained_path(&self.root, &format!("{filtered}.key"))?;
        debug!(candidate = %candidate.display(), "resolving enrollment key");
        if candidate.is_file() {
            return self.read_key_file(&candidate, &filtered);
        }

        if filtered.len() == KEY_SIZE * 2 {
            let wanted = EnrollmentKey::from_hex(&filtered)?;
            let fingerprint = wanted.fingerprint();
            let found = self.load(&fingerprint)?;
            if found.as_bytes() != wanted.as_bytes() {
                return Err(CryptoError::KeyNotFound {
                    path: self.key_path(&fingerprint),
                    fingerprint: fingerprint.to_string(),
                });
            }
            return Ok(found);
        }

        if filtered.len() == FINGERPRINT_LEN {
            return Err(CryptoError::KeyNotFound {
                fingerprint: filtered,
                path: candidate,
            });
        }
        Err(CryptoError::InvalidSearchTerm(term.to_string()))
    }

    /// Fingerprints of every key file in the store, sorted.
    pub fn list(&self) -> CryptoResult<Vec<Fingerprint>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("key") {
                continue;
            }
            if let Some(fp) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Fingerprint::parse(s).ok())
            {
                out.push(fp);
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_key_file(&self, path: &Path, fingerprint: &str) -> CryptoResult<EnrollmentKey> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CryptoError::KeyNotFound {
                    fingerprint: fingerprint.to_string(),
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let key = EnrollmentKey::from_hex(&text.trim().to_ascii_lowercase()).map_err(|e| {
            CryptoError::InvalidKey(format!("{}: {e}", path.display()))
        })?;

        if key.fingerprint().as_str() != fingerprint {
            warn!(
                path = %path.display(),
                actual = %key.fingerprint(),
                "key file name does not match its key's fingerprint"
            );
        }
        Ok(key)
    }
}

/// Join `file_name` onto `root`, refusing anything that would leave `root`.
fn contained_path(root: &Path, file_name: &str) -> CryptoResult<PathBuf> {
    let candidate = root.join(file_name);
    let mut components = Path::new(file_name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || candidate.parent() != Some(root) {
        return Err(CryptoError::PathEscape(candidate));
    }
    Ok(candidate)
}
