//! mpe-crypto: enrollment keys, filename codec, and the AES-256-CBC file engine
//!
//! Every uploaded file is encrypted on the device with the device's
//! enrollment key and named so that its provenance travels with it:
//!
//! ```text
//! {fingerprint}_{created_at}_{type}_{iv}.{ext}
//!    8 hex       colon-free    token   32 hex
//!                ISO 8601
//! ```
//!
//! The enrollment key IS the AES-256 key (no KDF). The fingerprint is the
//! first 8 hex characters of SHA-256 over the raw key bytes, and it names the
//! key file in the key store: `{fingerprint}.key`.

pub mod cipher;
pub mod error;
pub mod keys;
pub mod names;

pub use cipher::{decrypt, decrypt_to_path, decrypt_to_writer, encrypt, encrypt_file, Iv};
pub use error::{CryptoError, CryptoResult};
pub use keys::{EnrollmentKey, Fingerprint, KeyStore};
pub use names::{
    decode, decode_legacy, encode, sanitize_type, EncryptedName, LegacyName, NameError, NameField,
};

/// Size of an enrollment key in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// AES block size; also the CBC IV size
pub const BLOCK_SIZE: usize = 16;

/// Size of a CBC initialization vector
pub const IV_SIZE: usize = BLOCK_SIZE;

/// Hex characters of SHA-256 kept as the key fingerprint
pub const FINGERPRINT_LEN: usize = 8;

/// Default decryption chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
