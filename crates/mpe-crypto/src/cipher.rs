//! AES-256-CBC file engine
//!
//! Ciphertext is plain CBC over PKCS#7-padded plaintext; the IV is not stored
//! in the file, it travels in the filename (see [`crate::names`]).
//!
//! Decryption memory-maps the ciphertext and walks it in block-aligned
//! chunks, so peak memory stays at one chunk regardless of file size. The
//! padding is only checked once the final block has been decrypted.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
};
use aes::Aes256;
use memmap2::Mmap;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::EnrollmentKey;
use crate::{BLOCK_SIZE, IV_SIZE};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A 16-byte CBC initialization vector.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iv([u8; IV_SIZE]);

impl Iv {
    /// Fresh IV from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }

    /// Lowercase hex, 32 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; IV_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Iv({})", self.to_hex())
    }
}

impl std::fmt::Display for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Encrypt `plaintext` under a freshly generated IV.
///
/// Returns the ciphertext (always a non-zero multiple of 16 bytes) and the IV
/// that must be carried alongside it.
pub fn encrypt(key: &EnrollmentKey, plaintext: &[u8]) -> (Vec<u8>, Iv) {
    let iv = Iv::random();
    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), iv.as_bytes().into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    (ciphertext, iv)
}

/// Encrypt the file at `src` and write the ciphertext to `dst`.
pub fn encrypt_file(key: &EnrollmentKey, src: &Path, dst: &Path) -> CryptoResult<Iv> {
    let plaintext = fs::read(src)?;
    let (ciphertext, iv) = encrypt(key, &plaintext);
    fs::write(dst, ciphertext)?;
    Ok(iv)
}

/// Decrypt the file at `path` into `out`, `chunk_size` bytes at a time.
///
/// `chunk_size` is rounded down to a whole number of AES blocks (minimum one
/// block). The output is identical for every chunk size. Returns the number
/// of plaintext bytes written.
pub fn decrypt_to_writer<W: Write>(
    key: &EnrollmentKey,
    iv: &Iv,
    path: &Path,
    chunk_size: usize,
    out: &mut W,
) -> CryptoResult<u64> {
    let file = fs::File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Ok(0);
    }
    if len % BLOCK_SIZE != 0 {
        return Err(CryptoError::Integrity(format!(
            "{}: ciphertext length {len} is not a multiple of {BLOCK_SIZE}",
            path.display()
        )));
    }

    // SAFETY: the mapping is read-only and lives only for this call. Files
    // handed to the decryptor sit in a claimed processing directory that no
    // other writer touches.
    let mmap = unsafe { Mmap::map(&file)? };

    let chunk_size = block_aligned(chunk_size);
    let mut decryptor = Aes256CbcDec::new(key.as_bytes().into(), iv.as_bytes().into());
    let mut buf = Vec::with_capacity(chunk_size.min(len));
    let mut written = 0u64;

    let mut chunks = mmap.chunks(chunk_size).peekable();
    while let Some(chunk) = chunks.next() {
        buf.clear();
        buf.extend_from_slice(chunk);
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        let plain = if chunks.peek().is_none() {
            strip_padding(&buf).map_err(|reason| {
                CryptoError::Integrity(format!("{}: {reason}", path.display()))
            })?
        } else {
            &buf[..]
        };
        out.write_all(plain)?;
        written += plain.len() as u64;
    }

    out.flush()?;
    Ok(written)
}

/// Decrypt the file at `path` into memory.
pub fn decrypt(
    key: &EnrollmentKey,
    iv: &Iv,
    path: &Path,
    chunk_size: usize,
) -> CryptoResult<Vec<u8>> {
    let mut out = Vec::new();
    decrypt_to_writer(key, iv, path, chunk_size, &mut out)?;
    Ok(out)
}

/// Decrypt `src` into `dst`.
///
/// Plaintext is staged in a temporary file next to `dst` and only renamed
/// into place once the padding has verified, so a failed decryption never
/// leaves a partial file at `dst`. An existing `dst` is never replaced.
pub fn decrypt_to_path(
    key: &EnrollmentKey,
    iv: &Iv,
    src: &Path,
    dst: &Path,
    chunk_size: usize,
) -> CryptoResult<u64> {
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    let written = {
        let mut writer = std::io::BufWriter::new(staged.as_file_mut());
        decrypt_to_writer(key, iv, src, chunk_size, &mut writer)?
    };
    staged.persist_noclobber(dst).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            CryptoError::OutputExists(dst.to_path_buf())
        } else {
            CryptoError::Io(e.error)
        }
    })?;

    tracing::debug!(
        src = %src.display(),
        dst = %dst.display(),
        bytes = written,
        "decrypted"
    );
    Ok(written)
}

fn block_aligned(chunk_size: usize) -> usize {
    (chunk_size / BLOCK_SIZE * BLOCK_SIZE).max(BLOCK_SIZE)
}

/// Validate and remove PKCS#7 padding from the decrypted tail.
fn strip_padding(tail: &[u8]) -> Result<&[u8], String> {
    let pad = match tail.last() {
        Some(&b) => b as usize,
        None => return Err("empty final block".into()),
    };
    if pad == 0 || pad > BLOCK_SIZE || pad > tail.len() {
        return Err(format!("invalid padding length {pad} (wrong key or corrupt data)"));
    }
    let (plain, padding) = tail.split_at(tail.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err("inconsistent padding bytes (wrong key or corrupt data)".into());
    }
    Ok(plain)
}
