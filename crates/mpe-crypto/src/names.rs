//! Encrypted filename codec
//!
//! Canonical form, four `_`-separated segments plus an extension:
//!
//! ```text
//! 8ce4d5e6_2025-09-20T092542-0500_image_5ea30e9f40ce2e43d0b66c11c8324b05.png
//! └──┬───┘ └─────────┬──────────┘ └─┬─┘ └──────────────┬───────────────┘ └┬┘
//! fingerprint    created_at        type          iv (16 bytes)          ext
//! ```
//!
//! `created_at` is written in the colon-free ISO 8601 form so the name
//! survives filename sanitation; the extended RFC 3339 form is also read.
//!
//! Legacy devices sent `{id}_{epoch}_{type}.{ext}` with the IV at the start
//! of the file body. Those names are reported as [`NameError::Legacy`] by
//! [`decode`] and parsed only by [`decode_legacy`].
//!
//! Decoding is pure: it never touches the filesystem.

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

use crate::cipher::Iv;
use crate::keys::Fingerprint;
use crate::{FINGERPRINT_LEN, IV_SIZE};

/// Canonical `created_at` format, e.g. `2025-09-20T092542-0500`.
/// `%.f` prints fractional seconds only when they are non-zero.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S%.f%z";

const SEGMENTS: usize = 4;
const LEGACY_SEGMENTS: usize = 3;
const LEGACY_IV_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameField {
    Fingerprint,
    CreatedAt,
    Type,
    Iv,
    Extension,
}

impl std::fmt::Display for NameField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NameField::Fingerprint => "fingerprint",
            NameField::CreatedAt => "created_at",
            NameField::Type => "type",
            NameField::Iv => "iv",
            NameField::Extension => "extension",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("invalid filename '{name}': expected {expected} '_'-separated segments before the extension, found {found}")]
    Segments {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid filename '{name}': legacy name without an IV segment")]
    Legacy { name: String },

    #[error("invalid filename '{name}': bad {field}: {reason}")]
    Field {
        name: String,
        field: NameField,
        reason: String,
    },
}

impl NameError {
    /// The offending field, when a single field failed validation.
    pub fn field(&self) -> Option<NameField> {
        match self {
            NameError::Field { field, .. } => Some(*field),
            _ => None,
        }
    }
}

/// Provenance carried by a canonical encrypted filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedName {
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<FixedOffset>,
    pub data_type: String,
    pub iv: Iv,
    pub extension: String,
}

impl EncryptedName {
    pub fn encode(&self) -> Result<String, NameError> {
        encode(
            &self.fingerprint,
            &self.created_at,
            &self.data_type,
            &self.iv,
            &self.extension,
        )
    }

    /// `created_at` in canonical form.
    pub fn timestamp(&self) -> String {
        format_timestamp(&self.created_at)
    }

    /// Calendar date of `created_at` in its own offset, `YYYY-MM-DD`.
    pub fn date_part(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }

    /// Output name once decrypted: the canonical name without the IV segment.
    pub fn plain_file_name(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.fingerprint,
            self.timestamp(),
            self.data_type,
            self.extension
        )
    }
}

/// A pre-IV filename: `{id}_{epoch}_{type}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyName {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub data_type: String,
    pub extension: String,
}

pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse an offset-aware timestamp in canonical or RFC 3339 form.
pub fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map_err(|e| format!("'{s}' is not an offset-aware ISO 8601 timestamp ({e})"))
}

/// Build a canonical filename. `data_type` must already be a clean token
/// (see [`sanitize_type`]).
pub fn encode(
    fingerprint: &Fingerprint,
    created_at: &DateTime<FixedOffset>,
    data_type: &str,
    iv: &Iv,
    extension: &str,
) -> Result<String, NameError> {
    let name = || format!("{fingerprint}_{}_{data_type}_{}", format_timestamp(created_at), iv.to_hex());
    if let Err(reason) = check_type(data_type) {
        return Err(field_error(&name(), NameField::Type, reason));
    }
    if let Err(reason) = check_extension(extension) {
        return Err(field_error(&name(), NameField::Extension, reason));
    }
    Ok(format!("{}.{extension}", name()))
}

/// Parse a canonical filename into its fields.
pub fn decode(filename: &str) -> Result<EncryptedName, NameError> {
    let (stem, extension) = split_extension(filename);
    let parts: Vec<&str> = stem.split('_').collect();

    if parts.len() == LEGACY_SEGMENTS && is_epoch(parts[1]) {
        return Err(NameError::Legacy {
            name: filename.to_string(),
        });
    }
    if parts.len() != SEGMENTS {
        return Err(NameError::Segments {
            name: filename.to_string(),
            expected: SEGMENTS,
            found: parts.len(),
        });
    }

    let fingerprint = Fingerprint::parse(parts[0]).map_err(|_| {
        field_error(
            filename,
            NameField::Fingerprint,
            format!("'{}' is not {FINGERPRINT_LEN} hex characters", parts[0]),
        )
    })?;

    let created_at = parse_timestamp(parts[1]).map_err(|reason| {
        let reason = if is_epoch(parts[1]) {
            format!("{reason}; numeric epoch timestamps are only valid in legacy names")
        } else {
            reason
        };
        field_error(filename, NameField::CreatedAt, reason)
    })?;

    check_type(parts[2]).map_err(|r| field_error(filename, NameField::Type, r))?;
    let iv = parse_iv(parts[3]).map_err(|r| field_error(filename, NameField::Iv, r))?;
    check_extension(extension).map_err(|r| field_error(filename, NameField::Extension, r))?;

    Ok(EncryptedName {
        fingerprint,
        created_at,
        data_type: parts[2].to_string(),
        iv,
        extension: extension.to_string(),
    })
}

/// Parse a legacy `{id}_{epoch}_{type}.{ext}` filename.
///
/// Epoch values of 10^12 and above are milliseconds, smaller ones seconds.
pub fn decode_legacy(filename: &str) -> Result<LegacyName, NameError> {
    let (stem, extension) = split_extension(filename);
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != LEGACY_SEGMENTS {
        return Err(NameError::Segments {
            name: filename.to_string(),
            expected: LEGACY_SEGMENTS,
            found: parts.len(),
        });
    }

    let id = Fingerprint::parse(parts[0])
        .map_err(|_| {
            field_error(
                filename,
                NameField::Fingerprint,
                format!("'{}' is not {FINGERPRINT_LEN} hex characters", parts[0]),
            )
        })?
        .to_string();

    let epoch_err = || field_error(filename, NameField::CreatedAt, format!("'{}' is not an epoch", parts[1]));
    if !is_epoch(parts[1]) {
        return Err(epoch_err());
    }
    let epoch: i64 = parts[1].parse().map_err(|_| epoch_err())?;
    let created_at = if epoch >= 1_000_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
    .ok_or_else(epoch_err)?;

    check_type(parts[2]).map_err(|r| field_error(filename, NameField::Type, r))?;
    check_extension(extension).map_err(|r| field_error(filename, NameField::Extension, r))?;

    Ok(LegacyName {
        id,
        created_at,
        data_type: parts[2].to_string(),
        extension: extension.to_string(),
    })
}

/// Reduce free-form text to a type token: ASCII alphanumerics and `-`.
pub fn sanitize_type(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

fn split_extension(filename: &str) -> (&str, &str) {
    filename.rsplit_once('.').unwrap_or((filename, ""))
}

fn is_epoch(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn check_type(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("empty".into());
    }
    if !s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(format!("'{s}' may only contain ASCII letters, digits and '-'"));
    }
    Ok(())
}

fn check_extension(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("missing".into());
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(format!("'{s}' contains characters outside [A-Za-z0-9_-]"));
    }
    Ok(())
}

fn parse_iv(s: &str) -> Result<Iv, String> {
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("'{s}' is not hexadecimal"));
    }
    if s.len() == LEGACY_IV_SIZE * 2 {
        return Err(format!(
            "{LEGACY_IV_SIZE}-byte IV is not supported, expected {IV_SIZE} bytes ({} hex characters)",
            IV_SIZE * 2
        ));
    }
    if s.len() != IV_SIZE * 2 {
        return Err(format!(
            "expected {} hex characters, got {}",
            IV_SIZE * 2,
            s.len()
        ));
    }
    Iv::from_hex(s).map_err(|e| e.to_string())
}

fn field_error(name: &str, field: NameField, reason: impl Into<String>) -> NameError {
    NameError::Field {
        name: name.to_string(),
        field,
        reason: reason.into(),
    }
}
