//! An encrypted upload on disk: a path plus the provenance decoded from its name.

use std::path::{Path, PathBuf};

use serde::Serialize;

use mpe_crypto::{EncryptedName, Fingerprint};

use crate::error::{BatchError, BatchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFile {
    path: PathBuf,
    name: EncryptedName,
}

/// Summary of one encrypted file, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub fingerprint: String,
    pub created_at: String,
    pub data_type: String,
    pub iv: String,
}

impl EncryptedFile {
    /// Decode the file name at `path`. Does not require the file to exist.
    pub fn from_path(path: impl Into<PathBuf>) -> BatchResult<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BatchError::InvalidFilename(path.display().to_string()))?;
        let name = mpe_crypto::decode(file_name)?;
        Ok(Self { path, name })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &EncryptedName {
        &self.name
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.name.fingerprint
    }

    /// Where the decrypted file goes, relative to the batch output directory:
    /// `{fingerprint}/{YYYY-MM-DD}/{type}/{fingerprint}_{timestamp}_{type}.{ext}`.
    pub fn output_relative_path(&self) -> PathBuf {
        PathBuf::from(self.name.fingerprint.as_str())
            .join(self.name.date_part())
            .join(&self.name.data_type)
            .join(self.name.plain_file_name())
    }

    pub fn info(&self) -> BatchResult<FileInfo> {
        let size = std::fs::metadata(&self.path)?.len();
        Ok(FileInfo {
            path: self.path.clone(),
            size,
            fingerprint: self.name.fingerprint.to_string(),
            created_at: self.name.created_at.to_rfc3339(),
            data_type: self.name.data_type.clone(),
            iv: self.name.iv.to_hex(),
        })
    }
}

/// Make a client-supplied filename safe to store.
///
/// Keeps the last path component, drops non-ASCII characters, turns
/// whitespace runs into `_`, removes anything outside `[A-Za-z0-9_.+-]` and
/// trims `.` and `_` from both ends. `+` is kept because it carries the UTC
/// offset of east-of-UTC timestamps. Returns `None` when nothing usable is
/// left.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let ascii: String = last.chars().filter(char::is_ascii).collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');

    match trimmed {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "8ce4d5e6_2025-09-20T092542-0500_image_5ea30e9f40ce2e43d0b66c11c8324b05.png";

    #[test]
    fn test_output_relative_path_drops_iv() {
        let file = EncryptedFile::from_path(PathBuf::from("/ready/batch-1").join(NAME)).unwrap();
        assert_eq!(
            file.output_relative_path(),
            PathBuf::from("8ce4d5e6/2025-09-20/image/8ce4d5e6_2025-09-20T092542-0500_image.png")
        );
    }

    #[test]
    fn test_date_part_uses_embedded_offset() {
        // 23:30 at -0500 is already the next day in UTC; the folder follows the device.
        let file =
            EncryptedFile::from_path("8ce4d5e6_2025-09-20T233000-0500_data_5ea30e9f40ce2e43d0b66c11c8324b05.csv")
                .unwrap();
        assert!(file.output_relative_path().starts_with("8ce4d5e6/2025-09-20/data"));
    }

    #[test]
    fn test_from_path_rejects_bad_name() {
        let err = EncryptedFile::from_path("/tmp/invalid.png").unwrap_err();
        assert!(matches!(err, BatchError::Name(_)));
    }

    #[test]
    fn test_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NAME);
        std::fs::write(&path, [0u8; 48]).unwrap();

        let info = EncryptedFile::from_path(&path).unwrap().info().unwrap();
        assert_eq!(info.size, 48);
        assert_eq!(info.fingerprint, "8ce4d5e6");
        assert_eq!(info.data_type, "image");
        assert_eq!(info.iv, "5ea30e9f40ce2e43d0b66c11c8324b05");
        assert_eq!(info.created_at, "2025-09-20T09:25:42-05:00");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My cool movie.mov").as_deref(), Some("My_cool_movie.mov"));
        assert_eq!(sanitize_filename("../../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\Users\\x\\scan.png").as_deref(), Some("scan.png"));
        assert_eq!(sanitize_filename("résumé.pdf").as_deref(), Some("rsum.pdf"));
        assert_eq!(sanitize_filename("__init__.py").as_deref(), Some("init__.py"));
        assert_eq!(sanitize_filename(NAME).as_deref(), Some(NAME));
    }

    #[test]
    fn test_sanitize_filename_keeps_positive_offsets() {
        for name in [
            "8ce4d5e6_2025-09-21T235959+0200_data_5ea30e9f40ce2e43d0b66c11c8324b05.csv",
            "8ce4d5e6_2025-09-21T235959+0000_data_5ea30e9f40ce2e43d0b66c11c8324b05.csv",
            "8ce4d5e6_2025-09-21T235959.250+0530_data_5ea30e9f40ce2e43d0b66c11c8324b05.csv",
        ] {
            assert_eq!(sanitize_filename(name).as_deref(), Some(name));
            assert!(EncryptedFile::from_path(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_sanitize_filename_rejects_empty() {
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("../"), None);
        assert_eq!(sanitize_filename("日本語"), None);
        assert_eq!(sanitize_filename("  ._ "), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_sanitized_names_are_safe(raw in "\\PC{0,40}") {
            if let Some(name) = sanitize_filename(&raw) {
                proptest::prop_assert!(!name.is_empty());
                proptest::prop_assert!(name != "." && name != "..");
                proptest::prop_assert!(name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'+')));
                proptest::prop_assert!(!name.starts_with(['.', '_']));
            }
        }
    }
}
