use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MpeError, MpeResult};

/// Top-level configuration (loaded from mpe.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MpeConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the batch pipeline directories (incoming/, ready/, ...)
    pub root: PathBuf,
    /// Directory holding `{fingerprint}.key` enrollment key files
    pub keys_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum total payload of one upload request, e.g. "16M" or "1GB"
    pub max_content_length: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Concurrent batches (0 = available parallelism)
    pub workers: usize,
    /// Quiet period after the last event on a ready batch before claiming it
    pub debounce_ms: u64,
    /// Interval of the full ready-root sweep
    pub sweep_interval_secs: u64,
    /// Batches left in processing/ longer than this are moved to failed/
    pub stale_after_secs: u64,
    /// Decryption chunk size in bytes
    pub chunk_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/mpe"),
            keys_dir: PathBuf::from("/var/lib/mpe/keys"),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_content_length: "16M".into(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            debounce_ms: 2000,
            sweep_interval_secs: 60,
            stale_after_secs: 3600,
            chunk_size: 64 * 1024,
        }
    }
}

impl UploadConfig {
    pub fn max_content_bytes(&self) -> MpeResult<u64> {
        parse_size(&self.max_content_length)
    }
}

impl ProcessorConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl MpeConfig {
    /// Read a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> MpeResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| MpeError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Apply `MPE_*` overrides from an environment snapshot.
    pub fn apply_env<I>(&mut self, vars: I) -> MpeResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "MPE_ROOT" => self.storage.root = PathBuf::from(value),
                "MPE_KEYS_DIR" => self.storage.keys_dir = PathBuf::from(value),
                "MPE_MAX_CONTENT_LENGTH" => self.upload.max_content_length = value,
                "MPE_WORKERS" => {
                    self.processor.workers = value.trim().parse().map_err(|_| {
                        MpeError::Config(format!("MPE_WORKERS must be an integer, got '{value}'"))
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Startup validation: every field the pipeline depends on must be usable.
    pub fn validate(&self) -> MpeResult<()> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(MpeError::Config("storage.root is empty".into()));
        }
        if self.storage.keys_dir.as_os_str().is_empty() {
            return Err(MpeError::Config("storage.keys_dir is empty".into()));
        }
        self.upload.max_content_bytes()?;
        if self.processor.chunk_size < 16 {
            return Err(MpeError::Config(format!(
                "processor.chunk_size must be at least one AES block (16), got {}",
                self.processor.chunk_size
            )));
        }
        if self.processor.debounce_ms == 0 {
            return Err(MpeError::Config("processor.debounce_ms must be > 0".into()));
        }
        if self.processor.sweep_interval_secs == 0 {
            return Err(MpeError::Config(
                "processor.sweep_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a human-readable size such as `16M`, `1GB`, `512K`, `1.5GB` or `1024`.
///
/// Units are powers of 1024; the trailing `B` is optional and case is ignored.
pub fn parse_size(input: &str) -> MpeResult<u64> {
    let err = |reason: &str| MpeError::Size {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim().to_ascii_uppercase();
    if s.is_empty() {
        return Err(err("size string cannot be empty"));
    }

    let s = s.strip_suffix('B').unwrap_or(&s);
    let (number, multiplier) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], 1u64 << 10),
        Some('M') => (&s[..s.len() - 1], 1u64 << 20),
        Some('G') => (&s[..s.len() - 1], 1u64 << 30),
        Some('T') => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1u64),
    };
    let number = number.trim_end();

    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (number, None),
    };
    let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || frac.is_some_and(|f| !all_digits(f)) {
        return Err(err("use a format like '16M' or '1GB'"));
    }

    let value: f64 = number.parse().map_err(|_| err("not a number"))?;
    Ok((value * multiplier as f64) as u64)
}
