//! mpe: operator CLI for the mpe upload pipeline
//!
//! Key management:
//!   key new                      - generate and store an enrollment key
//!   key show <term>              - look up a key by fingerprint or full hex key
//!   key list                     - list stored fingerprints
//!
//! Files:
//!   encrypt <fp> <out> <input>...  - produce correctly named encrypted test files
//!   decrypt <input> <output>       - decrypt one encrypted file
//!   info <file>                    - show what an encrypted filename carries
//!
//! Pipeline:
//!   ingest <file>...             - stage local files as one upload batch
//!   process                      - one stale sweep plus one ready sweep
//!   config show                  - display the effective configuration

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, Timelike};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info_span;

use mpe_batch::{BatchError, BatchProcessor, Disposition, EncryptedFile, IngestOutcome, UploadPart};
use mpe_core::{Layout, MpeConfig};
use mpe_crypto::{decode_legacy, sanitize_type, Fingerprint, KeyStore, NameError};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "mpe",
    version,
    about = "mpe upload pipeline client",
    long_about = "mpe: manage enrollment keys, generate and decrypt encrypted files, and drive the batch pipeline"
)]
struct Cli {
    /// Path to mpe.toml configuration file
    #[arg(long, short = 'c', env = "MPE_CONFIG", default_value = "/etc/mpe/config.toml")]
    config: PathBuf,

    /// Log level for diagnostics on stderr
    #[arg(long, env = "MPE_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enrollment key management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Encrypt files into device-style names for testing the pipeline
    ///
    /// Each input gets a random timestamp within the last N days (sorted in
    /// input order) and a type derived from its extension.
    Encrypt {
        /// Fingerprint of a stored enrollment key (8 hex characters)
        fingerprint: String,
        /// Directory to write encrypted files into
        out_dir: PathBuf,
        /// Plaintext files to encrypt
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Spread timestamps over this many days back from now
        #[arg(long, default_value_t = 1)]
        days_back: u32,
        /// Data type token for every file; derived from the extension when omitted
        #[arg(long = "type")]
        data_type: Option<String>,
    },

    /// Decrypt a single encrypted file
    ///
    /// The key is chosen by the fingerprint in the filename.
    Decrypt {
        /// Encrypted file with a canonical name
        input: PathBuf,
        /// Output file, or a directory to write the IV-free name into; never overwritten
        output: PathBuf,
        /// Expected fingerprint; a mismatch is reported, the filename wins
        #[arg(long)]
        fingerprint: Option<String>,
    },

    /// Show the provenance carried by an encrypted filename
    Info {
        file: PathBuf,
    },

    /// Stage local files as one upload batch and queue it
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Process everything in the ready queue once
    Process,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Generate a new enrollment key and store it
    New,
    /// Resolve a key by fingerprint or full 64-hex key
    Show { term: String },
    /// List stored fingerprints
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let mut config = MpeConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    config.apply_env(std::env::vars())?;
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Key { action: KeyAction::New } => cmd_key_new(&config),
        Commands::Key { action: KeyAction::Show { term } } => cmd_key_show(&config, &term),
        Commands::Key { action: KeyAction::List } => cmd_key_list(&config),
        Commands::Encrypt { fingerprint, out_dir, inputs, days_back, data_type } => cmd_encrypt(
            &config,
            &fingerprint,
            &out_dir,
            &inputs,
            days_back,
            data_type.as_deref(),
        ),
        Commands::Decrypt { input, output, fingerprint } => {
            cmd_decrypt(&config, &input, &output, fingerprint.as_deref())
        }
        Commands::Info { file } => cmd_info(&file),
        Commands::Ingest { files } => cmd_ingest(&config, &files),
        Commands::Process => cmd_process(&config),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// ── `mpe key` ─────────────────────────────────────────────────────────────────

fn key_store(config: &MpeConfig) -> KeyStore {
    KeyStore::new(&config.storage.keys_dir)
}

fn cmd_key_new(config: &MpeConfig) -> Result<()> {
    let store = key_store(config);
    let key = store
        .generate_and_persist()
        .with_context(|| format!("generating key in {}", store.root().display()))?;
    let fp = key.fingerprint();

    println!("fingerprint: {fp}");
    println!("key:         {}", key.to_hex());
    println!("file:        {}", store.key_path(&fp).display());
    Ok(())
}

fn cmd_key_show(config: &MpeConfig, term: &str) -> Result<()> {
    let store = key_store(config);
    let key = store.resolve(term)?;
    let fp = key.fingerprint();

    println!("fingerprint: {fp}");
    println!("key:         {}", key.to_hex());
    println!("file:        {}", store.key_path(&fp).display());
    Ok(())
}

fn cmd_key_list(config: &MpeConfig) -> Result<()> {
    let store = key_store(config);
    let fingerprints = store.list()?;
    if fingerprints.is_empty() {
        println!("no enrollment keys in {}", store.root().display());
    }
    for fp in fingerprints {
        println!("{fp}");
    }
    Ok(())
}

// ── `mpe encrypt` ─────────────────────────────────────────────────────────────

fn cmd_encrypt(
    config: &MpeConfig,
    fingerprint: &str,
    out_dir: &Path,
    inputs: &[PathBuf],
    days_back: u32,
    data_type: Option<&str>,
) -> Result<()> {
    let fp = Fingerprint::parse(fingerprint)?;
    let forced_type = data_type.map(sanitize_type);
    let key = key_store(config)
        .load(&fp)
        .with_context(|| format!("loading enrollment key {fp}"))?;

    for input in inputs {
        if !input.is_file() {
            anyhow::bail!("input file does not exist: {}", input.display());
        }
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let now = Local::now().fixed_offset();
    let timestamps = plausible_timestamps(&mut rand::thread_rng(), now, inputs.len(), days_back);

    let pb = make_progress_bar(inputs.len() as u64, "encrypt");
    let mut total = 0u64;
    for (input, created_at) in inputs.iter().zip(&timestamps) {
        pb.set_message(input.display().to_string());

        let plaintext =
            std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
        let (ciphertext, iv) = mpe_crypto::encrypt(&key, &plaintext);
        let name = mpe_crypto::encode(
            &fp,
            created_at,
            forced_type.as_deref().unwrap_or_else(|| type_for_extension(input)),
            &iv,
            &extension_of(input),
        )?;
        let dest = out_dir.join(&name);
        std::fs::write(&dest, &ciphertext)
            .with_context(|| format!("writing {}", dest.display()))?;

        total += ciphertext.len() as u64;
        pb.inc(1);
        pb.println(format!("  {} -> {name}", input.display()));
    }
    pb.finish_with_message("done".to_string());

    println!();
    println!("Encrypted {} files ({}) into {}", inputs.len(), fmt_bytes(total), out_dir.display());
    Ok(())
}

/// `count` random second-precision timestamps in the `days_back` days up to
/// `now`, sorted oldest first.
fn plausible_timestamps<R: Rng>(
    rng: &mut R,
    now: DateTime<FixedOffset>,
    count: usize,
    days_back: u32,
) -> Vec<DateTime<FixedOffset>> {
    let now = now.with_nanosecond(0).unwrap_or(now);
    let span = i64::from(days_back) * 24 * 60 * 60;
    let start = now - ChronoDuration::seconds(span);

    let mut out: Vec<_> = (0..count)
        .map(|_| start + ChronoDuration::seconds(rng.gen_range(0..=span)))
        .collect();
    out.sort();
    out
}

fn type_for_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "tiff" | "tif" => "image",
        "json" | "xml" | "csv" => "data",
        "txt" | "log" | "md" => "text",
        _ => "file",
    }
}

/// Extension kept verbatim when it is filename-safe, otherwise `bin`.
fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'))
        .unwrap_or("bin")
        .to_string()
}

// ── `mpe decrypt` / `mpe info` ────────────────────────────────────────────────

fn cmd_decrypt(
    config: &MpeConfig,
    input: &Path,
    output: &Path,
    expected: Option<&str>,
) -> Result<()> {
    let file = EncryptedFile::from_path(input)?;
    let fp = file.fingerprint();

    if let Some(expected) = expected {
        if Fingerprint::parse(expected).ok().as_ref() != Some(fp) {
            tracing::warn!(expected, actual = %fp, "fingerprint mismatch, using the filename's");
            eprintln!("warning: --fingerprint {expected} does not match the filename ({fp}); using {fp}");
        }
    }

    let key = key_store(config)
        .load(fp)
        .with_context(|| format!("loading enrollment key {fp}"))?;

    let dest = if output.is_dir() {
        output.join(file.name().plain_file_name())
    } else {
        output.to_path_buf()
    };

    let pb = make_spinner("decrypt");
    pb.set_message(input.display().to_string());
    let written = mpe_crypto::decrypt_to_path(
        &key,
        &file.name().iv,
        input,
        &dest,
        config.processor.chunk_size,
    )
    .with_context(|| format!("decrypting {}", input.display()))?;
    pb.finish_with_message("done".to_string());

    println!("{} -> {} ({})", input.display(), dest.display(), fmt_bytes(written));
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&describe(path)?)?);
    Ok(())
}

/// Filename metadata as JSON. Legacy names are described too, flagged as
/// undecryptable here because their IV lives in the file body.
fn describe(path: &Path) -> Result<serde_json::Value> {
    match EncryptedFile::from_path(path) {
        Ok(file) => Ok(serde_json::to_value(file.info()?)?),
        Err(BatchError::Name(NameError::Legacy { name })) => {
            let legacy = decode_legacy(&name)?;
            Ok(serde_json::json!({
                "path": path,
                "size": std::fs::metadata(path)?.len(),
                "legacy": true,
                "id": legacy.id,
                "created_at": legacy.created_at.to_rfc3339(),
                "data_type": legacy.data_type,
                "extension": legacy.extension,
            }))
        }
        Err(e) => Err(e.into()),
    }
}

// ── `mpe ingest` / `mpe process` ──────────────────────────────────────────────

fn cmd_ingest(config: &MpeConfig, files: &[PathBuf]) -> Result<()> {
    let layout = Layout::new(&config.storage.root);
    layout.ensure().context("creating pipeline directories")?;

    let parts = files
        .iter()
        .map(|path| {
            let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(UploadPart::new(filename, data))
        })
        .collect::<Result<Vec<_>>>()?;

    let max = config.upload.max_content_bytes()?;
    let report = mpe_batch::ingest(&layout, &parts, max, info_span!("ingest"))?;

    println!("{}", report.message());
    if let Some(batch) = &report.batch {
        println!("  batch: {batch}");
    }
    for failure in &report.failures {
        println!("  error: {failure}");
    }

    if report.outcome() == IngestOutcome::Failed {
        anyhow::bail!("no files accepted");
    }
    Ok(())
}

fn cmd_process(config: &MpeConfig) -> Result<()> {
    let layout = Layout::new(&config.storage.root);
    layout.ensure().context("creating pipeline directories")?;
    let processor = BatchProcessor::new(
        layout,
        key_store(config),
        config.processor.chunk_size,
        info_span!("process"),
    );

    let stale = processor.sweep_stale(
        Duration::from_secs(config.processor.stale_after_secs),
        &HashSet::new(),
    )?;
    for name in &stale {
        println!("stale: {name} -> failed");
    }

    let pb = make_spinner("process");
    pb.set_message("sweeping ready queue...");
    let summaries = processor.sweep_ready()?;
    pb.finish_and_clear();

    if summaries.is_empty() {
        println!("ready queue is empty");
    }
    for summary in &summaries {
        match &summary.disposition {
            Disposition::Processed(dest) => {
                println!("{}: {} files -> {}", summary.name, summary.decrypted, dest.display());
            }
            Disposition::Failed(dest) => {
                println!(
                    "{}: FAILED ({} ok, {} failed) -> {}",
                    summary.name,
                    summary.decrypted,
                    summary.errors.len(),
                    dest.display()
                );
                for e in &summary.errors {
                    println!("    {} [{}]: {}", e.file, e.class, e.reason);
                }
            }
        }
    }
    Ok(())
}

// ── `mpe config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &MpeConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
