//! Orchestrator lifecycle: startup recovery, ready-queue watcher, debounce,
//! periodic sweeps, bounded worker pool, graceful shutdown

use anyhow::{Context, Result};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, info_span, warn};

use mpe_batch::{queued_batch_name, BatchProcessor, Quiescence};
use mpe_core::{Layout, MpeConfig};
use mpe_crypto::KeyStore;

type InFlight = Arc<Mutex<HashSet<String>>>;

pub async fn run(config: MpeConfig) -> Result<()> {
    let processor = build_processor(&config)?;
    let ready = processor.layout().ready();
    let stale_after = Duration::from_secs(config.processor.stale_after_secs);
    let workers = config.processor.worker_count();
    let mut pool = Pool::new(processor.clone(), workers);

    // ── Watcher ─────────────────────────────────────────────────────────────
    let (tx, mut rx) = mpsc::channel::<notify::Event>(256);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => warn!(error = %e, "watcher error"),
        },
        Config::default(),
    )
    .context("creating file watcher")?;
    watcher
        .watch(&ready, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", ready.display()))?;
    info!(dir = %ready.display(), workers, "watching ready queue");

    // ── Crash recovery: anything left over from a previous run ─────────────
    stale_sweep(&processor, &pool.in_flight, stale_after).await;
    for name in pending(&processor).await {
        pool.dispatch(name);
    }

    let debounce = Duration::from_millis(config.processor.debounce_ms);
    let mut quiet = Quiescence::new(debounce);
    let mut debounce_tick = tokio::time::interval((debounce / 4).clamp(
        Duration::from_millis(50),
        Duration::from_secs(1),
    ));
    let sweep_every = Duration::from_secs(config.processor.sweep_interval_secs);
    let mut sweep_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;

    notify_ready();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            Some(event) = rx.recv() => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                let now = Instant::now();
                for path in &event.paths {
                    let Some(name) = queued_batch_name(&ready, path) else { continue };
                    if ready.join(&name).exists() {
                        quiet.touch(&name, now);
                    } else {
                        // Moved out of the queue, most likely by our own claim.
                        quiet.forget(&name);
                    }
                }
            }
            _ = debounce_tick.tick() => {
                for name in quiet.take_due(Instant::now()) {
                    debug!(batch = %name, "quiet window elapsed");
                    pool.dispatch(name);
                }
            }
            _ = sweep_tick.tick() => {
                stale_sweep(&processor, &pool.in_flight, stale_after).await;
                for name in pending(&processor).await {
                    if !quiet.contains(&name) {
                        pool.dispatch(name);
                    }
                }
            }
            Some(res) = pool.tasks.join_next(), if !pool.tasks.is_empty() => {
                if let Err(e) = res {
                    error!(error = %e, "worker task failed");
                }
            }
        }
    }

    drop(watcher);
    info!(in_flight = pool.tasks.len(), "draining in-flight batches");
    pool.drain().await;
    info!("mped exiting cleanly");
    Ok(())
}

/// One stale sweep and one ready sweep, synchronously.
pub async fn run_once(config: MpeConfig) -> Result<()> {
    let processor = build_processor(&config)?;
    let stale_after = Duration::from_secs(config.processor.stale_after_secs);

    let summaries = tokio::task::spawn_blocking(move || -> Result<_> {
        processor.sweep_stale(stale_after, &HashSet::new())?;
        Ok(processor.sweep_ready()?)
    })
    .await
    .context("sweep task panicked")??;

    let processed = summaries.iter().filter(|s| s.is_processed()).count();
    info!(
        batches = summaries.len(),
        processed,
        failed = summaries.len() - processed,
        "sweep complete"
    );
    Ok(())
}

fn build_processor(config: &MpeConfig) -> Result<Arc<BatchProcessor>> {
    let layout = Layout::new(&config.storage.root);
    layout
        .ensure()
        .with_context(|| format!("creating pipeline under {}", config.storage.root.display()))?;

    if !config.storage.keys_dir.is_dir() {
        warn!(
            keys_dir = %config.storage.keys_dir.display(),
            "key store directory missing; every file will fail key lookup"
        );
    }
    let keys = KeyStore::new(&config.storage.keys_dir);

    let span = info_span!("processor", root = %config.storage.root.display());
    Ok(Arc::new(BatchProcessor::new(
        layout,
        keys,
        config.processor.chunk_size,
        span,
    )))
}

async fn pending(processor: &Arc<BatchProcessor>) -> Vec<String> {
    let p = processor.clone();
    match tokio::task::spawn_blocking(move || p.pending()).await {
        Ok(Ok(names)) => names,
        Ok(Err(e)) => {
            warn!(error = %e, "listing ready queue failed");
            Vec::new()
        }
        Err(e) => {
            error!(error = %e, "listing ready queue panicked");
            Vec::new()
        }
    }
}

async fn stale_sweep(processor: &Arc<BatchProcessor>, in_flight: &InFlight, max_age: Duration) {
    let busy = lock(in_flight).clone();
    let p = processor.clone();
    match tokio::task::spawn_blocking(move || p.sweep_stale(max_age, &busy)).await {
        Ok(Ok(moved)) if !moved.is_empty() => warn!(batches = ?moved, "stale batches moved to failed"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "stale sweep failed"),
        Err(e) => error!(error = %e, "stale sweep panicked"),
    }
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Worker pool ─────────────────────────────────────────────────────────────

struct Pool {
    processor: Arc<BatchProcessor>,
    semaphore: Arc<Semaphore>,
    in_flight: InFlight,
    tasks: JoinSet<()>,
}

impl Pool {
    fn new(processor: Arc<BatchProcessor>, workers: usize) -> Self {
        Self {
            processor,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
        }
    }

    /// Queue `name` for processing unless it is already in flight.
    fn dispatch(&mut self, name: String) {
        if !lock(&self.in_flight).insert(name.clone()) {
            debug!(batch = %name, "already in flight");
            return;
        }

        let processor = self.processor.clone();
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();

        self.tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                lock(&in_flight).remove(&name);
                return;
            };

            let p = processor.clone();
            let n = name.clone();
            let started = Instant::now();
            match tokio::task::spawn_blocking(move || p.run_batch(&n)).await {
                Ok(Ok(Some(summary))) => info!(
                    batch = %name,
                    decrypted = summary.decrypted,
                    failed = summary.errors.len(),
                    processed = summary.is_processed(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch finished"
                ),
                Ok(Ok(None)) => debug!(batch = %name, "claimed elsewhere"),
                Ok(Err(e)) => {
                    error!(batch = %name, error = %e, "batch errored");
                    fail_batch(&processor, &name, format!("error: {e}")).await;
                }
                Err(e) => {
                    error!(batch = %name, error = %e, "batch task panicked");
                    fail_batch(&processor, &name, format!("panic: {e}")).await;
                }
            }

            lock(&in_flight).remove(&name);
        });
    }

    async fn drain(&mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed during drain");
            }
        }
    }
}

async fn fail_batch(processor: &Arc<BatchProcessor>, name: &str, reason: String) {
    let p = processor.clone();
    let name = name.to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || p.fail_after_error(&name, &reason)).await {
        error!(error = %e, "routing batch to failed panicked");
    }
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op otherwise
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
