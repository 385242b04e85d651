//! Background batching and delivery of log entries.
//!
//! The [`Shipper`] trait is the boundary the writer depends on: a bounded
//! channel to hand entries to, and two ways of shutting down. [`LokiShipper`]
//! is the concrete implementation. It owns one background thread running a
//! current-thread tokio runtime that drains the channel into per-stream
//! batches and pushes them with [`PushClient`].
//!
//! A batch is shipped when either:
//! - The next entry would push it over `batch_size` bytes (size-based flush)
//! - It is older than `batch_wait` (time-based flush)

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Dispatch};

use crate::batch::Batch;
use crate::client::PushClient;
use crate::config::{ClientConfig, ResourceLimits};
use crate::entry::Entry;
use crate::error::OpenError;

/// Capacity of the entries channel; writers block once it is full.
pub const CHANNEL_CAPACITY: usize = 1_000;

/// Name of the background thread.
const THREAD_NAME: &str = "loki-shipper";

/// Lower bound for the batch age check interval.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Accepts entries and delivers them in the background.
pub trait Shipper: Send {
    /// Handle to the entries channel. Sends block (or wait) while it is full.
    fn sender(&self) -> mpsc::Sender<Entry>;

    /// Stop accepting entries, ship everything already queued and wait for
    /// the worker to finish.
    fn stop(&mut self);

    /// Stop immediately. In-flight pushes and queued entries are dropped.
    /// Returns once the worker has exited.
    fn stop_now(&mut self);
}

/// Statistics about shipper operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipperStats {
    /// Total number of entries delivered
    pub entries_sent: u64,

    /// Total number of entries dropped (limits, failed batches, stop_now)
    pub entries_dropped: u64,

    /// Total number of batches delivered
    pub batches_sent: u64,

    /// Total number of batches given up on
    pub batches_dropped: u64,

    /// Total number of retries performed
    pub retries: u64,

    /// Total number of lines cut down to `max_line_size`
    pub lines_truncated: u64,
}

/// Shipper backed by the Loki push API.
pub struct LokiShipper {
    tx: mpsc::Sender<Entry>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    stats: Arc<RwLock<ShipperStats>>,
}

impl LokiShipper {
    /// Build the push client and start the background worker.
    ///
    /// When `dispatch` is given, the worker's diagnostics go to that
    /// subscriber instead of the global one.
    pub fn new(config: Arc<ClientConfig>, dispatch: Option<Dispatch>) -> Result<Self, OpenError> {
        let client = PushClient::new(&config)?;
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let cancel = CancellationToken::new();
        let stats = Arc::new(RwLock::new(ShipperStats::default()));

        let worker = Worker {
            client,
            batch_wait: config.batch_wait,
            batch_size: config.batch_size,
            limits: config.limits,
            shutdown: shutdown.clone(),
            cancel: cancel.clone(),
            stats: stats.clone(),
        };

        let handle = std::thread::Builder::new().name(THREAD_NAME.to_string()).spawn(move || {
            let _guard = dispatch.as_ref().map(tracing::dispatcher::set_default);
            runtime.block_on(worker.run(rx));
        })?;

        info!(
            name = %config.name,
            url = %config.url,
            batch_wait_ms = config.batch_wait.as_millis() as u64,
            batch_size = config.batch_size,
            "Loki shipper started"
        );

        Ok(Self {
            tx,
            shutdown,
            cancel,
            worker: Some(handle),
            stats,
        })
    }

    /// Get current shipper statistics.
    pub fn stats(&self) -> ShipperStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Loki shipper worker panicked");
            }
        }
    }
}

impl Shipper for LokiShipper {
    fn sender(&self) -> mpsc::Sender<Entry> {
        self.tx.clone()
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        self.join();
    }

    fn stop_now(&mut self) {
        self.cancel.cancel();
        self.join();
    }
}

impl Drop for LokiShipper {
    fn drop(&mut self) {
        self.stop_now();
    }
}

/// State owned by the background thread.
struct Worker {
    client: PushClient,
    batch_wait: Duration,
    batch_size: usize,
    limits: ResourceLimits,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    stats: Arc<RwLock<ShipperStats>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Entry>) {
        let mut batch = Batch::new();
        let mut ticker = interval((self.batch_wait / 2).max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.abandon(&batch, &mut rx);
                    break;
                }

                _ = self.shutdown.cancelled() => {
                    rx.close();
                    while let Some(entry) = rx.recv().await {
                        self.add(entry, &mut batch).await;
                    }
                    info!(remaining = batch.len(), "Shipper stopping, flushing remaining entries");
                    self.ship(std::mem::take(&mut batch)).await;
                    break;
                }

                maybe_entry = rx.recv() => {
                    match maybe_entry {
                        Some(entry) => self.add(entry, &mut batch).await,
                        None => {
                            // Every sender is gone
                            self.ship(std::mem::take(&mut batch)).await;
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if !batch.is_empty() && batch.age() >= self.batch_wait {
                        debug!(
                            entries = batch.len(),
                            batch_wait_ms = self.batch_wait.as_millis() as u64,
                            "Time-based flush triggered"
                        );
                        self.ship(std::mem::take(&mut batch)).await;
                    }
                }
            }
        }

        debug!("Shipper worker exited");
    }

    /// Apply the line limits and put the entry into the pending batch,
    /// shipping the batch first if the entry would overflow it.
    async fn add(&self, mut entry: Entry, batch: &mut Batch) {
        let max_line_size = self.limits.max_line_size;
        if max_line_size > 0 && entry.line.len() > max_line_size {
            if !self.limits.truncate_oversized {
                warn!(
                    size = entry.line.len(),
                    max_line_size = max_line_size,
                    labels = %entry.labels,
                    "Dropping line over max_line_size"
                );
                self.record(|s| s.entries_dropped += 1);
                return;
            }
            truncate_line(&mut entry.line, max_line_size);
            self.record(|s| s.lines_truncated += 1);
        }

        if !batch.is_empty() && batch.size_bytes_after(&entry) > self.batch_size {
            debug!(batch_bytes = batch.size_bytes(), "Size-based flush triggered");
            self.ship(std::mem::take(batch)).await;
        }

        if batch.is_empty() {
            // Age counts from the first entry
            *batch = Batch::new();
        }

        if let Err(err) = batch.add(entry, self.limits.max_streams) {
            warn!(error = %err, "Dropping entry");
            self.record(|s| s.entries_dropped += 1);
        }
    }

    /// Push a batch, giving up early if the shipper is stopped now.
    async fn ship(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let entries = batch.len() as u64;
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                warn!(entries = entries, "Shipper stopped during push, dropping batch");
                self.record(|s| {
                    s.batches_dropped += 1;
                    s.entries_dropped += entries;
                });
            }

            result = self.client.send_batch(&batch) => match result {
                Ok(attempts) => self.record(|s| {
                    s.batches_sent += 1;
                    s.entries_sent += entries;
                    s.retries += u64::from(attempts.saturating_sub(1));
                }),
                Err(dropped) => self.record(|s| {
                    s.batches_dropped += 1;
                    s.entries_dropped += entries;
                    s.retries += u64::from(dropped.attempts.saturating_sub(1));
                }),
            },
        }
    }

    /// Count what an immediate stop leaves behind.
    fn abandon(&self, batch: &Batch, rx: &mut mpsc::Receiver<Entry>) {
        rx.close();
        let mut queued = 0u64;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        let lost = batch.len() as u64 + queued;
        if lost > 0 {
            warn!(pending = batch.len(), queued = queued, "Shipper stopped immediately, dropping entries");
            self.record(|s| s.entries_dropped += lost);
        }
    }

    fn record(&self, update: impl FnOnce(&mut ShipperStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}

/// Cut `line` to at most `max` bytes without splitting a character.
fn truncate_line(line: &mut String, max: usize) {
    let mut end = max.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line.truncate(end);
}
