//! Async request and audit logging.
//!
//! Both loggers feed a bounded channel (10 000 deep) into a writer task
//! that flushes batches of up to 100 messages or every 1000 ms, whichever
//! comes first. Enqueue never blocks: on a full queue the message is
//! dropped, a lost-log counter increments, and the overflow is reported
//! once per episode. The audit sink is line-delimited text with its own
//! retention, honoring a `rotate_if_needed` contract.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub const QUEUE_DEPTH: usize = 10_000;
pub const BATCH_MAX: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Where batched lines land. File and stdout sinks are provided; tests use
/// an in-memory sink.
pub trait LogSink: Send + 'static {
    fn write_batch(&mut self, lines: &[String]) -> std::io::Result<()>;
    /// Size-based rotation hook, called after each batch.
    fn rotate_if_needed(&mut self) -> std::io::Result<()>;
}

/// Appends lines to a file, rotating at `max_size_bytes` by renaming the
/// live file aside with a timestamp suffix.
pub struct FileSink {
    path: PathBuf,
    file: Option<std::fs::File>,
    max_size_bytes: u64,
}

impl FileSink {
    pub fn new<P: Into<PathBuf>>(path: P, max_size_mb: u64) -> Self {
        Self {
            path: path.into(),
            file: None,
            max_size_bytes: max_size_mb * 1024 * 1024,
        }
    }

    fn open(&mut self) -> std::io::Result<&mut std::fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.file = Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        Ok(self.file.as_mut().expect("just opened"))
    }
}

impl LogSink for FileSink {
    fn write_batch(&mut self, lines: &[String]) -> std::io::Result<()> {
        let file = self.open()?;
        let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        file.flush()
    }

    fn rotate_if_needed(&mut self) -> std::io::Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let size = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_size_bytes {
            return Ok(());
        }
        let rotated = self.path.with_extension(format!(
            "{}.{}",
            self.path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("log"),
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        self.file = None;
        std::fs::rename(&self.path, rotated)
    }
}

/// Stdout sink used when no log directory is configured.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_batch(&mut self, lines: &[String]) -> std::io::Result<()> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for line in lines {
            writeln!(handle, "{line}")?;
        }
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ===== Request log events =====

/// Structured request-log events, serialized as one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum LogEvent {
    WafRequest {
        timestamp: String,
        request_id: String,
        client_ip: String,
        method: String,
        path: String,
        query: String,
        user_agent: String,
        blocked: bool,
        observed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        rule_id: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rule_message: Option<String>,
        duration_ms: f64,
        status_code: u16,
        domain: String,
    },
    RuleMatch {
        timestamp: String,
        request_id: String,
        client_ip: String,
        rule_id: u32,
        rule_message: String,
        variable: String,
        value: String,
        score: i32,
    },
    RateLimitExceeded {
        timestamp: String,
        client_ip: String,
        path: String,
        limit: u32,
        reset_at: u64,
    },
    Error {
        timestamp: String,
        context: String,
        message: String,
    },
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ===== Audit events =====

/// Audit event kinds, written as line-delimited text to a separate sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Block,
    ConfigChange,
    IpBlocked,
    GeoipBlocked,
    RateLimitExceeded,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Block => "BLOCK",
            AuditKind::ConfigChange => "CONFIG_CHANGE",
            AuditKind::IpBlocked => "IP_BLOCKED",
            AuditKind::GeoipBlocked => "GEOIP_BLOCKED",
            AuditKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub client_ip: String,
    pub detail: String,
}

impl AuditEvent {
    fn render(&self) -> String {
        format!(
            "{} {} ip={} {}",
            timestamp_now(),
            self.kind.as_str(),
            self.client_ip,
            self.detail
        )
    }
}

// ===== The shared bounded writer =====

struct WriterShared {
    lost: AtomicU64,
    overflow_episode: AtomicBool,
}

/// Bounded, batching logger over any line-renderable event type.
pub struct AsyncLogger<E: Send + 'static> {
    /// Taken on shutdown so the channel closes and the writer drains out.
    tx: parking_lot::RwLock<Option<mpsc::Sender<E>>>,
    shared: Arc<WriterShared>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> AsyncLogger<E> {
    fn spawn<S, F>(mut sink: S, render: F) -> Self
    where
        S: LogSink,
        F: Fn(&E) -> String + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<E>(QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            let mut batch: Vec<String> = Vec::with_capacity(BATCH_MAX);
            let mut deadline = tokio::time::Instant::now() + FLUSH_INTERVAL;
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(event)) => {
                        batch.push(render(&event));
                        // Drain whatever is queued, up to the batch cap.
                        while batch.len() < BATCH_MAX {
                            match rx.try_recv() {
                                Ok(event) => batch.push(render(&event)),
                                Err(_) => break,
                            }
                        }
                        if batch.len() >= BATCH_MAX {
                            flush(&mut sink, &mut batch);
                            deadline = tokio::time::Instant::now() + FLUSH_INTERVAL;
                        }
                    }
                    Ok(None) => {
                        // Channel closed: final flush and exit.
                        flush(&mut sink, &mut batch);
                        break;
                    }
                    Err(_) => {
                        // Interval elapsed: flush whatever accumulated.
                        flush(&mut sink, &mut batch);
                        deadline = tokio::time::Instant::now() + FLUSH_INTERVAL;
                    }
                }
            }
        });

        Self {
            tx: parking_lot::RwLock::new(Some(tx)),
            shared: Arc::new(WriterShared {
                lost: AtomicU64::new(0),
                overflow_episode: AtomicBool::new(false),
            }),
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Non-blocking enqueue. A full (or closed) queue drops the event and
    /// counts it.
    pub fn enqueue(&self, event: E) {
        let sent = match self.tx.read().as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        };
        if sent {
            self.shared.overflow_episode.store(false, Ordering::Relaxed);
        } else {
            self.shared.lost.fetch_add(1, Ordering::Relaxed);
            // Report once per overflow episode, not per message.
            if !self.shared.overflow_episode.swap(true, Ordering::Relaxed) {
                warn!(
                    lost_total = self.shared.lost.load(Ordering::Relaxed),
                    "log queue full, dropping messages"
                );
            }
        }
    }

    pub fn lost_count(&self) -> u64 {
        self.shared.lost.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the writer to flush its tail.
    pub async fn shutdown(&self) {
        self.tx.write().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // The writer exits once `recv()` observes the closed channel;
            // the wait is bounded so shutdown can never hang.
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

fn flush<S: LogSink>(sink: &mut S, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = sink.write_batch(batch) {
        error!(error = %e, dropped = batch.len(), "log sink write failed");
    }
    if let Err(e) = sink.rotate_if_needed() {
        error!(error = %e, "log rotation failed");
    }
    batch.clear();
}

/// The JSON request logger.
pub type RequestLogger = AsyncLogger<LogEvent>;

/// The line-delimited audit logger.
pub type AuditLogger = AsyncLogger<AuditEvent>;

/// Build the request logger over a file sink (or stdout when `log_dir` is
/// unset).
pub fn request_logger(log_dir: Option<&Path>, max_size_mb: u64) -> RequestLogger {
    match log_dir {
        Some(dir) => AsyncLogger::spawn(FileSink::new(dir.join("waf.log"), max_size_mb), |e| {
            serde_json::to_string(e).unwrap_or_default()
        }),
        None => AsyncLogger::spawn(StdoutSink, |e| serde_json::to_string(e).unwrap_or_default()),
    }
}

/// Build the audit logger. Returns `None` when auditing is disabled.
pub fn audit_logger(
    log_dir: Option<&Path>,
    max_size_mb: u64,
    enabled: bool,
) -> Option<AuditLogger> {
    if !enabled {
        return None;
    }
    Some(match log_dir {
        Some(dir) => {
            AsyncLogger::spawn(FileSink::new(dir.join("audit.log"), max_size_mb), |e: &AuditEvent| {
                e.render()
            })
        }
        None => AsyncLogger::spawn(StdoutSink, |e: &AuditEvent| e.render()),
    })
}
