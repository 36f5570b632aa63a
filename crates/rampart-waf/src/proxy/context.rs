//! Per-request tracing.
//!
//! A [`RequestTrace`] records twelve named timepoints as monotonic
//! nanoseconds (relative to process start), a ray id, and a small metadata
//! map. Traces are pooled with the same lease discipline as variable
//! snapshots; the handler stamps points as the pipeline advances and emits
//! derived durations on completion.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub const TRACE_POOL_SIZE: usize = 256;
const METADATA_CAP: usize = 8;

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// The fixed set of trace points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    Start,
    DnsComplete,
    LbComplete,
    WafStart,
    WafComplete,
    BackendStart,
    BackendComplete,
    ResponseStart,
    ResponseComplete,
    GcStart,
    GcComplete,
    End,
}

impl TracePoint {
    pub const COUNT: usize = 12;

    fn index(self) -> usize {
        match self {
            TracePoint::Start => 0,
            TracePoint::DnsComplete => 1,
            TracePoint::LbComplete => 2,
            TracePoint::WafStart => 3,
            TracePoint::WafComplete => 4,
            TracePoint::BackendStart => 5,
            TracePoint::BackendComplete => 6,
            TracePoint::ResponseStart => 7,
            TracePoint::ResponseComplete => 8,
            TracePoint::GcStart => 9,
            TracePoint::GcComplete => 10,
            TracePoint::End => 11,
        }
    }
}

/// Durations derived from a completed trace, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceDurations {
    pub total_ms: f64,
    pub waf_ms: f64,
    pub backend_ms: f64,
    pub response_ms: f64,
}

/// One request's timeline. Zeroed timepoints mean "not reached".
pub struct RequestTrace {
    points: [u64; TracePoint::COUNT],
    ray_id: String,
    metadata: Vec<(String, String)>,
}

impl RequestTrace {
    pub fn new() -> Self {
        Self {
            points: [0; TracePoint::COUNT],
            ray_id: String::with_capacity(36),
            metadata: Vec::with_capacity(METADATA_CAP),
        }
    }

    /// Reset and begin a new timeline with a fresh ray id.
    pub fn begin(&mut self) {
        self.points = [0; TracePoint::COUNT];
        self.ray_id.clear();
        self.metadata.clear();
        // uuid's fmt writes into the buffer; no persistent allocation.
        use std::fmt::Write;
        let _ = write!(self.ray_id, "{}", uuid::Uuid::new_v4());
        self.mark(TracePoint::Start);
    }

    /// Stamp a point with the current monotonic time.
    pub fn mark(&mut self, point: TracePoint) {
        self.points[point.index()] = monotonic_nanos();
    }

    pub fn get(&self, point: TracePoint) -> Option<u64> {
        match self.points[point.index()] {
            0 => None,
            n => Some(n),
        }
    }

    pub fn ray_id(&self) -> &str {
        &self.ray_id
    }

    /// Attach a small piece of metadata; silently capped.
    pub fn annotate(&mut self, key: &str, value: &str) {
        if self.metadata.len() < METADATA_CAP {
            self.metadata.push((key.to_string(), value.to_string()));
        }
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    /// Derived durations; spans whose endpoints were not reached are zero.
    pub fn durations(&self) -> TraceDurations {
        let span_ms = |a: TracePoint, b: TracePoint| -> f64 {
            match (self.get(a), self.get(b)) {
                (Some(start), Some(end)) if end >= start => (end - start) as f64 / 1_000_000.0,
                _ => 0.0,
            }
        };
        TraceDurations {
            total_ms: span_ms(TracePoint::Start, TracePoint::End),
            waf_ms: span_ms(TracePoint::WafStart, TracePoint::WafComplete),
            backend_ms: span_ms(TracePoint::BackendStart, TracePoint::BackendComplete),
            response_ms: span_ms(TracePoint::ResponseStart, TracePoint::ResponseComplete),
        }
    }
}

impl Default for RequestTrace {
    fn default() -> Self {
        Self::new()
    }
}

fn monotonic_nanos() -> u64 {
    PROCESS_EPOCH.elapsed().as_nanos() as u64
}

/// Bounded pool of traces, mirroring the variable-snapshot pool.
pub struct TracePool {
    tx: mpsc::Sender<Box<RequestTrace>>,
    rx: Mutex<mpsc::Receiver<Box<RequestTrace>>>,
    overflow: AtomicU64,
}

impl TracePool {
    pub fn new() -> Arc<Self> {
        Self::with_size(TRACE_POOL_SIZE)
    }

    pub fn with_size(size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(size);
        for _ in 0..size {
            let _ = tx.try_send(Box::new(RequestTrace::new()));
        }
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            overflow: AtomicU64::new(0),
        })
    }

    /// Lease a trace, already `begin()`-stamped.
    pub fn acquire(self: &Arc<Self>) -> TraceLease {
        let mut trace = match self.rx.lock().try_recv() {
            Ok(t) => t,
            Err(_) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                Box::new(RequestTrace::new())
            }
        };
        trace.begin();
        TraceLease {
            trace: Some(trace),
            pool: Arc::clone(self),
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// RAII lease; the trace returns to its pool on drop.
pub struct TraceLease {
    trace: Option<Box<RequestTrace>>,
    pool: Arc<TracePool>,
}

impl Deref for TraceLease {
    type Target = RequestTrace;
    fn deref(&self) -> &Self::Target {
        self.trace.as_deref().expect("lease is live until drop")
    }
}

impl DerefMut for TraceLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.trace.as_deref_mut().expect("lease is live until drop")
    }
}

impl Drop for TraceLease {
    fn drop(&mut self) {
        if let Some(trace) = self.trace.take() {
            let _ = self.pool.tx.try_send(trace);
        }
    }
}
