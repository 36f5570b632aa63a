//! Per-request variable extraction into pooled, preallocated buffers.
//!
//! A [`VariableSnapshot`] owns fixed-capacity string buffers sized to the
//! extraction bounds; `reset()` clears lengths without freeing backing
//! storage, so the steady-state hotpath performs no allocation. Snapshots
//! are leased from a bounded [`SnapshotPool`] and returned by an RAII guard
//! on every exit path.

use super::model::VariableType;
use hyper::HeaderMap;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const MAX_ARGS: usize = 128;
pub const MAX_HEADERS: usize = 64;
pub const MAX_COOKIES: usize = 32;
pub const MAX_VALUE_LEN: usize = 8 * 1024;
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Pool depth. Acquire falls back to a fresh snapshot when drained.
pub const POOL_SIZE: usize = 256;

/// Fixed-slot string storage: `len` live entries over preallocated buffers.
struct FixedStrings {
    bufs: Vec<String>,
    len: usize,
}

impl FixedStrings {
    fn with_capacity(slots: usize, value_capacity: usize) -> Self {
        Self {
            bufs: (0..slots)
                .map(|_| String::with_capacity(value_capacity))
                .collect(),
            len: 0,
        }
    }

    /// Write the concatenation of `parts` into the next slot, truncated to
    /// `MAX_VALUE_LEN`. Silently drops the entry when all slots are used.
    fn push_parts(&mut self, parts: &[&str]) {
        if self.len >= self.bufs.len() {
            return;
        }
        let buf = &mut self.bufs[self.len];
        buf.clear();
        for part in parts {
            let remaining = MAX_VALUE_LEN - buf.len();
            if remaining == 0 {
                break;
            }
            buf.push_str(truncate_str(part, remaining));
        }
        self.len += 1;
    }

    fn values(&self) -> &[String] {
        &self.bufs[..self.len]
    }

    fn reset(&mut self) {
        // Buffers keep their capacity; only the live count resets.
        self.len = 0;
    }
}

/// Truncate at a char boundary so multi-byte input cannot split.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A per-request materialization of every extractable variable.
pub struct VariableSnapshot {
    request_line: String,
    filename: String,
    basename: String,
    args: FixedStrings,
    args_names: FixedStrings,
    headers: FixedStrings,
    /// Lowercased header names, parallel to `headers`, for whitelists.
    header_names: FixedStrings,
    cookie: String,
    cookie_names: FixedStrings,
    body: String,
}

impl VariableSnapshot {
    pub fn new() -> Self {
        Self {
            request_line: String::with_capacity(MAX_VALUE_LEN),
            filename: String::with_capacity(1024),
            basename: String::with_capacity(256),
            args: FixedStrings::with_capacity(MAX_ARGS, 64),
            args_names: FixedStrings::with_capacity(MAX_ARGS, 32),
            headers: FixedStrings::with_capacity(MAX_HEADERS, 128),
            header_names: FixedStrings::with_capacity(MAX_HEADERS, 32),
            cookie: String::with_capacity(1024),
            cookie_names: FixedStrings::with_capacity(MAX_COOKIES, 32),
            body: String::new(),
        }
    }

    /// Clear all lengths; backing storage is retained for reuse.
    pub fn reset(&mut self) {
        self.request_line.clear();
        self.filename.clear();
        self.basename.clear();
        self.args.reset();
        self.args_names.reset();
        self.headers.reset();
        self.header_names.reset();
        self.cookie.clear();
        self.cookie_names.reset();
        self.body.clear();
    }

    /// Fill every buffer from the request parts. `path_and_query` is the
    /// origin-form target (`/search?q=1`); `body` is truncated to
    /// `body_limit` bytes.
    pub fn populate(
        &mut self,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: &[u8],
        body_limit: usize,
    ) {
        self.reset();

        // REQUEST_LINE
        self.request_line.push_str(truncate_str(method, 32));
        self.request_line.push(' ');
        let remaining = MAX_VALUE_LEN.saturating_sub(self.request_line.len() + 9);
        self.request_line
            .push_str(truncate_str(path_and_query, remaining));
        self.request_line.push_str(" HTTP/1.1");

        // REQUEST_FILENAME / REQUEST_BASENAME
        let path = match path_and_query.find('?') {
            Some(q) => &path_and_query[..q],
            None => path_and_query,
        };
        self.filename.push_str(truncate_str(path, 1024));
        let base = path.rsplit('/').next().unwrap_or("");
        self.basename.push_str(truncate_str(base, 256));

        // ARGS / ARGS_NAMES from the query string
        if let Some(q) = path_and_query.find('?') {
            let query = &path_and_query[q + 1..];
            for token in query.split('&') {
                if token.is_empty() {
                    continue;
                }
                self.args.push_parts(&[token]);
                let name = match token.find('=') {
                    Some(eq) => &token[..eq],
                    None => token,
                };
                self.args_names.push_parts(&[name]);
            }
        }

        // HEADERS in `Key: value` form plus the lowercase-name index
        for (name, value) in headers.iter() {
            let value = match value.to_str() {
                Ok(v) => v,
                Err(_) => continue, // non-UTF-8 header values are not inspected
            };
            self.headers.push_parts(&[name.as_str(), ": ", value]);
            self.header_names.push_parts(&[name.as_str()]);
        }

        // COOKIE / COOKIE_NAMES
        if let Some(cookie) = headers.get(hyper::header::COOKIE) {
            if let Ok(raw) = cookie.to_str() {
                self.cookie.push_str(truncate_str(raw, MAX_VALUE_LEN));
                self.parse_cookie_names();
            }
        }

        // BODY, truncated
        let body = &body[..body.len().min(body_limit)];
        match std::str::from_utf8(body) {
            Ok(s) => self.body.push_str(s),
            Err(e) => {
                // Inspect the valid prefix; binary tails are not matchable.
                let valid = e.valid_up_to();
                self.body
                    .push_str(std::str::from_utf8(&body[..valid]).unwrap_or(""));
            }
        }
    }

    /// Scan the cookie header by indices, emitting names as borrowed slices
    /// straight into the preallocated buffers. No intermediate strings.
    fn parse_cookie_names(&mut self) {
        let raw = &self.cookie;
        let names = &mut self.cookie_names;
        let bytes = raw.as_bytes();
        let mut start = 0;
        let mut i = 0;
        while i <= bytes.len() {
            let at_end = i == bytes.len();
            if at_end || bytes[i] == b';' {
                let segment = &raw[start..i];
                let name_end = segment.find('=').unwrap_or(segment.len());
                let name = segment[..name_end].trim();
                if !name.is_empty() {
                    names.push_parts(&[name]);
                }
                start = i + 1;
            }
            i += 1;
        }
    }

    /// Borrowed values for a variable type.
    pub fn get_values(&self, var_type: VariableType) -> &[String] {
        match var_type {
            VariableType::RequestLine => std::slice::from_ref(&self.request_line),
            VariableType::RequestFilename => std::slice::from_ref(&self.filename),
            VariableType::RequestBasename => std::slice::from_ref(&self.basename),
            VariableType::Args => self.args.values(),
            VariableType::ArgsNames => self.args_names.values(),
            VariableType::Headers => self.headers.values(),
            VariableType::Cookie => std::slice::from_ref(&self.cookie),
            VariableType::CookieNames => self.cookie_names.values(),
            VariableType::Body => std::slice::from_ref(&self.body),
        }
    }

    /// Header values filtered by a case-insensitive name whitelist.
    pub fn get_values_for_headers<'a>(
        &'a self,
        names: &'a [String],
    ) -> impl Iterator<Item = &'a String> {
        self.headers
            .values()
            .iter()
            .zip(self.header_names.values().iter())
            .filter(move |(_, header_name)| {
                names
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(header_name.as_str()))
            })
            .map(|(line, _)| line)
    }
}

impl Default for VariableSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool statistics.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub acquired: u64,
    pub overflow: u64,
}

/// Bounded pool of preallocated snapshots.
pub struct SnapshotPool {
    tx: mpsc::Sender<Box<VariableSnapshot>>,
    rx: Mutex<mpsc::Receiver<Box<VariableSnapshot>>>,
    acquired: AtomicU64,
    overflow: AtomicU64,
}

impl SnapshotPool {
    pub fn new() -> Arc<Self> {
        Self::with_size(POOL_SIZE)
    }

    pub fn with_size(size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(size);
        for _ in 0..size {
            // Channel capacity equals the fill count; sends cannot fail.
            let _ = tx.try_send(Box::new(VariableSnapshot::new()));
        }
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            acquired: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
        })
    }

    /// Lease a snapshot: pooled when available, freshly constructed when
    /// the pool is drained (counted as overflow).
    pub fn acquire(self: &Arc<Self>) -> SnapshotLease {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let snapshot = match self.rx.lock().try_recv() {
            Ok(s) => s,
            Err(_) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                Box::new(VariableSnapshot::new())
            }
        };
        SnapshotLease {
            snapshot: Some(snapshot),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut snapshot: Box<VariableSnapshot>) {
        snapshot.reset();
        // Dropped when the pool is already full.
        let _ = self.tx.try_send(snapshot);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
        }
    }
}

/// RAII lease; returns the snapshot to its pool on drop.
pub struct SnapshotLease {
    snapshot: Option<Box<VariableSnapshot>>,
    pool: Arc<SnapshotPool>,
}

impl Deref for SnapshotLease {
    type Target = VariableSnapshot;
    fn deref(&self) -> &Self::Target {
        self.snapshot.as_deref().expect("lease is live until drop")
    }
}

impl DerefMut for SnapshotLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.snapshot
            .as_deref_mut()
            .expect("lease is live until drop")
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        if let Some(s) = self.snapshot.take() {
            self.pool.release(s);
        }
    }
}
