//! ACME HTTP-01 challenge cache.
//!
//! Issuance and renewal live in an external collaborator; the core only
//! stores `token -> key authorization` pairs with a TTL and serves them at
//! `/.well-known/acme-challenge/{token}`. Storage is charged to the
//! ChallengeCache memory module.

use crate::memory::{BoundedLruCache, MemoryModule, MemoryTracker};
use std::sync::Arc;
use std::time::Duration;

/// Challenges are short-lived; an hour covers validation retries.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(3600);
const MAX_CHALLENGES: usize = 10_000;

pub const ACME_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

pub struct ChallengeCache {
    entries: BoundedLruCache<String, String>,
}

impl ChallengeCache {
    pub fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self {
            entries: BoundedLruCache::new(MemoryModule::ChallengeCache, tracker, MAX_CHALLENGES),
        }
    }

    /// Register a token. Returns false when the cache refused the entry
    /// (memory pressure); the caller degrades by re-registering later.
    pub fn register(&self, token: &str, key_authorization: &str) -> bool {
        let bytes = token.len() + key_authorization.len() + 64;
        self.entries
            .insert(token.to_string(), key_authorization.to_string(), bytes)
    }

    /// Key authorization for a token, if registered and fresh.
    pub fn lookup(&self, token: &str) -> Option<String> {
        self.entries.get(&token.to_string())
    }

    /// Token from a request path, when it is an ACME challenge path.
    pub fn token_from_path(path: &str) -> Option<&str> {
        let token = path.strip_prefix(ACME_PATH_PREFIX)?;
        if token.is_empty() || token.contains('/') {
            return None;
        }
        Some(token)
    }

    /// Drop expired challenges. Called by periodic maintenance.
    pub fn sweep(&self) -> usize {
        self.entries.evict_older_than(CHALLENGE_TTL)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
