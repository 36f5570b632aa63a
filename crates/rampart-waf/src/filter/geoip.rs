//! GeoIP country gating.
//!
//! Looks countries up in an MMDB database with an in-process reader and a
//! 1-hour TTL cache. Private IPs and lookup errors resolve to `None` and
//! allow. When no database is configured the gate allows every IP and says
//! so once at startup.

use crate::memory::{BoundedLruCache, MemoryModule, MemoryTracker};
use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CACHE_TTL: Duration = Duration::from_secs(3600);
const CACHE_MAX_ENTRIES: usize = 100_000;

/// Country information extracted from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryInfo {
    pub country_code: String,
    pub country_name: String,
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoDecision {
    pub blocked: bool,
    pub reason: Option<String>,
    pub country_code: Option<String>,
}

impl GeoDecision {
    fn allow(code: Option<String>) -> Self {
        Self {
            blocked: false,
            reason: None,
            country_code: code,
        }
    }
}

enum CacheSlot {
    Known(CountryInfo),
    /// Lookup failed or the IP is private; cached to avoid re-probing.
    Unknown,
}

impl Clone for CacheSlot {
    fn clone(&self) -> Self {
        match self {
            CacheSlot::Known(info) => CacheSlot::Known(info.clone()),
            CacheSlot::Unknown => CacheSlot::Unknown,
        }
    }
}

/// Country gate with allow/block lists.
pub struct GeoIpGate {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    allowed_countries: Vec<String>,
    blocked_countries: Vec<String>,
    cache: BoundedLruCache<IpAddr, CacheSlot>,
}

impl GeoIpGate {
    /// Open the database. A missing or unreadable database produces a
    /// disabled gate that allows everything.
    pub fn new(
        db_path: Option<&Path>,
        allowed_countries: Vec<String>,
        blocked_countries: Vec<String>,
        tracker: Arc<MemoryTracker>,
    ) -> Self {
        let reader = match db_path {
            Some(path) => match maxminddb::Reader::open_readfile(path) {
                Ok(r) => {
                    info!(db = %path.display(), "geoip database loaded");
                    Some(r)
                }
                Err(e) => {
                    warn!(db = %path.display(), error = %e, "geoip database unavailable, gate disabled (allow all)");
                    None
                }
            },
            None => {
                info!("geoip gate disabled: no database configured (allow all)");
                None
            }
        };

        Self {
            reader,
            allowed_countries: to_upper(allowed_countries),
            blocked_countries: to_upper(blocked_countries),
            cache: BoundedLruCache::new(MemoryModule::GeoIp, tracker, CACHE_MAX_ENTRIES),
        }
    }

    pub fn enabled(&self) -> bool {
        self.reader.is_some()
    }

    /// Country for an IP, through the TTL cache. Private IPs and lookup
    /// errors yield `None`.
    pub fn lookup(&self, ip: IpAddr) -> Option<CountryInfo> {
        let reader = self.reader.as_ref()?;

        if is_private(ip) {
            return None;
        }

        if let Some(slot) = self.cache.get(&ip) {
            return match slot {
                CacheSlot::Known(info) => Some(info),
                CacheSlot::Unknown => None,
            };
        }

        let resolved = match reader.lookup::<geoip2::Country>(ip) {
            Ok(country) => country.country.and_then(|c| {
                let code = c.iso_code?;
                let name = c
                    .names
                    .and_then(|n| n.get("en").copied())
                    .unwrap_or(code)
                    .to_string();
                Some(CountryInfo {
                    country_code: code.to_string(),
                    country_name: name,
                })
            }),
            Err(e) => {
                debug!(%ip, error = %e, "geoip lookup failed");
                None
            }
        };

        let slot = match &resolved {
            Some(info) => CacheSlot::Known(info.clone()),
            None => CacheSlot::Unknown,
        };
        // ~key + two short strings; a fixed conservative estimate.
        self.cache.insert(ip, slot, 96);
        resolved
    }

    /// Gate decision. With a non-empty allow list only listed countries
    /// pass; otherwise the block list denies its members; everything else
    /// (including unknown) passes.
    pub fn decision(&self, ip: IpAddr) -> GeoDecision {
        if self.reader.is_none() {
            return GeoDecision::allow(None);
        }

        let info = match self.lookup(ip) {
            Some(i) => i,
            None => return GeoDecision::allow(None),
        };

        if !self.allowed_countries.is_empty() {
            if self.allowed_countries.contains(&info.country_code) {
                return GeoDecision::allow(Some(info.country_code));
            }
            return GeoDecision {
                blocked: true,
                reason: Some(format!(
                    "country {} not in allowed list",
                    info.country_code
                )),
                country_code: Some(info.country_code),
            };
        }

        if self.blocked_countries.contains(&info.country_code) {
            return GeoDecision {
                blocked: true,
                reason: Some(format!("country {} is blocked", info.country_code)),
                country_code: Some(info.country_code),
            };
        }

        GeoDecision::allow(Some(info.country_code))
    }

    /// Drop cache entries older than the TTL. Called by the periodic
    /// maintenance task.
    pub fn sweep_cache(&self) -> usize {
        self.cache.evict_older_than(CACHE_TTL)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn to_upper(list: Vec<String>) -> Vec<String> {
    list.into_iter().map(|c| c.to_ascii_uppercase()).collect()
}

/// Loopback, RFC1918, link-local, and IPv6 unique-local/link-local
/// addresses are never looked up.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link local
        }
    }
}
