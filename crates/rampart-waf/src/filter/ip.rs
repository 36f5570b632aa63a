//! IP admission filtering.
//!
//! Exact-match whitelists/blacklists are hash sets; CIDR matching uses a
//! binary radix tree for IPv4 (level `n` branches on bit `31-n`, terminal
//! nodes hold the prefix, lookup is longest-prefix) and a linear
//! exact-equality scan for IPv6. Decision priority is fixed:
//! whitelist-exact, whitelist-CIDR, blacklist-exact, blacklist-CIDR,
//! default allow.

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{info, warn};

/// Filter verdict with the list that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpDecision {
    pub allowed: bool,
    /// "whitelist", "blacklist", or "default".
    pub source: &'static str,
}

impl IpDecision {
    const ALLOW_WHITELIST: IpDecision = IpDecision {
        allowed: true,
        source: "whitelist",
    };
    const DENY_BLACKLIST: IpDecision = IpDecision {
        allowed: false,
        source: "blacklist",
    };
    const ALLOW_DEFAULT: IpDecision = IpDecision {
        allowed: true,
        source: "default",
    };
}

#[derive(Debug, Default)]
struct RadixNode {
    children: [Option<Box<RadixNode>>; 2],
    /// Terminal marker: the network this node completes.
    terminal: Option<(Ipv4Addr, u8)>,
}

/// Binary radix tree over IPv4 prefixes.
#[derive(Debug, Default)]
pub struct Ipv4RadixTree {
    root: RadixNode,
    len: usize,
}

impl Ipv4RadixTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a network, walking `prefix_len` bits MSB-first and marking
    /// the final node terminal.
    pub fn insert(&mut self, net: Ipv4Net) {
        let addr = u32::from(net.network());
        let prefix_len = net.prefix_len();

        let mut node = &mut self.root;
        for level in 0..prefix_len {
            let bit = ((addr >> (31 - level)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Box::default);
        }
        if node.terminal.is_none() {
            self.len += 1;
        }
        node.terminal = Some((net.network(), prefix_len));
    }

    /// Longest-prefix match: walk until a child is missing or all 32 bits
    /// are consumed, remembering the last terminal node passed.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<(Ipv4Addr, u8)> {
        let addr = u32::from(ip);
        let mut node = &self.root;
        let mut best = node.terminal;

        for level in 0..32 {
            let bit = ((addr >> (31 - level)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if node.terminal.is_some() {
                        best = node.terminal;
                    }
                }
                None => break,
            }
        }
        best
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.lookup(ip).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
struct FilterState {
    exact_whitelist: HashSet<IpAddr>,
    exact_blacklist: HashSet<IpAddr>,
    cidr_whitelist: Ipv4RadixTree,
    cidr_blacklist: Ipv4RadixTree,
    /// IPv6 networks, matched by exact network-address equality only.
    v6_whitelist: Vec<Ipv6Addr>,
    v6_blacklist: Vec<Ipv6Addr>,
}

impl FilterState {
    fn add_entry(&mut self, entry: &str, whitelist: bool) -> bool {
        if entry.contains('/') {
            if let Ok(net) = entry.parse::<Ipv4Net>() {
                if whitelist {
                    self.cidr_whitelist.insert(net);
                } else {
                    self.cidr_blacklist.insert(net);
                }
                return true;
            }
            // IPv6 CIDR: stored by network address, exact equality only.
            if let Ok(net) = entry.parse::<ipnet::Ipv6Net>() {
                if whitelist {
                    self.v6_whitelist.push(net.network());
                } else {
                    self.v6_blacklist.push(net.network());
                }
                return true;
            }
            return false;
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            if whitelist {
                self.exact_whitelist.insert(ip);
            } else {
                self.exact_blacklist.insert(ip);
            }
            return true;
        }
        false
    }

    fn check(&self, ip: IpAddr) -> IpDecision {
        // 1. exact whitelist
        if self.exact_whitelist.contains(&ip) {
            return IpDecision::ALLOW_WHITELIST;
        }
        // 2. CIDR whitelist
        if self.cidr_hit(ip, true) {
            return IpDecision::ALLOW_WHITELIST;
        }
        // 3. exact blacklist
        if self.exact_blacklist.contains(&ip) {
            return IpDecision::DENY_BLACKLIST;
        }
        // 4. CIDR blacklist
        if self.cidr_hit(ip, false) {
            return IpDecision::DENY_BLACKLIST;
        }
        // 5. default
        IpDecision::ALLOW_DEFAULT
    }

    fn cidr_hit(&self, ip: IpAddr, whitelist: bool) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                if whitelist {
                    self.cidr_whitelist.contains(v4)
                } else {
                    self.cidr_blacklist.contains(v4)
                }
            }
            IpAddr::V6(v6) => {
                let list = if whitelist {
                    &self.v6_whitelist
                } else {
                    &self.v6_blacklist
                };
                list.iter().any(|net| *net == v6)
            }
        }
    }
}

/// The admission IP filter. Reads are frequent; the whole state is
/// replaced on reload, so a single lock over everything is fine.
pub struct IpFilter {
    enabled: bool,
    state: RwLock<FilterState>,
}

impl IpFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: RwLock::new(FilterState::default()),
        }
    }

    /// Build from the configured list files. Missing files load as empty
    /// lists with a warning.
    pub fn from_files(
        enabled: bool,
        whitelist_file: Option<&Path>,
        blacklist_file: Option<&Path>,
    ) -> Self {
        let filter = Self::new(enabled);
        if let Some(path) = whitelist_file {
            filter.load_list(path, true);
        }
        if let Some(path) = blacklist_file {
            filter.load_list(path, false);
        }
        filter
    }

    /// Parse a line-oriented list file: `#` comments, `/`-tokens are CIDR,
    /// everything else a literal IP. Malformed lines warn and are skipped.
    pub fn load_list(&self, path: &Path, whitelist: bool) {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "ip list unreadable, loading empty");
                return;
            }
        };
        let mut state = self.state.write();
        let mut loaded = 0usize;
        for line in content.lines() {
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }
            if state.add_entry(entry, whitelist) {
                loaded += 1;
            } else {
                warn!(file = %path.display(), entry, "skipping malformed ip list entry");
            }
        }
        info!(
            file = %path.display(),
            entries = loaded,
            list = if whitelist { "whitelist" } else { "blacklist" },
            "ip list loaded"
        );
    }

    /// Add a single entry at runtime (tests and admin hooks).
    pub fn add(&self, entry: &str, whitelist: bool) -> bool {
        self.state.write().add_entry(entry, whitelist)
    }

    /// Decide for a client IP string. Unparseable IPs (including the
    /// "unknown" placeholder) default to allow.
    pub fn check(&self, ip: &str) -> IpDecision {
        if !self.enabled {
            return IpDecision::ALLOW_DEFAULT;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) => self.state.read().check(addr),
            Err(_) => IpDecision::ALLOW_DEFAULT,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}
