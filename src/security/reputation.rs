//! Whitelist, blacklist, and ban table.
//!
//! Single IPs live in sharded maps and are found in O(1); CIDR networks are
//! kept in a short read-mostly list that is scanned only when non-empty.
//! Every read treats an expired entry as absent, so a request racing the
//! sweeper always sees the permissive answer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::Serialize;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::MAX_DURATION_SECS;
use crate::error::BlockReason;

/// `now + ttl`, with `ttl` capped at the longest accepted duration.
/// `None` when the monotonic clock cannot represent the deadline.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl.min(Duration::from_secs(MAX_DURATION_SECS)))
}

/// A single IP or a CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReputationTarget(IpNet);

impl ReputationTarget {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }

    /// The address when this target is a single host.
    pub fn host(&self) -> Option<IpAddr> {
        (self.0.prefix_len() == self.0.max_prefix_len()).then(|| self.0.addr())
    }
}

impl From<IpAddr> for ReputationTarget {
    fn from(ip: IpAddr) -> Self {
        ReputationTarget(IpNet::from(ip))
    }
}

impl FromStr for ReputationTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(ip.into());
        }
        s.parse::<IpNet>()
            .map(|net| ReputationTarget(net.trunc()))
            .map_err(|_| format!("'{}' is not an IP address or CIDR network", s))
    }
}

impl std::fmt::Display for ReputationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.host() {
            Some(ip) => write!(f, "{}", ip),
            None => write!(f, "{}", self.0),
        }
    }
}

/// A whitelist or blacklist entry.
#[derive(Debug, Clone)]
pub struct ReputationEntry {
    pub target: ReputationTarget,
    pub reason: String,
    pub created_at: Instant,
    /// `None` means permanent until removed.
    pub expires_at: Option<Instant>,
}

impl ReputationEntry {
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Where a ban came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BanSource {
    Manual,
    Auto,
}

/// A time-bounded ban of one IP.
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub reason: String,
    pub source: BanSource,
    pub banned_at: Instant,
    pub expires_at: Instant,
}

impl BanEntry {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Operator-facing rendering of a reputation entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub ip: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Operator-facing rendering of a ban.
#[derive(Debug, Clone, Serialize)]
pub struct BanView {
    pub ip: IpAddr,
    pub reason: String,
    pub source: BanSource,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Entries removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub bans: usize,
    pub blacklist: usize,
    pub whitelist: usize,
}

#[derive(Debug, Default)]
struct ReputationList {
    hosts: DashMap<IpAddr, ReputationEntry>,
    networks: RwLock<Vec<ReputationEntry>>,
    /// Mirrors `!networks.is_empty()`, updated under the write lock.
    has_networks: AtomicBool,
}

impl ReputationList {
    fn insert(&self, entry: ReputationEntry) {
        match entry.target.host() {
            Some(ip) => {
                self.hosts.insert(ip, entry);
            }
            None => {
                let mut networks = self.networks.write();
                networks.retain(|e| e.target != entry.target);
                networks.push(entry);
                self.has_networks.store(true, Ordering::Release);
            }
        }
    }

    fn remove(&self, target: &ReputationTarget) -> bool {
        match target.host() {
            Some(ip) => self.hosts.remove(&ip).is_some(),
            None => {
                let mut networks = self.networks.write();
                let before = networks.len();
                networks.retain(|e| e.target != *target);
                self.has_networks.store(!networks.is_empty(), Ordering::Release);
                networks.len() != before
            }
        }
    }

    fn find(&self, ip: &IpAddr, now: Instant) -> Option<ReputationEntry> {
        if let Some(entry) = self.hosts.get(ip) {
            if entry.is_live(now) {
                return Some(entry.clone());
            }
        }

        if !self.has_networks.load(Ordering::Acquire) {
            return None;
        }

        let networks = self.networks.read();
        networks
            .iter()
            .find(|e| e.target.contains(ip) && e.is_live(now))
            .cloned()
    }

    fn purge(&self, now: Instant) -> usize {
        let before = self.len();
        self.hosts.retain(|_, e| e.is_live(now));
        let mut networks = self.networks.write();
        networks.retain(|e| e.is_live(now));
        self.has_networks.store(!networks.is_empty(), Ordering::Release);
        drop(networks);
        before.saturating_sub(self.len())
    }

    fn live(&self, now: Instant) -> Vec<ReputationEntry> {
        let mut entries: Vec<ReputationEntry> = self
            .hosts
            .iter()
            .filter(|e| e.is_live(now))
            .map(|e| e.value().clone())
            .collect();
        entries.extend(self.networks.read().iter().filter(|e| e.is_live(now)).cloned());
        entries
    }

    fn len(&self) -> usize {
        self.hosts.len() + self.networks.read().len()
    }
}

/// Whitelist, blacklist, and ban state consulted before any rate limit.
#[derive(Debug)]
pub struct ReputationStore {
    whitelist: ReputationList,
    blacklist: ReputationList,
    bans: DashMap<IpAddr, BanEntry>,
    clock: Arc<dyn Clock>,
}

impl ReputationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            whitelist: ReputationList::default(),
            blacklist: ReputationList::default(),
            bans: DashMap::new(),
            clock,
        }
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.find(ip, self.clock.now()).is_some()
    }

    pub fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.find(ip, self.clock.now()).is_some()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.live_ban(ip, self.clock.now()).is_some()
    }

    /// Why `ip` must be refused, checking the blacklist before bans.
    pub fn block_reason(&self, ip: &IpAddr) -> Option<BlockReason> {
        let now = self.clock.now();
        if let Some(entry) = self.blacklist.find(ip, now) {
            return Some(BlockReason::Blacklisted(entry.reason));
        }
        self.live_ban(ip, now).map(|ban| BlockReason::Banned(ban.reason))
    }

    fn live_ban(&self, ip: &IpAddr, now: Instant) -> Option<BanEntry> {
        let ban = self.bans.get(ip)?;
        ban.is_live(now).then(|| ban.clone())
    }

    /// Blacklist an IP or network. A zero or absent TTL is permanent.
    pub fn add_to_blacklist(&self, target: ReputationTarget, reason: &str, ttl: Option<Duration>) {
        let entry = self.entry(target, reason, ttl);
        info!(entry = %target, reason = %reason, ttl_secs = ?ttl.map(|t| t.as_secs()), "Added to blacklist");
        self.blacklist.insert(entry);
    }

    pub fn remove_from_blacklist(&self, target: &ReputationTarget) -> bool {
        let removed = self.blacklist.remove(target);
        if removed {
            info!(entry = %target, "Removed from blacklist");
        }
        removed
    }

    /// Whitelist an IP or network. A zero or absent TTL is permanent.
    pub fn add_to_whitelist(&self, target: ReputationTarget, ttl: Option<Duration>) {
        let entry = self.entry(target, "whitelisted", ttl);
        info!(entry = %target, ttl_secs = ?ttl.map(|t| t.as_secs()), "Added to whitelist");
        self.whitelist.insert(entry);
    }

    pub fn remove_from_whitelist(&self, target: &ReputationTarget) -> bool {
        let removed = self.whitelist.remove(target);
        if removed {
            info!(entry = %target, "Removed from whitelist");
        }
        removed
    }

    /// Ban an IP for `duration`, replacing any existing ban. Durations
    /// beyond [`MAX_DURATION_SECS`] are capped.
    pub fn ban(&self, ip: IpAddr, reason: &str, duration: Duration, source: BanSource) -> BanEntry {
        let now = self.clock.now();
        let expires_at = deadline(now, duration).unwrap_or_else(|| {
            warn!(ip = %ip, "Ban deadline not representable; ban expires immediately");
            now
        });
        let entry = BanEntry {
            ip,
            reason: reason.to_string(),
            source,
            banned_at: now,
            expires_at,
        };
        self.bans.insert(ip, entry.clone());
        entry
    }

    pub fn unban(&self, ip: &IpAddr) -> bool {
        let removed = self.bans.remove(ip).is_some();
        if removed {
            info!(ip = %ip, "Ban lifted");
        }
        removed
    }

    fn entry(&self, target: ReputationTarget, reason: &str, ttl: Option<Duration>) -> ReputationEntry {
        let now = self.clock.now();
        ReputationEntry {
            target,
            reason: reason.to_string(),
            created_at: now,
            expires_at: ttl
                .filter(|t| !t.is_zero())
                .and_then(|t| deadline(now, t)),
        }
    }

    /// Drop every expired ban and list entry.
    pub fn purge_expired(&self) -> PurgeReport {
        let now = self.clock.now();
        let bans_before = self.bans.len();
        self.bans.retain(|_, ban| ban.is_live(now));

        PurgeReport {
            bans: bans_before.saturating_sub(self.bans.len()),
            blacklist: self.blacklist.purge(now),
            whitelist: self.whitelist.purge(now),
        }
    }

    pub fn whitelist_entries(&self) -> Vec<EntryView> {
        self.views(&self.whitelist)
    }

    pub fn blacklist_entries(&self) -> Vec<EntryView> {
        self.views(&self.blacklist)
    }

    pub fn ban_entries(&self) -> Vec<BanView> {
        let now = self.clock.now();
        let mut bans: Vec<BanView> = self
            .bans
            .iter()
            .filter(|b| b.is_live(now))
            .map(|b| BanView {
                ip: b.ip,
                reason: b.reason.clone(),
                source: b.source,
                banned_at: self.clock.to_wall(b.banned_at),
                expires_at: self.clock.to_wall(b.expires_at),
            })
            .collect();
        bans.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        bans
    }

    fn views(&self, list: &ReputationList) -> Vec<EntryView> {
        let mut views: Vec<EntryView> = list
            .live(self.clock.now())
            .into_iter()
            .map(|e| EntryView {
                ip: e.target.to_string(),
                reason: e.reason,
                created_at: self.clock.to_wall(e.created_at),
                expires_at: e.expires_at.map(|at| self.clock.to_wall(at)),
            })
            .collect();
        views.sort_by(|a, b| a.ip.cmp(&b.ip));
        views
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }
}
