// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Kit identity cache
//!
//! Maps a transport identity `(application, device)` or a logical identity
//! `(project, serial)` to the kit's registration and running statistics.
//! Entries live for a fixed TTL; the store is only consulted on a miss.
//!
//! Statistics survive refreshes and evictions: an expired entry hands its
//! statistics to its replacement, and an evicted entry parks them in a
//! bounded LRU history until the kit shows up again.
//!
//! Time is passed in explicitly as unix seconds.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::envelope::GatewayInfo;
use crate::error::{CacheError, StoreError};
use crate::store::{Forwarding, MetadataStore, Registration};

/// Initial guess of the sending interval
const INITIAL_INTERVAL: i64 = 240;
/// Interval ceiling
const MAX_INTERVAL: i64 = 1800;
/// Interval assumed after a long silence
const RESET_INTERVAL: i64 = 900;
/// A gap longer than this resets the interval guess
const SILENCE: i64 = 3600;

/// Logical kit identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KitId {
    pub project: String,
    pub serial: String,
}

impl KitId {
    pub fn new(project: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            serial: serial.into(),
        }
    }
}

impl fmt::Display for KitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.project, self.serial)
    }
}

/// Either identity of a kit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KitKey {
    Kit(KitId),
    Transport { app_id: String, dev_id: String },
}

impl KitKey {
    pub fn kit(project: impl Into<String>, serial: impl Into<String>) -> Self {
        Self::Kit(KitId::new(project, serial))
    }

    pub fn transport(app_id: impl Into<String>, dev_id: impl Into<String>) -> Self {
        Self::Transport {
            app_id: app_id.into(),
            dev_id: dev_id.into(),
        }
    }
}

impl fmt::Display for KitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kit(id) => id.fmt(f),
            Self::Transport { app_id, dev_id } => write!(f, "{}/{}", app_id, dev_id),
        }
    }
}

/// Last, lowest and highest value of a signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalRange {
    pub last: f64,
    pub min: f64,
    pub max: f64,
}

impl SignalRange {
    fn new(value: f64) -> Self {
        Self {
            last: value,
            min: value,
            max: value,
        }
    }

    fn update(&mut self, value: f64) {
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// A gateway that heard the kit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewaySeen {
    pub id: String,
    pub rssi: Option<SignalRange>,
    pub snr: Option<SignalRange>,
}

/// Running statistics of a kit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KitStats {
    pub record_count: u64,
    /// Guessed sending interval in seconds
    pub interval: i64,
    /// Best signal first
    pub gateways: Vec<GatewaySeen>,
    pub unknown_fields: BTreeSet<String>,
    pub last_seen: Option<i64>,
}

impl Default for KitStats {
    fn default() -> Self {
        Self {
            record_count: 0,
            interval: INITIAL_INTERVAL,
            gateways: Vec::new(),
            unknown_fields: BTreeSet::new(),
            last_seen: None,
        }
    }
}

impl KitStats {
    /// Account for one record received at `timestamp`
    pub fn observe(&mut self, timestamp: i64, gateways: &[GatewayInfo]) {
        self.record_count += 1;
        if let Some(last) = self.last_seen {
            let gap = timestamp - last;
            if gap > SILENCE {
                self.interval = RESET_INTERVAL;
            } else if gap > 0 {
                self.interval = ((self.interval + gap) / 2).min(MAX_INTERVAL);
            }
        }
        if self.last_seen.map_or(true, |last| timestamp > last) {
            self.last_seen = Some(timestamp);
        }

        for info in gateways {
            let seen = match self.gateways.iter_mut().position(|g| g.id == info.id) {
                Some(i) => &mut self.gateways[i],
                None => {
                    self.gateways.push(GatewaySeen {
                        id: info.id.clone(),
                        rssi: None,
                        snr: None,
                    });
                    let last = self.gateways.len() - 1;
                    &mut self.gateways[last]
                }
            };
            for (range, value) in [(&mut seen.rssi, info.rssi), (&mut seen.snr, info.snr)] {
                if let Some(value) = value {
                    match range {
                        Some(r) => r.update(value),
                        None => *range = Some(SignalRange::new(value)),
                    }
                }
            }
        }
        self.gateways.sort_by(|a, b| {
            let strength = |g: &GatewaySeen| {
                (
                    g.rssi.map_or(f64::MIN, |r| r.last),
                    g.snr.map_or(f64::MIN, |r| r.last),
                )
            };
            strength(b)
                .partial_cmp(&strength(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Remember an unknown field; `true` the first time it is seen
    pub fn note_unknown_field(&mut self, field: &str) -> bool {
        self.unknown_fields.insert(field.to_string())
    }
}

/// A cached kit
#[derive(Debug, Clone, PartialEq)]
pub struct KitEntry {
    pub id: KitId,
    pub app_id: Option<String>,
    pub dev_id: Option<String>,
    /// Unix time the entry expires
    pub ttl: i64,
    pub sensors: Vec<String>,
    pub home: Option<String>,
    pub active: bool,
    pub valid: bool,
    pub forwarding: Forwarding,
    pub kit_row: Option<u64>,
    pub policy_row: Option<u64>,
    pub firmware: Option<String>,
    pub stats: KitStats,
}

impl KitEntry {
    fn from_registration(row: Registration, ttl: i64, stats: KitStats) -> Self {
        Self {
            id: row.kit_id(),
            app_id: row.app_id,
            dev_id: row.dev_id,
            ttl,
            sensors: row.sensors,
            home: row.home,
            active: row.active,
            valid: row.valid,
            forwarding: row.forwarding,
            kit_row: row.kit_row,
            policy_row: row.policy_row,
            firmware: row.firmware,
            stats,
        }
    }

    fn transport(&self) -> Option<(String, String)> {
        Some((self.app_id.clone()?, self.dev_id.clone()?))
    }
}

/// Per-entry summary for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KitStatus {
    pub kit: String,
    pub device: Option<String>,
    pub active: bool,
    pub expires_in: i64,
    pub record_count: u64,
    pub interval: i64,
    pub last_seen: Option<i64>,
    pub unknown_fields: Vec<String>,
}

/// Bounded TTL cache of kit registrations
pub struct KitCache {
    entries: HashMap<KitId, KitEntry>,
    aliases: HashMap<(String, String), KitId>,
    history: LruCache<KitId, KitStats>,
    store: Box<dyn MetadataStore>,
    max_entries: usize,
    ttl: i64,
}

impl KitCache {
    pub fn new(config: &CacheConfig, store: Box<dyn MetadataStore>) -> Self {
        let history = NonZeroUsize::new(config.history.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: HashMap::new(),
            aliases: HashMap::new(),
            history: LruCache::new(history),
            store,
            max_entries: config.max_entries.max(1),
            ttl: config.ttl_secs as i64,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live entry exists for the key, without touching the store
    pub fn contains(&self, key: &KitKey, now: i64) -> bool {
        self.cached_id(key)
            .and_then(|id| self.entries.get(&id))
            .map_or(false, |e| e.ttl > now)
    }

    /// Resolve at the current wall-clock time
    pub fn resolve(&mut self, key: &KitKey) -> Result<&mut KitEntry, CacheError> {
        self.resolve_at(key, chrono::Utc::now().timestamp())
    }

    /// Resolve a key, consulting the store when there is no live entry
    pub fn resolve_at(&mut self, key: &KitKey, now: i64) -> Result<&mut KitEntry, CacheError> {
        let cached = self
            .cached_id(key)
            .filter(|id| self.entries.get(id).map_or(false, |e| e.ttl > now));
        let id = match cached {
            Some(id) => id,
            None => self.load(key, now)?,
        };
        self.entries
            .get_mut(&id)
            .ok_or_else(|| CacheError::UnregisteredKit(key.to_string()))
    }

    /// Force the next resolve of this key to re-query the store
    pub fn invalidate(&mut self, key: &KitKey) -> Result<(), StoreError> {
        if let Some(id) = self.cached_id(key) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.ttl = i64::MIN;
                debug!(kit = %id, "cache entry invalidated");
            }
        }
        self.store.refresh()
    }

    /// Force every entry to re-query the store
    pub fn invalidate_all(&mut self) -> Result<(), StoreError> {
        for entry in self.entries.values_mut() {
            entry.ttl = i64::MIN;
        }
        info!(entries = self.entries.len(), "cache invalidated");
        self.store.refresh()
    }

    /// Summary of every entry, oldest expiry first
    pub fn status(&self, now: i64) -> Vec<KitStatus> {
        let mut entries: Vec<&KitEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.ttl, e.id.clone()));
        entries
            .into_iter()
            .map(|e| KitStatus {
                kit: e.id.to_string(),
                device: e.dev_id.clone(),
                active: e.active,
                expires_in: e.ttl.saturating_sub(now).max(0),
                record_count: e.stats.record_count,
                interval: e.stats.interval,
                last_seen: e.stats.last_seen,
                unknown_fields: e.stats.unknown_fields.iter().cloned().collect(),
            })
            .collect()
    }

    fn cached_id(&self, key: &KitKey) -> Option<KitId> {
        match key {
            KitKey::Kit(id) => Some(id.clone()),
            KitKey::Transport { app_id, dev_id } => self
                .aliases
                .get(&(app_id.clone(), dev_id.clone()))
                .cloned(),
        }
    }

    fn load(&mut self, key: &KitKey, now: i64) -> Result<KitId, CacheError> {
        let row = self
            .store
            .lookup(key)?
            .ok_or_else(|| CacheError::UnregisteredKit(key.to_string()))?;
        let id = row.kit_id();

        let stats = match self.entries.remove(&id) {
            Some(old) => {
                self.drop_alias(&old);
                old.stats
            }
            None => self.history.pop(&id).unwrap_or_default(),
        };

        while self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let entry = KitEntry::from_registration(row, now + self.ttl, stats);
        if let Some(alias) = entry.transport() {
            self.aliases.insert(alias, id.clone());
        }
        debug!(kit = %id, key = %key, "kit loaded from store");
        self.entries.insert(id.clone(), entry);
        Ok(id)
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self
            .entries
            .values()
            .min_by_key(|e| (e.ttl, e.id.clone()))
            .map(|e| e.id.clone())
        else {
            return;
        };
        if let Some(entry) = self.entries.remove(&oldest) {
            self.drop_alias(&entry);
            debug!(kit = %oldest, "evicted from cache");
            self.history.put(oldest, entry.stats);
        }
    }

    /// Forget the entry's transport alias, unless another kit has taken it over
    fn drop_alias(&mut self, entry: &KitEntry) {
        if let Some(alias) = entry.transport() {
            if self.aliases.get(&alias) == Some(&entry.id) {
                self.aliases.remove(&alias);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn row(serial: &str) -> Registration {
        Registration {
            project: "SAN".to_string(),
            serial: serial.to_string(),
            app_id: Some("app".to_string()),
            dev_id: Some(format!("dev-{}", serial)),
            active: true,
            valid: true,
            forwarding: Forwarding::default(),
            home: Some("u1hjus2f2ym".to_string()),
            sensors: vec![],
            kit_row: None,
            policy_row: None,
            firmware: None,
            updated: "2020-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    fn cache(max_entries: usize, ttl_secs: u64, serials: &[&str]) -> KitCache {
        let store = InMemoryStore::with_rows(serials.iter().map(|s| row(s)).collect());
        let config = CacheConfig {
            max_entries,
            ttl_secs,
            history: 16,
        };
        KitCache::new(&config, Box::new(store))
    }

    fn gateway(id: &str, rssi: f64) -> GatewayInfo {
        GatewayInfo {
            id: id.to_string(),
            rssi: Some(rssi),
            snr: Some(5.0),
            geohash: None,
        }
    }

    #[test]
    fn test_both_keys_reach_one_entry() {
        let mut cache = cache(10, 100, &["0001"]);
        cache
            .resolve_at(&KitKey::kit("SAN", "0001"), 0)
            .unwrap()
            .stats
            .observe(0, &[]);
        let entry = cache
            .resolve_at(&KitKey::transport("app", "dev-0001"), 1)
            .unwrap();
        assert_eq!(entry.id, KitId::new("SAN", "0001"));
        assert_eq!(entry.stats.record_count, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_keeps_alias_moved_to_another_kit() {
        let mut moved = row("0002");
        moved.dev_id = Some("dev-0001".to_string());
        let store = InMemoryStore::with_rows(vec![row("0001"), moved, row("0003")]);
        let config = CacheConfig {
            max_entries: 2,
            ttl_secs: 100,
            history: 16,
        };
        let mut cache = KitCache::new(&config, Box::new(store));
        let device = KitKey::transport("app", "dev-0001");

        cache.resolve_at(&KitKey::kit("SAN", "0001"), 0).unwrap();
        cache.resolve_at(&KitKey::kit("SAN", "0002"), 10).unwrap();
        // the oldest entry, 0001, makes room for 0003
        cache.resolve_at(&KitKey::kit("SAN", "0003"), 20).unwrap();
        assert!(!cache.contains(&KitKey::kit("SAN", "0001"), 20));

        assert!(cache.contains(&device, 20));
        assert_eq!(
            cache.resolve_at(&device, 20).unwrap().id,
            KitId::new("SAN", "0002")
        );
    }

    #[test]
    fn test_unregistered_kit() {
        let mut cache = cache(10, 100, &[]);
        assert_eq!(
            cache.resolve_at(&KitKey::kit("SAN", "deadbeef0001"), 0),
            Err(CacheError::UnregisteredKit("SAN_deadbeef0001".to_string()))
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_carried_over_expiry() {
        let mut cache = cache(10, 100, &["0001"]);
        let key = KitKey::kit("SAN", "0001");
        cache.resolve_at(&key, 0).unwrap().stats.observe(0, &[]);
        cache.resolve_at(&key, 60).unwrap().stats.observe(60, &[]);

        // expired: reloaded, statistics kept
        let entry = cache.resolve_at(&key, 500).unwrap();
        assert_eq!(entry.ttl, 600);
        assert_eq!(entry.stats.record_count, 2);
        assert_eq!(entry.stats.last_seen, Some(60));
    }

    #[test]
    fn test_invalidate_bypasses_ttl() {
        let mut cache = cache(10, 100, &["0001"]);
        let key = KitKey::transport("app", "dev-0001");
        assert_eq!(cache.resolve_at(&key, 0).unwrap().ttl, 100);
        assert!(cache.contains(&key, 50));

        cache.invalidate(&key).unwrap();
        assert!(!cache.contains(&key, 50));
        assert_eq!(cache.resolve_at(&key, 50).unwrap().ttl, 150);
    }

    #[test]
    fn test_interval_guess() {
        let mut stats = KitStats::default();
        stats.observe(1000, &[]);
        assert_eq!(stats.interval, 240);
        stats.observe(1300, &[]);
        assert_eq!(stats.interval, 270);
        stats.observe(5000, &[]);
        assert_eq!(stats.interval, 900);
        stats.observe(8000, &[]);
        assert_eq!(stats.interval, 1800);
        assert_eq!(stats.record_count, 4);
        assert_eq!(stats.last_seen, Some(8000));
    }

    #[test]
    fn test_gateways_best_first() {
        let mut stats = KitStats::default();
        stats.observe(0, &[gateway("far", -115.0), gateway("near", -80.0)]);
        stats.observe(300, &[gateway("far", -100.0)]);
        stats.observe(600, &[gateway("far", -70.0)]);
        assert_eq!(stats.gateways[0].id, "far");
        let far = stats.gateways[0].rssi.unwrap();
        assert_eq!((far.last, far.min, far.max), (-70.0, -115.0, -70.0));
        assert_eq!(stats.gateways[1].id, "near");
    }

    #[test]
    fn test_unknown_field_once() {
        let mut stats = KitStats::default();
        assert!(stats.note_unknown_field("pm7"));
        assert!(!stats.note_unknown_field("pm7"));
    }
}
