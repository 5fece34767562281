// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metadata store contract
//!
//! The store answers one question: given a kit key, what is the most recent
//! registration row? Rows join the kit registry and the forwarding policy.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{KitId, KitKey};
use crate::error::StoreError;

/// Where a kit's records go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Forwarding {
    /// Archive to the measurement database
    pub database: bool,
    /// Luftdaten forwarding id, if forwarded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub luftdaten: Option<String>,
    /// Publish to the web map
    pub website: bool,
}

/// One registration row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub project: String,
    pub serial: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub dev_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub valid: bool,
    #[serde(default)]
    pub forwarding: Forwarding,
    /// Home location geohash
    #[serde(default)]
    pub home: Option<String>,
    /// Sensors in use
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Kit registry row id
    #[serde(default)]
    pub kit_row: Option<u64>,
    /// Forwarding policy row id
    #[serde(default)]
    pub policy_row: Option<u64>,
    #[serde(default)]
    pub firmware: Option<String>,
    /// Row date, for "as of" ordering
    pub updated: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Registration {
    pub fn kit_id(&self) -> KitId {
        KitId::new(&self.project, &self.serial)
    }

    /// Whether this row answers for the key
    pub fn matches(&self, key: &KitKey) -> bool {
        match key {
            KitKey::Kit(id) => self.project == id.project && self.serial == id.serial,
            KitKey::Transport { app_id, dev_id } => {
                self.app_id.as_deref() == Some(app_id.as_str())
                    && self.dev_id.as_deref() == Some(dev_id.as_str())
            }
        }
    }
}

/// Source of registration rows
pub trait MetadataStore: Send {
    /// Most recent row for the key; `Ok(None)` for an unregistered kit
    fn lookup(&self, key: &KitKey) -> Result<Option<Registration>, StoreError>;

    /// Drop whatever the store itself caches
    fn refresh(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn most_recent<'a>(
    rows: impl Iterator<Item = &'a Registration>,
    key: &KitKey,
) -> Option<Registration> {
    rows.filter(|r| r.matches(key))
        .max_by_key(|r| r.updated)
        .cloned()
}

/// Rows held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    rows: Vec<Registration>,
    outage: Option<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Registration>) -> Self {
        Self { rows, outage: None }
    }

    pub fn insert(&mut self, row: Registration) {
        self.rows.push(row);
    }

    /// Make every lookup fail as unavailable
    pub fn set_outage(&mut self, reason: Option<String>) {
        self.outage = reason;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl MetadataStore for InMemoryStore {
    fn lookup(&self, key: &KitKey) -> Result<Option<Registration>, StoreError> {
        if let Some(reason) = &self.outage {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        Ok(most_recent(self.rows.iter(), key))
    }
}

/// Registration rows read from a JSON file (an array of rows)
///
/// The file is read once on open and again on every refresh.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    rows: Vec<Registration>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let rows = Self::read(&path)?;
        info!(path = %path.display(), rows = rows.len(), "loaded kit registrations");
        Ok(Self { path, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn read(path: &Path) -> Result<Vec<Registration>, StoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
    }
}

impl MetadataStore for JsonFileStore {
    fn lookup(&self, key: &KitKey) -> Result<Option<Registration>, StoreError> {
        Ok(most_recent(self.rows.iter(), key))
    }

    fn refresh(&mut self) -> Result<(), StoreError> {
        self.rows = Self::read(&self.path)?;
        info!(path = %self.path.display(), rows = self.rows.len(), "reloaded kit registrations");
        Ok(())
    }
}
