// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Accepted measurement names

use std::collections::{HashMap, HashSet};

use aqlink::RuleTable;

use crate::config::SchemaConfig;

/// Names accepted besides those the rule table emits, mostly for fields
/// the network server decodes itself
const COMMON_FIELDS: &[&str] = &[
    "pm1", "pm25", "pm10", "pm03_cnt", "pm05_cnt", "pm1_cnt", "pm25_cnt", "pm4_cnt", "pm5_cnt",
    "pm10_cnt", "grain", "temp", "rv", "luchtdruk", "gas", "aqi", "voc", "geohash", "alt", "ws",
    "wr", "rain", "accu", "version", "time", "event", "value", "dust", "meteo", "gps",
];

const COMMON_ALIASES: &[(&str, &str)] = &[
    ("pm2.5", "pm25"),
    ("pm2_5", "pm25"),
    ("pm1.0", "pm1"),
    ("pm10.0", "pm10"),
    ("temperature", "temp"),
    ("humidity", "rv"),
    ("rh", "rv"),
    ("pressure", "luchtdruk"),
    ("altitude", "alt"),
    ("wind_speed", "ws"),
    ("wind_direction", "wr"),
    ("battery", "accu"),
];

/// Accepted names plus alternative spellings
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    known: HashSet<String>,
    aliases: HashMap<String, String>,
}

impl FieldSchema {
    /// Names the rules emit, the common names and any configured extras
    pub fn new(rules: &RuleTable, config: &SchemaConfig) -> Self {
        let mut schema = Self::default();
        schema.known.extend(rules.field_names());
        schema
            .known
            .extend(COMMON_FIELDS.iter().map(|f| f.to_string()));
        schema
            .known
            .extend(config.fields.iter().map(|f| f.to_ascii_lowercase()));
        for (alias, name) in COMMON_ALIASES {
            schema.aliases.insert(alias.to_string(), name.to_string());
        }
        for (alias, name) in &config.aliases {
            schema
                .aliases
                .insert(alias.to_ascii_lowercase(), name.to_ascii_lowercase());
        }
        schema
    }

    /// Accepted name for a field; `None` when the field is unknown
    pub fn canonical(&self, name: &str) -> Option<String> {
        if self.known.contains(name) {
            return Some(name.to_string());
        }
        let lower = name.to_ascii_lowercase();
        let lower = self.aliases.get(&lower).cloned().unwrap_or(lower);
        self.known.contains(&lower).then_some(lower)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
