// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! The record handed to publishers

use std::collections::BTreeMap;

use serde::Serialize;

use aqlink::Group;

use crate::cache::KitId;
use crate::envelope::{Envelope, GatewayInfo, NetworkKind};
use crate::store::Forwarding;

/// Network side of a record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkMeta {
    #[serde(rename = "type")]
    pub kind: NetworkKind,
    pub app_id: String,
    pub dev_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u8>,
    /// Time on air in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub airtime: Option<f64>,
    pub gateways: Vec<GatewayInfo>,
}

impl From<&Envelope> for NetworkMeta {
    fn from(envelope: &Envelope) -> Self {
        Self {
            kind: envelope.network,
            app_id: envelope.app_id.clone(),
            dev_id: envelope.dev_id.clone(),
            port: envelope.port,
            airtime: envelope.airtime,
            gateways: envelope.gateways.clone(),
        }
    }
}

/// A decoded, resolved measurement record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    /// Unix seconds
    pub timestamp: i64,
    pub kit: KitId,
    pub forwarding: Forwarding,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: Group,
    pub data: BTreeMap<String, Group>,
    pub network: NetworkMeta,
}

impl CanonicalRecord {
    /// One JSON line
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn measurement_count(&self) -> usize {
        self.data.values().map(BTreeMap::len).sum()
    }
}
