// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Transport envelopes
//!
//! The network server wraps every uplink in a JSON envelope. Two shapes
//! arrive on the wire and are told apart structurally:
//!
//! - TTN V2: `app_id`, `dev_id`, `port`, `payload_raw`, `metadata`
//! - TTN V3: `end_device_ids`, `received_at`, `uplink_message`
//!
//! Both normalize into one [`Envelope`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use aqlink::geohash::{self, POSITION_PRECISION};

use crate::error::EnvelopeError;

/// Which network server produced the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    #[serde(rename = "TTNV2")]
    TtnV2,
    #[serde(rename = "TTNV3")]
    TtnV3,
}

/// A receiving gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geohash: Option<String>,
}

/// Normalized uplink
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub network: NetworkKind,
    pub app_id: String,
    pub dev_id: String,
    pub port: Option<u8>,
    /// Raw payload bytes, empty when the network sent none
    pub payload: Vec<u8>,
    /// Fields the network server decoded itself
    pub decoded: Option<Map<String, Value>>,
    pub received_at: Option<DateTime<Utc>>,
    /// Time on air in seconds
    pub airtime: Option<f64>,
    pub gateways: Vec<GatewayInfo>,
    /// Broker or file the envelope came from
    pub source: String,
}

impl Envelope {
    /// Parse envelope text
    pub fn parse(text: &str, max_fields: usize) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        Self::from_value(value, max_fields)
    }

    /// Parse envelope bytes as received from a broker
    pub fn from_slice(bytes: &[u8], max_fields: usize) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        Self::from_value(value, max_fields)
    }

    /// Normalize an already parsed JSON value
    pub fn from_value(value: Value, max_fields: usize) -> Result<Self, EnvelopeError> {
        let object = value
            .as_object()
            .ok_or_else(|| EnvelopeError::Json("not an object".to_string()))?;
        if object.len() > max_fields {
            return Err(EnvelopeError::TooManyFields {
                count: object.len(),
                max: max_fields,
            });
        }

        if object.contains_key("uplink_message") {
            let wire: V3Wire =
                serde_json::from_value(value).map_err(|e| EnvelopeError::Json(e.to_string()))?;
            wire.normalize()
        } else if object.contains_key("payload_raw") || object.contains_key("app_id") {
            let wire: V2Wire =
                serde_json::from_value(value).map_err(|e| EnvelopeError::Json(e.to_string()))?;
            wire.normalize()
        } else {
            Err(EnvelopeError::UnknownShape)
        }
    }

    /// Tag the envelope with its origin
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Measurement time in unix seconds: reception minus time on air
    pub fn timestamp(&self) -> Option<i64> {
        let received = self.received_at?;
        let seconds = received.timestamp_millis() as f64 / 1000.0;
        Some((seconds - self.airtime.unwrap_or(0.0)).round() as i64)
    }

    /// Whether the network server sent decoded fields but no raw bytes
    pub fn is_decoded_only(&self) -> bool {
        self.payload.is_empty() && self.decoded.as_ref().map_or(false, |d| !d.is_empty())
    }
}

fn decode_payload(text: Option<&str>) -> Result<Vec<u8>, EnvelopeError> {
    match text {
        None | Some("") => Ok(Vec::new()),
        Some(text) => BASE64
            .decode(text)
            .map_err(|e| EnvelopeError::Payload(e.to_string())),
    }
}

fn parse_time(text: Option<&str>) -> Result<Option<DateTime<Utc>>, EnvelopeError> {
    match text {
        None | Some("") => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| EnvelopeError::Timestamp(format!("{}: {}", text, e))),
    }
}

fn gateway_geohash(lat: Option<f64>, lon: Option<f64>) -> Option<String> {
    match (lat, lon) {
        // a zero position means the gateway did not report one
        (Some(lat), Some(lon)) if lat != 0.0 || lon != 0.0 => {
            geohash::encode(lat, lon, POSITION_PRECISION)
        }
        _ => None,
    }
}

fn non_empty(map: Option<Map<String, Value>>) -> Option<Map<String, Value>> {
    map.filter(|m| !m.is_empty())
}

// ----------------------------------------------------------------------------
// TTN V2
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct V2Wire {
    app_id: Option<String>,
    dev_id: Option<String>,
    port: Option<u8>,
    payload_raw: Option<String>,
    payload_fields: Option<Map<String, Value>>,
    #[serde(default)]
    metadata: V2Metadata,
}

#[derive(Debug, Default, Deserialize)]
struct V2Metadata {
    time: Option<String>,
    /// microseconds
    airtime: Option<f64>,
    #[serde(default)]
    gateways: Vec<V2Gateway>,
}

#[derive(Debug, Deserialize)]
struct V2Gateway {
    gtw_id: String,
    rssi: Option<f64>,
    snr: Option<f64>,
    #[serde(alias = "lat")]
    latitude: Option<f64>,
    #[serde(alias = "lon")]
    longitude: Option<f64>,
}

impl V2Wire {
    fn normalize(self) -> Result<Envelope, EnvelopeError> {
        let app_id = self.app_id.ok_or(EnvelopeError::MissingField("app_id"))?;
        let dev_id = self.dev_id.ok_or(EnvelopeError::MissingField("dev_id"))?;
        let payload = decode_payload(self.payload_raw.as_deref())?;
        let decoded = non_empty(self.payload_fields);
        if payload.is_empty() && decoded.is_none() {
            return Err(EnvelopeError::MissingField("payload_raw"));
        }
        Ok(Envelope {
            network: NetworkKind::TtnV2,
            app_id,
            dev_id,
            port: self.port,
            payload,
            decoded,
            received_at: parse_time(self.metadata.time.as_deref())?,
            airtime: self.metadata.airtime.map(|us| us / 1_000_000.0),
            gateways: self
                .metadata
                .gateways
                .into_iter()
                .map(|g| GatewayInfo {
                    geohash: gateway_geohash(g.latitude, g.longitude),
                    id: g.gtw_id,
                    rssi: g.rssi,
                    snr: g.snr,
                })
                .collect(),
            source: String::new(),
        })
    }
}

// ----------------------------------------------------------------------------
// TTN V3
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct V3Wire {
    end_device_ids: Option<V3DeviceIds>,
    received_at: Option<String>,
    uplink_message: V3Uplink,
}

#[derive(Debug, Deserialize)]
struct V3DeviceIds {
    device_id: Option<String>,
    application_ids: Option<V3ApplicationIds>,
}

#[derive(Debug, Deserialize)]
struct V3ApplicationIds {
    application_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V3Uplink {
    f_port: Option<u8>,
    frm_payload: Option<String>,
    decoded_payload: Option<Map<String, Value>>,
    #[serde(default)]
    rx_metadata: Vec<V3RxMetadata>,
    /// e.g. "0.061696s"
    consumed_airtime: Option<String>,
    received_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V3RxMetadata {
    gateway_ids: Option<V3GatewayIds>,
    rssi: Option<f64>,
    snr: Option<f64>,
    location: Option<V3Location>,
    packet_broker: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct V3GatewayIds {
    gateway_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V3Location {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl V3Wire {
    fn normalize(self) -> Result<Envelope, EnvelopeError> {
        let ids = self
            .end_device_ids
            .ok_or(EnvelopeError::MissingField("end_device_ids"))?;
        let dev_id = ids.device_id.ok_or(EnvelopeError::MissingField("device_id"))?;
        let app_id = ids
            .application_ids
            .and_then(|a| a.application_id)
            .ok_or(EnvelopeError::MissingField("application_id"))?;

        let uplink = self.uplink_message;
        let payload = decode_payload(uplink.frm_payload.as_deref())?;
        let decoded = non_empty(uplink.decoded_payload);
        if payload.is_empty() && decoded.is_none() {
            return Err(EnvelopeError::MissingField("frm_payload"));
        }

        let airtime = match uplink.consumed_airtime.as_deref() {
            None => None,
            Some(text) => Some(
                text.trim_end_matches('s')
                    .parse::<f64>()
                    .map_err(|e| EnvelopeError::Timestamp(format!("{}: {}", text, e)))?,
            ),
        };
        let received = self.received_at.or(uplink.received_at);

        let gateways = uplink
            .rx_metadata
            .into_iter()
            .filter(|rx| rx.packet_broker.is_none())
            .filter_map(|rx| {
                let id = rx.gateway_ids.and_then(|g| g.gateway_id)?;
                let (lat, lon) = rx
                    .location
                    .map_or((None, None), |l| (l.latitude, l.longitude));
                Some(GatewayInfo {
                    id,
                    rssi: rx.rssi,
                    snr: rx.snr,
                    geohash: gateway_geohash(lat, lon),
                })
            })
            .collect();

        Ok(Envelope {
            network: NetworkKind::TtnV3,
            app_id,
            dev_id,
            port: uplink.f_port,
            payload,
            decoded,
            received_at: parse_time(received.as_deref())?,
            airtime,
            gateways,
            source: String::new(),
        })
    }
}
