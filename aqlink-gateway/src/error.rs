// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for aqlink Gateway

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Envelope could not be normalized
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Kit resolution failed
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Metadata store unreachable or corrupt
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Rule table could not be loaded
    #[error("Rule error: {0}")]
    Rules(#[from] aqlink::RuleError),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] aqlink::DecodeError),
}

/// Malformed transport envelope
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// Not JSON, or not a JSON object
    #[error("invalid JSON: {0}")]
    Json(String),

    /// Neither a V2 nor a V3 envelope
    #[error("unrecognized envelope shape")]
    UnknownShape,

    /// A required key is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Too many top-level fields
    #[error("{count} fields exceeds the limit of {max}")]
    TooManyFields { count: usize, max: usize },

    /// The base64 payload does not decode
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Reception time does not parse
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

/// Metadata store failure
///
/// Unavailability is fatal to the dispatcher: it cannot make forwarding
/// decisions without the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store cannot be reached
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with data that does not parse
    #[error("corrupt registration data: {0}")]
    Corrupt(String),
}

/// Kit resolution failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// No registration row matches the key
    #[error("unregistered kit: {0}")]
    UnregisteredKit(String),

    /// The store failed during a miss
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration loading or validation failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },

    /// File is not valid JSON for the configuration
    #[error("cannot parse configuration: {0}")]
    Parse(String),

    /// A value is out of range or inconsistent
    #[error("invalid setting {setting}: {reason}")]
    Invalid { setting: String, reason: String },
}

/// Broker transport failure, handled inside the connection state machine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection refused or dropped during the handshake
    #[error("connect failed: {0}")]
    Connect(String),

    /// No acknowledgement within the connect timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Subscription request rejected
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The session dropped while connected
    #[error("connection lost: {0}")]
    Lost(String),
}

/// Result type alias for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
