//! # aqlink - sensor kit payload codec
//!
//! Table-driven encoder/decoder for the compact binary uplinks of
//! air-quality and weather kits on LoRaWAN.
//!
//! ## Key Features
//!
//! - **Rule-driven**: products are described by packed layouts, sentinels and calibrations
//! - **Self-describing payloads**: sub-records tagged with a sensor type byte
//! - **Fail closed**: truncated, trailing or unknown bytes are errors, never guesses
//! - **Legacy firmware**: hand-coded decoders for the older port 2/3/4 layouts
//!
//! ## Quick Start
//!
//! ```rust
//! use aqlink::{Codec, ProductKey};
//!
//! let codec = Codec::default();
//!
//! // weerDIY1: header version, then a BME280 sub-record (type 1)
//! let payload = [0x0A, 0x01, 0x00, 0xD5, 0x02, 0x26, 0x03, 0xF5];
//! let record = codec.decode(&payload, &ProductKey::from("weerDIY1")).unwrap();
//! assert_eq!(record.number("BME280", "temp"), Some(21.3));
//!
//! let bytes = codec.encode(&record, &ProductKey::from("weerDIY1")).unwrap();
//! assert_eq!(bytes, payload);
//! ```
//!
//! ## Modules
//!
//! - [`rules`]: product rules, packed types, sentinels and calibrations
//! - [`codec`]: rule-driven encode/decode
//! - [`legacy`]: hand-coded port 2/3/4 layouts
//! - [`record`]: decoded sensor records
//! - [`geohash`]: position tokens

// Modules
pub mod codec;
pub mod error;
pub mod geohash;
pub mod legacy;
pub mod record;
pub mod rules;

// Re-exports for convenient access
pub use codec::Codec;
pub use error::{AqlinkError, DecodeError, EncodeError, Result, RuleError};
pub use record::{Group, Measurement, SensorRecord, Value};
pub use rules::{
    ByteOrder, Calibration, Field, Layout, LegacyLayout, PackedType, ProductKey, ProductRule,
    RuleTable, Sentinel, SubRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
