// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # aqlink Gateway - LoRaWAN ingestion layer
//!
//! Turns uplinks from The Things Network into canonical measurement
//! records for aqlink sensor kits.
//!
//! ## Features
//!
//! - **Envelope normalization**: TTN v2 and v3 uplinks end up in one shape
//! - **Supervised brokers**: reconnect with backoff, stall detection, retirement
//! - **Kit cache**: bounded TTL cache over a registration store
//! - **Replay**: recorded envelope files feed the same pipeline
//!
//! ## Quick Start
//!
//! ```rust
//! use aqlink::{Codec, RuleTable};
//! use aqlink_gateway::{CollectorConfig, Dispatcher, Envelope, InMemoryStore, Registration};
//!
//! let row: Registration = serde_json::from_str(r#"{
//!     "project": "SAN", "serial": "1f2e3d4c",
//!     "app_id": "aqlink-kits", "dev_id": "kit-01",
//!     "updated": "2024-01-01T00:00:00Z"
//! }"#).unwrap();
//! let store = InMemoryStore::with_rows(vec![row]);
//!
//! let config = CollectorConfig::default();
//! let mut dispatcher = Dispatcher::new(&config, Codec::new(RuleTable::builtin()), Box::new(store));
//!
//! let envelope = Envelope::parse(r#"{
//!     "app_id": "aqlink-kits", "dev_id": "kit-01", "port": 12,
//!     "payload_raw": "CgEA1QImA/U=",
//!     "metadata": { "time": "2024-05-01T10:00:00Z" }
//! }"#, 25).unwrap();
//!
//! let record = dispatcher.process(envelope).unwrap().unwrap();
//! assert_eq!(record.kit.to_string(), "SAN_1f2e3d4c");
//! assert_eq!(record.timestamp, 1714557600);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ ┌──────────┐        ┌────────────┐
//! │ Broker A │ │ Broker B │  ...   │ Replay file│
//! └────┬─────┘ └────┬─────┘        └─────┬──────┘
//!      │  offer()   │                    │
//!      ▼            ▼                    │
//!   ┌─────────────────┐                  │
//!   │ bounded queue   │                  │
//!   └───────┬─────────┘                  │
//!           ▼                            ▼
//!   ┌────────────────────────────────────────┐
//!   │ Dispatcher: decode → kit cache → schema │
//!   └───────────────────┬────────────────────┘
//!                       ▼
//!               CanonicalRecord
//! ```

mod broker;
mod cache;
mod config;
mod connection;
mod dispatcher;
mod envelope;
mod error;
mod queue;
mod record;
mod replay;
mod schema;
mod store;

// Public API
pub use broker::{spawn as spawn_broker, BrokerHandle, Incoming, MqttTransport, Transport, TransportFactory};
pub use cache::{GatewaySeen, KitCache, KitEntry, KitId, KitKey, KitStats, KitStatus, SignalRange};
pub use config::{
    BrokerConfig, CacheConfig, CollectorConfig, ConnectionConfig, DispatcherConfig, ReplayConfig,
    SchemaConfig,
};
pub use connection::{BackoffPolicy, Connection, ConnectionPolicy, ConnectionState, ConnectionStatus};
pub use dispatcher::{DispatchStats, Dispatcher, NETWORK_DECODED_GROUP};
pub use envelope::{Envelope, GatewayInfo, NetworkKind};
pub use error::{
    CacheError, ConfigError, EnvelopeError, GatewayError, Result, StoreError, TransportError,
};
pub use queue::{channel, QueueReceiver, QueueSender};
pub use record::{CanonicalRecord, NetworkMeta};
pub use replay::FileSource;
pub use schema::FieldSchema;
pub use store::{Forwarding, InMemoryStore, JsonFileStore, MetadataStore, Registration};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
