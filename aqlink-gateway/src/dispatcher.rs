// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! The consumer loop
//!
//! Each pass of [`Dispatcher::next_record`]:
//!
//! 1. takes one envelope from every replay file
//! 2. (re)starts broker workers that are not retired
//! 3. pops one envelope from the ingestion queue
//! 4. decodes, resolves the kit, filters fields, and returns the record
//!
//! When nothing is available it waits on the queue for the poll interval.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use aqlink::{Codec, Group, Measurement, ProductKey, SensorRecord};

use crate::broker::{self, BrokerHandle, MqttTransport, TransportFactory};
use crate::cache::{KitCache, KitId, KitKey};
use crate::config::CollectorConfig;
use crate::connection::{ConnectionPolicy, ConnectionState, ConnectionStatus};
use crate::envelope::Envelope;
use crate::error::{CacheError, ConfigError, Result};
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::record::{CanonicalRecord, NetworkMeta};
use crate::replay::FileSource;
use crate::schema::FieldSchema;
use crate::store::MetadataStore;

/// Group holding fields the network server decoded
pub const NETWORK_DECODED_GROUP: &str = "ttn";

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub decoded: u64,
    /// Envelopes without anything to decode
    pub malformed: u64,
    pub decode_errors: u64,
    pub unregistered: u64,
    pub inactive: u64,
    /// Kits whose registration is flagged invalid
    pub invalid: u64,
    /// Fields dropped as unknown
    pub unknown_fields: u64,
    /// Timestamp of the most recently decoded record
    pub last_decoded_at: Option<i64>,
    pub last_kit: Option<KitId>,
}

struct BrokerSlot {
    name: String,
    factory: TransportFactory,
    handle: Option<BrokerHandle>,
    retired: bool,
    last_status: Option<ConnectionStatus>,
}

/// Single consumer of all sources
pub struct Dispatcher {
    codec: Codec,
    cache: KitCache,
    schema: FieldSchema,
    sources: Vec<FileSource>,
    brokers: Vec<BrokerSlot>,
    pending: VecDeque<Envelope>,
    queue_tx: QueueSender,
    queue_rx: QueueReceiver,
    policy: ConnectionPolicy,
    max_fields: usize,
    poll_interval: Duration,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Build a dispatcher with an MQTT worker per configured broker
    pub fn new(config: &CollectorConfig, codec: Codec, store: Box<dyn MetadataStore>) -> Self {
        let (queue_tx, queue_rx) = queue::channel(config.dispatcher.queue_capacity);
        let schema = FieldSchema::new(codec.rules(), &config.schema);
        let mut dispatcher = Self {
            cache: KitCache::new(&config.cache, store),
            schema,
            codec,
            sources: Vec::new(),
            brokers: Vec::new(),
            pending: VecDeque::new(),
            queue_tx,
            queue_rx,
            policy: ConnectionPolicy::from(&config.connection),
            max_fields: config.connection.max_envelope_fields,
            poll_interval: config.dispatcher.poll_interval(),
            stats: DispatchStats::default(),
        };
        for broker in &config.brokers {
            dispatcher.add_broker(broker.name.clone(), MqttTransport::factory(broker.clone()));
        }
        dispatcher
    }

    /// Register a broker; its worker starts on the next pass
    pub fn add_broker(&mut self, name: impl Into<String>, factory: TransportFactory) {
        self.brokers.push(BrokerSlot {
            name: name.into(),
            factory,
            handle: None,
            retired: false,
            last_status: None,
        });
    }

    /// Replay a recorded envelope file
    pub fn add_replay_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = FileSource::open(path, self.max_fields).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.sources.push(source);
        Ok(())
    }

    /// Producer handle onto the ingestion queue
    pub fn queue(&self) -> QueueSender {
        self.queue_tx.clone()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Envelopes dropped because the queue was full
    pub fn queue_dropped(&self) -> u64 {
        self.queue_rx.dropped()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_tx.len()
    }

    pub fn cache(&self) -> &KitCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut KitCache {
        &mut self.cache
    }

    /// Status of every broker, running or retired
    pub fn broker_statuses(&self) -> Vec<ConnectionStatus> {
        self.brokers
            .iter()
            .filter_map(|slot| {
                slot.handle
                    .as_ref()
                    .map(BrokerHandle::status)
                    .or_else(|| slot.last_status.clone())
            })
            .collect()
    }

    /// Bring a retired broker back; `false` when the name is unknown
    pub fn reinstate(&mut self, name: &str) -> bool {
        let Some(slot) = self.brokers.iter_mut().find(|s| s.name == name) else {
            return false;
        };
        if slot.retired {
            info!(broker = %name, "broker reinstated");
            slot.retired = false;
            slot.last_status = None;
            slot.handle = None;
        }
        true
    }

    /// Next canonical record; `Ok(None)` once every source is exhausted
    ///
    /// Only an unreachable metadata store is an error.
    pub async fn next_record(&mut self) -> Result<Option<CanonicalRecord>> {
        loop {
            while let Some(envelope) = self.pending.pop_front() {
                if let Some(record) = self.process(envelope)? {
                    return Ok(Some(record));
                }
            }

            for source in &mut self.sources {
                if let Some(envelope) = source.next_envelope() {
                    self.pending.push_back(envelope);
                }
            }
            self.sources.retain(|s| !s.is_exhausted());

            self.supervise();

            if let Some(envelope) = self.queue_rx.try_pop() {
                self.pending.push_back(envelope);
            }
            if !self.pending.is_empty() {
                continue;
            }

            if self.sources.is_empty() && !self.has_live_brokers() {
                return Ok(None);
            }
            if let Some(envelope) = self.queue_rx.pop_timeout(self.poll_interval).await {
                self.pending.push_back(envelope);
            }
        }
    }

    /// Signal every broker worker and wait for all of them
    pub async fn shutdown(&mut self) {
        for slot in &mut self.brokers {
            if let Some(mut handle) = slot.handle.take() {
                handle.stop().await;
                slot.last_status = Some(handle.status());
            }
        }
        info!(decoded = self.stats.decoded, "dispatcher stopped");
    }

    /// Turn one envelope into a record at the current time
    pub fn process(&mut self, envelope: Envelope) -> Result<Option<CanonicalRecord>> {
        self.process_at(envelope, chrono::Utc::now().timestamp())
    }

    /// Turn one envelope into a record; `Ok(None)` when it is discarded
    pub fn process_at(
        &mut self,
        envelope: Envelope,
        now: i64,
    ) -> Result<Option<CanonicalRecord>> {
        let mut timestamp = envelope.timestamp().unwrap_or(now);

        let mut decoded = if !envelope.payload.is_empty() {
            let Some(port) = envelope.port else {
                self.stats.malformed += 1;
                debug!(source = %envelope.source, device = %envelope.dev_id, "payload without port");
                return Ok(None);
            };
            match self.codec.decode(&envelope.payload, &ProductKey::ByPort(port)) {
                Ok(record) => record,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(
                        product = %e.product(),
                        port,
                        bytes = envelope.payload.len(),
                        device = %envelope.dev_id,
                        error = %e,
                        "cannot decode payload"
                    );
                    return Ok(None);
                }
            }
        } else if let Some(fields) = &envelope.decoded {
            network_decoded(fields)
        } else {
            self.stats.malformed += 1;
            debug!(source = %envelope.source, device = %envelope.dev_id, "nothing to decode");
            return Ok(None);
        };

        let key = KitKey::transport(envelope.app_id.as_str(), envelope.dev_id.as_str());
        let entry = match self.cache.resolve_at(&key, now) {
            Ok(entry) => entry,
            Err(CacheError::UnregisteredKit(kit)) => {
                self.stats.unregistered += 1;
                warn!(kit = %kit, source = %envelope.source, "unregistered kit, record discarded");
                return Ok(None);
            }
            Err(CacheError::Store(e)) => {
                error!(error = %e, "metadata store unavailable");
                return Err(e.into());
            }
        };
        if !entry.active {
            self.stats.inactive += 1;
            warn!(kit = %entry.id, "inactive kit, record discarded");
            return Ok(None);
        }
        if !entry.valid {
            self.stats.invalid += 1;
            warn!(kit = %entry.id, "kit registration marked invalid, record discarded");
            return Ok(None);
        }

        if let Some(time) = decoded.groups.remove("time") {
            if let Some(t) = time.get("time").and_then(Measurement::number) {
                timestamp = t as i64;
            }
        }

        let mut data = BTreeMap::new();
        for (group_name, group) in std::mem::take(&mut decoded.groups) {
            let mut kept = Group::new();
            for (field, measurement) in group {
                match self.schema.canonical(&field) {
                    Some(name) => {
                        kept.insert(name, measurement);
                    }
                    None => {
                        self.stats.unknown_fields += 1;
                        if entry.stats.note_unknown_field(&field) {
                            warn!(kit = %entry.id, group = %group_name, field = %field, "unknown field dropped");
                        }
                    }
                }
            }
            if !kept.is_empty() {
                data.insert(group_name, kept);
            }
        }

        entry.stats.observe(timestamp, &envelope.gateways);

        let record = CanonicalRecord {
            timestamp,
            kit: entry.id.clone(),
            forwarding: entry.forwarding.clone(),
            header: decoded.header,
            data,
            network: NetworkMeta::from(&envelope),
        };
        self.stats.decoded += 1;
        self.stats.last_decoded_at = Some(timestamp);
        self.stats.last_kit = Some(record.kit.clone());
        debug!(
            kit = %record.kit,
            timestamp,
            measurements = record.measurement_count(),
            "record decoded"
        );
        Ok(Some(record))
    }

    fn has_live_brokers(&self) -> bool {
        self.brokers.iter().any(|slot| !slot.retired)
    }

    fn supervise(&mut self) {
        for slot in &mut self.brokers {
            if slot.retired {
                continue;
            }
            let restart = match &slot.handle {
                None => true,
                Some(handle) if handle.is_finished() => {
                    let status = handle.status();
                    if status.state == ConnectionState::Retired {
                        error!(broker = %slot.name, "broker retired, dropped from the active set");
                        slot.retired = true;
                        slot.last_status = Some(status);
                        slot.handle = None;
                        false
                    } else {
                        warn!(broker = %slot.name, state = %status.state, "broker worker exited, restarting");
                        true
                    }
                }
                Some(_) => false,
            };
            if restart {
                slot.handle = Some(broker::spawn(
                    slot.name.clone(),
                    (slot.factory)(),
                    self.policy.clone(),
                    self.queue_tx.clone(),
                    self.max_fields,
                ));
            }
        }
    }
}

/// Fields decoded by the network server: scalars go to the `ttn` group,
/// objects become groups of their own
fn network_decoded(fields: &Map<String, JsonValue>) -> SensorRecord {
    let mut record = SensorRecord::new();
    for (name, value) in fields {
        match value {
            JsonValue::Object(members) => {
                for (field, value) in members {
                    if let Some(m) = measurement(value) {
                        record.set(name.as_str(), field.as_str(), m);
                    }
                }
            }
            other => {
                if let Some(m) = measurement(other) {
                    record.set(NETWORK_DECODED_GROUP, name.as_str(), m);
                }
            }
        }
    }
    record
}

fn measurement(value: &JsonValue) -> Option<Measurement> {
    match value {
        JsonValue::Null => Some(Measurement::undefined()),
        JsonValue::Number(n) => n.as_f64().map(Measurement::new),
        JsonValue::String(s) => Some(Measurement::new(s.as_str())),
        JsonValue::Bool(b) => Some(Measurement::new(if *b { 1.0 } else { 0.0 })),
        _ => None,
    }
}
