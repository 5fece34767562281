// aqlink Gateway - Integration Tests
//
// Tests are organized into categories:
// 1. Envelopes
// 2. Queue
// 3. Kit cache
// 4. Dispatcher
// 5. Replay
// 6. Brokers

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use aqlink::{Codec, RuleTable};
use aqlink_gateway::{
    channel, CacheConfig, CacheError, CollectorConfig, Connection, ConnectionPolicy,
    ConnectionState, Dispatcher, Envelope,
    EnvelopeError, Forwarding, GatewayError, InMemoryStore, Incoming, KitCache, KitKey,
    NetworkKind, Registration, StoreError, Transport, TransportError,
};

const WEER_DIY1: &str = "CgEA1QImA/U=";

fn registration(serial: &str, dev_id: &str) -> Registration {
    Registration {
        project: "SAN".to_string(),
        serial: serial.to_string(),
        app_id: Some("aqlink-kits".to_string()),
        dev_id: Some(dev_id.to_string()),
        active: true,
        valid: true,
        forwarding: Forwarding {
            database: true,
            luftdaten: None,
            website: true,
        },
        home: None,
        sensors: vec!["BME280".to_string()],
        kit_row: Some(7),
        policy_row: Some(3),
        firmware: None,
        updated: "2024-01-01T00:00:00Z".parse().unwrap(),
    }
}

fn v2_envelope(dev_id: &str, payload: &str) -> String {
    format!(
        r#"{{
            "app_id": "aqlink-kits",
            "dev_id": "{}",
            "port": 12,
            "payload_raw": "{}",
            "metadata": {{
                "time": "2024-05-01T10:00:00.3Z",
                "airtime": 400000,
                "gateways": [{{ "gtw_id": "gw-1", "rssi": -90, "snr": 7.5 }}]
            }}
        }}"#,
        dev_id, payload
    )
}

fn v3_envelope(dev_id: &str, payload: &str) -> String {
    format!(
        r#"{{
            "end_device_ids": {{
                "device_id": "{}",
                "application_ids": {{ "application_id": "aqlink-kits" }}
            }},
            "received_at": "2024-05-01T10:00:00.3Z",
            "uplink_message": {{
                "f_port": 12,
                "frm_payload": "{}",
                "consumed_airtime": "0.4s",
                "rx_metadata": [
                    {{ "gateway_ids": {{ "gateway_id": "gw-1" }}, "rssi": -90, "snr": 7.5 }},
                    {{ "packet_broker": {{ "forwarder_net_id": "000013" }}, "rssi": -110 }}
                ]
            }}
        }}"#,
        dev_id, payload
    )
}

fn dispatcher(rows: Vec<Registration>) -> Dispatcher {
    dispatcher_with(&CollectorConfig::default(), InMemoryStore::with_rows(rows))
}

fn dispatcher_with(config: &CollectorConfig, store: InMemoryStore) -> Dispatcher {
    Dispatcher::new(config, Codec::new(RuleTable::builtin()), Box::new(store))
}

// ============================================================================
// Envelope Tests
// ============================================================================

#[test]
fn test_v2_and_v3_normalize_to_same_shape() {
    let v2 = Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap();
    let v3 = Envelope::parse(&v3_envelope("kit-01", WEER_DIY1), 25).unwrap();

    assert_eq!(v2.network, NetworkKind::TtnV2);
    assert_eq!(v3.network, NetworkKind::TtnV3);
    assert_eq!(v2.app_id, v3.app_id);
    assert_eq!(v2.dev_id, v3.dev_id);
    assert_eq!(v2.port, v3.port);
    assert_eq!(v2.payload, v3.payload);
    assert_eq!(v2.gateways, v3.gateways);
    assert_eq!(v2.timestamp(), v3.timestamp());
    assert_eq!(v3.timestamp(), Some(1714557600));
}

#[test]
fn test_envelope_field_limit() {
    let mut object = serde_json::Map::new();
    object.insert("app_id".into(), "a".into());
    object.insert("dev_id".into(), "d".into());
    object.insert("payload_raw".into(), WEER_DIY1.into());
    for i in 0..23 {
        object.insert(format!("extra{}", i), i.into());
    }
    let value = serde_json::Value::Object(object);

    assert!(Envelope::from_value(value.clone(), 26).is_ok());
    assert_eq!(
        Envelope::from_value(value, 25),
        Err(EnvelopeError::TooManyFields { count: 26, max: 25 })
    );
}

#[test]
fn test_envelope_without_payload_rejected() {
    let text = r#"{ "app_id": "a", "dev_id": "d", "port": 2 }"#;
    assert_eq!(
        Envelope::parse(text, 25),
        Err(EnvelopeError::MissingField("payload_raw"))
    );
    assert!(matches!(
        Envelope::parse("[1, 2]", 25),
        Err(EnvelopeError::Json(_))
    ));
    assert_eq!(
        Envelope::parse(r#"{ "hello": 1 }"#, 25),
        Err(EnvelopeError::UnknownShape)
    );
}

// ============================================================================
// Queue Tests
// ============================================================================

#[test]
fn test_queue_drops_when_full() {
    let (tx, mut rx) = channel(2);
    let envelope = Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap();

    assert!(tx.offer(envelope.clone()));
    assert!(tx.offer(envelope.clone()));
    assert!(!tx.offer(envelope));
    assert_eq!(tx.dropped(), 1);
    assert_eq!(rx.dropped(), 1);

    assert!(rx.try_pop().is_some());
    assert!(rx.try_pop().is_some());
    assert!(rx.try_pop().is_none());
}

#[tokio::test]
async fn test_queue_pop_timeout_when_empty() {
    let (_tx, mut rx) = channel(1);
    assert!(rx.pop_timeout(Duration::from_millis(10)).await.is_none());
}

// ============================================================================
// Kit Cache Tests
// ============================================================================

fn kit_cache(max_entries: usize, ttl_secs: u64, rows: Vec<Registration>) -> KitCache {
    let config = CacheConfig {
        max_entries,
        ttl_secs,
        history: 8,
    };
    KitCache::new(&config, Box::new(InMemoryStore::with_rows(rows)))
}

#[test]
fn test_cache_evicts_oldest_expiry() {
    let mut cache = kit_cache(
        2,
        5,
        vec![
            registration("a", "dev-a"),
            registration("b", "dev-b"),
            registration("c", "dev-c"),
        ],
    );
    let (a, b, c) = (KitKey::kit("SAN", "a"), KitKey::kit("SAN", "b"), KitKey::kit("SAN", "c"));

    cache.resolve_at(&b, 0).unwrap(); // expires at 5
    cache.resolve_at(&a, 5).unwrap(); // expires at 10
    cache.resolve_at(&c, 6).unwrap();

    assert_eq!(cache.len(), 2);
    assert!(cache.contains(&a, 6));
    assert!(cache.contains(&c, 6));
    assert!(!cache.contains(&b, 6));
}

#[test]
fn test_cache_unregistered_kit() {
    let mut cache = kit_cache(10, 60, vec![]);
    let err = cache
        .resolve_at(&KitKey::kit("SAN", "deadbeef0001"), 0)
        .unwrap_err();
    assert!(matches!(err, CacheError::UnregisteredKit(_)));
    assert!(cache.is_empty());

    let mut cache = kit_cache(10, 60, vec![registration("0001", "kit-01")]);
    assert!(cache
        .resolve_at(&KitKey::transport("aqlink-kits", "kit-02"), 0)
        .is_err());
}

#[test]
fn test_cache_resolve_is_idempotent() {
    let mut cache = kit_cache(10, 60, vec![registration("0001", "kit-01")]);
    let by_kit = cache
        .resolve_at(&KitKey::kit("SAN", "0001"), 0)
        .unwrap()
        .id
        .clone();
    let by_transport = cache
        .resolve_at(&KitKey::transport("aqlink-kits", "kit-01"), 1)
        .unwrap()
        .id
        .clone();
    let again = cache
        .resolve_at(&KitKey::kit("SAN", "0001"), 2)
        .unwrap()
        .id
        .clone();

    assert_eq!(by_kit, by_transport);
    assert_eq!(by_kit, again);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_cache_store_outage() {
    let mut store = InMemoryStore::with_rows(vec![registration("0001", "kit-01")]);
    store.set_outage(Some("connection refused".to_string()));
    let mut cache = KitCache::new(&CacheConfig::default(), Box::new(store));

    let err = cache
        .resolve_at(&KitKey::kit("SAN", "0001"), 0)
        .unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::Unavailable(_))));
}

// ============================================================================
// Dispatcher Tests
// ============================================================================

#[test]
fn test_dispatch_v2_envelope() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    let envelope = Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap();

    let record = dispatcher.process_at(envelope, 0).unwrap().unwrap();
    assert_eq!(record.kit.to_string(), "SAN_0001");
    assert_eq!(record.timestamp, 1714557600);
    assert!(record.forwarding.database);
    assert_eq!(record.data["BME280"]["temp"].number(), Some(21.3));
    assert_eq!(record.network.kind, NetworkKind::TtnV2);
    assert_eq!(record.network.gateways.len(), 1);

    let stats = dispatcher.stats();
    assert_eq!(stats.decoded, 1);
    assert_eq!(stats.last_decoded_at, Some(1714557600));
    assert_eq!(stats.last_kit.as_ref().map(ToString::to_string).as_deref(), Some("SAN_0001"));
}

#[test]
fn test_dispatch_time_group_overrides_timestamp() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    let envelope = Envelope::parse(&v3_envelope("kit-01", "CgEA1QImA/X+ZVPxAA=="), 25).unwrap();

    let record = dispatcher.process_at(envelope, 0).unwrap().unwrap();
    assert_eq!(record.timestamp, 1_700_000_000);
    assert!(!record.data.contains_key("time"));
}

#[test]
fn test_dispatch_unregistered_kit_discarded() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    let envelope = Envelope::parse(&v2_envelope("deadbeef0001", WEER_DIY1), 25).unwrap();

    assert!(dispatcher.process_at(envelope, 0).unwrap().is_none());
    assert_eq!(dispatcher.stats().unregistered, 1);
    assert_eq!(dispatcher.stats().decoded, 0);
}

#[test]
fn test_dispatch_inactive_kit_discarded() {
    let mut row = registration("0001", "kit-01");
    row.active = false;
    let mut dispatcher = dispatcher(vec![row]);
    let envelope = Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap();

    assert!(dispatcher.process_at(envelope, 0).unwrap().is_none());
    assert_eq!(dispatcher.stats().inactive, 1);
}

#[test]
fn test_dispatch_invalid_kit_discarded() {
    let mut row = registration("0001", "kit-01");
    row.valid = false;
    let mut dispatcher = dispatcher(vec![row, registration("0002", "kit-02")]);

    let envelope = Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap();
    assert!(dispatcher.process_at(envelope, 0).unwrap().is_none());
    let envelope = Envelope::parse(&v2_envelope("kit-02", WEER_DIY1), 25).unwrap();
    assert!(dispatcher.process_at(envelope, 0).unwrap().is_some());

    assert_eq!(dispatcher.stats().invalid, 1);
    assert_eq!(dispatcher.stats().inactive, 0);
    assert_eq!(dispatcher.stats().decoded, 1);
}

#[test]
fn test_dispatch_decode_error_discarded() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    // BME280 sub-record cut short
    let envelope = Envelope::parse(&v2_envelope("kit-01", "CgEA1QI="), 25).unwrap();

    assert!(dispatcher.process_at(envelope, 0).unwrap().is_none());
    assert_eq!(dispatcher.stats().decode_errors, 1);
}

#[test]
fn test_dispatch_store_outage_is_fatal() {
    let mut store = InMemoryStore::with_rows(vec![registration("0001", "kit-01")]);
    store.set_outage(Some("database down".to_string()));
    let mut dispatcher = dispatcher_with(&CollectorConfig::default(), store);
    let envelope = Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap();

    let err = dispatcher.process_at(envelope, 0).unwrap_err();
    assert!(matches!(err, GatewayError::Store(StoreError::Unavailable(_))));
}

#[test]
fn test_dispatch_unknown_field_warned_once() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    let text = r#"{
        "app_id": "aqlink-kits",
        "dev_id": "kit-01",
        "payload_fields": { "Temperature": 20.5, "pm7": 3 },
        "metadata": { "time": "2024-05-01T10:00:00Z" }
    }"#;

    for _ in 0..2 {
        let envelope = Envelope::parse(text, 25).unwrap();
        let record = dispatcher.process_at(envelope, 0).unwrap().unwrap();
        assert_eq!(record.data["ttn"]["temp"].number(), Some(20.5));
        assert!(!record.data["ttn"].contains_key("pm7"));
    }

    assert_eq!(dispatcher.stats().unknown_fields, 2);
    let status = dispatcher.cache().status(0);
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].unknown_fields, vec!["pm7".to_string()]);
    assert_eq!(status[0].record_count, 2);
}

#[test]
fn test_record_serializes_to_json_line() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    let envelope = Envelope::parse(&v3_envelope("kit-01", WEER_DIY1), 25).unwrap();
    let record = dispatcher.process_at(envelope, 0).unwrap().unwrap();

    let line = record.to_json().unwrap();
    assert!(!line.contains('\n'));
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["kit"]["project"], "SAN");
    assert_eq!(value["network"]["type"], "TTNV3");
    assert_eq!(value["data"]["BME280"]["temp"]["value"], 21.3);
}

#[tokio::test]
async fn test_next_record_drains_queue_then_ends() {
    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    let queue = dispatcher.queue();
    queue.offer(Envelope::parse(&v2_envelope("kit-01", WEER_DIY1), 25).unwrap());
    queue.offer(Envelope::parse(&v2_envelope("unknown", WEER_DIY1), 25).unwrap());
    queue.offer(Envelope::parse(&v3_envelope("kit-01", WEER_DIY1), 25).unwrap());

    let first = dispatcher.next_record().await.unwrap().unwrap();
    let second = dispatcher.next_record().await.unwrap().unwrap();
    assert_eq!(first.network.kind, NetworkKind::TtnV2);
    assert_eq!(second.network.kind, NetworkKind::TtnV3);
    assert!(dispatcher.next_record().await.unwrap().is_none());
    assert_eq!(dispatcher.stats().unregistered, 1);
}

// ============================================================================
// Replay Tests
// ============================================================================

#[tokio::test]
async fn test_replay_file_through_dispatcher() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# captured 2024-05-01").unwrap();
    writeln!(
        file,
        "v3/aqlink-kits/devices/kit-01/up {}",
        v3_envelope("kit-01", WEER_DIY1).replace('\n', " ")
    )
    .unwrap();
    writeln!(file, "{{ not json }}").unwrap();
    writeln!(file, "// decoded by the network server").unwrap();
    writeln!(
        file,
        r#"{{ "app_id": "aqlink-kits", "dev_id": "kit-01",
              "payload_fields": {{ "rv": 0x37 }},
              "metadata": {{ "time": "2024-05-01T11:00:00Z" }} }}"#
    )
    .unwrap();
    file.flush().unwrap();

    let mut dispatcher = dispatcher(vec![registration("0001", "kit-01")]);
    dispatcher.add_replay_file(file.path()).unwrap();

    let mut records = Vec::new();
    while let Some(record) = dispatcher.next_record().await.unwrap() {
        records.push(record);
    }

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].data["BME280"]["temp"].number(), Some(21.3));
    assert_eq!(records[1].data["ttn"]["rv"].number(), Some(55.0));
    assert_eq!(records[1].timestamp, 1714561200);
}

#[test]
fn test_replay_missing_file() {
    let mut dispatcher = dispatcher(vec![]);
    let err = dispatcher
        .add_replay_file("/nonexistent/aqlink/replay.txt")
        .unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}

// ============================================================================
// Broker Tests
// ============================================================================

struct Scripted {
    connects: VecDeque<Result<(), TransportError>>,
    messages: Arc<Mutex<VecDeque<Incoming>>>,
}

#[async_trait]
impl Transport for Scripted {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connects
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("refused".into())))
    }

    async fn next_message(&mut self) -> Result<Option<Incoming>, TransportError> {
        let next = self.messages.lock().unwrap().pop_front();
        match next {
            Some(message) => Ok(Some(message)),
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(None)
            }
        }
    }

    async fn disconnect(&mut self) {}
}

/// Fail every connect as soon as the backoff allows; the delays seen
fn fail_until_retired(conn: &mut Connection, limit: usize) -> Vec<Duration> {
    let mut now = Instant::now();
    let mut delays = Vec::new();
    while conn.state() != ConnectionState::Retired && delays.len() < limit {
        assert!(conn.begin_connect(now));
        conn.connect_failed(now, "refused");
        if let Some(delay) = conn.backoff_remaining(now) {
            delays.push(delay);
            now += delay;
        }
    }
    delays
}

#[test]
fn test_backoff_sequence_outlives_restart_window() {
    let mut config = CollectorConfig::default();
    config.connection.restart_window_secs = 60;
    let mut conn = Connection::new("eu1", ConnectionPolicy::from(&config.connection));

    let delays = fail_until_retired(&mut conn, 20);
    assert_eq!(conn.state(), ConnectionState::Retired);
    assert_eq!(delays.len(), 4);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
    assert!(!conn.begin_connect(Instant::now() + Duration::from_secs(7200)));
}

#[test]
fn test_backoff_sequence_reaches_ceiling() {
    let mut config = CollectorConfig::default();
    config.connection.max_restarts = 10;
    config.connection.restart_window_secs = 60;
    let mut conn = Connection::new("eu1", ConnectionPolicy::from(&config.connection));

    let delays = fail_until_retired(&mut conn, 20);
    assert_eq!(conn.state(), ConnectionState::Retired);
    assert_eq!(delays.len(), 9);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
    assert_eq!(delays.last(), Some(&Duration::from_secs(600)));
    assert_eq!(conn.status().consecutive_failures, 10);
}

fn fast_config() -> CollectorConfig {
    let mut config = CollectorConfig::default();
    config.connection.max_restarts = 2;
    config.connection.backoff_initial_secs = 0;
    config.connection.backoff_max_secs = 0;
    config.connection.connect_timeout_secs = 1;
    config.dispatcher.poll_interval_ms = 10;
    config
}

#[tokio::test]
async fn test_failing_broker_is_retired() {
    let mut dispatcher = dispatcher_with(&fast_config(), InMemoryStore::new());
    dispatcher.add_broker(
        "eu1",
        Box::new(|| {
            Box::new(Scripted {
                connects: VecDeque::new(),
                messages: Arc::default(),
            }) as Box<dyn Transport>
        }),
    );

    let next = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_record())
        .await
        .unwrap()
        .unwrap();
    assert!(next.is_none());

    let statuses = dispatcher.broker_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, ConnectionState::Retired);
    assert_eq!(statuses[0].restart_count, 2);

    assert!(dispatcher.reinstate("eu1"));
    assert!(!dispatcher.reinstate("nope"));
}

#[tokio::test]
async fn test_broker_messages_reach_dispatcher() {
    let messages = Arc::new(Mutex::new(VecDeque::from(vec![
        Incoming {
            topic: "v3/aqlink-kits/devices/kit-01/up".to_string(),
            payload: b"not an envelope".to_vec(),
        },
        Incoming {
            topic: "v3/aqlink-kits/devices/kit-01/up".to_string(),
            payload: v3_envelope("kit-01", WEER_DIY1).into_bytes(),
        },
    ])));

    let mut dispatcher = dispatcher_with(
        &fast_config(),
        InMemoryStore::with_rows(vec![registration("0001", "kit-01")]),
    );
    let script = Arc::clone(&messages);
    dispatcher.add_broker(
        "eu1",
        Box::new(move || {
            Box::new(Scripted {
                connects: VecDeque::from(vec![Ok(())]),
                messages: Arc::clone(&script),
            }) as Box<dyn Transport>
        }),
    );

    let record = tokio::time::timeout(Duration::from_secs(5), dispatcher.next_record())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.kit.to_string(), "SAN_0001");
    assert!(record.network.app_id == "aqlink-kits");

    dispatcher.shutdown().await;
    let statuses = dispatcher.broker_statuses();
    assert_eq!(statuses[0].state, ConnectionState::Disconnected);
}
