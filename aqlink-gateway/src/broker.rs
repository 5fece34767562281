// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Broker workers
//!
//! One tokio task per broker. The task owns its [`Transport`], drives the
//! [`Connection`] state machine, and pushes parsed envelopes onto the
//! shared queue. Its status is published on a watch channel; stopping it
//! is signalled on another, and every await point races that signal.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::connection::{Connection, ConnectionPolicy, ConnectionState, ConnectionStatus};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::queue::QueueSender;

/// How often a connected worker wakes to check for a stalled session
const STALL_CHECK: Duration = Duration::from_secs(5);

/// A published message
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe session to one broker
#[async_trait]
pub trait Transport: Send {
    /// Open the session and subscribe
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Next message; `Ok(None)` for protocol traffic that carries no data
    async fn next_message(&mut self) -> Result<Option<Incoming>, TransportError>;

    /// Close the session
    async fn disconnect(&mut self);
}

/// Builds a fresh transport each time a worker is (re)started
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send>;

/// MQTT transport
pub struct MqttTransport {
    options: MqttOptions,
    topic: String,
    qos: QoS,
    session: Option<(AsyncClient, EventLoop)>,
}

impl MqttTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), password.clone());
        }
        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        Self {
            options,
            topic: config.topic.clone(),
            qos,
            session: None,
        }
    }

    /// Factory for the dispatcher
    pub fn factory(config: BrokerConfig) -> TransportFactory {
        Box::new(move || Box::new(MqttTransport::new(&config)) as Box<dyn Transport>)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 16);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Connect(format!("{:?}", ack.code)));
                    }
                    break;
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
        client
            .subscribe(self.topic.clone(), self.qos)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        self.session = Some((client, eventloop));
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<Incoming>, TransportError> {
        let Some((_, eventloop)) = self.session.as_mut() else {
            return Err(TransportError::Lost("not connected".to_string()));
        };
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(Some(Incoming {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            })),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(codes = ?ack.return_codes, "subscription acknowledged");
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) => {
                self.session = None;
                Err(TransportError::Lost(e.to_string()))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some((client, _)) = self.session.take() {
            let _ = client.disconnect().await;
        }
    }
}

/// Handle kept by the dispatcher for one running worker
pub struct BrokerHandle {
    name: String,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published status
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the worker and wait for it to exit
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(broker = %self.name, error = %e, "broker worker panicked");
            }
        }
    }
}

/// Start a worker task
pub fn spawn(
    name: impl Into<String>,
    transport: Box<dyn Transport>,
    policy: ConnectionPolicy,
    queue: QueueSender,
    max_fields: usize,
) -> BrokerHandle {
    let name = name.into();
    let connection = Connection::new(name.clone(), policy);
    let (status_tx, status_rx) = watch::channel(connection.status());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = BrokerWorker {
        name: name.clone(),
        transport,
        connection,
        queue,
        max_fields,
        status: status_tx,
        shutdown: shutdown_rx,
    };
    let join = tokio::spawn(worker.run());

    BrokerHandle {
        name,
        status: status_rx,
        shutdown: shutdown_tx,
        join: Some(join),
    }
}

struct BrokerWorker {
    name: String,
    transport: Box<dyn Transport>,
    connection: Connection,
    queue: QueueSender,
    max_fields: usize,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl BrokerWorker {
    async fn run(mut self) {
        info!(broker = %self.name, "broker worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.connection.state() {
                ConnectionState::Retired => {
                    error!(
                        broker = %self.name,
                        restarts = self.connection.restart_count(),
                        "broker retired after repeated connect failures"
                    );
                    break;
                }
                ConnectionState::Connected => {
                    if !self.poll_session().await {
                        break;
                    }
                }
                _ => {
                    if !self.connect().await {
                        break;
                    }
                }
            }
            self.publish();
        }

        self.transport.disconnect().await;
        self.connection.disconnected();
        self.publish();
        info!(broker = %self.name, state = %self.connection.state(), "broker worker stopped");
    }

    /// Wait out any backoff, then attempt a session; `false` on shutdown
    async fn connect(&mut self) -> bool {
        if let Some(wait) = self.connection.backoff_remaining(now()) {
            debug!(broker = %self.name, delay_ms = wait.as_millis() as u64, "backing off");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.changed() => return false,
            }
        }
        if !self.connection.begin_connect(now()) {
            return true;
        }
        self.publish();

        let limit = self.connection.policy().connect_timeout;
        let result = tokio::select! {
            r = tokio::time::timeout(limit, self.transport.connect()) => r,
            _ = self.shutdown.changed() => return false,
        };
        match result {
            Ok(Ok(())) => {
                self.connection.connected(now());
                info!(broker = %self.name, "connected and subscribed");
            }
            Ok(Err(e)) => {
                warn!(broker = %self.name, error = %e, "connect failed");
                self.connection.connect_failed(now(), e.to_string());
            }
            Err(_) => {
                let e = TransportError::Timeout(limit);
                warn!(broker = %self.name, error = %e, "connect failed");
                self.connection.connect_failed(now(), e.to_string());
            }
        }
        true
    }

    /// Read one message or time out for a stall check; `false` on shutdown
    async fn poll_session(&mut self) -> bool {
        let result = tokio::select! {
            r = tokio::time::timeout(STALL_CHECK, self.transport.next_message()) => r,
            _ = self.shutdown.changed() => return false,
        };
        match result {
            Ok(Ok(Some(incoming))) => {
                self.connection.record_received(now());
                self.enqueue(incoming);
            }
            Ok(Ok(None)) | Err(_) => {}
            Ok(Err(e)) => {
                warn!(broker = %self.name, error = %e, "session lost");
                self.transport.disconnect().await;
                self.connection.transport_error(now(), e.to_string());
                return true;
            }
        }
        if self.connection.is_stalled(now()) {
            warn!(broker = %self.name, "no data within the data timeout, restarting session");
            self.transport.disconnect().await;
            self.connection.stall(now());
        }
        true
    }

    fn enqueue(&self, incoming: Incoming) {
        match Envelope::from_slice(&incoming.payload, self.max_fields) {
            Ok(envelope) => {
                self.queue.offer(envelope.with_source(self.name.clone()));
            }
            Err(e) => {
                warn!(
                    broker = %self.name,
                    topic = %incoming.topic,
                    error = %e,
                    "dropping envelope"
                );
            }
        }
    }

    fn publish(&self) {
        let status = self.connection.status();
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}
