// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error, unavailable_error};
use log::{debug, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop,
              MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;

use crate::csv_sink::format_values;
use crate::imu_trait::Reading;
use crate::sink_fanout::Sink;

pub const DEFAULT_BROKER_PORT: u16 = 1883;

const KEEP_ALIVE: Duration = Duration::from_secs(5);

// Pause between reconnection attempts after the broker connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// How long close() waits for queued messages to be written.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Splits "host[:port]" into host and port, defaulting the port.
pub fn parse_broker(broker: &str) -> Result<(String, u16), CanonicalError> {
    let broker = broker.trim();
    if broker.is_empty() {
        return Err(invalid_argument_error("Empty broker address"));
    }
    match broker.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| invalid_argument_error(
                &format!("Bad broker port {:?}", port)))?;
            Ok((host.to_string(), port))
        },
        Some(_) => Err(invalid_argument_error(
            &format!("Bad broker address {:?}", broker))),
        None => Ok((broker.to_string(), DEFAULT_BROKER_PORT)),
    }
}

fn validate_topic(topic: &str) -> Result<(), CanonicalError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(invalid_argument_error(
            &format!("Invalid publish topic {:?}", topic)));
    }
    Ok(())
}

// Publishes each Reading's comma-joined values to an MQTT broker, QoS 0.
// Delivery is fire-and-forget: deliver() only enqueues onto the client's
// bounded request queue, which a tokio task drains onto the connection. A
// full queue drops the reading (counted, not an error). If the connection
// drops, the task keeps reconnecting; readings queue up meanwhile and are
// dropped once the queue is full.
pub struct NetworkSink {
    client: AsyncClient,
    topic: String,
    closed: bool,
    dropped: u64,
    worker: Option<JoinHandle<()>>,
    runtime: tokio::runtime::Handle,
}

impl NetworkSink {
    /// Connects to the broker at `host`:`port` as `client_id` and waits for
    /// its acknowledgement. Must be called within a tokio runtime; the
    /// connection task is spawned onto it. Returns unavailable_error if the
    /// broker does not accept the connection within `connect_timeout`;
    /// callers treat that as "no network sink" rather than a fatal error.
    pub async fn connect(host: &str, port: u16, client_id: &str, topic: &str,
                         queue_capacity: usize, connect_timeout: Duration)
                         -> Result<Self, CanonicalError> {
        if queue_capacity == 0 {
            return Err(invalid_argument_error("Queue capacity must be positive"));
        }
        validate_topic(topic)?;
        // MqttOptions panics on these.
        if client_id.is_empty() || client_id.starts_with(' ') {
            return Err(invalid_argument_error(
                &format!("Invalid client id {:?}", client_id)));
        }
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, mut eventloop) = AsyncClient::new(options, queue_capacity);

        let connected = tokio::time::timeout(connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            return Ok(());
                        }
                        return Err(unavailable_error(
                            &format!("Broker {}:{} refused connection: {:?}",
                                     host, port, ack.code)));
                    },
                    Ok(_) => {},
                    Err(e) => {
                        return Err(unavailable_error(
                            &format!("Could not connect to broker {}:{}: {:?}",
                                     host, port, e)));
                    },
                }
            }
        }).await;
        match connected {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(unavailable_error(
                    &format!("Timed out connecting to broker {}:{}", host, port)));
            },
        }
        info!("Connected to broker {}:{} as {}, topic {}", host, port, client_id, topic);

        let worker = tokio::task::spawn(NetworkSink::worker(eventloop));
        Ok(NetworkSink{
            client,
            topic: topic.to_string(),
            closed: false,
            dropped: 0,
            worker: Some(worker),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    // Drives the connection until the client disconnects or goes away.
    async fn worker(mut eventloop: EventLoop) {
        let mut failures = 0u64;
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if failures > 0 {
                        info!("Reconnected to broker after {} attempts", failures);
                    }
                    failures = 0;
                },
                Ok(_) => {},
                Err(ConnectionError::RequestsDone) => break,
                Err(e) => {
                    if failures == 0 {
                        warn!("Broker connection lost: {:?}", e);
                    } else {
                        debug!("Broker reconnect failed: {:?}", e);
                    }
                    failures += 1;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                },
            }
        }
    }
}

impl Sink for NetworkSink {
    fn name(&self) -> &str {
        "network"
    }

    fn deliver(&mut self, reading: &Reading) -> Result<(), CanonicalError> {
        if self.closed {
            self.dropped += 1;
            return Ok(());
        }
        if self.client.try_publish(self.topic.as_str(), QoS::AtMostOnce, false,
                                   format_values(reading)).is_err() {
            self.dropped += 1;
        }
        Ok(())
    }

    // Must not be called from within the tokio runtime's async context.
    fn close(&mut self) -> Result<(), CanonicalError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Queued behind any pending publishes, so those go out first.
        if let Err(e) = self.client.try_disconnect() {
            debug!("Could not queue broker disconnect: {:?}", e);
        }
        if let Some(mut worker) = self.worker.take() {
            let drained = self.runtime.block_on(async {
                tokio::time::timeout(DRAIN_TIMEOUT, &mut worker).await
            });
            if drained.is_err() {
                warn!("Broker connection did not drain within {:?}", DRAIN_TIMEOUT);
                worker.abort();
            }
        }
        Ok(())
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }
}

// mod tests.
