//! MQTT publisher for race telemetry
//!
//! Publishes to:
//! - pumptrack/lap - Completed laps (QoS 1)
//! - pumptrack/dnf - Timed-out laps (QoS 1)
//! - pumptrack/status - Race/sensor state (QoS 0)
//! - pumptrack/stats - Session statistics (QoS 0)
//! - pumptrack/health - Sensor health detail (QoS 0)
//!
//! Event-driven messages come from the fan-out queue; status, statistics and
//! health are also refreshed on a fixed interval from the status store.
//! Publishing never waits on the broker: `try_publish` fails fast when the
//! client's request queue is full and the failure is counted.

use crate::domain::race::RaceEvent;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::telemetry::{TelemetryBuilder, TelemetryMessage};
use crate::services::status_store::StatusStore;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct Topics {
    lap: String,
    dnf: String,
    status: String,
    stats: String,
    health: String,
}

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    events: mpsc::Receiver<RaceEvent>,
    store: StatusStore,
    builder: TelemetryBuilder,
    topics: Topics,
    publish_interval: Duration,
    metrics: Arc<Metrics>,
}

impl MqttPublisher {
    /// Create the publisher and spawn the rumqttc event loop
    pub fn new(
        config: &Config,
        events: mpsc::Receiver<RaceEvent>,
        store: StatusStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        let client_id = format!("{}-{}", config.mqtt_client_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_publisher_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_publisher_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_publisher_connection_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            events,
            store,
            builder: TelemetryBuilder::new(config.site_id()),
            topics: Topics {
                lap: config.mqtt_lap_topic().to_string(),
                dnf: config.mqtt_dnf_topic().to_string(),
                status: config.mqtt_status_topic().to_string(),
                stats: config.mqtt_stats_topic().to_string(),
                health: config.mqtt_health_topic().to_string(),
            },
            publish_interval: config.mqtt_publish_interval(),
            metrics,
        }
    }

    /// Run until shutdown, then drain queued events
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            lap = %self.topics.lap,
            status = %self.topics.status,
            interval_ms = %self.publish_interval.as_millis(),
            "mqtt_publisher_started"
        );

        let mut ticker = interval(self.publish_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_publisher_shutdown");
                        while let Ok(event) = self.events.try_recv() {
                            self.publish_event(&event);
                        }
                        if let Err(e) = self.client.disconnect().await {
                            debug!(error = %e, "mqtt_publisher_disconnect_failed");
                        }
                        return;
                    }
                }
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        Some(event) => self.publish_event(&event),
                        None => {
                            info!("mqtt_publisher_event_source_closed");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.publish_periodic();
                }
            }
        }
    }

    fn publish_event(&self, event: &RaceEvent) {
        let snapshot = self.store.read();
        for message in self.builder.for_event(event, &snapshot, Instant::now()) {
            self.publish(&message);
        }
    }

    fn publish_periodic(&self) {
        let snapshot = self.store.read();
        for message in self.builder.periodic(&snapshot, Instant::now()) {
            self.publish(&message);
        }
    }

    fn route(&self, message: &TelemetryMessage) -> (&str, QoS) {
        match message {
            TelemetryMessage::Lap(_) => (&self.topics.lap, QoS::AtLeastOnce),
            TelemetryMessage::Dnf(_) => (&self.topics.dnf, QoS::AtLeastOnce),
            TelemetryMessage::Status(_) => (&self.topics.status, QoS::AtMostOnce),
            TelemetryMessage::Statistics(_) => (&self.topics.stats, QoS::AtMostOnce),
            TelemetryMessage::Health(_) => (&self.topics.health, QoS::AtMostOnce),
        }
    }

    fn publish(&self, message: &TelemetryMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, kind = %message.kind(), "mqtt_payload_serialize_failed");
                return;
            }
        };

        let (topic, qos) = self.route(message);
        if let Err(e) = self.client.try_publish(topic, qos, false, json.into_bytes()) {
            self.metrics.record_publish_failure();
            match qos {
                QoS::AtLeastOnce => error!(error = %e, topic = %topic, "mqtt_publish_failed"),
                _ => debug!(error = %e, topic = %topic, "mqtt_publish_failed"),
            }
        }
    }
}
