//! Embedded MQTT broker using rumqttd
//!
//! Lets a standalone timer serve telemetry to the dashboard without an
//! external broker on the network. Disabled by default.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Build the rumqttd configuration for a single v4 listener
fn broker_config(listen_addr: SocketAddr) -> Config {
    let router_config = RouterConfig {
        max_segment_size: 1_048_576,
        max_segment_count: 10,
        max_connections: 64,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen: listen_addr,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 65_536,
                max_inflight_count: 100,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router: router_config,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded MQTT broker if enabled in config
///
/// The broker runs on its own OS thread; `Broker::start` blocks for the
/// lifetime of the process.
pub fn start_embedded_broker(app_config: &AppConfig) {
    if !app_config.broker_enabled() {
        return;
    }

    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen_addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return;
        }
    };

    let config = broker_config(listen_addr);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give the listener time to bind before the publisher connects
    thread::sleep(Duration::from_millis(100));
    info!(addr = %listen_addr, "broker_started");
}
