//! MQTT publishing over rumqttc.

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde_json::Value;

use crate::events::sink::EventSink;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `[v6]:port` or a `mqtt://` / `mqtts://` URL.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Publishes at most once; a dropped message is not retried.
pub struct MqttSink {
    client: Client,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = &settings.endpoint;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        log::info!(
            "MQTT client started for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            connection_handle: Mutex::new(Some(spawn_connection(connection))),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt connection handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn spawn_connection(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        }
    })
}

impl EventSink for MqttSink {
    fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.client.publish(topic, QoS::AtMostOnce, false, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_plain() {
        let endpoint = parse_mqtt_endpoint("127.0.0.1:1883").unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.use_tls);
    }

    #[test]
    fn parse_endpoint_mqtts_scheme() {
        let endpoint = parse_mqtt_endpoint("mqtts://broker.local:8883").unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.use_tls);
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let endpoint = parse_mqtt_endpoint("[::1]:1883").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_garbage() {
        assert!(parse_mqtt_endpoint("broker.local").is_err());
        assert!(parse_mqtt_endpoint("ws://broker.local:80").is_err());
        assert!(parse_mqtt_endpoint(":1883").is_err());
        assert!(parse_mqtt_endpoint("host:notaport").is_err());
    }
}
