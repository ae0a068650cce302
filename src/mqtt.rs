use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::{config, messages::StateAnnouncement};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    address: &'a str,
    confidence: u8,
    presence: &'static str,
    timestamp: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "whoishome".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "whoishome".to_string()),
            },
            eventloop,
        )
    }

    fn scan_topic(&self) -> String {
        format!("{}/scan", self.topic_path)
    }

    fn device_topic(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(name)
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(self.scan_topic(), QoS::AtMostOnce)
            .await
    }

    /// Drives the connection. Publishes on the scan topic are forwarded as
    /// scan requests to the poll loop.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<StateAnnouncement>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        if p.topic == self.scan_topic() {
                            if let Err(err) = tx.send(StateAnnouncement::ScanRequested) {
                                error!("Error announcing scan request: {:?}", err);
                            }
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Queues a retained presence message without waiting. Fails instead of
    /// blocking when the request queue is full, e.g. while the broker is down.
    pub fn announce_presence(
        &self,
        name: &str,
        address: &str,
        home: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<(), rumqttc::ClientError> {
        info!(
            "Announcing {} as {} on MQTT",
            name,
            if home { "home" } else { "not_home" }
        );
        let payload = device_payload(name, address, home, timestamp);
        self.client
            .try_publish(self.device_topic(name), QoS::AtLeastOnce, true, payload)
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn device_payload(name: &str, address: &str, home: bool, timestamp: DateTime<Utc>) -> String {
    let message = DeviceMqttMessage {
        name,
        address,
        confidence: if home { 100 } else { 0 },
        presence: if home { "home" } else { "not_home" },
        timestamp: timestamp.to_rfc3339(),
    };
    // Only plain strings and integers, serialization cannot fail.
    serde_json::to_string(&message).unwrap_or_default()
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
