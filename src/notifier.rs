//! Delivery of presence events to the outside world.
//!
//! A [`Notifier`] fans an event out to every configured channel whose filter
//! accepts the event kind. Delivery is best effort: failures are logged and
//! never reach the poll loop. With no channels configured it does nothing.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde_derive::Serialize;

use crate::messages::{PresenceEvent, PresenceKind};
use crate::mqtt::MqttClient;

const PUSHBULLET_PUSHES_URL: &str = "https://api.pushbullet.com/v2/pushes";
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Pushbullet rejected the push with status {0}")]
    Rejected(reqwest::StatusCode),
    #[error("MQTT publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("gave up after {0:?}")]
    TimedOut(Duration),
}

pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, event: &'a PresenceEvent) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Which event kinds a channel wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyFilter {
    pub arrivals: bool,
    pub departures: bool,
}

impl NotifyFilter {
    pub const ALL: NotifyFilter = NotifyFilter {
        arrivals: true,
        departures: true,
    };

    pub fn accepts(&self, kind: PresenceKind) -> bool {
        match kind {
            PresenceKind::Arrived => self.arrivals,
            PresenceKind::Departed => self.departures,
        }
    }
}

struct Route {
    channel: Box<dyn NotificationChannel>,
    filter: NotifyFilter,
}

pub struct Notifier {
    routes: Vec<Route>,
    send_timeout: Duration,
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier {
            routes: Vec::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl Notifier {
    pub fn new() -> Self {
        Notifier::default()
    }

    /// Upper bound on a single channel send.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Adds the Pushbullet route when a key is available. A client that
    /// cannot be built leaves push notifications disabled.
    pub fn with_pushbullet(self, api_key: Option<String>, filter: NotifyFilter) -> Self {
        let Some(api_key) = api_key else {
            info!("No Pushbullet key configured, push notifications disabled");
            return self;
        };
        match PushbulletChannel::new(api_key) {
            Ok(channel) => self.with_channel(channel, filter),
            Err(err) => {
                warn!("Push notifications disabled, Pushbullet client failed: {}", err);
                self
            }
        }
    }

    pub fn with_channel(
        mut self,
        channel: impl NotificationChannel + 'static,
        filter: NotifyFilter,
    ) -> Self {
        debug!("Notifications enabled via {} ({:?})", channel.name(), filter);
        self.routes.push(Route {
            channel: Box::new(channel),
            filter,
        });
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.routes.is_empty()
    }

    pub async fn deliver(&self, event: &PresenceEvent) {
        for route in &self.routes {
            if !route.filter.accepts(event.kind) {
                debug!(
                    "{} notifications for {} events are disabled",
                    route.channel.name(),
                    event.kind
                );
                continue;
            }
            let sent = tokio::time::timeout(self.send_timeout, route.channel.send(event))
                .await
                .unwrap_or(Err(NotifyError::TimedOut(self.send_timeout)));
            if let Err(err) = sent {
                error!(
                    "Failed to notify {} {} via {}: {}",
                    event.person,
                    event.kind,
                    route.channel.name(),
                    err
                );
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct PushNote {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'static str,
    body: String,
}

impl PushNote {
    fn for_event(event: &PresenceEvent) -> Self {
        let (title, body) = match event.kind {
            PresenceKind::Arrived => (
                "Home Arrival",
                format!("{} has connected to the network", event.person),
            ),
            PresenceKind::Departed => (
                "Home Departure",
                format!("{} has disconnected from the network", event.person),
            ),
        };
        PushNote {
            kind: "note",
            title,
            body,
        }
    }
}

pub struct PushbulletChannel {
    http: reqwest::Client,
    api_key: String,
}

impl PushbulletChannel {
    pub fn new(api_key: String) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(PushbulletChannel { http, api_key })
    }

    async fn push(&self, event: &PresenceEvent) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(PUSHBULLET_PUSHES_URL)
            .header("Access-Token", &self.api_key)
            .json(&PushNote::for_event(event))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status()));
        }
        debug!("Pushed {} notification for {}", event.kind, event.person);
        Ok(())
    }
}

impl NotificationChannel for PushbulletChannel {
    fn name(&self) -> &'static str {
        "pushbullet"
    }

    fn send<'a>(&'a self, event: &'a PresenceEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(self.push(event))
    }
}

/// Mirrors presence transitions as retained device-tracker messages.
pub struct MqttChannel {
    client: MqttClient,
    addresses: BTreeMap<String, String>,
}

impl MqttChannel {
    pub fn new(client: MqttClient, addresses: BTreeMap<String, String>) -> Self {
        MqttChannel { client, addresses }
    }

    async fn publish(&self, event: &PresenceEvent) -> Result<(), NotifyError> {
        let address = self
            .addresses
            .get(&event.person)
            .map(String::as_str)
            .unwrap_or_default();
        self.client
            .announce_presence(&event.person, address, event.is_home(), event.timestamp)?;
        Ok(())
    }
}

impl NotificationChannel for MqttChannel {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn send<'a>(&'a self, event: &'a PresenceEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(self.publish(event))
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records delivered events, optionally failing every send.
    #[derive(Clone, Default)]
    pub struct RecordingChannel {
        pub delivered: Arc<Mutex<Vec<PresenceEvent>>>,
        pub fail: bool,
    }

    impl RecordingChannel {
        pub fn failing() -> Self {
            RecordingChannel {
                fail: true,
                ..Default::default()
            }
        }

        pub fn events(&self) -> Vec<PresenceEvent> {
            self.delivered.lock().unwrap().clone()
        }
    }

    /// Never completes a send, like a publish stuck behind a dead broker.
    pub struct StalledChannel;

    impl NotificationChannel for StalledChannel {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn send<'a>(&'a self, _event: &'a PresenceEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
            Box::pin(futures::future::pending())
        }
    }

    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn send<'a>(&'a self, event: &'a PresenceEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
            Box::pin(async move {
                self.delivered.lock().unwrap().push(event.clone());
                if self.fail {
                    return Err(NotifyError::Rejected(reqwest::StatusCode::UNAUTHORIZED));
                }
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::testing::{RecordingChannel, StalledChannel};
    use super::*;
    use crate::config::MqttConfig;

    fn event(kind: PresenceKind) -> PresenceEvent {
        PresenceEvent {
            person: "Alice".to_string(),
            kind,
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = Notifier::new();
        assert!(!notifier.is_enabled());
        notifier.deliver(&event(PresenceKind::Arrived)).await;
        notifier.deliver(&event(PresenceKind::Departed)).await;
    }

    #[tokio::test]
    async fn test_filter_per_event_kind() {
        let arrivals_only = RecordingChannel::default();
        let everything = RecordingChannel::default();
        let notifier = Notifier::new()
            .with_channel(
                arrivals_only.clone(),
                NotifyFilter {
                    arrivals: true,
                    departures: false,
                },
            )
            .with_channel(everything.clone(), NotifyFilter::ALL);

        notifier.deliver(&event(PresenceKind::Arrived)).await;
        notifier.deliver(&event(PresenceKind::Departed)).await;

        assert_eq!(arrivals_only.events(), vec![event(PresenceKind::Arrived)]);
        assert_eq!(everything.events().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_stop_delivery() {
        let broken = RecordingChannel::failing();
        let healthy = RecordingChannel::default();
        let notifier = Notifier::new()
            .with_channel(broken.clone(), NotifyFilter::ALL)
            .with_channel(healthy.clone(), NotifyFilter::ALL);

        notifier.deliver(&event(PresenceKind::Departed)).await;

        assert_eq!(broken.events().len(), 1);
        assert_eq!(healthy.events(), vec![event(PresenceKind::Departed)]);
    }

    #[test]
    fn test_push_note_text() {
        let note = PushNote::for_event(&event(PresenceKind::Arrived));
        assert_eq!(note.title, "Home Arrival");
        assert_eq!(note.body, "Alice has connected to the network");

        let json = serde_json::to_value(PushNote::for_event(&event(PresenceKind::Departed))).unwrap();
        assert_eq!(json["type"], "note");
        assert_eq!(json["title"], "Home Departure");
        assert_eq!(json["body"], "Alice has disconnected from the network");
    }

    #[tokio::test]
    async fn test_stalled_channel_is_abandoned() {
        let healthy = RecordingChannel::default();
        let notifier = Notifier::new()
            .with_send_timeout(Duration::from_millis(50))
            .with_channel(StalledChannel, NotifyFilter::ALL)
            .with_channel(healthy.clone(), NotifyFilter::ALL);

        tokio::time::timeout(Duration::from_secs(2), notifier.deliver(&event(PresenceKind::Arrived)))
            .await
            .expect("delivery should give up on the stalled channel");
        assert_eq!(healthy.events(), vec![event(PresenceKind::Arrived)]);
    }

    #[tokio::test]
    async fn test_mqtt_delivery_returns_while_broker_down() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: Some(1),
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            keep_alive_seconds: None,
        };
        // The event loop is never polled, so nothing drains the request queue.
        let (client, _eventloop) = MqttClient::new(&config);
        let addresses = BTreeMap::from([("Alice".to_string(), "10.0.0.2".to_string())]);
        let notifier = Notifier::new().with_channel(MqttChannel::new(client, addresses), NotifyFilter::ALL);

        for n in 0..20 {
            let kind = if n % 2 == 0 {
                PresenceKind::Arrived
            } else {
                PresenceKind::Departed
            };
            tokio::time::timeout(Duration::from_secs(1), notifier.deliver(&event(kind)))
                .await
                .unwrap_or_else(|_| panic!("delivery #{n} blocked with the broker down"));
        }
    }

    #[test]
    fn test_pushbullet_route_optional() {
        let filter = NotifyFilter {
            arrivals: true,
            departures: false,
        };
        assert!(!Notifier::new().with_pushbullet(None, filter).is_enabled());
        assert!(
            Notifier::new()
                .with_pushbullet(Some("o.abc123".to_string()), filter)
                .is_enabled()
        );
    }
}
