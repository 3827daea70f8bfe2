//! Impure I/O operations for the bridge connection
//!
//! [`MqttConnection`] owns the `rumqttc` client and a supervisor task that
//! drives the event loop, resubscribes on every ConnAck and rebuilds the
//! client with a fresh token whenever the connection drops.

use super::connection::{
    configure_mqtt_options, next_state, reconnect_delay, ConnectionEvent, ConnectionSettings,
    ConnectionState, MqttError, CONNECT_TIMEOUT,
};
use super::message_handler::{
    handle_control_payload, route_mqtt_event, should_process_message, EventRoute,
};
use crate::looper::Looper;
use crate::protocol::Message;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection to the device bridge
pub struct MqttConnection {
    settings: ConnectionSettings,
    looper: Looper,
    client: Arc<Mutex<Option<AsyncClient>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the supervisor task
struct Supervisor {
    settings: ConnectionSettings,
    looper: Looper,
    client: Arc<Mutex<Option<AsyncClient>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MqttConnection {
    /// Create an unconnected connection. Inbound control messages will be
    /// queued on `looper`.
    pub fn new(settings: ConnectionSettings, looper: Looper) -> Self {
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            looper,
            client: Arc::new(Mutex::new(None)),
            state_tx,
            state_rx,
            shutdown_tx,
            supervisor: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn create_connection(
        settings: &ConnectionSettings,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(settings)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Block until the connection is usable or `timeout` elapses.
    ///
    /// Drops and reconnects in between are waited through; only a denied
    /// subscription ends the wait early.
    pub async fn wait_for_connection(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let result = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| state.is_connected() || state.is_fatal()),
        )
        .await;

        match result {
            Ok(Ok(state)) => match &*state {
                ConnectionState::SubscriptionDenied(topic) => {
                    Err(MqttError::SubscriptionDenied(topic.clone()))
                }
                _ => Ok(()),
            },
            Ok(Err(_)) => Err(MqttError::ConnectionFailed(
                "State channel closed".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectionTimeout),
        }
    }

    /// Open the connection and wait for the broker's ConnAck.
    ///
    /// Calling this on an already running connection only waits. A connection
    /// whose subscription was denied is never reopened.
    pub async fn connect(&self) -> Result<(), MqttError> {
        if let ConnectionState::SubscriptionDenied(topic) = self.connection_state() {
            return Err(MqttError::SubscriptionDenied(topic));
        }

        {
            let mut supervisor = self.supervisor.lock().await;
            let running = supervisor
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());

            if !running {
                let (client, event_loop) = Self::create_connection(&self.settings)?;
                *self.client.lock().await = Some(client);

                self.shutdown_tx.send_replace(false);
                self.state_tx.send_modify(|state| {
                    *state = next_state(state, ConnectionEvent::ReconnectionStarted)
                });

                let task = Supervisor {
                    settings: self.settings.clone(),
                    looper: self.looper.clone(),
                    client: Arc::clone(&self.client),
                    state_tx: self.state_tx.clone(),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                };
                info!(client_id = %self.settings.client_id, broker = %self.settings.broker_url, "Connecting to bridge");
                let span = crate::mqtt_span!(operation = "supervisor", client_id = %self.settings.client_id);
                *supervisor = Some(tokio::spawn(task.run(event_loop).instrument(span)));
            }
        }

        Self::wait_for_connection(self.state_rx.clone(), CONNECT_TIMEOUT).await
    }

    /// Stop the supervisor and close the connection
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
        }

        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.supervisor.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Connection supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Connection supervisor ended with error: {}", e)
                }
                Err(_) => warn!("Connection supervisor didn't shut down gracefully"),
                _ => {}
            }
        }

        self.state_tx.send_modify(|state| {
            *state = next_state(
                state,
                ConnectionEvent::Disconnected("Client disconnected".to_string()),
            )
        });
        info!("Disconnected from bridge");
        Ok(())
    }

    /// Publish one message on the events topic at least once
    pub async fn publish(&self, message: &Message) -> Result<(), MqttError> {
        Self::wait_for_connection(self.state_rx.clone(), CONNECT_TIMEOUT).await?;

        let payload = message.to_json()?;
        let topic = self.settings.events_topic();

        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqttError::ConnectionFailed("Client not connected".to_string()))?;
        tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.publish(&topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| MqttError::ConnectionTimeout)?
        .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic = %topic, message_type = %message.message_type(), "Published message");
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// True once the broker has refused the control subscription
    pub fn is_fatally_disconnected(&self) -> bool {
        self.connection_state().is_fatal()
    }
}

impl Supervisor {
    fn transition(&self, event: ConnectionEvent) {
        self.state_tx
            .send_modify(|state| *state = next_state(state, event));
    }

    async fn run(mut self, event_loop: EventLoop) {
        info!(client_id = %self.settings.client_id, "Starting connection supervisor");
        let mut event_loop = event_loop;
        let mut consecutive_failures = 0u32;
        let mut subscribe_pending = false;

        loop {
            if subscribe_pending {
                subscribe_pending = !self.try_subscribe().await;
            }

            let event = tokio::select! {
                biased;
                _ = self.shutdown_rx.wait_for(|stop| *stop) => None,
                event = event_loop.poll() => Some(event),
            };
            let Some(event) = event else {
                if self.state_tx.borrow().is_connected() {
                    Self::flush_disconnect(&mut event_loop).await;
                }
                break;
            };

            let disconnect_reason = match event {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        consecutive_failures = 0;
                        self.transition(ConnectionEvent::ConnAckReceived);
                        info!("Connected to bridge");
                        subscribe_pending = true;
                        continue;
                    }
                    EventRoute::SubscriptionConfirmed { packet_id } => {
                        debug!(packet_id, "Subscription confirmed");
                        self.transition(ConnectionEvent::SubscriptionGranted);
                        continue;
                    }
                    EventRoute::SubscriptionRejected { packet_id } => {
                        let topic = self.settings.config_topic();
                        error!(packet_id, topic = %topic, "Broker denied control subscription");
                        self.transition(ConnectionEvent::SubscriptionRejected(topic));
                        break;
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        debug!(topic = %topic, bytes = payload.len(), "Received message");
                        if should_process_message(&topic, &self.settings.config_topic()) {
                            handle_control_payload(&payload, &self.looper);
                        }
                        continue;
                    }
                    EventRoute::Disconnected => "Broker sent disconnect".to_string(),
                    EventRoute::InfrastructureEvent(description) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", description);
                        continue;
                    }
                    EventRoute::OutgoingEvent => continue,
                },
                Err(e) => e.to_string(),
            };

            warn!(reason = %disconnect_reason, "Connection lost");
            subscribe_pending = false;
            self.transition(ConnectionEvent::Disconnected(disconnect_reason));

            if !self.reconnect(&mut event_loop, consecutive_failures).await {
                break;
            }
            consecutive_failures = consecutive_failures.saturating_add(1);
        }

        info!("Connection supervisor stopped");
    }

    /// Let the event loop send a queued disconnect before it is dropped
    async fn flush_disconnect(event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Disconnect not flushed before shutdown");
        }
    }

    /// Queue the control topic subscription without waiting on the request
    /// channel, which only this task drains. Returns false while the channel
    /// is full.
    async fn try_subscribe(&self) -> bool {
        let topic = self.settings.config_topic();
        let Some(client) = self.client.lock().await.clone() else {
            return true;
        };
        match client.try_subscribe(&topic, QoS::AtLeastOnce) {
            Ok(()) => {
                debug!(topic = %topic, "Subscribing to control topic");
                true
            }
            Err(e) => {
                debug!(topic = %topic, "Subscription request deferred: {}", e);
                false
            }
        }
    }

    /// Rebuild client and event loop with a fresh token.
    /// Returns false if shutdown was requested while waiting.
    async fn reconnect(&mut self, event_loop: &mut EventLoop, consecutive_failures: u32) -> bool {
        let delay = reconnect_delay(consecutive_failures);
        if !delay.is_zero() {
            let shutdown = tokio::select! {
                _ = self.shutdown_rx.wait_for(|stop| *stop) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if shutdown {
                return false;
            }
        }
        if *self.shutdown_rx.borrow() {
            return false;
        }

        self.transition(ConnectionEvent::ReconnectionStarted);
        match MqttConnection::create_connection(&self.settings) {
            Ok((client, new_event_loop)) => {
                *event_loop = new_event_loop;
                *self.client.lock().await = Some(client);
                info!(attempt = consecutive_failures + 1, "Reconnecting with a fresh token");
            }
            Err(e) => {
                // The old event loop retries with its previous credentials
                error!("Failed to create new connection: {}", e);
            }
        }
        true
    }
}

#[async_trait]
impl Transport for MqttConnection {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        MqttConnection::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttConnection::disconnect(self).await
    }

    async fn publish(&self, message: &Message) -> Result<(), Self::Error> {
        MqttConnection::publish(self, message).await
    }

    fn connection_state(&self) -> ConnectionState {
        MqttConnection::connection_state(self)
    }

    fn is_fatally_disconnected(&self) -> bool {
        MqttConnection::is_fatally_disconnected(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LogMessage, TopicBuilder};
    use crate::testing::{FakeBroker, FakeBrokerBehavior, PacketKind};
    use std::time::Instant;
    use tokio::time::timeout;

    fn local_settings(broker_url: &str) -> ConnectionSettings {
        ConnectionSettings {
            project_id: "test-project".to_string(),
            device_id: "test01".to_string(),
            client_id: TopicBuilder::build_client_id("test-project", "europe-west1", "reg", "test01"),
            broker_url: broker_url.to_string(),
            private_key: include_bytes!("../../../tests/fixtures/rsa_private.pem").to_vec(),
            ca_certs: None,
        }
    }

    #[tokio::test]
    async fn test_wait_for_connection_returns_when_already_connected() {
        let (_tx, rx) = watch::channel(ConnectionState::Subscribed);
        assert!(MqttConnection::wait_for_connection(rx, Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_waits_through_reconnects() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);

        let waiter = tokio::spawn(MqttConnection::wait_for_connection(
            rx,
            Duration::from_secs(5),
        ));
        tx.send_replace(ConnectionState::Disconnected("dropped".to_string()));
        tokio::task::yield_now().await;
        tx.send_replace(ConnectionState::Connected);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_times_out() {
        let (_tx, rx) = watch::channel(ConnectionState::Connecting);

        let result = MqttConnection::wait_for_connection(rx, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(MqttError::ConnectionTimeout)));
    }

    #[tokio::test]
    async fn test_wait_for_connection_surfaces_denied_subscription() {
        let (_tx, rx) = watch::channel(ConnectionState::SubscriptionDenied("/devices/x/config".to_string()));

        let result = MqttConnection::wait_for_connection(rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MqttError::SubscriptionDenied(_))));
    }

    #[tokio::test]
    async fn test_new_connection_is_disconnected() {
        let connection = MqttConnection::new(local_settings("mqtt://127.0.0.1:1"), Looper::new());

        assert!(matches!(
            connection.connection_state(),
            ConnectionState::Disconnected(_)
        ));
        assert!(!connection.is_fatally_disconnected());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_times_out() {
        let connection = MqttConnection::new(local_settings("mqtt://127.0.0.1:1"), Looper::new());

        let started = Instant::now();
        let result = connection.connect().await;

        assert!(matches!(result, Err(MqttError::ConnectionTimeout)));
        assert!(started.elapsed() >= CONNECT_TIMEOUT);
        assert!(!connection.connection_state().is_connected());

        connection.disconnect().await.unwrap();
        assert_eq!(
            connection.connection_state(),
            ConnectionState::Disconnected("Client disconnected".to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_with_bad_key_fails_fast() {
        let mut settings = local_settings("mqtt://127.0.0.1:1");
        settings.private_key = b"garbage".to_vec();
        let connection = MqttConnection::new(settings, Looper::new());

        let result = connection.connect().await;
        assert!(matches!(result, Err(MqttError::Credentials(_))));
    }

    #[tokio::test]
    async fn test_subscribes_when_requests_are_queued_before_connack() {
        let broker = FakeBroker::start(FakeBrokerBehavior {
            connack_delay: Duration::from_millis(300),
            ..Default::default()
        })
        .await
        .unwrap();
        let connection = Arc::new(MqttConnection::new(
            local_settings(&broker.url()),
            Looper::new(),
        ));

        let connecting = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.connect().await }
        });

        // Fill the request channel while the broker holds back its CONNACK
        let client = loop {
            if let Some(client) = connection.client.lock().await.clone() {
                break client;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let topic = connection.settings().events_topic();
        for _ in 0..REQUEST_CHANNEL_CAPACITY {
            client
                .try_publish(&topic, QoS::AtLeastOnce, false, "{}")
                .unwrap();
        }

        assert!(connecting.await.unwrap().is_ok());
        timeout(
            Duration::from_secs(2),
            broker.wait_for(|packets| packets.iter().any(|p| p.kind == PacketKind::Subscribe)),
        )
        .await
        .expect("control topic subscribed");
        timeout(
            Duration::from_secs(2),
            connection
                .state_rx
                .clone()
                .wait_for(|state| *state == ConnectionState::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();

        let message: Message = LogMessage::error("after backlog").into();
        timeout(Duration::from_secs(3), connection.publish(&message))
            .await
            .expect("publish returns")
            .unwrap();
        timeout(
            Duration::from_secs(2),
            broker.wait_for(|packets| {
                packets.iter().filter(|p| p.kind == PacketKind::Publish).count()
                    == REQUEST_CHANNEL_CAPACITY + 1
            }),
        )
        .await
        .unwrap();

        connection.disconnect().await.unwrap();
    }
}
