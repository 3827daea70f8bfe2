//! MQTT connection tests
//!
//! Connection failures are exercised against closed ports, and the
//! supervisor's reconnect and subscription handling against the in-process
//! [`FakeBroker`]. Tests against a real broker need a local Mosquitto on
//! port 1883 and are ignored by default:
//!
//! ```bash
//! docker run -d -p 1883:1883 eclipse-mosquitto:1.6
//! cargo test --test test_mqtt_broker_integration -- --ignored
//! ```

mod test_helpers;

use bobnet_sensors::agent::AgentLifecycle;
use bobnet_sensors::looper::Looper;
use bobnet_sensors::protocol::{DataMessage, Message};
use bobnet_sensors::sensors::{DeviceRegistry, Sensors};
use bobnet_sensors::testing::broker::SUBACK_FAILURE;
use bobnet_sensors::testing::{FakeBroker, FakeBrokerBehavior, PacketKind, ReceivedPacket};
use bobnet_sensors::transport::mqtt::{ConnectionSettings, MqttConnection, MqttError};
use bobnet_sensors::transport::ConnectionState;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Map};
use std::time::{Duration, Instant};
use test_helpers::test_config;
use tokio::time::timeout;

const LOCAL_BROKER: &str = "mqtt://localhost:1883";
const WAIT: Duration = Duration::from_secs(5);

async fn connection(broker_url: &str, looper: Looper) -> MqttConnection {
    let config = test_config(broker_url);
    let settings = ConnectionSettings::from_config(&config.iotcore)
        .await
        .expect("fixture credentials load");
    MqttConnection::new(settings, looper)
}

/// Plain client watching the device's event topic
async fn observer() -> (AsyncClient, rumqttc::EventLoop) {
    let mut options = MqttOptions::new("bobnet-observer", "localhost", 1883);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut event_loop) = AsyncClient::new(options, 10);
    client
        .subscribe("/devices/test01/events", QoS::AtLeastOnce)
        .await
        .unwrap();

    // Wait for the subscription to be granted
    loop {
        if let Event::Incoming(Packet::SubAck(_)) = event_loop.poll().await.unwrap() {
            break;
        }
    }
    (client, event_loop)
}

async fn next_event_payload(event_loop: &mut rumqttc::EventLoop) -> serde_json::Value {
    loop {
        if let Event::Incoming(Packet::Publish(publish)) = event_loop.poll().await.unwrap() {
            return serde_json::from_slice(&publish.payload).unwrap();
        }
    }
}

#[tokio::test]
async fn test_connect_times_out_when_broker_unavailable() {
    let connection = connection("mqtt://127.0.0.1:1", Looper::new()).await;

    let start = Instant::now();
    let result = connection.connect().await;

    assert!(matches!(result, Err(MqttError::ConnectionTimeout)));
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(!connection.connection_state().is_connected());
    assert!(!connection.is_fatally_disconnected());

    connection.disconnect().await.unwrap();
    assert!(matches!(
        connection.connection_state(),
        ConnectionState::Disconnected(_)
    ));
}

fn reading() -> Message {
    let mut data = Map::new();
    data.insert("value".to_string(), json!(1));
    DataMessage::new("counter1", data).into()
}

fn position(packets: &[ReceivedPacket], connection: usize, kind: PacketKind) -> Option<usize> {
    packets
        .iter()
        .position(|packet| packet.connection == connection && packet.kind == kind)
}

#[tokio::test]
async fn test_connect_subscribes_to_control_topic() {
    let broker = FakeBroker::start(FakeBrokerBehavior::default())
        .await
        .unwrap();
    let connection = connection(&broker.url(), Looper::new()).await;

    connection.connect().await.unwrap();
    timeout(
        WAIT,
        broker.wait_for(|packets| position(packets, 0, PacketKind::Subscribe).is_some()),
    )
    .await
    .expect("control topic subscribed");

    connection.publish(&reading()).await.unwrap();
    timeout(
        WAIT,
        broker.wait_for(|packets| position(packets, 0, PacketKind::Publish).is_some()),
    )
    .await
    .unwrap();
    timeout(WAIT, async {
        while connection.connection_state() != ConnectionState::Subscribed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription granted");

    connection.disconnect().await.unwrap();
    timeout(
        WAIT,
        broker.wait_for(|packets| position(packets, 0, PacketKind::Disconnect).is_some()),
    )
    .await
    .expect("disconnect flushed to the broker");
}

#[tokio::test]
async fn test_reconnects_and_resubscribes_after_drop() {
    let broker = FakeBroker::start(FakeBrokerBehavior {
        close_after_first_suback: true,
        ..Default::default()
    })
    .await
    .unwrap();
    let connection = connection(&broker.url(), Looper::new()).await;

    connection.connect().await.unwrap();
    timeout(
        WAIT,
        broker.wait_for(|packets| position(packets, 1, PacketKind::Subscribe).is_some()),
    )
    .await
    .expect("subscribed again on the new connection");

    let packets = broker.received();
    assert!(position(&packets, 1, PacketKind::Connect) < position(&packets, 1, PacketKind::Subscribe));
    assert_eq!(broker.count(PacketKind::Connect), 2);
    assert_eq!(broker.count_on(0, PacketKind::Subscribe), 1);

    connection.publish(&reading()).await.unwrap();
    timeout(
        WAIT,
        broker.wait_for(|packets| position(packets, 1, PacketKind::Publish).is_some()),
    )
    .await
    .unwrap();
    assert!(!connection.is_fatally_disconnected());

    connection.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_denied_subscription_is_fatal_and_not_retried() {
    let broker = FakeBroker::start(FakeBrokerBehavior {
        suback_return_code: SUBACK_FAILURE,
        ..Default::default()
    })
    .await
    .unwrap();
    let connection = connection(&broker.url(), Looper::new()).await;

    // connect() returns once ConnAck is seen, or on the denial if it lands first
    match connection.connect().await {
        Ok(()) | Err(MqttError::SubscriptionDenied(_)) => {}
        Err(e) => panic!("unexpected connect error: {e}"),
    }
    timeout(WAIT, async {
        while !connection.is_fatally_disconnected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("denial surfaced");

    assert_eq!(
        connection.connection_state(),
        ConnectionState::SubscriptionDenied("/devices/test01/config".to_string())
    );
    assert!(matches!(
        connection.connect().await,
        Err(MqttError::SubscriptionDenied(ref topic)) if topic == "/devices/test01/config"
    ));
    assert!(matches!(
        connection.publish(&reading()).await,
        Err(MqttError::SubscriptionDenied(_))
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.count(PacketKind::Connect), 1);

    connection.disconnect().await.unwrap();
    assert!(connection.is_fatally_disconnected());
}

#[tokio::test]
#[ignore = "requires a local MQTT broker"]
async fn test_connect_and_publish_to_real_broker() {
    let (_observer, mut events) = observer().await;
    let connection = connection(LOCAL_BROKER, Looper::new()).await;

    connection.connect().await.unwrap();
    assert_eq!(connection.connection_state(), ConnectionState::Subscribed);

    let mut data = Map::new();
    data.insert("message".to_string(), json!("value"));
    connection
        .publish(&DataMessage::new("cli", data).into())
        .await
        .unwrap();

    let payload = timeout(Duration::from_secs(5), next_event_payload(&mut events))
        .await
        .unwrap();
    assert_eq!(payload["type"], "data");
    assert_eq!(payload["device"], "cli");
    assert_eq!(payload["data"]["message"], "value");

    connection.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local MQTT broker"]
async fn test_control_message_round_trip_through_broker() {
    let (observer, mut events) = observer().await;
    let config = test_config(LOCAL_BROKER);
    let sensors = Sensors::from_config(&config.sensors, &DeviceRegistry::with_builtin()).unwrap();

    let looper = Looper::new();
    let transport = connection(LOCAL_BROKER, looper.clone()).await;
    let mut agent = AgentLifecycle::new(transport, sensors, looper);
    agent.start().await.unwrap();

    // First reading of the counter, which starts at 3
    let reading = timeout(Duration::from_secs(5), next_event_payload(&mut events))
        .await
        .unwrap();
    assert_eq!(reading["data"]["value"], 3);

    observer
        .publish(
            "/devices/test01/config",
            QoS::AtLeastOnce,
            false,
            r#"{"commands": {"counter1": {"id": 1, "state": "new"}}}"#,
        )
        .await
        .unwrap();

    let ack = timeout(Duration::from_secs(5), next_event_payload(&mut events))
        .await
        .unwrap();
    let ack: Message = serde_json::from_value(ack).unwrap();
    assert!(matches!(ack, Message::Command(ref command) if command.id == 1));

    agent.shutdown().await.unwrap();
}
