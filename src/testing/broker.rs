//! In-process MQTT 3.1.1 broker for exercising the bridge connection
//!
//! Speaks just enough of the protocol to acknowledge connects, subscriptions,
//! publishes and pings, and records every packet it receives so tests can
//! assert on what reached the wire.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// SUBACK return code granting QoS 1
pub const SUBACK_GRANTED_QOS1: u8 = 0x01;
/// SUBACK return code refusing the subscription
pub const SUBACK_FAILURE: u8 = 0x80;

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const PINGRESP: [u8; 2] = [0xD0, 0x00];

/// Control packet types the broker distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Publish,
    Subscribe,
    PingReq,
    Disconnect,
    Other(u8),
}

impl PacketKind {
    fn from_header(header: u8) -> Self {
        match header >> 4 {
            1 => Self::Connect,
            3 => Self::Publish,
            8 => Self::Subscribe,
            12 => Self::PingReq,
            14 => Self::Disconnect,
            other => Self::Other(other),
        }
    }
}

/// One packet as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// Index of the TCP connection it arrived on, counting from 0
    pub connection: usize,
    pub kind: PacketKind,
}

/// How the broker answers
#[derive(Debug, Clone)]
pub struct FakeBrokerBehavior {
    /// Pause before answering CONNECT
    pub connack_delay: Duration,
    /// Return code sent in every SUBACK
    pub suback_return_code: u8,
    /// Drop the first connection right after its SUBACK
    pub close_after_first_suback: bool,
}

impl Default for FakeBrokerBehavior {
    fn default() -> Self {
        Self {
            connack_delay: Duration::ZERO,
            suback_return_code: SUBACK_GRANTED_QOS1,
            close_after_first_suback: false,
        }
    }
}

#[derive(Default)]
struct Recorder {
    packets: Mutex<Vec<ReceivedPacket>>,
    activity: Notify,
}

impl Recorder {
    fn record(&self, packet: ReceivedPacket) {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet);
        self.activity.notify_waiters();
    }

    fn snapshot(&self) -> Vec<ReceivedPacket> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Broker listening on an ephemeral localhost port
pub struct FakeBroker {
    port: u16,
    recorder: Arc<Recorder>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(behavior: FakeBrokerBehavior) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let recorder = Arc::new(Recorder::default());

        let accept_recorder = Arc::clone(&recorder);
        let accept_task = tokio::spawn(async move {
            let mut connection = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let session = Session {
                    connection,
                    behavior: behavior.clone(),
                    recorder: Arc::clone(&accept_recorder),
                };
                tokio::spawn(session.run(stream));
                connection += 1;
            }
        });

        Ok(Self {
            port,
            recorder,
            accept_task,
        })
    }

    /// Broker URL suitable for `ConnectionSettings::broker_url`
    pub fn url(&self) -> String {
        format!("mqtt://127.0.0.1:{}", self.port)
    }

    pub fn received(&self) -> Vec<ReceivedPacket> {
        self.recorder.snapshot()
    }

    pub fn count(&self, kind: PacketKind) -> usize {
        self.received()
            .iter()
            .filter(|packet| packet.kind == kind)
            .count()
    }

    pub fn count_on(&self, connection: usize, kind: PacketKind) -> usize {
        self.received()
            .iter()
            .filter(|packet| packet.connection == connection && packet.kind == kind)
            .count()
    }

    /// Wait until the recorded packets satisfy `condition`
    pub async fn wait_for(&self, condition: impl Fn(&[ReceivedPacket]) -> bool) {
        loop {
            let notified = self.recorder.activity.notified();
            if condition(&self.recorder.snapshot()) {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct Session {
    connection: usize,
    behavior: FakeBrokerBehavior,
    recorder: Arc<Recorder>,
}

impl Session {
    async fn run(self, mut stream: TcpStream) {
        loop {
            let (header, body) = match read_packet(&mut stream).await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(connection = self.connection, "Fake broker session ended: {}", e);
                    return;
                }
            };
            let kind = PacketKind::from_header(header);
            self.recorder.record(ReceivedPacket {
                connection: self.connection,
                kind,
            });

            let reply = match kind {
                PacketKind::Connect => {
                    tokio::time::sleep(self.behavior.connack_delay).await;
                    Some(CONNACK_ACCEPTED.to_vec())
                }
                PacketKind::Subscribe => body.get(0..2).map(|packet_id| {
                    vec![
                        0x90,
                        0x03,
                        packet_id[0],
                        packet_id[1],
                        self.behavior.suback_return_code,
                    ]
                }),
                PacketKind::Publish => puback_for(header, &body),
                PacketKind::PingReq => Some(PINGRESP.to_vec()),
                PacketKind::Disconnect => return,
                PacketKind::Other(_) => None,
            };

            if let Some(reply) = reply {
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }

            if kind == PacketKind::Subscribe
                && self.behavior.close_after_first_suback
                && self.connection == 0
            {
                debug!("Fake broker dropping first connection");
                return;
            }
        }
    }
}

/// PUBACK for a QoS 1 publish; QoS 0 publishes are not acknowledged
fn puback_for(header: u8, body: &[u8]) -> Option<Vec<u8>> {
    if (header >> 1) & 0x03 == 0 {
        return None;
    }
    let topic_len = usize::from(u16::from_be_bytes([*body.first()?, *body.get(1)?]));
    let packet_id = body.get(2 + topic_len..4 + topic_len)?;
    Some(vec![0x40, 0x02, packet_id[0], packet_id[1]])
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Malformed remaining length",
            ));
        }
    }

    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}
