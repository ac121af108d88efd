//! MQTT publisher carrying each snapshot as a base64 JPEG text payload.

use std::time::{Duration, Instant};

use base64::Engine;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, RecvTimeoutError};
use tracing::{debug, info};

use crate::{sinks::ImageSink, transport::TransportError};

/// Broker and topic a snapshot is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTarget {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
}

/// Text payload published for one snapshot.
pub fn snapshot_payload(jpeg: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(jpeg)
}

/// Connects per snapshot, publishes at least once and waits for the ack.
pub struct MqttSink {
    target: MqttTarget,
    timeout: Duration,
}

impl MqttSink {
    pub fn new(target: MqttTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    fn options(&self, payload_len: usize) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.target.client_id.clone(),
            self.target.host.clone(),
            self.target.port,
        );
        options.set_keep_alive(Duration::from_secs(5));
        options.set_max_packet_size(64 * 1024, payload_len + self.target.topic.len() + 64);
        if let Some((user, password)) = self.target.credentials.as_ref() {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

impl ImageSink for MqttSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, jpeg: &[u8], _caption: &str) -> Result<(), TransportError> {
        if self.target.host.is_empty()
            || self.target.topic.is_empty()
            || self.target.client_id.trim().is_empty()
        {
            return Err(TransportError::Config(
                "mqtt broker host, topic and client id are required".into(),
            ));
        }
        let payload = snapshot_payload(jpeg);
        let payload_len = payload.len();
        let (client, mut connection) = Client::new(self.options(payload_len), 4);
        client
            .publish(
                self.target.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                payload.into_bytes(),
            )
            .map_err(|err| TransportError::Mqtt(err.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(TransportError::Timeout);
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => break Ok(()),
                Ok(Ok(event)) => debug!(?event, "mqtt event"),
                Ok(Err(err)) => break Err(TransportError::Mqtt(err.to_string())),
                Err(RecvTimeoutError::Timeout) => break Err(TransportError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(TransportError::Mqtt("connection closed".into()));
                }
            }
        };
        let _ = client.disconnect();
        outcome?;

        info!(
            topic = %self.target.topic,
            bytes = payload_len,
            "snapshot published over mqtt"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn target(port: u16, topic: &str) -> MqttTarget {
        MqttTarget {
            host: "127.0.0.1".into(),
            port,
            topic: topic.into(),
            client_id: "facewatch-test".into(),
            credentials: None,
        }
    }

    #[test]
    fn payload_is_standard_base64_of_the_jpeg() {
        assert_eq!(snapshot_payload(&[0xff, 0xd8, 0xff, 0xd9]), "/9j/2Q==");
        assert_eq!(snapshot_payload(b"jpeg"), "anBlZw==");
    }

    #[test]
    fn empty_topic_is_a_configuration_error() {
        let mut sink = MqttSink::new(target(1883, ""), Duration::from_secs(1));
        assert_eq!(sink.name(), "mqtt");
        assert!(matches!(
            sink.deliver(&[0xff, 0xd8], ""),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn unreachable_broker_fails_delivery() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut sink = MqttSink::new(target(port, "facewatch/motion"), Duration::from_secs(2));
        assert!(sink.deliver(&[0xff, 0xd8, 0xff, 0xd9], "").is_err());
    }
}
