//! MQTT transport built on `rumqttc`
//!
//! Each session owns one `rumqttc` client. Its event loop is polled until the
//! broker's CONNACK arrives, then handed to a driver task that forwards
//! incoming PUBLISH packets to the session and reports the first network
//! error as a lost connection. `rumqttc`'s own reconnect is never used; the
//! bus client decides when to dial again.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::{
    BusConnector, BusError, BusSession, InboundMessage, Publication, AVAILABILITY_OFFLINE,
};

/// Capacity of the `rumqttc` request channel
const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the DISCONNECT to leave the socket
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection settings for the MQTT broker
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub qos: QoS,
    pub connect_timeout: Duration,
    /// Retained topic that receives `offline` as last will and on clean close
    pub availability_topic: Option<String>,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            qos: QoS::AtLeastOnce,
            connect_timeout: Duration::from_secs(10),
            availability_topic: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(1)));
        options.set_clean_session(true);

        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }

        if let Some(topic) = &self.availability_topic {
            options.set_last_will(LastWill::new(
                topic,
                AVAILABILITY_OFFLINE,
                QoS::AtLeastOnce,
                true,
            ));
        }

        options
    }
}

/// Map a numeric QoS level to `rumqttc`'s enum
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Opens sessions to an MQTT broker
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BusConnector for MqttConnector {
    async fn connect(&self) -> Result<Box<dyn BusSession>, BusError> {
        let settings = &self.settings;
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "Connecting to MQTT broker");

        let (client, mut eventloop) =
            AsyncClient::new(settings.options(), REQUEST_CHANNEL_CAPACITY);

        timeout(settings.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                BusError::Connect(format!(
                    "timed out connecting to {}:{}",
                    settings.host, settings.port
                ))
            })??;

        let (incoming_tx, incoming_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let driver = tokio::spawn(drive(eventloop, incoming_tx));

        Ok(Box::new(MqttSession {
            client,
            incoming: incoming_rx,
            driver: Some(driver),
            qos: settings.qos,
            availability_topic: settings.availability_topic.clone(),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BusError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BusError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(event) => trace!(?event, "MQTT event before CONNACK"),
            Err(e) => return Err(BusError::Connect(e.to_string())),
        }
    }
}

/// Poll the event loop until the connection ends
async fn drive(mut eventloop: EventLoop, incoming: mpsc::Sender<Result<InboundMessage, BusError>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if incoming.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT DISCONNECT sent");
                break;
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(e) => {
                let _ = incoming
                    .send(Err(BusError::ConnectionLost(e.to_string())))
                    .await;
                break;
            }
        }
    }
}

/// An open MQTT session
pub struct MqttSession {
    client: AsyncClient,
    incoming: mpsc::Receiver<Result<InboundMessage, BusError>>,
    driver: Option<JoinHandle<()>>,
    qos: QoS,
    availability_topic: Option<String>,
}

#[async_trait]
impl BusSession for MqttSession {
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), BusError> {
        for filter in filters {
            self.client
                .subscribe(filter.as_str(), self.qos)
                .await
                .map_err(|e| BusError::ConnectionLost(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(&mut self, publication: &Publication) -> Result<(), BusError> {
        self.client
            .publish(
                publication.topic.as_str(),
                self.qos,
                publication.retain,
                publication.payload.to_vec(),
            )
            .await
            .map_err(|e| BusError::ConnectionLost(e.to_string()))
    }

    async fn next_message(&mut self) -> Result<InboundMessage, BusError> {
        match self.incoming.recv().await {
            Some(result) => result,
            None => Err(BusError::ConnectionLost(
                "MQTT event loop stopped".to_string(),
            )),
        }
    }

    async fn close(&mut self) {
        let client = &self.client;
        let availability_topic = self.availability_topic.as_deref();
        let goodbye = async move {
            if let Some(topic) = availability_topic {
                if let Err(e) = client
                    .publish(topic, QoS::AtLeastOnce, true, AVAILABILITY_OFFLINE)
                    .await
                {
                    debug!(error = %e, "Could not publish offline availability");
                }
            }
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Error sending MQTT DISCONNECT");
            }
        };
        // A stalled request channel must not hold up shutdown
        if timeout(DISCONNECT_TIMEOUT, goodbye).await.is_err() {
            debug!("Timed out queueing MQTT DISCONNECT");
        }

        if let Some(mut driver) = self.driver.take() {
            if timeout(DISCONNECT_TIMEOUT, &mut driver).await.is_err() {
                driver.abort();
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
