//! Evok WebSocket transport
//!
//! Evok pushes JSON over a WebSocket. Every text frame carries either a single
//! device object or an array of them:
//!
//! ```json
//! [{"dev": "relay", "circuit": "1", "value": 1, "pending": false}]
//! ```
//!
//! Requests sent by the bridge:
//! - `{"cmd": "filter", "devices": ["relay", "input"]}` limits notifications
//!   to the configured device types
//! - `{"cmd": "all"}` asks for a dump of every device's current state
//! - `{"cmd": "set", "dev": "relay", "circuit": "1", "value": 1}` writes a value

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use super::{FeedConnector, FeedError, FeedSession, Notification};
use crate::point::{DeviceKind, FeedAddress, PointValue};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for the close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connects to the Evok WebSocket endpoint
#[derive(Debug, Clone)]
pub struct EvokConnector {
    url: String,
    connect_timeout: Duration,
}

impl EvokConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl FeedConnector for EvokConnector {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError> {
        info!(url = %self.url, "Connecting to Evok");

        let (ws, _response) = timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| FeedError::Connect(format!("timed out connecting to {}", self.url)))?
        .map_err(|e| FeedError::Connect(e.to_string()))?;

        Ok(Box::new(EvokSession {
            ws,
            pending: VecDeque::new(),
        }))
    }
}

/// Request frames understood by Evok
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum Request<'a> {
    Filter { devices: Vec<&'a str> },
    All,
    Set {
        dev: &'a str,
        circuit: &'a str,
        value: Value,
    },
}

/// An open Evok WebSocket session
pub struct EvokSession {
    ws: WsStream,
    /// Notifications parsed from a frame but not handed out yet
    pending: VecDeque<Notification>,
}

impl EvokSession {
    async fn send(&mut self, request: &Request<'_>) -> Result<(), FeedError> {
        let text = serde_json::to_string(request)
            .map_err(|e| FeedError::Protocol(format!("cannot encode request: {}", e)))?;
        trace!(%text, "Evok request");
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::ConnectionLost(e.to_string()))
    }
}

#[async_trait]
impl FeedSession for EvokSession {
    async fn subscribe(&mut self, addresses: &[FeedAddress]) -> Result<(), FeedError> {
        let kinds: BTreeSet<DeviceKind> = addresses.iter().map(|a| a.dev).collect();
        let devices = kinds.iter().map(|k| k.as_str()).collect();
        self.send(&Request::Filter { devices }).await?;
        // Prime the current state; Evok answers with every device it knows
        self.send(&Request::All).await
    }

    async fn next_notification(&mut self) -> Result<Notification, FeedError> {
        loop {
            if let Some(notification) = self.pending.pop_front() {
                return Ok(notification);
            }

            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(notifications) => self.pending.extend(notifications),
                    Err(e) => debug!(error = %e, "Ignoring unparsable Evok frame"),
                },
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite answers pings on the next read or write
                    trace!("Evok ping");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("close frame {} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "close frame".to_string());
                    return Err(FeedError::ConnectionLost(reason));
                }
                Some(Ok(_)) => {
                    // Binary, Pong, raw frames carry nothing for us
                }
                Some(Err(e)) => return Err(FeedError::ConnectionLost(e.to_string())),
                None => return Err(FeedError::ConnectionLost("stream ended".to_string())),
            }
        }
    }

    async fn invoke(&mut self, address: &FeedAddress, value: PointValue) -> Result<(), FeedError> {
        let value = match value {
            PointValue::Bool(b) => Value::from(u8::from(b)),
            PointValue::Number(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| FeedError::Command(format!("{} is not a valid number", n)))?,
        };
        self.send(&Request::Set {
            dev: address.dev.as_str(),
            circuit: &address.circuit,
            value,
        })
        .await
    }

    async fn close(&mut self) {
        match timeout(CLOSE_TIMEOUT, self.ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error closing Evok WebSocket"),
            Err(_) => debug!("Timed out closing Evok WebSocket"),
        }
    }
}

/// Parse a text frame into notifications.
///
/// Entries for device types the bridge does not model, or without a usable
/// value, are skipped.
pub(crate) fn parse_frame(text: &str) -> Result<Vec<Notification>, FeedError> {
    let json: Value =
        serde_json::from_str(text).map_err(|e| FeedError::Protocol(e.to_string()))?;

    let entries = match json {
        Value::Array(entries) => entries,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(FeedError::Protocol(format!(
                "expected object or array, got {}",
                other
            )))
        }
    };

    Ok(entries.iter().filter_map(parse_entry).collect())
}

fn parse_entry(entry: &Value) -> Option<Notification> {
    let dev = entry.get("dev")?.as_str()?.parse::<DeviceKind>().ok()?;

    let circuit = match entry.get("circuit")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let value = match entry.get("value")? {
        Value::Bool(b) => PointValue::Bool(*b),
        Value::Number(n) => PointValue::Number(n.as_f64()?),
        _ => return None,
    };

    Some(Notification {
        address: FeedAddress::new(dev, circuit),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_array_frame() {
        let text = r#"[{"dev":"relay","circuit":"1","value":1,"pending":false},
                       {"dev":"input","circuit":"1_01","value":0,"bitvalue":0}]"#;
        let notifications = parse_frame(text).unwrap();
        assert_eq!(
            notifications,
            vec![
                Notification {
                    address: FeedAddress::new(DeviceKind::Relay, "1"),
                    value: PointValue::Number(1.0),
                },
                Notification {
                    address: FeedAddress::new(DeviceKind::Input, "1_01"),
                    value: PointValue::Number(0.0),
                },
            ]
        );
    }

    #[test]
    fn test_parse_single_object_with_numeric_circuit() {
        let text = r#"{"dev":"temp","circuit":28,"value":21.5}"#;
        let notifications = parse_frame(text).unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].address, FeedAddress::new(DeviceKind::Temp, "28"));
        assert_eq!(notifications[0].value, PointValue::Number(21.5));
    }

    #[test]
    fn test_parse_skips_unknown_devices_and_missing_values() {
        let text = r#"[{"dev":"neuron","circuit":"1","model":"M203"},
                       {"dev":"relay","circuit":"2"},
                       {"dev":"relay","circuit":"3","value":true}]"#;
        let notifications = parse_frame(text).unwrap();
        assert_eq!(
            notifications,
            vec![Notification {
                address: FeedAddress::new(DeviceKind::Relay, "3"),
                value: PointValue::Bool(true),
            }]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_frame("not json"), Err(FeedError::Protocol(_))));
        assert!(matches!(parse_frame("42"), Err(FeedError::Protocol(_))));
    }

    #[test]
    fn test_request_encoding() {
        let set = Request::Set {
            dev: "relay",
            circuit: "1",
            value: Value::from(1u8),
        };
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            serde_json::json!({"cmd": "set", "dev": "relay", "circuit": "1", "value": 1})
        );

        let filter = Request::Filter {
            devices: vec!["input", "relay"],
        };
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            serde_json::json!({"cmd": "filter", "devices": ["input", "relay"]})
        );

        assert_eq!(
            serde_json::to_value(&Request::All).unwrap(),
            serde_json::json!({"cmd": "all"})
        );
    }
}
