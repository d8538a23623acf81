//! Feed Client
//!
//! Owns the connection to the device-state feed. A background task connects,
//! subscribes every configured point, streams notifications as events and
//! executes commands. When the session drops it emits `ConnectionLost`,
//! backs off and reconnects on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FeedConnector, FeedError, FeedEvent, FeedSession, Notification};
use crate::backoff::ReconnectPolicy;
use crate::connection::{ConnectionState, EventStream, EVENT_CHANNEL_CAPACITY};
use crate::point::{DevicePoint, FeedAddress, PointId, PointValue};

/// Upper bound for closing a session
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Command handed to the connection task
struct FeedCommand {
    address: FeedAddress,
    value: PointValue,
    reply: oneshot::Sender<Result<(), FeedError>>,
}

/// Configured points, indexed both ways
struct PointIndex {
    by_id: HashMap<PointId, DevicePoint>,
    by_address: HashMap<FeedAddress, DevicePoint>,
}

impl PointIndex {
    fn new(points: Vec<DevicePoint>) -> Self {
        let by_address = points
            .iter()
            .map(|p| (p.address.clone(), p.clone()))
            .collect();
        let by_id = points.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self { by_id, by_address }
    }

    fn addresses(&self) -> Vec<FeedAddress> {
        let mut addresses: Vec<FeedAddress> = self.by_address.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

/// Why a session ended
enum SessionEnd {
    /// Shutdown requested or nobody listens to events anymore
    Stopped,
    /// The connection dropped
    Lost(FeedError),
}

/// Handle to the feed connection
pub struct FeedClient {
    points: Arc<PointIndex>,
    state: Arc<RwLock<ConnectionState>>,
    command_tx: mpsc::Sender<FeedCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedClient {
    /// Spawn the connection task.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background and is announced by `ConnectionRestored`.
    pub fn spawn(
        connector: Arc<dyn FeedConnector>,
        points: Vec<DevicePoint>,
        reconnect: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> (Self, EventStream<FeedEvent>) {
        let points = Arc::new(PointIndex::new(points));
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(64);

        let task = FeedTask {
            connector,
            points: points.clone(),
            state: state.clone(),
            event_tx,
            command_rx,
            reconnect,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        let client = Self {
            points,
            state,
            command_tx,
            cancel,
            task: Mutex::new(Some(handle)),
        };
        (client, EventStream::new(event_rx))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Write a value to a point.
    ///
    /// Fails when the point is unknown or read-only, when the value does not
    /// match the point's type, or when the feed is not connected.
    pub async fn send_command(&self, id: &PointId, value: PointValue) -> Result<(), FeedError> {
        let point = self
            .points
            .by_id
            .get(id)
            .ok_or_else(|| FeedError::Command(format!("unknown point '{}'", id)))?;

        if !point.is_writable() {
            return Err(FeedError::Command(format!("point '{}' is read-only", id)));
        }

        if value.kind() != point.value_kind() {
            return Err(FeedError::Command(format!(
                "point '{}' expects a {:?} value, got {}",
                id,
                point.value_kind(),
                value
            )));
        }

        if self.state() != ConnectionState::Connected {
            return Err(FeedError::Command(format!(
                "feed is not connected, '{}' not written",
                id
            )));
        }

        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(FeedCommand {
                address: point.address.clone(),
                value,
                reply,
            })
            .await
            .map_err(|_| FeedError::Command("feed client is closed".to_string()))?;

        response.await.map_err(|_| {
            FeedError::Command(format!("connection lost before '{}' was written", id))
        })?
    }

    /// Stop the connection task and wait for it to finish
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// State owned by the background connection task
struct FeedTask {
    connector: Arc<dyn FeedConnector>,
    points: Arc<PointIndex>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<FeedEvent>,
    command_rx: mpsc::Receiver<FeedCommand>,
    reconnect: ReconnectPolicy,
    cancel: CancellationToken,
}

impl FeedTask {
    /// Main loop: connect → stream → on error, backoff → reconnect
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            *self.state.write() = ConnectionState::Connecting;

            let opened = {
                let open = Self::open(self.connector.as_ref(), self.points.addresses());
                tokio::pin!(open);
                loop {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break None,
                        result = &mut open => break Some(result),
                        Some(cmd) = self.command_rx.recv() => reject(cmd, "feed is connecting"),
                    }
                }
            };

            let result = match opened {
                Some(result) => result,
                None => break,
            };

            match result {
                Ok(session) => {
                    attempt = 0;
                    *self.state.write() = ConnectionState::Connected;
                    info!("Feed connected");

                    if self.event_tx.send(FeedEvent::ConnectionRestored).await.is_err() {
                        break;
                    }

                    match self.run_session(session).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(e) => {
                            *self.state.write() = ConnectionState::Disconnected;
                            warn!(error = %e, "Feed connection lost");
                            if self.event_tx.send(FeedEvent::ConnectionLost).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    *self.state.write() = ConnectionState::Disconnected;
                    warn!(error = %e, attempt, "Feed connection failed");
                }
            }

            let delay = self.reconnect.delay(attempt);
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt, "Waiting before feed reconnect"
            );
            attempt = attempt.saturating_add(1);

            if !self.wait(delay).await {
                break;
            }
        }

        *self.state.write() = ConnectionState::Closing;
        while let Ok(cmd) = self.command_rx.try_recv() {
            reject(cmd, "feed client is closing");
        }
        *self.state.write() = ConnectionState::Disconnected;
        debug!("Feed connection task exiting");
    }

    /// Open a session and subscribe all configured points
    async fn open(
        connector: &dyn FeedConnector,
        addresses: Vec<FeedAddress>,
    ) -> Result<Box<dyn FeedSession>, FeedError> {
        let mut session = connector.connect().await?;
        if let Err(e) = session.subscribe(&addresses).await {
            session.close().await;
            return Err(e);
        }
        debug!(points = addresses.len(), "Feed subscriptions sent");
        Ok(session)
    }

    /// Sleep through a backoff interval, refusing commands meanwhile.
    /// Returns `false` when shutdown was requested.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(cmd) = self.command_rx.recv() => reject(cmd, "feed is disconnected"),
            }
        }
    }

    async fn run_session(&mut self, mut session: Box<dyn FeedSession>) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    close_session(session.as_mut()).await;
                    return SessionEnd::Stopped;
                }
                Some(cmd) = self.command_rx.recv() => {
                    let result = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        result = session.invoke(&cmd.address, cmd.value) => Some(result),
                    };
                    let Some(result) = result else {
                        reject(cmd, "feed client is closing");
                        close_session(session.as_mut()).await;
                        return SessionEnd::Stopped;
                    };
                    match result {
                        Ok(()) => {
                            debug!(address = %cmd.address, value = %cmd.value, "Command written to feed");
                            let _ = cmd.reply.send(Ok(()));
                        }
                        Err(FeedError::ConnectionLost(msg)) => {
                            let _ = cmd.reply.send(Err(FeedError::Command(format!(
                                "connection lost while writing {}: {}",
                                cmd.address, msg
                            ))));
                            return SessionEnd::Lost(FeedError::ConnectionLost(msg));
                        }
                        Err(e) => {
                            let _ = cmd.reply.send(Err(e));
                        }
                    }
                }
                notification = session.next_notification() => {
                    let notification = match notification {
                        Ok(n) => n,
                        Err(e) => return SessionEnd::Lost(e),
                    };
                    if let Some(event) = self.translate(notification) {
                        if self.event_tx.send(event).await.is_err() {
                            close_session(session.as_mut()).await;
                            return SessionEnd::Stopped;
                        }
                    }
                }
            }
        }
    }

    /// Turn a raw notification into an event for a configured point
    fn translate(&self, notification: Notification) -> Option<FeedEvent> {
        let point = match self.points.by_address.get(&notification.address) {
            Some(point) => point,
            None => {
                debug!(address = %notification.address, "Ignoring notification for unconfigured circuit");
                return None;
            }
        };

        match notification.value.coerce(point.value_kind()) {
            Some(value) => Some(FeedEvent::StateChanged {
                point: point.id.clone(),
                value,
            }),
            None => {
                warn!(
                    point = %point.id,
                    value = %notification.value,
                    "Dropping notification with unusable value"
                );
                None
            }
        }
    }
}

fn reject(cmd: FeedCommand, reason: &str) {
    let _ = cmd.reply.send(Err(FeedError::Command(format!(
        "{}, {} not written",
        reason, cmd.address
    ))));
}

async fn close_session(session: &mut dyn FeedSession) {
    if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close())
        .await
        .is_err()
    {
        warn!("Timed out closing feed session");
    }
}
