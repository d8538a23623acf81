//! Bus Client
//!
//! Owns the connection to the MQTT broker. Publications accepted while
//! connected go straight to the connection task; publications accepted while
//! disconnected wait in a bounded [`PendingQueue`] and are sent, oldest first,
//! as soon as a session is up again. Both paths are switched under one lock
//! so a publication can never overtake an older one for the same topic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::PendingQueue;
use super::{BusConnector, BusError, BusEvent, BusSession, Publication, AVAILABILITY_ONLINE};
use crate::backoff::ReconnectPolicy;
use crate::connection::{ConnectionState, EventStream, EVENT_CHANNEL_CAPACITY};

/// Upper bound for closing a session
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Options for the bus client
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Topic filters subscribed on every (re)connect
    pub filters: Vec<String>,
    /// Retained topic that receives `online` after every (re)connect
    pub availability_topic: Option<String>,
    /// Capacity of the pending queue
    pub max_pending: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            availability_topic: None,
            max_pending: 1000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Where publish() routes publications
struct Outbox {
    /// Route to the connection task instead of the queue
    connected: bool,
    closed: bool,
    pending: PendingQueue,
}

/// State shared between the handle and the connection task
struct Shared {
    state: RwLock<ConnectionState>,
    outbox: Mutex<Outbox>,
    /// Publications handed to the task but not yet written to a session
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0 && self.outbox.lock().pending.is_empty()
    }

    fn settle(&self, count: usize) {
        if count > 0 && self.outstanding.fetch_sub(count, Ordering::SeqCst) == count {
            self.idle.notify_waiters();
        }
    }
}

/// Why a session ended
enum SessionEnd {
    Stopped,
    Lost(BusError),
}

/// Handle to the bus connection
pub struct BusClient {
    shared: Arc<Shared>,
    publish_tx: mpsc::UnboundedSender<Publication>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Spawn the connection task.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background and is announced by `ConnectionRestored`.
    pub fn spawn(
        connector: Arc<dyn BusConnector>,
        options: BusOptions,
        cancel: CancellationToken,
    ) -> (Self, EventStream<BusEvent>) {
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            outbox: Mutex::new(Outbox {
                connected: false,
                closed: false,
                pending: PendingQueue::new(options.max_pending),
            }),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();

        let task = BusTask {
            connector,
            shared: shared.clone(),
            options,
            event_tx,
            publish_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        let client = Self {
            shared,
            publish_tx,
            cancel,
            task: Mutex::new(Some(handle)),
        };
        (client, EventStream::new(event_rx))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Publish a message.
    ///
    /// While disconnected the publication is queued; a newer publication for
    /// a queued topic replaces it. `Backpressure` means the queue was full and
    /// its oldest entry was dropped to make room; this publication is queued
    /// regardless.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Result<(), BusError> {
        let publication = Publication::new(topic, payload, retain);
        let mut outbox = self.shared.outbox.lock();

        if outbox.closed {
            return Err(BusError::Closed);
        }

        if outbox.connected {
            self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
            if self.publish_tx.send(publication).is_err() {
                self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                outbox.closed = true;
                return Err(BusError::Closed);
            }
            Ok(())
        } else {
            outbox.pending.push(publication)
        }
    }

    /// Number of publications waiting for a connection
    pub fn pending(&self) -> usize {
        self.shared.outbox.lock().pending.len()
    }

    /// Wait until every accepted publication has been written to a session.
    ///
    /// Returns `false` if that did not happen within `grace`.
    pub async fn flush(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.shared.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }

    /// Close the session and stop the connection task
    pub async fn close(&self) {
        self.shared.outbox.lock().closed = true;
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// State owned by the background connection task
struct BusTask {
    connector: Arc<dyn BusConnector>,
    shared: Arc<Shared>,
    options: BusOptions,
    event_tx: mpsc::Sender<BusEvent>,
    publish_rx: mpsc::UnboundedReceiver<Publication>,
    cancel: CancellationToken,
}

impl BusTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            *self.shared.state.write() = ConnectionState::Connecting;

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = Self::open(self.connector.as_ref(), &self.options.filters) => Some(result),
            };

            match opened {
                None => break,
                Some(Ok(mut session)) => {
                    attempt = 0;

                    if let Err(e) = self.go_online(session.as_mut()).await {
                        *self.shared.state.write() = ConnectionState::Disconnected;
                        if e != BusError::Closed {
                            warn!(error = %e, "Bus connection lost while sending backlog");
                        }
                        close_session(session.as_mut()).await;
                    } else {
                        *self.shared.state.write() = ConnectionState::Connected;
                        info!("Bus connected");

                        if self.event_tx.send(BusEvent::ConnectionRestored).await.is_err() {
                            close_session(session.as_mut()).await;
                            break;
                        }

                        match self.run_session(session).await {
                            SessionEnd::Stopped => break,
                            SessionEnd::Lost(e) => {
                                *self.shared.state.write() = ConnectionState::Disconnected;
                                warn!(error = %e, "Bus connection lost");
                                if self.event_tx.send(BusEvent::ConnectionLost).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    *self.shared.state.write() = ConnectionState::Disconnected;
                    warn!(error = %e, attempt, "Bus connection failed");
                }
            }

            let delay = self.options.reconnect.delay(attempt);
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt, "Waiting before bus reconnect"
            );
            attempt = attempt.saturating_add(1);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        *self.shared.state.write() = ConnectionState::Closing;
        let abandoned = {
            let mut outbox = self.shared.outbox.lock();
            outbox.closed = true;
            outbox.connected = false;
            let mut abandoned = 0;
            while self.publish_rx.try_recv().is_ok() {
                abandoned += 1;
            }
            abandoned
        };
        if abandoned > 0 {
            warn!(abandoned, "Bus client closed with unsent publications");
        }
        self.shared.settle(abandoned);
        *self.shared.state.write() = ConnectionState::Disconnected;
        debug!("Bus connection task exiting");
    }

    /// Open a session and subscribe the command filters
    async fn open(
        connector: &dyn BusConnector,
        filters: &[String],
    ) -> Result<Box<dyn BusSession>, BusError> {
        let mut session = connector.connect().await?;
        if let Err(e) = session.subscribe(filters).await {
            session.close().await;
            return Err(e);
        }
        debug!(filters = filters.len(), "Bus subscriptions sent");
        Ok(session)
    }

    /// Announce availability, switch publish() to the live path and send the
    /// backlog. On failure the unsent part of the backlog is queued again.
    async fn go_online(&mut self, session: &mut dyn BusSession) -> Result<(), BusError> {
        if let Some(topic) = &self.options.availability_topic {
            let online = Publication::new(topic.as_str(), AVAILABILITY_ONLINE, true);
            send(&self.cancel, session, &online).await?;
        }

        let backlog = {
            let mut outbox = self.shared.outbox.lock();
            outbox.connected = true;
            let backlog = outbox.pending.drain();
            self.shared
                .outstanding
                .fetch_add(backlog.len(), Ordering::SeqCst);
            backlog
        };

        if !backlog.is_empty() {
            info!(count = backlog.len(), "Sending queued publications");
        }

        let mut backlog = backlog.into_iter();
        while let Some(publication) = backlog.next() {
            if let Err(e) = send(&self.cancel, session, &publication).await {
                let mut unsent = vec![publication];
                unsent.extend(backlog);
                self.go_offline(unsent);
                return Err(e);
            }
            self.shared.settle(1);
        }

        Ok(())
    }

    /// Switch publish() back to the queue.
    ///
    /// `unsent` holds publications taken from the channel or backlog that
    /// never reached the broker; they go back ahead of anything newer.
    fn go_offline(&mut self, unsent: Vec<Publication>) {
        let mut settled = unsent.len();
        {
            let mut outbox = self.shared.outbox.lock();
            outbox.connected = false;
            while let Ok(publication) = self.publish_rx.try_recv() {
                settled += 1;
                if let Err(e) = outbox.pending.push(publication) {
                    warn!(error = %e, "Publication dropped");
                }
            }
            outbox.pending.requeue_front(unsent);
        }
        self.shared.settle(settled);
    }

    async fn run_session(&mut self, mut session: Box<dyn BusSession>) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    close_session(session.as_mut()).await;
                    return SessionEnd::Stopped;
                }
                Some(publication) = self.publish_rx.recv() => {
                    match send(&self.cancel, session.as_mut(), &publication).await {
                        Ok(()) => self.shared.settle(1),
                        Err(BusError::Closed) => {
                            warn!(topic = %publication.topic, "Publication abandoned on close");
                            self.shared.settle(1);
                            close_session(session.as_mut()).await;
                            return SessionEnd::Stopped;
                        }
                        Err(e) => {
                            self.go_offline(vec![publication]);
                            return SessionEnd::Lost(e);
                        }
                    }
                }
                message = session.next_message() => {
                    match message {
                        Ok(message) => {
                            let event = BusEvent::CommandReceived {
                                topic: message.topic,
                                payload: message.payload,
                            };
                            if self.event_tx.send(event).await.is_err() {
                                close_session(session.as_mut()).await;
                                return SessionEnd::Stopped;
                            }
                        }
                        Err(e) => {
                            self.go_offline(Vec::new());
                            return SessionEnd::Lost(e);
                        }
                    }
                }
            }
        }
    }
}

/// Publish on `session` unless the task is cancelled first.
///
/// A broker that stops reading can leave a publish pending indefinitely;
/// cancellation turns that into `BusError::Closed`.
async fn send(
    cancel: &CancellationToken,
    session: &mut dyn BusSession,
    publication: &Publication,
) -> Result<(), BusError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BusError::Closed),
        result = session.publish(publication) => result,
    }
}

async fn close_session(session: &mut dyn BusSession) {
    if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close())
        .await
        .is_err()
    {
        warn!("Timed out closing bus session");
    }
}
