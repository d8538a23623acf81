//! In-memory feed and broker used by the integration tests
//!
//! Both fakes hand out sessions backed by unbounded channels. The test keeps
//! a handle to inject notifications or messages into the current session,
//! to drop it, or to refuse new connections.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use evokmq::backoff::ReconnectPolicy;
use evokmq::bus::{BusConnector, BusError, BusSession, InboundMessage, Publication};
use evokmq::feed::{FeedConnector, FeedError, FeedSession, Notification};
use evokmq::point::{DeviceKind, FeedAddress, PointValue};

/// Upper bound for every wait in the tests
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Short backoff so reconnect tests finish quickly
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

/// Poll `condition` until it holds, panicking after [`WAIT_TIMEOUT`]
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Give spawned tasks time to process what is already queued
pub async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

/// Run a future with [`WAIT_TIMEOUT`]
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    timeout(WAIT_TIMEOUT, future)
        .await
        .expect("operation timed out")
}

// ============================================================================
// Feed
// ============================================================================

type NotificationTx = mpsc::UnboundedSender<Result<Notification, FeedError>>;

#[derive(Default)]
struct FeedState {
    available: AtomicBool,
    sessions: Mutex<usize>,
    current: Mutex<Option<(NotificationTx, Arc<AtomicBool>)>>,
    subscriptions: Mutex<Vec<Vec<FeedAddress>>>,
    invoked: Mutex<Vec<(FeedAddress, PointValue)>>,
    hold_close: AtomicBool,
    closes: Mutex<usize>,
    stall_invoke: AtomicBool,
}

/// Fake device-state feed
#[derive(Clone)]
pub struct FakeFeed {
    state: Arc<FeedState>,
}

impl FakeFeed {
    pub fn new() -> Self {
        let state = FeedState::default();
        state.available.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Connector handing out sessions of this feed
    pub fn connector(&self) -> Arc<dyn FeedConnector> {
        Arc::new(self.clone())
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Number of sessions opened so far
    pub fn sessions(&self) -> usize {
        *self.state.sessions.lock()
    }

    pub async fn wait_sessions(&self, count: usize) {
        wait_until("feed sessions", || self.sessions() >= count).await;
    }

    /// Push a notification into the current session
    pub fn emit(&self, dev: DeviceKind, circuit: &str, value: PointValue) {
        let current = self.state.current.lock();
        let (tx, _) = current.as_ref().expect("no feed session");
        tx.send(Ok(Notification {
            address: FeedAddress::new(dev, circuit),
            value,
        }))
        .expect("feed session gone");
    }

    /// Break the current session
    pub fn drop_connection(&self) {
        if let Some((tx, alive)) = self.state.current.lock().take() {
            alive.store(false, Ordering::SeqCst);
            let _ = tx.send(Err(FeedError::ConnectionLost("dropped by test".to_string())));
        }
    }

    /// Every subscribe call, one entry per session
    pub fn subscriptions(&self) -> Vec<Vec<FeedAddress>> {
        self.state.subscriptions.lock().clone()
    }

    /// Every value written by the bridge
    pub fn invoked(&self) -> Vec<(FeedAddress, PointValue)> {
        self.state.invoked.lock().clone()
    }

    /// Keep session close calls pending until released
    pub fn hold_close(&self, hold: bool) {
        self.state.hold_close.store(hold, Ordering::SeqCst);
    }

    /// Never complete writes, as with a controller that stopped responding
    pub fn stall_invoke(&self, stall: bool) {
        self.state.stall_invoke.store(stall, Ordering::SeqCst);
    }

    /// Close calls started by the bridge
    pub fn closes(&self) -> usize {
        *self.state.closes.lock()
    }
}

#[async_trait]
impl FeedConnector for FakeFeed {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(FeedError::Connect("feed unavailable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        *self.state.current.lock() = Some((tx, alive.clone()));
        *self.state.sessions.lock() += 1;

        Ok(Box::new(FakeFeedSession {
            state: self.state.clone(),
            notifications: rx,
            alive,
        }))
    }
}

struct FakeFeedSession {
    state: Arc<FeedState>,
    notifications: mpsc::UnboundedReceiver<Result<Notification, FeedError>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl FeedSession for FakeFeedSession {
    async fn subscribe(&mut self, addresses: &[FeedAddress]) -> Result<(), FeedError> {
        self.state.subscriptions.lock().push(addresses.to_vec());
        Ok(())
    }

    async fn next_notification(&mut self) -> Result<Notification, FeedError> {
        match self.notifications.recv().await {
            Some(result) => result,
            None => Err(FeedError::ConnectionLost("session closed".to_string())),
        }
    }

    async fn invoke(&mut self, address: &FeedAddress, value: PointValue) -> Result<(), FeedError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(FeedError::ConnectionLost("session dropped".to_string()));
        }
        if self.state.stall_invoke.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.invoked.lock().push((address.clone(), value));
        Ok(())
    }

    async fn close(&mut self) {
        *self.state.closes.lock() += 1;
        while self.state.hold_close.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(5)).await;
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Bus
// ============================================================================

type MessageTx = mpsc::UnboundedSender<Result<InboundMessage, BusError>>;

#[derive(Default)]
struct BusState {
    available: AtomicBool,
    sessions: Mutex<usize>,
    current: Mutex<Option<(MessageTx, Arc<AtomicBool>)>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<Publication>>,
    retained: Mutex<HashMap<String, Bytes>>,
    closed: Mutex<usize>,
    stall_state: AtomicBool,
}

/// Fake message broker
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<BusState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let state = BusState::default();
        state.available.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Connector handing out sessions of this broker
    pub fn connector(&self) -> Arc<dyn BusConnector> {
        Arc::new(self.clone())
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> usize {
        *self.state.sessions.lock()
    }

    pub async fn wait_sessions(&self, count: usize) {
        wait_until("bus sessions", || self.sessions() >= count).await;
    }

    /// Sessions closed by the bridge
    pub fn closed(&self) -> usize {
        *self.state.closed.lock()
    }

    /// Deliver a message to the bridge through the current session
    pub fn inject(&self, topic: &str, payload: &str) {
        let current = self.state.current.lock();
        let (tx, _) = current.as_ref().expect("no bus session");
        tx.send(Ok(InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }))
        .expect("bus session gone");
    }

    /// Break the current session
    pub fn drop_connection(&self) {
        if let Some((tx, alive)) = self.state.current.lock().take() {
            alive.store(false, Ordering::SeqCst);
            let _ = tx.send(Err(BusError::ConnectionLost("dropped by test".to_string())));
        }
    }

    /// Every publication received, in arrival order
    pub fn published(&self) -> Vec<Publication> {
        self.state.published.lock().clone()
    }

    /// Payloads published to `topic`, in arrival order
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| String::from_utf8_lossy(&p.payload).to_string())
            .collect()
    }

    /// Current retained payload of `topic`
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state
            .retained
            .lock()
            .get(topic)
            .map(|p| String::from_utf8_lossy(p).to_string())
    }

    /// Number of retained topics
    pub fn retained_count(&self) -> usize {
        self.state.retained.lock().len()
    }

    /// Every filter subscribed, across sessions
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    /// Stop accepting state publications: publish never completes, as with
    /// a broker that has stopped reading from its socket
    pub fn stall_state_publishes(&self, stall: bool) {
        self.state.stall_state.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusConnector for FakeBroker {
    async fn connect(&self) -> Result<Box<dyn BusSession>, BusError> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(BusError::Connect("broker unavailable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        *self.state.current.lock() = Some((tx, alive.clone()));
        *self.state.sessions.lock() += 1;

        Ok(Box::new(FakeBusSession {
            state: self.state.clone(),
            messages: rx,
            alive,
        }))
    }
}

struct FakeBusSession {
    state: Arc<BusState>,
    messages: mpsc::UnboundedReceiver<Result<InboundMessage, BusError>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl BusSession for FakeBusSession {
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), BusError> {
        self.state.subscriptions.lock().extend(filters.iter().cloned());
        Ok(())
    }

    async fn publish(&mut self, publication: &Publication) -> Result<(), BusError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionLost("session dropped".to_string()));
        }
        if self.state.stall_state.load(Ordering::SeqCst) && publication.topic.ends_with("/state")
        {
            std::future::pending::<()>().await;
        }
        if publication.retain {
            self.state
                .retained
                .lock()
                .insert(publication.topic.clone(), publication.payload.clone());
        }
        self.state.published.lock().push(publication.clone());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<InboundMessage, BusError> {
        match self.messages.recv().await {
            Some(result) => result,
            None => Err(BusError::ConnectionLost("session closed".to_string())),
        }
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        *self.state.closed.lock() += 1;
    }
}
