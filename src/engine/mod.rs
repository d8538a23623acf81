//! Bridge Engine
//!
//! Drives the feed and bus clients and translates between them. Feed state
//! goes out as retained publications; command messages from the bus go in as
//! feed writes. Every (re)connection of either side republishes the whole
//! state snapshot.

mod snapshot;

pub use snapshot::StateSnapshot;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::bus::{BusClient, BusConnector, BusError, BusEvent, BusOptions, MqttConnector};
use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionState, EventStream};
use crate::discovery::Discovery;
use crate::feed::{EvokConnector, FeedClient, FeedConnector, FeedEvent};
use crate::point::{PointId, PointValue};
use crate::topic::{Direction, TopicMapper};

/// Lifecycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    /// Shutdown requested; commands are refused and publications drain
    Draining,
    Stopped,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long shutdown waits for accepted publications to reach the broker
    pub drain_grace: Duration,
    pub feed_reconnect: ReconnectPolicy,
    pub bus_reconnect: ReconnectPolicy,
    /// Capacity of the bus client's pending queue
    pub max_pending: usize,
    /// Announce points for Home Assistant on every bus (re)connect
    pub discovery: Option<Discovery>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(5),
            feed_reconnect: ReconnectPolicy::default(),
            bus_reconnect: ReconnectPolicy::default(),
            max_pending: 1000,
            discovery: None,
        }
    }
}

/// Counters reported when the engine stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    /// State changes received from the feed
    pub state_changes: u64,
    /// State publications handed to the bus client, resyncs included
    pub published: u64,
    /// Full snapshot republications
    pub resyncs: u64,
    /// Commands written to the feed
    pub commands_forwarded: u64,
    /// Commands dropped: unknown topic, bad payload or refused by the feed
    pub commands_rejected: u64,
    /// Publications lost: evicted by backpressure or refused by the bus client
    pub dropped: u64,
    /// Whether every publication reached the broker before shutdown
    pub drained: bool,
}

impl EngineReport {
    fn record_publish(&mut self, result: Result<(), BusError>) {
        match result {
            Ok(()) => self.published += 1,
            Err(BusError::Backpressure { dropped_topic }) => {
                self.published += 1;
                self.dropped += 1;
                warn!(dropped = %dropped_topic, "Publish buffer full, oldest update dropped");
            }
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "Publication dropped");
            }
        }
    }
}

/// The bridge between the device-state feed and the message bus
pub struct BridgeEngine {
    mapper: Arc<TopicMapper>,
    feed_connector: Arc<dyn FeedConnector>,
    bus_connector: Arc<dyn BusConnector>,
    config: EngineConfig,
    snapshot: StateSnapshot,
    report: EngineReport,
    state_tx: watch::Sender<EngineState>,
}

impl BridgeEngine {
    pub fn new(
        mapper: TopicMapper,
        feed_connector: Arc<dyn FeedConnector>,
        bus_connector: Arc<dyn BusConnector>,
        config: EngineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Starting);
        Self {
            mapper: Arc::new(mapper),
            feed_connector,
            bus_connector,
            config,
            snapshot: StateSnapshot::new(),
            report: EngineReport::default(),
            state_tx,
        }
    }

    /// Build an engine talking to Evok and an MQTT broker
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mapper = config.mapper()?;
        let feed = EvokConnector::new(config.feed.url.clone(), config.feed.connect_timeout);
        let bus = MqttConnector::new(config.mqtt_settings()?);
        Ok(Self::new(
            mapper,
            Arc::new(feed),
            Arc::new(bus),
            config.engine_config(),
        ))
    }

    /// Watch the engine lifecycle
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    pub fn mapper(&self) -> &TopicMapper {
        &self.mapper
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Connectivity problems never end the run; both clients keep
    /// reconnecting in the background.
    pub async fn run(mut self, shutdown: CancellationToken) -> EngineReport {
        self.set_state(EngineState::Starting);

        // Clients get their own tokens so they outlive the shutdown signal
        // long enough to drain.
        let (feed, mut feed_events) = FeedClient::spawn(
            self.feed_connector.clone(),
            self.mapper.points().to_vec(),
            self.config.feed_reconnect.clone(),
            CancellationToken::new(),
        );
        let (bus, mut bus_events) = BusClient::spawn(
            self.bus_connector.clone(),
            BusOptions {
                filters: self.mapper.command_filters(),
                availability_topic: Some(self.mapper.availability_topic()),
                max_pending: self.config.max_pending,
                reconnect: self.config.bus_reconnect.clone(),
            },
            CancellationToken::new(),
        );

        self.set_state(EngineState::Running);
        info!(
            points = self.mapper.points().len(),
            prefix = %self.mapper.prefix(),
            "Bridge running"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = feed_events.next() => self.on_feed_event(&bus, event),
                Some(event) = bus_events.next() => {
                    self.on_bus_event(&feed, &mut feed_events, &bus, event).await;
                }
            }
        }

        self.set_state(EngineState::Draining);
        info!("Draining bridge");

        // Commands are no longer acted on. Both event streams stay drained
        // while the clients wind down so neither task blocks on a full
        // channel; state already received from the feed is still published.
        {
            let close = feed.close();
            tokio::pin!(close);
            loop {
                tokio::select! {
                    _ = &mut close => break,
                    Some(event) = feed_events.next() => self.on_draining_event(&bus, event),
                    Some(event) = bus_events.next() => ignore_while_draining(event),
                }
            }
        }
        while let Some(event) = feed_events.next().await {
            self.on_draining_event(&bus, event);
        }

        self.report.drained = if bus.state() == ConnectionState::Connected {
            let flush = bus.flush(self.config.drain_grace);
            tokio::pin!(flush);
            loop {
                tokio::select! {
                    drained = &mut flush => break drained,
                    Some(event) = bus_events.next() => ignore_while_draining(event),
                }
            }
        } else {
            bus.pending() == 0
        };
        drop(bus_events);
        if !self.report.drained {
            warn!(
                pending = bus.pending(),
                "Shutting down with publications not delivered"
            );
        }

        bus.close().await;
        self.set_state(EngineState::Stopped);
        info!(
            state_changes = self.report.state_changes,
            published = self.report.published,
            commands = self.report.commands_forwarded,
            "Bridge stopped"
        );

        self.report
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }

    fn on_feed_event(&mut self, bus: &BusClient, event: FeedEvent) {
        match event {
            FeedEvent::StateChanged { point, value } => self.on_state_changed(bus, point, value),
            FeedEvent::ConnectionRestored => {
                info!("Feed connection restored, resyncing state");
                self.resync(bus);
            }
            FeedEvent::ConnectionLost => {
                warn!("Feed connection lost");
            }
        }
    }

    fn on_draining_event(&mut self, bus: &BusClient, event: FeedEvent) {
        if let FeedEvent::StateChanged { point, value } = event {
            self.on_state_changed(bus, point, value);
        }
    }

    async fn on_bus_event(
        &mut self,
        feed: &FeedClient,
        feed_events: &mut EventStream<FeedEvent>,
        bus: &BusClient,
        event: BusEvent,
    ) {
        match event {
            BusEvent::CommandReceived { topic, payload } => {
                self.on_command(feed, feed_events, bus, &topic, payload)
                    .await;
            }
            BusEvent::ConnectionRestored => {
                info!("Bus connection restored, resyncing state");
                self.announce(bus);
                self.resync(bus);
            }
            BusEvent::ConnectionLost => {
                warn!("Bus connection lost, queueing publications");
            }
        }
    }

    fn on_state_changed(&mut self, bus: &BusClient, id: PointId, value: PointValue) {
        self.report.state_changes += 1;
        debug!(point = %id, %value, "State changed");
        self.snapshot.update(id.clone(), value);
        self.publish_state(bus, &id, &value);
    }

    fn publish_state(&mut self, bus: &BusClient, id: &PointId, value: &PointValue) {
        let Some(topic) = self.mapper.topic_for(id, Direction::State) else {
            // Feed events only name configured points
            warn!(point = %id, "No state topic for point");
            return;
        };
        let payload = self.mapper.encode(value);
        self.publish(bus, topic, payload);
    }

    fn publish(&mut self, bus: &BusClient, topic: String, payload: Bytes) {
        let result = bus.publish(topic, payload, true);
        self.report.record_publish(result);
    }

    /// Republish every known value
    fn resync(&mut self, bus: &BusClient) {
        if self.snapshot.is_empty() {
            return;
        }
        self.report.resyncs += 1;

        let entries: Vec<(PointId, PointValue)> = self
            .snapshot
            .iter()
            .map(|(id, value)| (id.clone(), *value))
            .collect();
        debug!(points = entries.len(), "Republishing snapshot");

        for (id, value) in entries {
            self.publish_state(bus, &id, &value);
        }
    }

    /// Publish discovery configs, if enabled
    fn announce(&self, bus: &BusClient) {
        let Some(discovery) = &self.config.discovery else {
            return;
        };
        let announcements = discovery.announcements(&self.mapper);
        debug!(count = announcements.len(), "Publishing discovery configs");
        for announcement in announcements {
            if let Err(e) = bus.publish(announcement.topic, announcement.payload, true) {
                warn!(error = %e, "Discovery publication dropped");
            }
        }
    }

    async fn on_command(
        &mut self,
        feed: &FeedClient,
        feed_events: &mut EventStream<FeedEvent>,
        bus: &BusClient,
        topic: &str,
        payload: Bytes,
    ) {
        let point = match self.mapper.point_for(topic) {
            Ok(point) => point,
            Err(e) => {
                self.report.commands_rejected += 1;
                warn!(error = %e, "Ignoring command");
                return;
            }
        };
        let id = point.id.clone();

        let value = match self.mapper.decode(&payload, point.value_kind()) {
            Ok(value) => value,
            Err(e) => {
                self.report.commands_rejected += 1;
                warn!(point = %id, error = %e, "Ignoring command");
                return;
            }
        };

        debug!(point = %id, %value, "Forwarding command");

        // Keep consuming feed events while the write is in flight so the feed
        // task never blocks on a full event channel.
        let send = feed.send_command(&id, value);
        tokio::pin!(send);
        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                Some(event) = feed_events.next() => self.on_feed_event(bus, event),
            }
        };

        match result {
            Ok(()) => self.report.commands_forwarded += 1,
            Err(e) => {
                self.report.commands_rejected += 1;
                warn!(point = %id, error = %e, "Command not applied");
            }
        }
    }
}

fn ignore_while_draining(event: BusEvent) {
    debug!(?event, "Ignoring bus event while draining");
}
