//! Connection state and event streams shared by the feed and bus clients

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

/// Capacity of each client's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connection state owned by a client's connection task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; a reconnect is pending unless the client is closed
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Shutting down
    Closing,
}

/// Lazy sequence of events produced by a client.
///
/// The sequence spans reconnections: after a `ConnectionLost` the consumer
/// keeps reading and eventually receives `ConnectionRestored`. It ends only
/// once the client's connection task has stopped.
pub struct EventStream<E> {
    rx: mpsc::Receiver<E>,
}

impl<E> EventStream<E> {
    pub(crate) fn new(rx: mpsc::Receiver<E>) -> Self {
        Self { rx }
    }

    /// Wait for the next event
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
