//! Broadcast broker for live event subscriptions.
//!
//! The `Broker` wraps two `tokio::broadcast` channels: one carrying
//! [`EventCommitted`] notifications, published by the writer task after every
//! commit is durable and indexed, and one carrying writer lifecycle
//! [`ServiceMessage`]s. Events travel as `Arc<RecordedEvent>` so subscribers share
//! one allocation.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::index::ReadIndex;
use crate::types::{EventCommitted, RecordedEvent, ServiceMessage, SubscriptionMessage};

/// Capacity of the lifecycle channel; it only ever carries a handful of messages.
const SERVICE_CHANNEL_CAPACITY: usize = 16;

/// Broadcast broker for pushing committed events to live subscribers.
///
/// Cloning produces a second handle onto the same channels.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<EventCommitted>,
    service_tx: broadcast::Sender<ServiceMessage>,
}

impl Broker {
    /// Create a new broker with the given broadcast channel capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events the broadcast channel can buffer before
    ///   lagging subscribers are dropped. Must be greater than zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        let (service_tx, _service_rx) = broadcast::channel(SERVICE_CHANNEL_CAPACITY);
        Self { tx, service_tx }
    }

    /// Publish one [`EventCommitted`] per event, in order.
    ///
    /// `is_end_of_log` is reported on the last event of the slice only: it states
    /// whether the commit that produced `events` was the last record written.
    ///
    /// # Arguments
    ///
    /// * `events` - Events of one or more commits, in commit order.
    /// * `is_end_of_log` - Whether nothing was written after these commits.
    pub fn publish_committed(&self, events: &[RecordedEvent], is_end_of_log: bool) {
        let last = events.len().saturating_sub(1);
        for (i, event) in events.iter().enumerate() {
            let message = EventCommitted {
                position: event.commit_position,
                event: Arc::new(event.clone()),
                is_end_of_log: is_end_of_log && i == last,
            };
            if self.tx.send(message).is_err() {
                tracing::debug!("broker publish: no active receivers");
            }
        }
    }

    /// Create a new receiver for committed events.
    ///
    /// Only events published after this call are received; catch-up is handled by
    /// [`subscribe_all`] and [`subscribe_stream`].
    pub fn subscribe(&self) -> broadcast::Receiver<EventCommitted> {
        self.tx.subscribe()
    }

    /// Publish a writer lifecycle message.
    pub fn publish_service(&self, message: ServiceMessage) {
        if self.service_tx.send(message).is_err() {
            tracing::debug!(?message, "broker publish: no service receivers");
        }
    }

    /// Create a new receiver for writer lifecycle messages.
    pub fn subscribe_service(&self) -> broadcast::Receiver<ServiceMessage> {
        self.service_tx.subscribe()
    }
}

/// Number of records examined per batch during the catch-up phase.
const CATCHUP_BATCH_SIZE: usize = 500;

/// Create an async stream that replays committed events of `$all` from
/// `from_position` (catch-up), emits a `CaughtUp` marker, then forwards live events.
///
/// The broadcast receiver and the index horizon are captured **before** any
/// historical read. Every commit below the horizon is already in the index and is
/// delivered by catch-up, so live events committed below it are skipped; later
/// commits that catch-up happened to read as well are recognised by position.
///
/// # Arguments
///
/// * `read_index` - Shared read-only handle to the read index.
/// * `broker` - Broker to receive live events from.
/// * `from_position` - Log position to start the catch-up replay from.
///
/// # Returns
///
/// A stream yielding `Result<SubscriptionMessage, Error>`.
///
/// # Errors
///
/// Yields `Error::InvalidArgument` and ends if the receiver lags behind the
/// broadcast channel; the consumer should re-subscribe from its last position.
/// Read errors during catch-up are yielded and end the stream.
pub async fn subscribe_all(
    read_index: ReadIndex,
    broker: &Broker,
    from_position: u64,
) -> impl futures_core::Stream<Item = Result<SubscriptionMessage, Error>> {
    let mut rx = broker.subscribe();
    let horizon = read_index.indexed_position();

    stream! {
        let mut cursor = from_position;
        let mut seen_after_horizon = HashSet::new();

        loop {
            let slice = match read_index.read_all_forward(cursor, CATCHUP_BATCH_SIZE) {
                Ok(slice) => slice,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            cursor = slice.next_position;
            for event in slice.events {
                if event.commit_position >= horizon {
                    seen_after_horizon.insert(event.log_position);
                }
                yield Ok(SubscriptionMessage::Event(Arc::new(event)));
            }
            if slice.is_end_of_stream {
                break;
            }
        }

        yield Ok(SubscriptionMessage::CaughtUp);

        loop {
            match rx.recv().await {
                Ok(committed) => {
                    let event = committed.event;
                    if event.log_position < from_position
                        || committed.position < horizon
                        || seen_after_horizon.remove(&event.log_position)
                    {
                        continue;
                    }
                    yield Ok(SubscriptionMessage::Event(event));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    yield Err(Error::InvalidArgument(
                        "subscription lagged: re-subscribe from last checkpoint".into(),
                    ));
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return;
                }
            }
        }
    }
}

/// Create an async stream that replays the events of `stream_id` from
/// `from_event_number` (catch-up), emits a `CaughtUp` marker, then forwards live
/// events of that stream.
///
/// Event numbers grow in commit order, so live events at or below the last number
/// delivered by catch-up are duplicates and skipped. A stream that does not exist
/// yet catches up immediately.
///
/// # Arguments
///
/// * `read_index` - Shared read-only handle to the read index.
/// * `broker` - Broker to receive live events from.
/// * `stream_id` - Stream to subscribe to.
/// * `from_event_number` - First event number to replay.
///
/// # Returns
///
/// A stream yielding `Result<SubscriptionMessage, Error>`.
///
/// # Errors
///
/// Yields `Error::StreamDeleted` if the stream is (or becomes, during catch-up)
/// hard-deleted, and `Error::InvalidArgument` if the receiver lags.
pub async fn subscribe_stream(
    read_index: ReadIndex,
    broker: &Broker,
    stream_id: String,
    from_event_number: u64,
) -> impl futures_core::Stream<Item = Result<SubscriptionMessage, Error>> {
    let mut rx = broker.subscribe();

    stream! {
        let mut cursor = from_event_number;
        let mut last_catchup_number: Option<u64> = None;

        loop {
            match read_index.read_stream_forward(&stream_id, cursor, CATCHUP_BATCH_SIZE as u64) {
                Ok(slice) => {
                    cursor = slice.next_event_number;
                    for event in slice.events {
                        last_catchup_number = Some(event.event_number);
                        yield Ok(SubscriptionMessage::Event(Arc::new(event)));
                    }
                    if slice.is_end_of_stream {
                        break;
                    }
                }
                Err(Error::StreamNotFound { .. }) => {
                    break;
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        yield Ok(SubscriptionMessage::CaughtUp);

        loop {
            match rx.recv().await {
                Ok(committed) => {
                    let event = committed.event;
                    if event.stream_id != stream_id || event.event_number < from_event_number {
                        continue;
                    }
                    if let Some(last) = last_catchup_number
                        && event.event_number <= last
                    {
                        continue;
                    }
                    yield Ok(SubscriptionMessage::Event(event));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    yield Err(Error::InvalidArgument(
                        "subscription lagged: re-subscribe from last checkpoint".into(),
                    ));
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return;
                }
            }
        }
    }
}
