//! Single-writer task for the storage engine.
//!
//! The `Store` is moved into one tokio task. Every write (appends, deletes,
//! metadata, explicit transactions, flushes) is sent to it as a [`WriteRequest`]
//! over a bounded `tokio::mpsc` channel and answered through a oneshot channel,
//! so writes are serialized without any per-stream locking. Reads bypass the task
//! entirely through the [`ReadIndex`] returned by [`spawn_writer`].

use tokio::sync::{mpsc, oneshot};

use crate::broker::Broker;
use crate::error::Error;
use crate::index::ReadIndex;
use crate::store::{CommitOutcome, Store};
use crate::types::{
    AppendResult, DeleteResult, ExpectedVersion, ProposedEvent, ServiceMessage, StreamMetadata,
};

type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// A request processed by the writer task.
///
/// Each variant carries the oneshot sender its result is delivered on.
pub enum WriteRequest {
    /// [`Store::append`].
    Append {
        stream_id: String,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
        response_tx: Reply<AppendResult>,
    },
    /// [`Store::write_prepare`].
    Prepare {
        stream_id: String,
        expected_version: ExpectedVersion,
        event: ProposedEvent,
        response_tx: Reply<u64>,
    },
    /// [`Store::write_commit`].
    Commit {
        transaction_position: u64,
        response_tx: Reply<CommitOutcome>,
    },
    /// [`Store::start_transaction`].
    StartTransaction {
        stream_id: String,
        expected_version: ExpectedVersion,
        response_tx: Reply<u64>,
    },
    /// [`Store::write_transaction_data`].
    TransactionWrite {
        transaction_position: u64,
        events: Vec<ProposedEvent>,
        response_tx: Reply<()>,
    },
    /// [`Store::commit_transaction`].
    CommitTransaction {
        transaction_position: u64,
        response_tx: Reply<AppendResult>,
    },
    /// [`Store::delete_stream`].
    Delete {
        stream_id: String,
        expected_version: ExpectedVersion,
        hard_delete: bool,
        response_tx: Reply<DeleteResult>,
    },
    /// [`Store::set_stream_metadata`].
    SetMetadata {
        stream_id: String,
        expected_version: ExpectedVersion,
        metadata: StreamMetadata,
        response_tx: Reply<AppendResult>,
    },
    /// [`Store::flush`].
    Flush { response_tx: Reply<()> },
}

impl WriteRequest {
    /// Stream the request targets, for logging.
    fn target(&self) -> String {
        match self {
            WriteRequest::Append { stream_id, .. }
            | WriteRequest::Prepare { stream_id, .. }
            | WriteRequest::StartTransaction { stream_id, .. }
            | WriteRequest::Delete { stream_id, .. }
            | WriteRequest::SetMetadata { stream_id, .. } => stream_id.clone(),
            WriteRequest::Commit {
                transaction_position,
                ..
            }
            | WriteRequest::TransactionWrite {
                transaction_position,
                ..
            }
            | WriteRequest::CommitTransaction {
                transaction_position,
                ..
            } => format!("transaction@{transaction_position}"),
            WriteRequest::Flush { .. } => "flush".to_string(),
        }
    }
}

/// Cloneable handle for submitting write requests to the writer task.
///
/// Cloning a `WriterHandle` produces a second sender into the same channel.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Create a new `WriterHandle` from the sender half of an mpsc channel.
    pub fn new(tx: mpsc::Sender<WriteRequest>) -> Self {
        Self { tx }
    }

    /// Send a request built around a fresh oneshot sender and await its reply.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument("writer task closed")` if the task is gone
    /// before or while handling the request.
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WriteRequest,
    ) -> Result<T, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::InvalidArgument("writer task closed".into()))?;
        response_rx
            .await
            .map_err(|_| Error::InvalidArgument("writer task closed".into()))?
    }

    /// Append events to a stream as one transaction.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream.
    /// * `expected_version` - Optimistic concurrency check.
    /// * `events` - Events to append.
    ///
    /// # Returns
    ///
    /// The [`AppendResult`] once the commit is durable and indexed.
    ///
    /// # Errors
    ///
    /// - The store's error (`WrongExpectedVersion`, `StreamDeleted`, `EventTooLarge`, ...).
    /// - `Error::InvalidArgument("writer task closed")` if the task has stopped.
    pub async fn append(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendResult, Error> {
        let stream_id = stream_id.to_string();
        self.request(|response_tx| WriteRequest::Append {
            stream_id,
            expected_version,
            events,
            response_tx,
        })
        .await
    }

    /// Write a single unvalidated prepare; see [`Store::write_prepare`].
    pub async fn write_prepare(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        event: ProposedEvent,
    ) -> Result<u64, Error> {
        let stream_id = stream_id.to_string();
        self.request(|response_tx| WriteRequest::Prepare {
            stream_id,
            expected_version,
            event,
            response_tx,
        })
        .await
    }

    /// Validate and commit a prepared transaction; see [`Store::write_commit`].
    pub async fn write_commit(&self, transaction_position: u64) -> Result<CommitOutcome, Error> {
        self.request(|response_tx| WriteRequest::Commit {
            transaction_position,
            response_tx,
        })
        .await
    }

    /// Begin an explicit transaction; returns its transaction position.
    pub async fn start_transaction(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
    ) -> Result<u64, Error> {
        let stream_id = stream_id.to_string();
        self.request(|response_tx| WriteRequest::StartTransaction {
            stream_id,
            expected_version,
            response_tx,
        })
        .await
    }

    /// Add events to an open explicit transaction.
    pub async fn write_transaction_data(
        &self,
        transaction_position: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<(), Error> {
        self.request(|response_tx| WriteRequest::TransactionWrite {
            transaction_position,
            events,
            response_tx,
        })
        .await
    }

    /// Close and commit an explicit transaction.
    pub async fn commit_transaction(
        &self,
        transaction_position: u64,
    ) -> Result<AppendResult, Error> {
        self.request(|response_tx| WriteRequest::CommitTransaction {
            transaction_position,
            response_tx,
        })
        .await
    }

    /// Hard- or soft-delete a stream; see [`Store::delete_stream`].
    pub async fn delete_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<DeleteResult, Error> {
        let stream_id = stream_id.to_string();
        self.request(|response_tx| WriteRequest::Delete {
            stream_id,
            expected_version,
            hard_delete,
            response_tx,
        })
        .await
    }

    /// Replace the metadata of a stream.
    pub async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> Result<AppendResult, Error> {
        let stream_id = stream_id.to_string();
        self.request(|response_tx| WriteRequest::SetMetadata {
            stream_id,
            expected_version,
            metadata,
            response_tx,
        })
        .await
    }

    /// Fsync chunk data and persist all checkpoints.
    pub async fn flush(&self) -> Result<(), Error> {
        self.request(|response_tx| WriteRequest::Flush { response_tx })
            .await
    }
}

/// Send `result` to the requester, warning if it stopped waiting.
fn respond<T>(response_tx: Reply<T>, result: Result<T, Error>, target: &str) {
    if response_tx.send(result).is_err() {
        tracing::warn!(target, "writer: response receiver dropped");
    }
}

/// Handle one request. Returns the error of a failed disk operation, after which
/// the writer must stop.
fn process(store: &mut Store, request: WriteRequest) -> Option<String> {
    let target = request.target();
    let mut fatal = None;
    macro_rules! answer {
        ($response_tx:expr, $result:expr) => {{
            let result = $result;
            if let Err(Error::Io(ref e)) = result {
                fatal = Some(e.to_string());
            }
            respond($response_tx, result, &target);
        }};
    }

    match request {
        WriteRequest::Append {
            stream_id,
            expected_version,
            events,
            response_tx,
        } => answer!(response_tx, store.append(&stream_id, expected_version, events)),
        WriteRequest::Prepare {
            stream_id,
            expected_version,
            event,
            response_tx,
        } => answer!(
            response_tx,
            store.write_prepare(&stream_id, expected_version, event)
        ),
        WriteRequest::Commit {
            transaction_position,
            response_tx,
        } => answer!(response_tx, store.write_commit(transaction_position)),
        WriteRequest::StartTransaction {
            stream_id,
            expected_version,
            response_tx,
        } => answer!(
            response_tx,
            store.start_transaction(&stream_id, expected_version)
        ),
        WriteRequest::TransactionWrite {
            transaction_position,
            events,
            response_tx,
        } => answer!(
            response_tx,
            store.write_transaction_data(transaction_position, events)
        ),
        WriteRequest::CommitTransaction {
            transaction_position,
            response_tx,
        } => answer!(response_tx, store.commit_transaction(transaction_position)),
        WriteRequest::Delete {
            stream_id,
            expected_version,
            hard_delete,
            response_tx,
        } => answer!(
            response_tx,
            store.delete_stream(&stream_id, expected_version, hard_delete)
        ),
        WriteRequest::SetMetadata {
            stream_id,
            expected_version,
            metadata,
            response_tx,
        } => answer!(
            response_tx,
            store.set_stream_metadata(&stream_id, expected_version, &metadata)
        ),
        WriteRequest::Flush { response_tx } => answer!(response_tx, store.flush()),
    }
    fatal
}

/// Run the writer task loop.
///
/// The first request of each batch is received with `recv()`, further pending
/// requests are drained with `try_recv()`. After each request the events it
/// committed are published to the broker, before the next request is handled,
/// so subscribers observe commit order.
///
/// An I/O error leaves the log in an unknown state: it is logged with
/// `tracing::error!`, the task stops accepting writes and pending requests fail
/// with "writer task closed". When the channel closes normally the store is
/// closed. Either way `ServiceMessage::Shutdown` is published last.
pub(crate) async fn run_writer(mut store: Store, mut rx: mpsc::Receiver<WriteRequest>, broker: Broker) {
    broker.publish_service(ServiceMessage::Initialized {
        writer_position: store.writer_position(),
        epoch_number: store.epoch().epoch_number,
    });

    let mut failed = false;
    'outer: while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(req) = rx.try_recv() {
            batch.push(req);
        }

        for req in batch {
            let fatal = process(&mut store, req);
            let committed = store.take_committed();
            if !committed.is_empty() {
                broker.publish_committed(&committed, true);
            }
            if let Some(error) = fatal {
                tracing::error!(%error, "writer: disk failure, no longer accepting writes");
                failed = true;
                break 'outer;
            }
        }
    }

    if !failed && let Err(e) = store.close() {
        tracing::error!(error = %e, "writer: failed to close store");
    }
    broker.publish_service(ServiceMessage::Shutdown);
}

/// Spawn the writer task on the tokio runtime.
///
/// # Arguments
///
/// * `store` - The storage engine to move into the writer task.
/// * `channel_capacity` - Bound on the mpsc channel. Controls backpressure.
/// * `broker` - Broker the task publishes committed events and lifecycle messages to.
///
/// # Returns
///
/// A tuple of:
/// - `WriterHandle` -- cloneable sender for submitting write requests.
/// - `ReadIndex` -- shared, read-only view of the store.
/// - `JoinHandle<()>` -- resolves once the task has closed the store.
pub fn spawn_writer(
    store: Store,
    channel_capacity: usize,
    broker: Broker,
) -> (WriterHandle, ReadIndex, tokio::task::JoinHandle<()>) {
    let read_index = store.read_index();
    let (tx, rx) = mpsc::channel(channel_capacity);
    let writer_handle = WriterHandle::new(tx);
    let join_handle = tokio::spawn(run_writer(store, rx, broker));
    (writer_handle, read_index, join_handle)
}
