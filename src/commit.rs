//! Commit validation: the optimistic-concurrency decision for a prepared transaction.
//!
//! Prepares are written without holding any per-stream lock. Before a commit is
//! appended, [`ReadIndex::check_commit_starting_at`] decides whether the transaction
//! may be committed, based only on records below a horizon (normally the Writer's
//! non-flushed position) and on commits already applied to the index.
//!
//! Because the decision depends on committed state only, two transactions prepared
//! against the same expected version both check `Ok` until one of them commits;
//! after that the other re-validates to `WrongExpectedVersion` (first committed
//! wins).

use crate::codec::{LogRecord, PrepareLogRecord};
use crate::error::Error;
use crate::index::ReadIndex;
use crate::types::{ExpectedVersion, PrepareFlags, RecordedEvent};

/// Outcome of validating a transaction for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitDecision {
    /// The transaction may be committed.
    Ok {
        /// Stream the transaction writes to.
        stream_id: String,
        /// Last event number of the stream at the horizon.
        current_version: Option<u64>,
        /// Event number the commit must assign to the first data prepare.
        first_event_number: u64,
        /// Event numbers about to be assigned; `None` if there are no data prepares.
        event_range: Option<(u64, u64)>,
    },
    /// The stream has moved past (or not yet reached) the expected version.
    WrongExpectedVersion {
        /// Stream the transaction writes to.
        stream_id: String,
        /// Version the prepares expected.
        expected: ExpectedVersion,
        /// Last event number of the stream at the horizon.
        current_version: Option<u64>,
    },
    /// The stream was hard-deleted.
    Deleted {
        /// Stream the transaction writes to.
        stream_id: String,
    },
    /// The same events are already committed; nothing must be written.
    Idempotent {
        /// Stream the transaction writes to.
        stream_id: String,
        /// Last event number of the stream at the horizon.
        current_version: Option<u64>,
        /// Event numbers the events were committed as.
        event_range: Option<(u64, u64)>,
        /// Position of the commit that committed them.
        commit_position: Option<u64>,
    },
    /// A retry partially matches what was committed: same first event, different rest.
    CorruptedIdempotency {
        /// Stream the transaction writes to.
        stream_id: String,
        /// Last event number of the stream at the horizon.
        current_version: Option<u64>,
    },
}

impl CommitDecision {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CommitDecision::Ok { .. } => "ok",
            CommitDecision::WrongExpectedVersion { .. } => "wrong_expected_version",
            CommitDecision::Deleted { .. } => "deleted",
            CommitDecision::Idempotent { .. } => "idempotent",
            CommitDecision::CorruptedIdempotency { .. } => "corrupted_idempotency",
        }
    }

    /// Convert a rejecting decision into the matching [`Error`]. `Ok` and
    /// `Idempotent` are not errors and return `None`.
    pub fn to_error(&self) -> Option<Error> {
        match self {
            CommitDecision::Ok { .. } | CommitDecision::Idempotent { .. } => None,
            CommitDecision::WrongExpectedVersion {
                stream_id,
                expected,
                current_version,
            } => Some(Error::WrongExpectedVersion {
                stream_id: stream_id.clone(),
                expected: *expected,
                current: *current_version,
            }),
            CommitDecision::Deleted { stream_id } => Some(Error::StreamDeleted {
                stream_id: stream_id.clone(),
            }),
            CommitDecision::CorruptedIdempotency { stream_id, .. } => {
                Some(Error::CorruptedIdempotency {
                    stream_id: stream_id.clone(),
                    detail: "retried write differs from the committed events".to_string(),
                })
            }
        }
    }
}

/// How a retried write compares with committed events.
enum Match {
    All,
    FirstOnly,
    None,
}

fn same_event(prepare: &PrepareLogRecord, event: &RecordedEvent) -> bool {
    prepare.event_id == event.event_id
        && prepare.event_type == event.event_type
        && prepare.data == event.data
        && prepare.metadata == event.metadata
}

fn compare(prepares: &[&PrepareLogRecord], committed: &[RecordedEvent]) -> Match {
    let Some(first) = prepares.first() else {
        return Match::None;
    };
    if !committed.first().is_some_and(|event| same_event(first, event)) {
        return Match::None;
    }
    let all = prepares.len() == committed.len()
        && prepares
            .iter()
            .zip(committed)
            .all(|(prepare, event)| same_event(prepare, event));
    if all { Match::All } else { Match::FirstOnly }
}

fn range_of(first: u64, count: usize) -> Option<(u64, u64)> {
    (count > 0).then(|| (first, first + count as u64 - 1))
}

impl ReadIndex {
    /// Decide whether the transaction that began at `transaction_position` may be
    /// committed, considering only records below `horizon`.
    ///
    /// Pure: reads the log and the index, mutates nothing.
    ///
    /// # Arguments
    ///
    /// * `transaction_position` - Log position of the transaction's first prepare.
    /// * `horizon` - Exclusive log position bound, normally the Writer's non-flushed
    ///   checkpoint.
    ///
    /// # Returns
    ///
    /// The [`CommitDecision`] for the transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::PositionNotFound`] if `transaction_position` is not below the
    ///   horizon or the Writer.
    /// - [`Error::InvalidArgument`] if the record there is not a prepare that begins
    ///   a transaction.
    /// - [`Error::InvalidTransaction`] if the transaction has no end marker below the
    ///   horizon, mixes streams, or was scavenged, and if an earlier commit of it was
    ///   rejected or it began before the current epoch.
    /// - [`Error::Io`] / [`Error::CorruptRecord`] on read failure.
    pub fn check_commit_starting_at(
        &self,
        transaction_position: u64,
        horizon: u64,
    ) -> Result<CommitDecision, Error> {
        if transaction_position >= horizon {
            return Err(Error::PositionNotFound {
                position: transaction_position,
            });
        }
        let abandoned = self
            .state
            .read()
            .expect("IndexState RwLock poisoned")
            .is_abandoned(transaction_position);
        if abandoned {
            return Err(Error::InvalidTransaction {
                transaction_position,
                detail: "transaction was rejected or began in an earlier epoch".to_string(),
            });
        }
        let prepares = self.collect_transaction(transaction_position, horizon)?;
        let begin = &prepares[0];
        let stream_id = begin.stream_id.clone();
        let expected = begin.expected_version;
        let mut data: Vec<&PrepareLogRecord> = prepares
            .iter()
            .filter(|p| p.flags.contains(PrepareFlags::DATA))
            .collect();
        data.sort_by_key(|p| p.transaction_offset);

        let (deleted, current_version, already_committed, dedup_hit) = {
            let state = self.state.read().expect("IndexState RwLock poisoned");
            let stream = state.streams.get(&stream_id);
            let dedup_hit = data
                .first()
                .and_then(|first| state.dedup.lookup(&first.event_id))
                .filter(|key| key.stream_id == stream_id)
                .map(|key| key.event_number);
            (
                stream.is_some_and(|s| s.deleted),
                stream.and_then(|s| s.last_event_number),
                state
                    .commits
                    .get(&transaction_position)
                    .filter(|c| c.commit_position < horizon)
                    .cloned(),
                dedup_hit,
            )
        };

        if deleted {
            return Ok(CommitDecision::Deleted { stream_id });
        }

        if let Some(commit) = already_committed {
            let committed = self.committed_events(transaction_position)?;
            let matches = data.len() == committed.len()
                && data
                    .iter()
                    .zip(&committed)
                    .all(|(prepare, event)| same_event(prepare, event));
            return Ok(if matches {
                CommitDecision::Idempotent {
                    stream_id,
                    current_version,
                    event_range: range_of(commit.first_event_number, data.len()),
                    commit_position: Some(commit.commit_position),
                }
            } else {
                CommitDecision::CorruptedIdempotency {
                    stream_id,
                    current_version,
                }
            });
        }

        let next_number = current_version.map_or(0, |v| v + 1);
        let ok = |stream_id: String| CommitDecision::Ok {
            stream_id,
            current_version,
            first_event_number: next_number,
            event_range: range_of(next_number, data.len()),
        };

        let expected_number = match expected {
            ExpectedVersion::Any => {
                let Some(first_number) = dedup_hit else {
                    return Ok(ok(stream_id));
                };
                let committed =
                    self.events_in_range(&stream_id, first_number, data.len() as u64)?;
                return Ok(self.retry_decision(
                    stream_id,
                    current_version,
                    &data,
                    &committed,
                    first_number,
                    ok,
                ));
            }
            ExpectedVersion::NoStream => None,
            ExpectedVersion::Exact(n) => Some(n),
        };

        if expected_number == current_version {
            return Ok(ok(stream_id));
        }

        // `None` (no stream) sorts below every event number.
        if expected_number < current_version {
            let first_number = expected_number.map_or(0, |n| n + 1);
            let committed = self.events_in_range(&stream_id, first_number, data.len() as u64)?;
            if !matches!(compare(&data, &committed), Match::None) {
                return Ok(self.retry_decision(
                    stream_id,
                    current_version,
                    &data,
                    &committed,
                    first_number,
                    ok,
                ));
            }
        }

        Ok(CommitDecision::WrongExpectedVersion {
            stream_id,
            expected,
            current_version,
        })
    }

    fn retry_decision(
        &self,
        stream_id: String,
        current_version: Option<u64>,
        data: &[&PrepareLogRecord],
        committed: &[RecordedEvent],
        first_number: u64,
        ok: impl FnOnce(String) -> CommitDecision,
    ) -> CommitDecision {
        match compare(data, committed) {
            Match::All => CommitDecision::Idempotent {
                event_range: range_of(first_number, data.len()),
                commit_position: committed.first().map(|e| e.commit_position),
                stream_id,
                current_version,
            },
            Match::FirstOnly => CommitDecision::CorruptedIdempotency {
                stream_id,
                current_version,
            },
            Match::None => ok(stream_id),
        }
    }

    /// Read the transaction's prepares, from its begin marker up to its end marker.
    fn collect_transaction(
        &self,
        transaction_position: u64,
        horizon: u64,
    ) -> Result<Vec<PrepareLogRecord>, Error> {
        let begin = match self.db.read_record(transaction_position)? {
            Some(LogRecord::Prepare(prepare))
                if prepare.transaction_position == transaction_position
                    && prepare.flags.contains(PrepareFlags::TRANSACTION_BEGIN) =>
            {
                prepare
            }
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "record at {transaction_position} does not begin a transaction: {}",
                    record_kind(&other)
                )));
            }
            None => {
                return Err(Error::InvalidTransaction {
                    transaction_position,
                    detail: "transaction was scavenged".to_string(),
                });
            }
        };

        let mut ended = begin.flags.contains(PrepareFlags::TRANSACTION_END);
        let mut prepares = vec![begin];
        if !ended {
            for item in self.db.scan_forward(transaction_position, horizon).skip(1) {
                let (record, _) = item?;
                let LogRecord::Prepare(prepare) = record else {
                    continue;
                };
                if prepare.transaction_position != transaction_position {
                    continue;
                }
                if prepare.stream_id != prepares[0].stream_id {
                    return Err(Error::InvalidTransaction {
                        transaction_position,
                        detail: format!(
                            "prepare at {} writes to {}, transaction writes to {}",
                            prepare.log_position, prepare.stream_id, prepares[0].stream_id
                        ),
                    });
                }
                ended = prepare.flags.contains(PrepareFlags::TRANSACTION_END);
                prepares.push(prepare);
                if ended {
                    break;
                }
            }
        }

        if !ended {
            return Err(Error::InvalidTransaction {
                transaction_position,
                detail: "transaction has no end marker below the horizon".to_string(),
            });
        }
        Ok(prepares)
    }
}

fn record_kind(record: &LogRecord) -> &'static str {
    match record {
        LogRecord::Prepare(_) => "prepare inside a transaction",
        LogRecord::Commit(_) => "commit",
        LogRecord::System(_) => "system record",
    }
}
