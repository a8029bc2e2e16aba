//! Error types for the stream engine
//!
//! Structural errors (bad config, not-found, conflicts) are returned
//! synchronously to the caller and never retried internally. Delivery
//! path failures (ack timeout, nak) are absorbed by the redelivery
//! state machine and only surface as a terminal state once the
//! delivery budget is exhausted.

use rill_storage::StorageError;
use thiserror::Error;

use crate::subject::{Subject, SubjectError};
use crate::types::{ConsumerName, DomainName, StreamName};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the stream engine
#[derive(Debug, Error)]
pub enum Error {
    /// Subject matches none of the stream's configured subjects
    #[error("stream {stream} does not accept subject {subject}")]
    SubjectNotAccepted {
        /// Stream that rejected the publish
        stream: StreamName,
        /// Offending subject
        subject: Subject,
    },

    /// Append rejected because the stream is at a configured limit
    /// and its discard policy is DiscardNew
    #[error("stream {0} is at its configured limit")]
    MaxMsgsReached(StreamName),

    /// No stream with the given name
    #[error("stream not found: {0}")]
    StreamNotFound(StreamName),

    /// Stream already exists
    #[error("stream already exists: {0}")]
    StreamExists(StreamName),

    /// No consumer with the given name
    #[error("consumer not found: {0}")]
    ConsumerNotFound(ConsumerName),

    /// A second live consumer would overlap a work-queue filter
    #[error("consumer {proposed} overlaps work-queue consumer {existing}")]
    ConsumerConflict {
        /// Consumer being created
        proposed: ConsumerName,
        /// Conflicting bound consumer
        existing: ConsumerName,
    },

    /// Sequence was already terminated for this consumer
    #[error("sequence {0} already terminated")]
    AlreadyTerminated(u64),

    /// Message was purged or never existed
    #[error("message not found: sequence {0}")]
    MessageNotFound(u64),

    /// Stream hit a storage failure and is permanently unavailable
    #[error("stream {0} is unavailable: {1}")]
    StreamUnavailable(StreamName, String),

    /// No domain with the given name is registered
    #[error("domain not found: {0}")]
    DomainNotFound(DomainName),

    /// No stream in any registered domain accepts the subject
    #[error("no stream accepts subject {0}")]
    NoStreamForSubject(Subject),

    /// Configuration rejected at creation time
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Subject or pattern failed validation
    #[error(transparent)]
    Subject(#[from] SubjectError),

    /// Storage backend error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Engine has been shut down
    #[error("engine is shut down")]
    Shutdown,
}
