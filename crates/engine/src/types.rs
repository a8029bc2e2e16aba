//! Core engine types

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::subject::Subject;

macro_rules! define_name_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create a new name
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Get the name as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_name_type!(StreamName, "Stream name type");
define_name_type!(ConsumerName, "Consumer name type");
define_name_type!(DomainName, "Federation domain name type");

/// A message stored in a stream
///
/// Immutable once appended; the sequence is assigned by the stream and
/// never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Stream sequence number, starting at 1
    pub sequence: u64,
    /// Subject the message was published on
    pub subject: Subject,
    /// Message payload
    pub payload: Bytes,
    /// Publish time in milliseconds since the unix epoch
    pub timestamp_ms: u64,
    /// Publisher-supplied deduplication id, if any
    pub dedup_id: Option<String>,
}

/// A message handed out to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The stored message
    pub message: StoredMessage,
    /// How many times this message has been delivered to the consumer
    pub delivery_count: u64,
}

/// Acknowledgment returned from a stream append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that captured the message
    pub stream: StreamName,
    /// Assigned (or, for duplicates, prior) sequence number
    pub sequence: u64,
    /// Whether the publish was a dedup-window duplicate
    pub duplicate: bool,
}

/// Stream state summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// First available sequence (last_seq + 1 when empty)
    pub first_seq: u64,
    /// Last assigned sequence
    pub last_seq: u64,
    /// Number of messages currently retained
    pub message_count: u64,
    /// Total payload bytes currently retained
    pub byte_count: u64,
}

/// Current time in milliseconds since the unix epoch
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
