//! Retention decisions for a stream's message set
//!
//! All functions here run under the stream's writer lock; they mutate
//! the in-memory log and report which sequences were purged so the
//! caller can mirror the purge to persistent storage.

use crate::config::{DiscardPolicy, RetentionPolicy, StreamConfig};

use super::LogInner;

/// Whether an incoming append of `incoming_bytes` must be rejected
/// under `DiscardPolicy::New`
pub(super) fn rejects_append(inner: &LogInner, config: &StreamConfig, incoming_bytes: u64) -> bool {
    if config.discard != DiscardPolicy::New {
        return false;
    }

    if let Some(max_msgs) = config.max_msgs
        && inner.messages.len() as u64 >= max_msgs
    {
        return true;
    }

    if let Some(max_bytes) = config.max_bytes
        && inner.byte_count + incoming_bytes > max_bytes
    {
        return true;
    }

    false
}

/// Purge oldest entries until the stream is back under its limits
///
/// Only meaningful for `DiscardPolicy::Old`; age limits apply to every
/// retention policy so aging out is checked regardless. Returns purged
/// sequences in ascending order.
pub(super) fn enforce_limits(inner: &mut LogInner, config: &StreamConfig, now_ms: u64) -> Vec<u64> {
    let mut purged = Vec::new();

    // Age expiry applies to the oldest entries first
    if let Some(max_age) = config.max_age {
        let cutoff = now_ms.saturating_sub(max_age.as_millis() as u64);
        while let Some((&seq, message)) = inner.messages.first_key_value() {
            if message.timestamp_ms >= cutoff {
                break;
            }
            inner.purge(seq);
            purged.push(seq);
        }
    }

    if config.discard == DiscardPolicy::Old {
        if let Some(max_msgs) = config.max_msgs {
            while inner.messages.len() as u64 > max_msgs {
                if let Some((&seq, _)) = inner.messages.first_key_value() {
                    inner.purge(seq);
                    purged.push(seq);
                } else {
                    break;
                }
            }
        }

        if let Some(max_bytes) = config.max_bytes {
            while inner.byte_count > max_bytes {
                if let Some((&seq, _)) = inner.messages.first_key_value() {
                    inner.purge(seq);
                    purged.push(seq);
                } else {
                    break;
                }
            }
        }
    }

    purged
}

/// Whether this retention policy purges when deliveries settle
pub(super) fn purges_on_settle(policy: RetentionPolicy) -> bool {
    matches!(policy, RetentionPolicy::WorkQueue | RetentionPolicy::Interest)
}
