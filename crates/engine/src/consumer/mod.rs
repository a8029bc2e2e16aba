//! Consumers: acknowledged cursors over a stream
//!
//! A consumer tracks a delivery cursor plus a pending table of
//! in-flight sequences. Each pending entry moves through a small state
//! machine: delivered, then either acked (removed), redelivered while
//! attempts remain, or terminated once the delivery budget is
//! exhausted or the application gives up on it.

mod delivery;

pub use delivery::{DeliveryHandle, DeliveryHandler};
pub(crate) use delivery::DeliveryPool;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AckPolicy, ConsumerConfig};
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::subject::Subject;
use crate::types::{ConsumerName, Delivery, StreamName, now_ms};

/// An in-flight delivery awaiting acknowledgment
#[derive(Debug, Clone)]
struct PendingEntry {
    deadline: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct ConsumerState {
    /// Next unseen sequence
    cursor: u64,
    /// In-flight sequences awaiting ack
    pending: HashMap<u64, PendingEntry>,
    /// Sequences abandoned by Term or an exhausted delivery budget
    terminated: HashSet<u64>,
    /// Messages that ran out of delivery attempts
    delivery_failures: u64,
}

/// Observable consumer state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Next unseen sequence
    pub cursor: u64,
    /// In-flight unacked deliveries
    pub num_pending: u64,
    /// Terminated sequences
    pub num_terminated: u64,
    /// Messages that exhausted their delivery budget
    pub delivery_failures: u64,
}

/// A durable or ephemeral cursor over a stream
pub struct Consumer {
    config: ConsumerConfig,
    stream_name: StreamName,
    stream: Weak<Stream>,
    context: Arc<EngineContext>,
    state: Mutex<ConsumerState>,
    cancel: CancellationToken,
    /// Open delivery contexts (push handles)
    active_handles: AtomicUsize,
    /// Last fetch/ack activity, for ephemeral collection
    last_activity_ms: AtomicU64,
}

impl Consumer {
    pub(crate) fn new(
        config: ConsumerConfig,
        stream_name: StreamName,
        stream: Weak<Stream>,
        context: Arc<EngineContext>,
        cursor: u64,
    ) -> Arc<Self> {
        let cancel = context.cancel.child_token();
        Arc::new(Self {
            config,
            stream_name,
            stream,
            context,
            state: Mutex::new(ConsumerState {
                cursor,
                ..ConsumerState::default()
            }),
            cancel,
            active_handles: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(now_ms()),
        })
    }

    /// The consumer's name
    pub fn name(&self) -> &ConsumerName {
        &self.config.name
    }

    /// The consumer's configuration
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Whether a subject passes the consumer's filter
    pub(crate) fn matches(&self, subject: &Subject) -> bool {
        self.config
            .filter_subject
            .as_ref()
            .is_none_or(|pattern| pattern.matches(subject))
    }

    fn stream(&self) -> Result<Arc<Stream>> {
        self.stream
            .upgrade()
            .ok_or_else(|| Error::StreamNotFound(self.stream_name.clone()))
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Observable state snapshot
    pub async fn info(&self) -> ConsumerInfo {
        let state = self.state.lock().await;
        ConsumerInfo {
            cursor: state.cursor,
            num_pending: state.pending.len() as u64,
            num_terminated: state.terminated.len() as u64,
            delivery_failures: state.delivery_failures,
        }
    }

    /// Pull up to `batch` deliverable messages, waiting up to
    /// `max_wait` for the first one
    ///
    /// Returns whatever accumulated when something becomes available
    /// or the wait expires; an empty result is not an error. Blocks
    /// only the calling worker, never other consumers or the append
    /// path.
    pub async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<Delivery>> {
        let stream = self.stream()?;
        self.touch();

        let deadline = Instant::now() + max_wait;
        let mut notified = stream.notified();

        loop {
            let deliveries = self.collect(&stream, batch).await?;
            if !deliveries.is_empty() {
                self.touch();
                return Ok(deliveries);
            }

            tokio::select! {
                changed = notified.changed() => {
                    if changed.is_err() {
                        // Stream dropped out from under us
                        return Ok(Vec::new());
                    }
                }
                // Pending entries expire on their own schedule
                () = tokio::time::sleep(self.context.sweep_interval) => {}
                () = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    /// Gather deliverable messages: expired pending entries first,
    /// then unseen messages past the cursor, subject to the
    /// max-ack-pending ceiling
    pub(crate) async fn collect(&self, stream: &Arc<Stream>, max: usize) -> Result<Vec<Delivery>> {
        let mut settled = Vec::new();
        let deliveries = {
            let mut state = self.state.lock().await;
            let log = stream.lock_log().await;
            let now = Instant::now();
            let mut out = Vec::new();

            // Expired in-flight entries are redelivered (or retired)
            // before any new hand-outs
            let mut expired: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(&seq, _)| seq)
                .collect();
            expired.sort_unstable();

            for seq in expired {
                if out.len() >= max {
                    break;
                }
                let Some(entry) = state.pending.get(&seq) else {
                    continue;
                };
                if entry.delivery_count >= self.config.max_deliver {
                    state.pending.remove(&seq);
                    state.terminated.insert(seq);
                    state.delivery_failures += 1;
                    settled.push(seq);
                    warn!(
                        consumer = %self.config.name,
                        sequence = seq,
                        "delivery attempts exhausted"
                    );
                    continue;
                }
                let Some(message) = log.messages.get(&seq).cloned() else {
                    // Purged while in flight
                    state.pending.remove(&seq);
                    continue;
                };
                let entry = state.pending.get_mut(&seq).expect("entry present");
                entry.delivery_count += 1;
                entry.deadline = now + self.config.ack_wait;
                out.push(Delivery {
                    message,
                    delivery_count: entry.delivery_count,
                });
            }

            // New messages past the cursor
            loop {
                if out.len() >= max {
                    break;
                }
                if let Some(limit) = self.config.max_ack_pending
                    && state.pending.len() >= limit
                {
                    break;
                }
                let Some((seq, message)) = log
                    .messages
                    .range(state.cursor..)
                    .next()
                    .map(|(&seq, message)| (seq, message.clone()))
                else {
                    break;
                };

                if !self.matches(&message.subject)
                    || state.terminated.contains(&seq)
                    || state.pending.contains_key(&seq)
                {
                    state.cursor = seq + 1;
                    continue;
                }

                state.cursor = seq + 1;
                if self.config.ack_policy == AckPolicy::None {
                    settled.push(seq);
                } else {
                    state.pending.insert(
                        seq,
                        PendingEntry {
                            deadline: now + self.config.ack_wait,
                            delivery_count: 1,
                        },
                    );
                }
                out.push(Delivery {
                    message,
                    delivery_count: 1,
                });
            }

            out
        };

        // Auto-acks (ack-policy None) and exhausted entries both settle
        // their sequence; retention hooks run outside the log lock
        for seq in settled {
            stream.settled(&self.config.name, seq).await;
        }

        if !deliveries.is_empty() {
            debug!(
                consumer = %self.config.name,
                count = deliveries.len(),
                "handed out messages"
            );
        }
        Ok(deliveries)
    }

    /// Acknowledge a delivered sequence
    ///
    /// Idempotent: acking a sequence that is no longer pending is a
    /// no-op. Acking a terminated sequence is an error.
    pub async fn ack(&self, sequence: u64) -> Result<()> {
        let stream = self.stream()?;
        self.touch();

        let acked: Vec<u64> = {
            let mut state = self.state.lock().await;
            if state.terminated.contains(&sequence) {
                return Err(Error::AlreadyTerminated(sequence));
            }
            match self.config.ack_policy {
                AckPolicy::None => Vec::new(),
                AckPolicy::Explicit => {
                    if state.pending.remove(&sequence).is_some() {
                        vec![sequence]
                    } else {
                        Vec::new()
                    }
                }
                AckPolicy::All => {
                    let mut seqs: Vec<u64> = state
                        .pending
                        .keys()
                        .copied()
                        .filter(|&seq| seq <= sequence)
                        .collect();
                    seqs.sort_unstable();
                    for seq in &seqs {
                        state.pending.remove(seq);
                    }
                    seqs
                }
            }
        };

        for seq in acked {
            stream.settled(&self.config.name, seq).await;
        }
        Ok(())
    }

    /// Request redelivery of a delivered sequence
    ///
    /// The entry becomes immediately eligible again while attempts
    /// remain; otherwise it is terminated. Naking a sequence that is
    /// not pending is a no-op.
    pub async fn nak(&self, sequence: u64) -> Result<()> {
        self.touch();
        let terminated = {
            let mut state = self.state.lock().await;
            if state.terminated.contains(&sequence) {
                return Err(Error::AlreadyTerminated(sequence));
            }

            match state.pending.get_mut(&sequence) {
                Some(entry) if entry.delivery_count >= self.config.max_deliver => {
                    state.pending.remove(&sequence);
                    state.terminated.insert(sequence);
                    state.delivery_failures += 1;
                    warn!(
                        consumer = %self.config.name,
                        sequence,
                        "nak with no delivery attempts left"
                    );
                    true
                }
                Some(entry) => {
                    entry.deadline = Instant::now();
                    false
                }
                None => false,
            }
        };

        if terminated && let Ok(stream) = self.stream() {
            stream.settled(&self.config.name, sequence).await;
        }
        Ok(())
    }

    /// Permanently abandon a delivered sequence
    pub async fn term(&self, sequence: u64) -> Result<()> {
        self.touch();
        let was_pending = {
            let mut state = self.state.lock().await;
            let was_pending = state.pending.remove(&sequence).is_some();
            state.terminated.insert(sequence);
            was_pending
        };

        if was_pending && let Ok(stream) = self.stream() {
            stream.settled(&self.config.name, sequence).await;
        }
        Ok(())
    }

    /// Retire pending entries whose delivery budget ran out, so pull
    /// consumers converge even with no fetch in flight, and forget
    /// terminated sequences the stream no longer retains
    pub(crate) async fn sweep(&self) {
        let Ok(stream) = self.stream() else {
            return;
        };
        let now = Instant::now();

        let exhausted: Vec<u64> = {
            let mut state = self.state.lock().await;
            let log = stream.lock_log().await;

            let exhausted: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, entry)| {
                    entry.deadline <= now && entry.delivery_count >= self.config.max_deliver
                })
                .map(|(&seq, _)| seq)
                .collect();

            for &seq in &exhausted {
                state.pending.remove(&seq);
                state.terminated.insert(seq);
                state.delivery_failures += 1;
                warn!(
                    consumer = %self.config.name,
                    sequence = seq,
                    "delivery attempts exhausted"
                );
            }

            // A terminated sequence below the first retained one can
            // never be seen again; keeping it would grow the set for
            // the consumer's lifetime
            let first_retained = log
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(log.last_seq + 1);
            state.terminated.retain(|&seq| seq >= first_retained);

            exhausted
        };

        for seq in exhausted {
            stream.settled(&self.config.name, seq).await;
        }
    }

    /// Whether this ephemeral consumer is idle past its threshold
    pub(crate) fn is_collectible(&self) -> bool {
        if self.config.durable || self.active_handles.load(Ordering::Relaxed) > 0 {
            return false;
        }
        let idle_ms = now_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed));
        idle_ms >= self.config.inactivity_threshold.as_millis() as u64
    }

    /// Cancel all delivery contexts
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}
