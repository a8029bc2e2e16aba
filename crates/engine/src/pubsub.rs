//! Plain (non-streamed) pub/sub with queue-group fan-out
//!
//! Subscriptions here are transient and at-most-once: a published
//! message goes to every matching plain subscriber and to exactly one
//! member of each matching queue group, chosen round-robin. Nothing is
//! retained; a subject with no subscribers drops the message.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::subject::{Subject, SubjectPattern};

/// A message fanned out to plain subscribers
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Concrete subject it was published on
    pub subject: Subject,
    /// Message payload
    pub payload: Bytes,
}

struct SubEntry {
    id: u64,
    pattern: SubjectPattern,
    sender: mpsc::UnboundedSender<PubSubMessage>,
}

#[derive(Default)]
struct Group {
    members: Vec<SubEntry>,
    /// Round-robin cursor into `members`
    next: usize,
}

#[derive(Default)]
struct RouterInner {
    next_id: u64,
    plain: Vec<SubEntry>,
    groups: HashMap<String, Group>,
}

/// Subject-matched fan-out to plain and queue-group subscribers
#[derive(Default)]
pub(crate) struct PubSubRouter {
    inner: RwLock<RouterInner>,
}

impl PubSubRouter {
    /// Register a plain subscription receiving every matching message
    pub(crate) fn subscribe(self: &Arc<Self>, pattern: SubjectPattern) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.plain.push(SubEntry {
            id,
            pattern,
            sender,
        });
        debug!(id, "added subscription");

        Subscription {
            id,
            group: None,
            router: self.clone(),
            receiver,
        }
    }

    /// Join a queue group; each matching message goes to exactly one
    /// member of the group
    pub(crate) fn queue_subscribe(
        self: &Arc<Self>,
        pattern: SubjectPattern,
        group: impl Into<String>,
    ) -> Subscription {
        let group = group.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.groups.entry(group.clone()).or_default().members.push(SubEntry {
            id,
            pattern,
            sender,
        });
        debug!(id, group = %group, "added queue subscription");

        Subscription {
            id,
            group: Some(group),
            router: self.clone(),
            receiver,
        }
    }

    /// Fan a message out; returns how many subscribers received it
    pub(crate) fn publish(&self, subject: &Subject, payload: &Bytes) -> usize {
        let mut inner = self.inner.write();
        let mut delivered = 0;

        for entry in &inner.plain {
            if entry.pattern.matches(subject) {
                let message = PubSubMessage {
                    subject: subject.clone(),
                    payload: payload.clone(),
                };
                if entry.sender.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }

        for group in inner.groups.values_mut() {
            let len = group.members.len();
            for offset in 0..len {
                let idx = (group.next + offset) % len;
                let member = &group.members[idx];
                if !member.pattern.matches(subject) {
                    continue;
                }
                let message = PubSubMessage {
                    subject: subject.clone(),
                    payload: payload.clone(),
                };
                if member.sender.send(message).is_ok() {
                    group.next = (idx + 1) % len;
                    delivered += 1;
                    break;
                }
            }
        }

        delivered
    }

    fn remove(&self, id: u64, group: Option<&str>) {
        let mut inner = self.inner.write();
        match group {
            None => inner.plain.retain(|entry| entry.id != id),
            Some(name) => {
                if let Some(group) = inner.groups.get_mut(name) {
                    group.members.retain(|entry| entry.id != id);
                    if group.next >= group.members.len() {
                        group.next = 0;
                    }
                    if group.members.is_empty() {
                        inner.groups.remove(name);
                    }
                }
            }
        }
    }
}

/// A live plain or queue-group subscription
///
/// Dropping the subscription removes it from the router.
pub struct Subscription {
    id: u64,
    group: Option<String>,
    router: Arc<PubSubRouter>,
    receiver: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Subscription {
    /// Wait for the next message; None once the router is gone
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued
    pub fn try_next(&mut self) -> Option<PubSubMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.remove(self.id, self.group.as_deref());
    }
}
