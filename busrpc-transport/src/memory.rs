//! In-process broker.
//!
//! Routes messages between subscriptions held in a [`DashMap`], following NATS
//! subject rules: tokens are separated by `.`, `*` matches one token and `>`
//! matches the remaining tail. Subscribers sharing a queue group receive each
//! message round-robin; everyone else receives every message.

use crate::broker::{BrokerConnection, BrokerMessage, Subscription};
use crate::error::TransportError;
use async_trait::async_trait;
use busrpc_protocol::{DEFAULT_INBOX_PREFIX, NATS_MAX_MESSAGE_SIZE};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// A registered subscription.
struct SubEntry {
    seq: u64,
    subject: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

struct Inner {
    subscriptions: DashMap<String, SubEntry>,
    next_seq: AtomicU64,
    connected: AtomicBool,
    max_payload: usize,
    /// Round-robin cursor per queue group.
    cursors: Mutex<HashMap<String, usize>>,
    published: Mutex<Vec<BrokerMessage>>,
    published_notify: Notify,
}

/// In-process message broker.
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a connected broker with the default NATS payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(NATS_MAX_MESSAGE_SIZE)
    }

    /// Creates a connected broker with the given payload limit (0 = unlimited).
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: DashMap::new(),
                next_seq: AtomicU64::new(0),
                connected: AtomicBool::new(true),
                max_payload,
                cursors: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                published_notify: Notify::new(),
            }),
        }
    }

    /// Simulates a connection loss or recovery.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Ends every subscription from the broker side, as a server disconnect
    /// would. Subscribers see their stream finish.
    pub fn close_subscriptions(&self) {
        self.inner.subscriptions.clear();
    }

    /// Returns every message published so far, oldest first.
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.inner.published.lock().clone()
    }

    /// Returns messages published to the given subject.
    pub fn published_to(&self, subject: &str) -> Vec<BrokerMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    /// Number of messages published so far.
    pub fn published_count(&self) -> usize {
        self.inner.published.lock().len()
    }

    /// Clears the publish history.
    pub fn clear_published(&self) {
        self.inner.published.lock().clear();
    }

    /// Waits until at least `count` messages have been published.
    ///
    /// Returns false if the timeout elapses first.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.published_notify.notified();
            if self.published_count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.published_count() >= count;
            }
        }
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of active subscriptions on exactly this subject.
    pub fn subscribers_on(&self, subject: &str) -> usize {
        self.inner
            .subscriptions
            .iter()
            .filter(|e| e.subject == subject)
            .count()
    }

    fn route(&self, message: BrokerMessage) {
        // Ungrouped subscribers, plus members of each queue group ordered by
        // subscription sequence so round-robin is deterministic.
        let mut direct = Vec::new();
        let mut groups: BTreeMap<String, Vec<(u64, String)>> = BTreeMap::new();

        for entry in self.inner.subscriptions.iter() {
            if !subject_matches(&entry.subject, &message.subject) {
                continue;
            }
            match &entry.queue_group {
                Some(group) => groups
                    .entry(group.clone())
                    .or_default()
                    .push((entry.seq, entry.key().clone())),
                None => direct.push(entry.key().clone()),
            }
        }

        let mut targets = direct;
        {
            let mut cursors = self.inner.cursors.lock();
            for (group, mut members) in groups {
                members.sort_by_key(|(seq, _)| *seq);
                let cursor = cursors.entry(group).or_insert(0);
                let (_, id) = &members[*cursor % members.len()];
                targets.push(id.clone());
                *cursor = cursor.wrapping_add(1);
            }
        }

        for id in targets {
            let closed = match self.inner.subscriptions.get(&id) {
                Some(entry) => entry.sender.send(message.clone()).is_err(),
                None => false,
            };
            if closed {
                self.inner.subscriptions.remove(&id);
            }
        }
    }

    fn do_publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let max = self.inner.max_payload;
        if max > 0 && payload.len() > max {
            return Err(TransportError::Broker(format!(
                "maximum payload exceeded: {} > {}",
                payload.len(),
                max
            )));
        }

        let message = BrokerMessage {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };
        self.inner.published.lock().push(message.clone());
        self.route(message);
        self.inner.published_notify.notify_waiters();
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn max_payload(&self) -> usize {
        self.inner.max_payload
    }

    fn new_inbox(&self) -> String {
        format!("{}{}", DEFAULT_INBOX_PREFIX, uuid::Uuid::new_v4().simple())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.do_publish(subject, None, payload)
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.do_publish(subject, Some(reply), payload)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if subject.is_empty() {
            return Err(TransportError::InvalidTopic);
        }

        let id = format!("sub-{}", uuid::Uuid::new_v4());
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscriptions.insert(
            id.clone(),
            SubEntry {
                seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
                subject: subject.to_string(),
                queue_group: queue_group.filter(|q| !q.is_empty()).map(str::to_string),
                sender,
            },
        );

        Ok(Box::new(MemorySubscription {
            id,
            subject: subject.to_string(),
            receiver,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn flush(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }
}

/// Subscription handle returned by [`MemoryBroker`].
struct MemorySubscription {
    id: String,
    subject: String,
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        self.inner.subscriptions.remove(&self.id);
        self.receiver.close();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.inner.subscriptions.remove(&self.id);
    }
}

/// Returns true if `subject` matches the subscription `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
