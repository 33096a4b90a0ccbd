//! Reference-counted registry of wanted topics.
//!
//! The registry is the source of truth for which topics the client wants,
//! independent of whether a connection currently exists. While an epoch is
//! live the connection manager attaches its outbound channel; attaching
//! replays every wanted topic, so no subscription is lost across reconnects.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::protocol::ClientMessage;
use crate::topic::Topic;

/// Outbound channel of the current connection epoch.
pub type Outbox = mpsc::UnboundedSender<ClientMessage>;

#[derive(Debug)]
struct TopicEntry {
    params: Option<serde_json::Value>,
    refs: usize,
}

#[derive(Default)]
struct RegistryState {
    topics: BTreeMap<Topic, TopicEntry>,
    outbox: Option<Outbox>,
}

impl RegistryState {
    /// Send over the attached outbox. Returns false when detached or the
    /// connection task has gone away.
    fn send(&self, msg: ClientMessage) -> bool {
        match &self.outbox {
            Some(tx) => match tx.send(msg) {
                Ok(()) => true,
                Err(e) => {
                    debug!(topic = ?e.0.topic(), "outbox closed, control message deferred to replay");
                    false
                }
            },
            None => false,
        }
    }

    fn replay(&self) -> usize {
        let mut sent = 0;
        for (topic, entry) in &self.topics {
            if self.send(ClientMessage::Subscribe {
                topic: topic.clone(),
                params: entry.params.clone(),
            }) {
                sent += 1;
            }
        }
        sent
    }
}

/// Registry of wanted topics shared by every consumer of the connection.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty, detached registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a reference to a topic.
    ///
    /// The first reference issues a subscribe message if connected. Further
    /// references only bump the count. Returns true if a message was sent.
    pub fn subscribe(&self, topic: Topic, params: Option<serde_json::Value>) -> bool {
        let mut state = self.state();

        if let Some(entry) = state.topics.get_mut(&topic) {
            entry.refs += 1;
            if params.is_some() && params != entry.params {
                debug!(%topic, "topic already active, keeping original params");
            }
            trace!(%topic, refs = entry.refs, "topic already wanted");
            return false;
        }

        state.topics.insert(
            topic.clone(),
            TopicEntry {
                params: params.clone(),
                refs: 1,
            },
        );
        let sent = state.send(ClientMessage::Subscribe {
            topic: topic.clone(),
            params,
        });
        debug!(%topic, sent, "topic wanted");
        sent
    }

    /// Drop a reference to a topic.
    ///
    /// The topic is removed, and an unsubscribe message issued if connected,
    /// only when the last reference goes away. Returns true if a message was
    /// sent.
    pub fn unsubscribe(&self, topic: &Topic) -> bool {
        let mut state = self.state();

        let Some(entry) = state.topics.get_mut(topic) else {
            debug!(%topic, "unsubscribe for topic that is not wanted");
            return false;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            trace!(%topic, refs = entry.refs, "topic still wanted");
            return false;
        }

        state.topics.remove(topic);
        let sent = state.send(ClientMessage::Unsubscribe {
            topic: topic.clone(),
        });
        debug!(%topic, sent, "topic released");
        sent
    }

    /// Re-issue a subscribe message for every wanted topic over the attached
    /// outbox. Returns the number of messages sent.
    pub fn replay_all(&self) -> usize {
        self.state().replay()
    }

    /// Attach the outbox of a newly ready epoch and replay every wanted topic.
    ///
    /// Called by the connection manager. Attach and replay happen under one
    /// lock, so a concurrent `subscribe` is either replayed or sent directly,
    /// never skipped.
    pub fn attach(&self, outbox: Outbox) -> usize {
        let mut state = self.state();
        state.outbox = Some(outbox);
        let replayed = state.replay();
        info!(topics = state.topics.len(), replayed, "replayed subscriptions");
        replayed
    }

    /// Detach the outbox after the epoch ended.
    pub fn detach(&self) {
        self.state().outbox = None;
    }

    /// Whether an epoch outbox is attached.
    pub fn is_attached(&self) -> bool {
        self.state().outbox.is_some()
    }

    /// Snapshot of the wanted topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        self.state().topics.keys().cloned().collect()
    }

    /// Current reference count of a topic (0 when not wanted).
    pub fn ref_count(&self, topic: &Topic) -> usize {
        self.state().topics.get(topic).map(|e| e.refs).unwrap_or(0)
    }

    /// Number of wanted topics.
    pub fn len(&self) -> usize {
        self.state().topics.len()
    }

    /// Whether no topics are wanted.
    pub fn is_empty(&self) -> bool {
        self.state().topics.is_empty()
    }
}
