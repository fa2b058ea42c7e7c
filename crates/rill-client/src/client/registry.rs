// Topic registry: the single source of truth for fan-out and cursors.
//
// Owned exclusively by the session task; nothing else ever touches it, so
// there is no locking here by construction.
use rill_wire::Message;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::warn;

pub(crate) type ListenerId = u64;

struct TopicEntry {
    // Registration order is delivery order.
    listeners: Vec<(ListenerId, mpsc::Sender<Message>)>,
    cursor: u64,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: BTreeMap<String, TopicEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn add_listener(
        &mut self,
        topic: &str,
        id: ListenerId,
        sender: mpsc::Sender<Message>,
    ) {
        self.entries
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry {
                listeners: Vec::new(),
                cursor: 0,
            })
            .listeners
            .push((id, sender));
    }

    /// Remove one listener. The entry itself stays behind, empty listener
    /// list and all: its cursor is the resume point if the topic is
    /// subscribed again or replayed after a reconnect.
    pub(crate) fn remove_listener(&mut self, topic: &str, id: ListenerId) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                let before = entry.listeners.len();
                entry.listeners.retain(|(listener, _)| *listener != id);
                entry.listeners.len() != before
            }
            None => false,
        }
    }

    pub(crate) fn cursor(&self, topic: &str) -> Option<u64> {
        self.entries.get(topic).map(|entry| entry.cursor)
    }

    pub(crate) fn set_cursor(&mut self, topic: &str, cursor: u64) {
        self.entries
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry {
                listeners: Vec::new(),
                cursor: 0,
            })
            .cursor = cursor;
    }

    /// Topics with their stored cursors, in topic order. This is the replay
    /// source for resubscription after a reconnect.
    pub(crate) fn snapshot(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.cursor))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deliver a message to every listener on `topic`, in registration
    /// order. Listeners whose receiver is gone are pruned; a listener with a
    /// full queue loses this one message rather than stalling dispatch.
    pub(crate) fn fan_out(&mut self, topic: &str, message: &Message) -> usize {
        let Some(entry) = self.entries.get_mut(topic) else {
            return 0;
        };
        let mut delivered = 0;
        entry
            .listeners
            .retain(|(id, sender)| match sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic, listener = *id, "listener queue full; dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        delivered
    }
}
