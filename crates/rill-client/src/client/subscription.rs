// Per-listener delivery handle returned by `Client::subscribe`.
use rill_wire::Message;
use tokio::sync::mpsc;

use crate::client::registry::ListenerId;

pub struct Subscription {
    topic: String,
    listener: ListenerId,
    events: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(topic: String, listener: ListenerId, events: mpsc::Receiver<Message>) -> Self {
        Self {
            topic,
            listener,
            events,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Next message delivered for this topic, in transport arrival order.
    /// Returns `None` once the session is gone.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.events.recv().await
    }
}
