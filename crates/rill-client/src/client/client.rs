// Public client handle. All protocol work happens on the session task; the
// handle just exchanges commands and replies with it.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use rill_wire::Message;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::session::{ConnectionState, Session, SessionCommand, SessionEvent};
use crate::client::subscription::Subscription;
use crate::config::ClientConfig;
use crate::transport::Dialer;

const LIFECYCLE_QUEUE_DEPTH: usize = 16;

/// Handle to one connection session. Cloning is cheap and every clone talks
/// to the same session.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<SessionCommand>,
    lifecycle: broadcast::Sender<SessionEvent>,
}

impl Client {
    /// Dial the configured url and run the connect handshake. Resolves once
    /// the server acknowledges the session with a `ConnAck`; the session
    /// then keeps running in the background, reconnecting on abnormal
    /// closes, until `disconnect` or the last handle is dropped.
    pub async fn connect(dialer: Arc<dyn Dialer>, config: ClientConfig) -> Result<Client> {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_depth);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_QUEUE_DEPTH);
        let (handshake_tx, handshake_rx) = oneshot::channel();
        Session::spawn(
            dialer,
            config,
            command_rx,
            lifecycle_tx.clone(),
            handshake_tx,
        );
        handshake_rx
            .await
            .map_err(|_| anyhow!("session ended before the connect handshake completed"))??;
        Ok(Client {
            commands: command_tx,
            lifecycle: lifecycle_tx,
        })
    }

    /// Subscribe a new listener to `topic`, resuming delivery from `cursor`.
    /// Resolves when the server acknowledges with a matching `SubAck`. The
    /// same topic can be subscribed any number of times; each call gets its
    /// own `Subscription` and every one receives each delivered message.
    pub async fn subscribe(&self, topic: &str, cursor: u64) -> Result<Subscription> {
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::Subscribe {
            topic: topic.to_string(),
            cursor,
            reply,
        })
        .await?;
        let (subscription, ack) = response.await.map_err(session_gone)??;
        ack.await
            .map_err(|_| anyhow!("session ended before subscribe ack for {topic}"))?;
        Ok(subscription)
    }

    /// Remove one listener. The topic's registry entry and cursor survive so
    /// a later subscribe or reconnect can resume where delivery left off.
    /// Resolves when the server acknowledges with a matching `UnsubAck`.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let topic = subscription.topic().to_string();
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::Unsubscribe {
            topic: topic.clone(),
            listener: subscription.listener(),
            reply,
        })
        .await?;
        let ack = response.await.map_err(session_gone)??;
        ack.await
            .map_err(|_| anyhow!("session ended before unsubscribe ack for {topic}"))?;
        Ok(())
    }

    /// Publish a value as JSON text. For pre-rendered strings use
    /// `publish_text`; for raw bytes use `publish_raw`.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value).context("serialize publish payload")?;
        self.publish_raw(topic, Bytes::from(data)).await
    }

    pub async fn publish_text(&self, topic: &str, payload: &str) -> Result<()> {
        self.publish_raw(topic, Bytes::copy_from_slice(payload.as_bytes()))
            .await
    }

    /// Fire-and-forget: the frame is sent immediately, no acknowledgment is
    /// awaited, and there is no delivery guarantee beyond the transport's
    /// own ordering. Encode failures (oversize frames included) surface
    /// here synchronously.
    pub async fn publish_raw(&self, topic: &str, data: Bytes) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::Publish {
            message: Message::publish(topic, data),
            reply,
        })
        .await?;
        response.await.map_err(session_gone)?
    }

    /// The client identifier in effect, once the server has assigned one.
    pub async fn client_id(&self) -> Result<Option<String>> {
        self.query(|reply| SessionCommand::ClientId { reply }).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.query(|reply| SessionCommand::State { reply }).await
    }

    /// Last-known resumption cursor for `topic`, if the session has one.
    pub async fn cursor(&self, topic: &str) -> Result<Option<u64>> {
        let topic = topic.to_string();
        self.query(|reply| SessionCommand::Cursor { topic, reply })
            .await
    }

    /// Every known topic with its stored cursor, in topic order.
    pub async fn topics(&self) -> Result<Vec<(String, u64)>> {
        self.query(|reply| SessionCommand::Topics { reply }).await
    }

    /// Lifecycle event stream: `Connected` after each completed handshake,
    /// `Disconnected` for each transport close.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    /// Close the transport deliberately and cancel any pending reconnect.
    /// Terminal: the session stays disconnected afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        self.query(|reply| SessionCommand::Disconnect { reply }).await
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply)).await?;
        response.await.map_err(session_gone)
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("session task is gone"))
    }
}

fn session_gone<E>(_: E) -> anyhow::Error {
    anyhow!("session task is gone")
}
