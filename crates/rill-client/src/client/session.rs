// Connection session: a single actor task that owns the transport, the
// subscription registry, and the pending-ack waiters.
//
// Every state mutation happens on this task. Client handles talk to it over
// the command channel; the transport talks to it over its event channel;
// the reconnect timer talks to it over an internal channel. Because the
// loop processes one step at a time, registry and waiter state never see
// concurrent access.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use rill_wire::{Command, Message};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::registry::{ListenerId, SubscriptionRegistry};
use crate::client::subscription::Subscription;
use crate::client::waiters::Waiters;
use crate::config::ClientConfig;
use crate::transport::{
    ABNORMAL_CLOSE, Dialer, NORMAL_CLOSE, Transport, TransportCommand, TransportEvent,
};

/// Lifecycle notifications delivered to `Client::events` subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The connect handshake completed; fires again after each reconnect.
    Connected,
    /// The transport closed with the given code.
    Disconnected { code: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug)]
pub(crate) struct AckEvent {
    pub(crate) kind: AckKind,
    pub(crate) topic: Option<String>,
}

pub(crate) enum SessionCommand {
    Subscribe {
        topic: String,
        cursor: u64,
        reply: oneshot::Sender<Result<(Subscription, oneshot::Receiver<()>)>>,
    },
    Unsubscribe {
        topic: String,
        listener: ListenerId,
        reply: oneshot::Sender<Result<oneshot::Receiver<()>>>,
    },
    Publish {
        message: Message,
        reply: oneshot::Sender<Result<()>>,
    },
    ClientId {
        reply: oneshot::Sender<Option<String>>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    Cursor {
        topic: String,
        reply: oneshot::Sender<Option<u64>>,
    },
    Topics {
        reply: oneshot::Sender<Vec<(String, u64)>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

enum InternalEvent {
    ReconnectDue { generation: u64 },
}

enum Step {
    Command(Option<SessionCommand>),
    Internal(InternalEvent),
    Transport(Option<TransportEvent>),
}

pub(crate) struct Session {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    commands: mpsc::Receiver<SessionCommand>,
    internal_tx: mpsc::Sender<InternalEvent>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    lifecycle: broadcast::Sender<SessionEvent>,
    transport: Option<Transport>,
    state: ConnectionState,
    client_id: Option<String>,
    registry: SubscriptionRegistry,
    acks: Waiters<AckEvent>,
    next_listener_id: ListenerId,
    resubscribe_on_connack: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_generation: u64,
    handshake: Option<oneshot::Sender<Result<()>>>,
}

impl Session {
    pub(crate) fn spawn(
        dialer: Arc<dyn Dialer>,
        config: ClientConfig,
        commands: mpsc::Receiver<SessionCommand>,
        lifecycle: broadcast::Sender<SessionEvent>,
        handshake: oneshot::Sender<Result<()>>,
    ) -> JoinHandle<()> {
        let (internal_tx, internal_rx) = mpsc::channel(4);
        let session = Self {
            config,
            dialer,
            commands,
            internal_tx,
            internal_rx,
            lifecycle,
            transport: None,
            state: ConnectionState::Disconnected,
            client_id: None,
            registry: SubscriptionRegistry::default(),
            acks: Waiters::default(),
            next_listener_id: 1,
            resubscribe_on_connack: false,
            reconnect_timer: None,
            reconnect_generation: 0,
            handshake: Some(handshake),
        };
        tokio::spawn(session.run())
    }

    async fn run(mut self) {
        if let Err(err) = self.dial().await {
            if let Some(handshake) = self.handshake.take() {
                let _ = handshake.send(Err(err));
            }
            return;
        }
        loop {
            match self.next_step().await {
                Step::Command(None) => break,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Internal(event) => self.handle_internal(event).await,
                // A transport that drops its event channel without a close
                // event is treated as an abnormal close.
                Step::Transport(None) => self.handle_close(ABNORMAL_CLOSE),
                Step::Transport(Some(event)) => self.handle_transport_event(event).await,
            }
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    async fn next_step(&mut self) -> Step {
        match self.transport.as_mut() {
            Some(transport) => tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = self.internal_rx.recv() => {
                    Step::Internal(event.expect("internal channel held open by session"))
                }
                event = transport.events.recv() => Step::Transport(event),
            },
            None => tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = self.internal_rx.recv() => {
                    Step::Internal(event.expect("internal channel held open by session"))
                }
            },
        }
    }

    async fn dial(&mut self) -> Result<()> {
        debug!(url = %self.config.url, "dialing transport");
        let transport = self
            .dialer
            .dial(&self.config.url)
            .await
            .context("dial transport")?;
        self.transport = Some(transport);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Subscribe {
                topic,
                cursor,
                reply,
            } => {
                let _ = reply.send(self.handle_subscribe(topic, cursor).await);
            }
            SessionCommand::Unsubscribe {
                topic,
                listener,
                reply,
            } => {
                let _ = reply.send(self.handle_unsubscribe(topic, listener).await);
            }
            SessionCommand::Publish { message, reply } => {
                let _ = reply.send(self.send_message(&message).await);
            }
            SessionCommand::ClientId { reply } => {
                let _ = reply.send(self.client_id.clone());
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.state);
            }
            SessionCommand::Cursor { topic, reply } => {
                let _ = reply.send(self.registry.cursor(&topic));
            }
            SessionCommand::Topics { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            SessionCommand::Disconnect { reply } => {
                self.handle_disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        topic: String,
        cursor: u64,
    ) -> Result<(Subscription, oneshot::Receiver<()>)> {
        let (sender, receiver) = mpsc::channel(self.config.listener_queue_depth);
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        // The registry is the single source of truth for fan-out: listeners
        // are registered before the frame goes out, so an early Inform is
        // never lost.
        self.registry.add_listener(&topic, id, sender);
        self.registry.set_cursor(&topic, cursor);
        self.update_topic_gauge();
        self.send_message(&Message::subscribe(&topic, cursor)).await?;
        let wanted = topic.clone();
        let ack = self.acks.register(move |event: &AckEvent| {
            event.kind == AckKind::Subscribe && event.topic.as_deref() == Some(wanted.as_str())
        });
        Ok((Subscription::new(topic, id, receiver), ack))
    }

    async fn handle_unsubscribe(
        &mut self,
        topic: String,
        listener: ListenerId,
    ) -> Result<oneshot::Receiver<()>> {
        self.registry.remove_listener(&topic, listener);
        self.send_message(&Message::unsubscribe(&topic)).await?;
        let wanted = topic;
        Ok(self.acks.register(move |event: &AckEvent| {
            event.kind == AckKind::Unsubscribe && event.topic.as_deref() == Some(wanted.as_str())
        }))
    }

    async fn handle_disconnect(&mut self) {
        // Explicit close: cancel any pending reconnect, close the transport
        // with the normal code, and stay down. Terminal for this session.
        self.reconnect_generation += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport
                .commands
                .send(TransportCommand::Close { code: NORMAL_CLOSE })
                .await;
        }
        self.state = ConnectionState::Disconnected;
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::ReconnectDue { generation } => {
                self.reconnect_timer = None;
                if generation != self.reconnect_generation
                    || self.state != ConnectionState::Reconnecting
                {
                    // An explicit disconnect raced the timer.
                    return;
                }
                metrics::counter!("rill_client_reconnects_total").increment(1);
                self.resubscribe_on_connack = true;
                if let Err(err) = self.dial().await {
                    // Unbounded retry on a fixed delay.
                    warn!(error = %err, "reconnect dial failed; retrying");
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                debug!("transport open; sending connect");
                let connect = Message::connect(self.config.client_id.as_deref());
                if let Err(err) = self.send_message(&connect).await {
                    warn!(error = %err, "failed to send connect frame");
                }
            }
            TransportEvent::Frame(bytes) => self.dispatch_frame(bytes).await,
            TransportEvent::Error(message) => {
                // Transport errors alone never change connection state; only
                // close events do.
                warn!(error = %message, "transport error");
            }
            TransportEvent::Closed { code } => self.handle_close(code),
        }
    }

    fn handle_close(&mut self, code: u16) {
        if self.state == ConnectionState::Disconnected && self.transport.is_none() {
            return;
        }
        self.transport = None;
        metrics::counter!("rill_client_transport_closes_total").increment(1);
        let _ = self.lifecycle.send(SessionEvent::Disconnected { code });
        if code == NORMAL_CLOSE {
            debug!(code, "transport closed normally");
            self.state = ConnectionState::Disconnected;
            return;
        }
        debug!(code, "transport closed abnormally; scheduling reconnect");
        self.state = ConnectionState::Reconnecting;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        // At most one pending timer, no matter how many close events arrive
        // before it fires.
        if self.reconnect_timer.is_some() {
            return;
        }
        let delay = self.config.reconnect_delay;
        let generation = self.reconnect_generation;
        let internal = self.internal_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal
                .send(InternalEvent::ReconnectDue { generation })
                .await;
        }));
    }

    async fn dispatch_frame(&mut self, bytes: Bytes) {
        metrics::counter!("rill_client_frames_in_total").increment(1);
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                // One bad frame is dropped; the session and every pending
                // waiter carry on.
                metrics::counter!("rill_client_decode_errors_total").increment(1);
                warn!(error = %err, len = bytes.len(), "dropping undecodable frame");
                return;
            }
        };
        match message.command {
            Command::Publish | Command::Inform => self.deliver(message),
            Command::SubAck => self.resolve_ack(AckKind::Subscribe, message),
            Command::UnsubAck => self.resolve_ack(AckKind::Unsubscribe, message),
            Command::ConnAck => self.handle_connack(message).await,
            // Forward-compatible: decodable commands we do not route are
            // ignored.
            _ => {}
        }
    }

    fn deliver(&mut self, message: Message) {
        let Some(topic) = message.topic.clone() else {
            return;
        };
        if message.command == Command::Inform {
            // Resumption rule: the cursor advances by the decoded payload
            // length in characters, not raw bytes. Saturating: a cursor at
            // the top of the range must never unwind dispatch. Relayed
            // publishes carry no cursor and leave the entry untouched.
            let advanced = message
                .cursor
                .unwrap_or(0)
                .saturating_add(message.payload().chars().count() as u64);
            self.registry.set_cursor(&topic, advanced);
            self.update_topic_gauge();
        }
        let delivered = self.registry.fan_out(&topic, &message);
        debug!(topic = %topic, delivered, "dispatched frame to listeners");
    }

    fn resolve_ack(&mut self, kind: AckKind, message: Message) {
        let event = AckEvent {
            kind,
            topic: message.topic,
        };
        if !self.acks.notify(&event) {
            debug!(?event, "ack with no pending waiter");
        }
    }

    async fn handle_connack(&mut self, message: Message) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        if let (Some(requested), Some(assigned)) = (
            self.config.client_id.as_deref(),
            message.client_id.as_deref(),
        ) {
            if requested != assigned {
                // Non-fatal: the server wins and the requested id is
                // overwritten.
                warn!(requested, assigned, "server assigned a different client id");
            }
        }
        self.client_id = message.client_id;
        self.state = ConnectionState::Connected;
        if self.resubscribe_on_connack {
            // Restore continuity of delivery: one Subscribe per known topic,
            // each carrying its stored cursor.
            for (topic, cursor) in self.registry.snapshot() {
                debug!(topic = %topic, cursor, "resubscribing after reconnect");
                if let Err(err) = self.send_message(&Message::subscribe(&topic, cursor)).await {
                    warn!(error = %err, topic = %topic, "resubscribe send failed");
                }
            }
        }
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.send(Ok(()));
        }
        let _ = self.lifecycle.send(SessionEvent::Connected);
        debug!(client_id = ?self.client_id, "session connected");
    }

    // Called after any registry mutation that can create an entry;
    // `deliver` creates them implicitly for topics nobody subscribed.
    fn update_topic_gauge(&self) {
        metrics::gauge!("rill_client_topics").set(self.registry.len() as f64);
    }

    async fn send_message(&mut self, message: &Message) -> Result<()> {
        let frame = message.encode().context("encode frame")?;
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| anyhow!("transport not connected"))?;
        transport
            .commands
            .send(TransportCommand::Send(frame))
            .await
            .map_err(|_| anyhow!("transport command channel closed"))?;
        metrics::counter!("rill_client_frames_out_total").increment(1);
        Ok(())
    }
}
