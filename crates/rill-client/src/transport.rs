// Transport boundary: an ordered, message-oriented duplex connection.
//
// The session consumes transports, it never implements them. A transport is
// a pair of channels: commands flowing out (frames to send, an explicit
// close) and events flowing in (open, discrete frames in arrival order,
// errors, close). Anything that can present this shape — a WebSocket, a
// framed TCP stream, a pair of in-process queues in tests — can carry the
// protocol.
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Close code for a deliberate shutdown. A close with any other code is
/// treated as abnormal and triggers the reconnection policy.
pub const NORMAL_CLOSE: u16 = 1000;

// Reported when the event channel vanishes without a Closed event.
pub(crate) const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Debug)]
pub enum TransportEvent {
    /// The connection finished opening and can carry frames.
    Opened,
    /// One complete inbound frame.
    Frame(Bytes),
    /// A transport-level fault that did not close the connection.
    Error(String),
    /// The connection is gone; no further events follow.
    Closed { code: u16 },
}

#[derive(Debug)]
pub enum TransportCommand {
    Send(Bytes),
    Close { code: u16 },
}

/// One live connection, exclusively owned by the session and replaced
/// wholesale on reconnect.
pub struct Transport {
    pub commands: mpsc::Sender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections for a session. At most one dial is in flight per
/// session at any time; the session awaits each attempt before anything
/// else happens.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> anyhow::Result<Transport>;
}
