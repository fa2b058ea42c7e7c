// Client for the rill pub/sub protocol: a connection session that owns one
// transport, tracks per-topic resumption cursors, and re-establishes
// subscriptions after an unplanned disconnect.
//
// DESIGN INTENT
// -------------
// The session is a single task. Client handles, the transport, and the
// reconnect timer all feed it through channels, so the subscription registry
// and the pending-ack waiters are only ever touched from one place.
// Operations that wait for a server acknowledgment (subscribe, unsubscribe,
// the connect handshake) suspend only the calling task; the session keeps
// dispatching frames while they wait, which is what lets two concurrent
// subscribes each be resolved by exactly their own ack.
//
// The wire format caps every frame at 255 bytes (the total length travels in
// a single byte); oversize frames fail loudly at encode time rather than
// overflowing on the wire.

pub mod config;
pub mod transport;

mod client;

pub use client::client::Client;
pub use client::session::{ConnectionState, SessionEvent};
pub use client::subscription::Subscription;
pub use config::ClientConfig;
pub use rill_wire as wire;
