// Wire format for rill protocol frames: one discrete buffer per command.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;

/// Hard ceiling on any encoded frame: the total length travels in a single
/// byte, so nothing larger than this can be framed. This is a protocol
/// constant, not a tuning knob.
pub const MAX_FRAME_LEN: usize = 255;

/// Fixed prefix of the extended framing before topic bytes begin:
/// command byte, total-length byte, le16 topic length, le64 cursor.
pub const EXTENDED_HEADER_LEN: usize = 12;

// Short framing used by acks: command byte, total-length byte, topic length.
const SHORT_HEADER_LEN: usize = 3;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error("command {0:?} has no wire layout")]
    UnsupportedCommand(Command),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte length field")]
    OversizeFrame(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid utf-8 in {0}")]
    InvalidText(&'static str),
}

/// Protocol command tags. The numeric values are fixed by the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    Inform = 103,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Command::Connect),
            2 => Ok(Command::ConnAck),
            3 => Ok(Command::Publish),
            8 => Ok(Command::Subscribe),
            9 => Ok(Command::SubAck),
            10 => Ok(Command::Unsubscribe),
            11 => Ok(Command::UnsubAck),
            103 => Ok(Command::Inform),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// One protocol message, either built for encoding or produced by decode.
///
/// ```
/// use rill_wire::Message;
///
/// let message = Message::subscribe("orders", 5);
/// let encoded = message.encode().expect("encode");
/// assert_eq!(encoded[0], 8);
/// assert_eq!(encoded[1] as usize, encoded.len());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub topic: Option<String>,
    pub client_id: Option<String>,
    pub cursor: Option<u64>,
    pub data: Bytes,
}

impl Message {
    /// Session-opening frame. `client_id` is empty when the client asks the
    /// server to assign one.
    pub fn connect(client_id: Option<&str>) -> Self {
        Self {
            command: Command::Connect,
            topic: None,
            client_id: client_id.map(|id| id.to_string()),
            cursor: None,
            data: Bytes::new(),
        }
    }

    pub fn subscribe(topic: &str, cursor: u64) -> Self {
        Self {
            command: Command::Subscribe,
            topic: Some(topic.to_string()),
            client_id: None,
            cursor: Some(cursor),
            data: Bytes::new(),
        }
    }

    pub fn unsubscribe(topic: &str) -> Self {
        Self {
            command: Command::Unsubscribe,
            topic: Some(topic.to_string()),
            client_id: None,
            cursor: None,
            data: Bytes::new(),
        }
    }

    pub fn publish(topic: &str, data: Bytes) -> Self {
        Self {
            command: Command::Publish,
            topic: Some(topic.to_string()),
            client_id: None,
            cursor: None,
            data,
        }
    }

    /// The logical payload: `data` decoded as UTF-8, with invalid sequences
    /// replaced rather than rejected.
    pub fn payload(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Encode into a single wire frame. Only client-originated commands
    /// (`Connect`, `Publish`, `Subscribe`, `Unsubscribe`) have an encode
    /// path; anything else is a caller bug.
    pub fn encode(&self) -> Result<Bytes> {
        match self.command {
            Command::Connect => self.encode_connect(),
            Command::Publish | Command::Subscribe | Command::Unsubscribe => self.encode_extended(),
            other => Err(Error::UnsupportedCommand(other)),
        }
    }

    fn encode_connect(&self) -> Result<Bytes> {
        let client_id = self.client_id.as_deref().unwrap_or("");
        let total = 2 + client_id.len();
        if total > MAX_FRAME_LEN {
            return Err(Error::OversizeFrame(total));
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.command as u8);
        buf.put_u8(total as u8);
        buf.extend_from_slice(client_id.as_bytes());
        Ok(buf.freeze())
    }

    fn encode_extended(&self) -> Result<Bytes> {
        let topic = self.topic.as_deref().unwrap_or("");
        let total = EXTENDED_HEADER_LEN + topic.len() + self.data.len();
        if total > MAX_FRAME_LEN {
            return Err(Error::OversizeFrame(total));
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.command as u8);
        buf.put_u8(total as u8);
        buf.put_u16_le(topic.len() as u16);
        buf.put_u64_le(self.cursor.unwrap_or(0));
        buf.extend_from_slice(topic.as_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Decode one inbound frame, keyed on the command byte. A frame that
    /// fails here should be discarded whole.
    pub fn decode(input: &[u8]) -> Result<Message> {
        let command = Command::try_from(*input.first().ok_or(Error::Incomplete)?)?;
        match command {
            Command::ConnAck => decode_connack(input),
            Command::Inform => decode_inform(input),
            // Relayed publishes arrive in the short framing with trailing
            // data, not the extended layout the client encodes them with.
            Command::Publish => decode_publish(input),
            // Acks use the short framing: one length byte, no cursor. This
            // is asymmetric with the extended Subscribe/Unsubscribe encode
            // layout and is kept exactly as the protocol behaves on the wire.
            Command::SubAck | Command::UnsubAck => decode_ack(command, input),
            other => Err(Error::UnknownCommand(other as u8)),
        }
    }
}

fn decode_connack(input: &[u8]) -> Result<Message> {
    if input.len() < 2 {
        return Err(Error::Incomplete);
    }
    let id_len = input[1] as usize;
    let id_bytes = input.get(2..2 + id_len).ok_or(Error::Incomplete)?;
    let client_id =
        std::str::from_utf8(id_bytes).map_err(|_| Error::InvalidText("client id"))?;
    Ok(Message {
        command: Command::ConnAck,
        topic: None,
        client_id: Some(client_id.to_string()),
        cursor: None,
        data: Bytes::new(),
    })
}

fn decode_inform(input: &[u8]) -> Result<Message> {
    if input.len() < EXTENDED_HEADER_LEN {
        return Err(Error::Incomplete);
    }
    let mut header = &input[2..EXTENDED_HEADER_LEN];
    let topic_len = header.get_u16_le() as usize;
    let cursor = header.get_u64_le();
    let topic_bytes = input
        .get(EXTENDED_HEADER_LEN..EXTENDED_HEADER_LEN + topic_len)
        .ok_or(Error::Incomplete)?;
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| Error::InvalidText("topic"))?;
    let data = Bytes::copy_from_slice(&input[EXTENDED_HEADER_LEN + topic_len..]);
    Ok(Message {
        command: Command::Inform,
        topic: Some(topic.to_string()),
        client_id: None,
        cursor: Some(cursor),
        data,
    })
}

fn decode_publish(input: &[u8]) -> Result<Message> {
    if input.len() < SHORT_HEADER_LEN {
        return Err(Error::Incomplete);
    }
    let topic_len = input[2] as usize;
    let topic_bytes = input
        .get(SHORT_HEADER_LEN..SHORT_HEADER_LEN + topic_len)
        .ok_or(Error::Incomplete)?;
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| Error::InvalidText("topic"))?;
    let data = Bytes::copy_from_slice(&input[SHORT_HEADER_LEN + topic_len..]);
    Ok(Message {
        command: Command::Publish,
        topic: Some(topic.to_string()),
        client_id: None,
        cursor: None,
        data,
    })
}

fn decode_ack(command: Command, input: &[u8]) -> Result<Message> {
    if input.len() < SHORT_HEADER_LEN {
        return Err(Error::Incomplete);
    }
    let topic_len = input[2] as usize;
    let topic_bytes = input
        .get(SHORT_HEADER_LEN..SHORT_HEADER_LEN + topic_len)
        .ok_or(Error::Incomplete)?;
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| Error::InvalidText("topic"))?;
    Ok(Message {
        command,
        topic: Some(topic.to_string()),
        client_id: None,
        cursor: None,
        data: Bytes::new(),
    })
}
