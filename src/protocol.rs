//! The wire codec for the framed textual messages of the Engine.IO /
//! Socket.IO (`EIO=3`) protocol.
//!
//! A message is a single text frame whose first one or two bytes encode the
//! type and whose tail encodes parameters. Encoding and decoding are pure
//! string-level operations: event payloads stay serialized JSON fragments and
//! are only parsed at the dispatch boundary.

use crate::errors::ProtocolError;

const MESSAGE_OPEN: &str = "0";
const MESSAGE_CLOSE: &str = "1";
const MESSAGE_PING: &str = "2";
const MESSAGE_PONG: &str = "3";
const MESSAGE_MSG: &str = "4";
const MESSAGE_EMPTY: &str = "40";
const MESSAGE_CLOSE_CLIENT: &str = "41";
const MESSAGE_COMMON: &str = "42";
const MESSAGE_ACK: &str = "43";
const MESSAGE_UPGRADE: &str = "5";
const MESSAGE_BLANK: &str = "6";

/// Ping sub-frame sent by a client probing a new transport.
pub(crate) const PING_PROBE: &str = "2probe";
/// Pong sub-frame answering a [`PING_PROBE`].
pub(crate) const PONG_PROBE: &str = "3probe";

/// Raw ping frame enqueued by the keepalive loop.
pub(crate) const PING_MESSAGE: &str = "2";
/// Raw pong frame answering an inbound ping.
pub(crate) const PONG_MESSAGE: &str = "3";
/// Queue sentinel closing the outbound loop after a regular close.
pub(crate) const CLOSE_MESSAGE: &str = "1";
/// Queue sentinel retiring the outbound loop without a disconnection event.
/// Never seen on the wire.
pub(crate) const STUB_MESSAGE: &str = "stub";

/// The type of a decoded [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Handshake frame carrying the connection header.
    Open,
    /// Connection teardown, either side.
    Close,
    Ping,
    Pong,
    /// `40`: the default namespace is ready.
    Empty,
    /// `5`: the client completed a transport upgrade.
    Upgrade,
    /// `6`: noop frame, used to quiesce a polling cycle.
    Blank,
    /// A fire-and-forget event.
    Emit,
    /// An event expecting an acknowledgement.
    AckRequest,
    /// The answer to an [`AckRequest`](MessageType::AckRequest).
    AckResponse,
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    /// The raw frame as received, kept for diagnostics.
    pub source: String,
    /// User-defined event name, set for `Emit` and `AckRequest` only.
    pub event: String,
    /// The serialized JSON payload, unparsed at this level.
    pub args: String,
    /// Acknowledgement id, set for `AckRequest` and `AckResponse` only.
    /// Id 0 is never allocated.
    pub ack_id: u64,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            source: String::new(),
            event: String::new(),
            args: String::new(),
            ack_id: 0,
        }
    }

    pub(crate) fn emit(event: &str) -> Self {
        Self {
            event: event.to_owned(),
            ..Self::new(MessageType::Emit)
        }
    }

    pub(crate) fn ack_request(event: &str, ack_id: u64) -> Self {
        Self {
            event: event.to_owned(),
            ack_id,
            ..Self::new(MessageType::AckRequest)
        }
    }

    pub(crate) fn ack_response(ack_id: u64) -> Self {
        Self {
            ack_id,
            ..Self::new(MessageType::AckResponse)
        }
    }
}

fn type_to_text(kind: MessageType) -> &'static str {
    match kind {
        MessageType::Open => MESSAGE_OPEN,
        MessageType::Close => MESSAGE_CLOSE,
        MessageType::Ping => MESSAGE_PING,
        MessageType::Pong => MESSAGE_PONG,
        MessageType::Empty => MESSAGE_EMPTY,
        MessageType::Upgrade => MESSAGE_UPGRADE,
        MessageType::Blank => MESSAGE_BLANK,
        MessageType::Emit | MessageType::AckRequest => MESSAGE_COMMON,
        MessageType::AckResponse => MESSAGE_ACK,
    }
}

/// Encode a message to its wire form.
pub fn encode(msg: &Message) -> Result<String, ProtocolError> {
    let mut result = String::from(type_to_text(msg.kind));

    match msg.kind {
        MessageType::Empty
        | MessageType::Ping
        | MessageType::Pong
        | MessageType::Upgrade
        | MessageType::Blank => Ok(result),
        MessageType::Open | MessageType::Close => {
            result.push_str(&msg.args);
            Ok(result)
        }
        MessageType::AckResponse => {
            result.push_str(&msg.ack_id.to_string());
            result.push('[');
            result.push_str(&msg.args);
            result.push(']');
            Ok(result)
        }
        MessageType::Emit | MessageType::AckRequest => {
            if msg.kind == MessageType::AckRequest {
                result.push_str(&msg.ack_id.to_string());
            }
            let event =
                serde_json::to_string(&msg.event).map_err(|_| ProtocolError::WrongPacket)?;
            Ok(format!("{result}[{event},{}]", msg.args))
        }
    }
}

fn message_type(data: &str) -> Result<MessageType, ProtocolError> {
    match data.get(0..1) {
        Some(MESSAGE_OPEN) => Ok(MessageType::Open),
        Some(MESSAGE_CLOSE) => Ok(MessageType::Close),
        Some(MESSAGE_PING) => Ok(MessageType::Ping),
        Some(MESSAGE_PONG) => Ok(MessageType::Pong),
        Some(MESSAGE_UPGRADE) => Ok(MessageType::Upgrade),
        Some(MESSAGE_BLANK) => Ok(MessageType::Blank),
        Some(MESSAGE_MSG) => match data.get(0..2) {
            Some(MESSAGE_EMPTY) => Ok(MessageType::Empty),
            Some(MESSAGE_CLOSE_CLIENT) => Ok(MessageType::Close),
            Some(MESSAGE_COMMON) => Ok(MessageType::AckRequest),
            Some(MESSAGE_ACK) => Ok(MessageType::AckResponse),
            _ => Err(ProtocolError::WrongMessageType),
        },
        _ => Err(ProtocolError::WrongMessageType),
    }
}

/// Extract the optional decimal ack id preceding the `[` that opens the body.
/// Returns the id and the rest of the frame starting at the bracket.
fn parse_ack(data: &str) -> Result<(u64, &str), ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::WrongPacket);
    }
    let text = &data[2..];
    let pos = text.find('[').ok_or(ProtocolError::WrongPacket)?;
    let id = text[..pos]
        .parse::<u64>()
        .map_err(|_| ProtocolError::WrongPacket)?;
    Ok((id, &text[pos..]))
}

/// Parse `["event",rest]`: locate the first and second quote (a third before
/// the separating comma is an error), then the first comma after the closing
/// quote. Returns the event name and the payload with the trailing `]`
/// stripped.
fn parse_event(text: &str) -> Result<(&str, &str), ProtocolError> {
    let mut start = 0;
    let mut end = 0;
    let mut rest = 0;
    let mut quotes = 0;

    for (i, b) in text.bytes().enumerate() {
        if b == b'"' {
            match quotes {
                0 => start = i + 1,
                1 => {
                    end = i;
                    rest = i + 1;
                }
                _ => return Err(ProtocolError::WrongPacket),
            }
            quotes += 1;
        }
        if b == b',' {
            if quotes < 2 {
                continue;
            }
            rest = i + 1;
            break;
        }
    }

    if end < start || rest >= text.len() {
        return Err(ProtocolError::WrongPacket);
    }

    let event = text.get(start..end).ok_or(ProtocolError::WrongPacket)?;
    let args = text
        .get(rest..text.len() - 1)
        .ok_or(ProtocolError::WrongPacket)?;
    Ok((event, args))
}

/// Decode a wire frame into a [`Message`].
pub fn decode(data: &str) -> Result<Message, ProtocolError> {
    let mut msg = Message::new(message_type(data)?);
    msg.source = data.to_owned();

    match msg.kind {
        MessageType::Upgrade
        | MessageType::Close
        | MessageType::Ping
        | MessageType::Pong
        | MessageType::Empty
        | MessageType::Blank => return Ok(msg),
        MessageType::Open => {
            msg.args = data[1..].to_owned();
            return Ok(msg);
        }
        _ => {}
    }

    let ack = parse_ack(data);

    if msg.kind == MessageType::AckResponse {
        let (id, rest) = ack?;
        msg.ack_id = id;
        msg.args = rest
            .get(1..rest.len() - 1)
            .ok_or(ProtocolError::WrongPacket)?
            .to_owned();
        return Ok(msg);
    }

    // No ack id before the bracket: the frame is a bare emit and the body
    // starts right after the two-byte discriminator.
    let body = match ack {
        Ok((id, rest)) => {
            msg.ack_id = id;
            rest
        }
        Err(_) => {
            msg.kind = MessageType::Emit;
            &data[2..]
        }
    };

    let (event, args) = parse_event(body)?;
    msg.event = event.to_owned();
    msg.args = args.to_owned();
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let encoded = encode(msg).unwrap();
        decode(&encoded).unwrap()
    }

    #[test]
    fn decode_open_frame() {
        let frame = r#"0{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":60000}"#;
        let msg = decode(frame).unwrap();
        assert_eq!(msg.kind, MessageType::Open);
        assert_eq!(msg.args, &frame[1..]);
        assert_eq!(msg.source, frame);
    }

    #[test]
    fn decode_emit() {
        let msg = decode(r#"42["chat",{"msg":"hi"}]"#).unwrap();
        assert_eq!(msg.kind, MessageType::Emit);
        assert_eq!(msg.event, "chat");
        assert_eq!(msg.args, r#"{"msg":"hi"}"#);
        assert_eq!(msg.ack_id, 0);
    }

    #[test]
    fn encode_ack_request() {
        let mut msg = Message::ack_request("join", 7);
        msg.args = r#"{"room":"main"}"#.to_owned();
        assert_eq!(encode(&msg).unwrap(), r#"427["join",{"room":"main"}]"#);
    }

    #[test]
    fn ack_response_roundtrip() {
        let mut msg = Message::ack_response(7);
        msg.args = r#""OK""#.to_owned();
        assert_eq!(encode(&msg).unwrap(), r#"437["OK"]"#);

        let decoded = decode(r#"437["OK"]"#).unwrap();
        assert_eq!(decoded.kind, MessageType::AckResponse);
        assert_eq!(decoded.ack_id, 7);
        assert_eq!(decoded.args, r#""OK""#);
    }

    #[test]
    fn decode_ack_request() {
        let msg = decode(r#"421["add",{"a":1,"b":2}]"#).unwrap();
        assert_eq!(msg.kind, MessageType::AckRequest);
        assert_eq!(msg.ack_id, 1);
        assert_eq!(msg.event, "add");
        assert_eq!(msg.args, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn roundtrip_bare_types() {
        for kind in [
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Empty,
            MessageType::Upgrade,
            MessageType::Blank,
            MessageType::Close,
        ] {
            let decoded = roundtrip(&Message::new(kind));
            assert_eq!(decoded.kind, kind);
        }
    }

    #[test]
    fn roundtrip_open() {
        let mut msg = Message::new(MessageType::Open);
        msg.args = r#"{"sid":"x"}"#.to_owned();
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind, MessageType::Open);
        assert_eq!(decoded.args, msg.args);
    }

    #[test]
    fn roundtrip_emit() {
        let mut msg = Message::emit("evt");
        msg.args = r#"[1,2,3]"#.to_owned();
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind, MessageType::Emit);
        assert_eq!(decoded.event, "evt");
        assert_eq!(decoded.args, msg.args);
    }

    #[test]
    fn roundtrip_ack_request_retains_id() {
        let mut msg = Message::ack_request("sum", 42);
        msg.args = r#"{"n":3}"#.to_owned();
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind, MessageType::AckRequest);
        assert_eq!(decoded.ack_id, 42);
        assert_eq!(decoded.event, "sum");
        assert_eq!(decoded.args, msg.args);
    }

    #[test]
    fn probe_frames_decode_as_heartbeats() {
        let ping = decode(PING_PROBE).unwrap();
        assert_eq!(ping.kind, MessageType::Ping);
        assert_eq!(ping.source, PING_PROBE);

        let pong = decode(PONG_PROBE).unwrap();
        assert_eq!(pong.kind, MessageType::Pong);
    }

    #[test]
    fn decode_client_close() {
        assert_eq!(decode("41").unwrap().kind, MessageType::Close);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode("").unwrap_err(), ProtocolError::WrongMessageType);
        assert_eq!(decode("9").unwrap_err(), ProtocolError::WrongMessageType);
        assert_eq!(decode("4").unwrap_err(), ProtocolError::WrongMessageType);
        assert_eq!(decode("4x").unwrap_err(), ProtocolError::WrongMessageType);
    }

    #[test]
    fn decode_rejects_malformed_event() {
        // a third quote before the separating comma
        assert_eq!(
            decode(r#"42["a""b",{}]"#).unwrap_err(),
            ProtocolError::WrongPacket
        );
        // ack response without a body
        assert_eq!(decode("43").unwrap_err(), ProtocolError::WrongPacket);
        assert_eq!(decode("437").unwrap_err(), ProtocolError::WrongPacket);
    }

    #[test]
    fn decode_emit_without_payload() {
        let msg = decode(r#"42["a"]"#).unwrap();
        assert_eq!(msg.event, "a");
        assert_eq!(msg.args, "");
    }
}
