//! Message variants carried over the mesh and their envelope shapes.
//!
//! Binary packets hold one CBOR envelope; the shape is picked by which tags
//! are present, never by key position:
//!
//! ```text
//! SMS                  {25 phone, 26 text}
//! stream chunk (open)  {34 id, 32 host, 33 port, 29 count, 24 payload}
//! stream chunk         {34 id, 28 index, 29 count, 24 payload}
//! tx segment (first)   {30 short id, 31 txid, 29 count, 27 network, 24 payload}
//! tx segment           {30 short id, 28 index, 24 payload}
//! ```
//!
//! Text packets are the radio SDK's plain text messages and are not CBOR.

use bytes::Bytes;
use serde_cbor::Value;
use std::time::SystemTime;

use crate::envelope::{tags, Envelope};
use crate::error::{DecodeError, EncodeError};
use crate::stream_id::StreamId;

/// Sender id the SMS gateway uses; the real party is in the phone number.
pub const GATEWAY_GID: u64 = 555_555_555;

pub const TXID_LEN: usize = 32;
pub const SHORT_TXID_LEN: usize = 8;

/// Raw content of one radio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshData {
    Binary(Bytes),
    Text(String),
}

/// One packet as delivered by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    pub sender_gid: u64,
    pub receiver_gid: u64,
    pub sent_at: SystemTime,
    pub data: MeshData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// A slice of a proxied byte stream.
///
/// `destination` is only set on the first segment of the first message of a
/// connection; that segment travels in the open shape and implies index 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub stream_id: StreamId,
    pub destination: Option<Destination>,
    pub index: u8,
    pub count: u8,
    pub payload: Bytes,
}

impl StreamChunk {
    /// Zero-length chunk: end of stream.
    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            destination: None,
            index: 0,
            count: 1,
            payload: Bytes::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_last(&self) -> bool {
        u16::from(self.index) + 1 >= u16::from(self.count)
    }

    pub fn to_envelope(&self) -> Envelope {
        let env = Envelope::new().with_bytes(tags::STREAM_ID, self.stream_id.as_bytes());
        let env = match &self.destination {
            Some(dest) => env
                .with_text(tags::HOST, &dest.host)
                .with_uint(tags::PORT, u64::from(dest.port)),
            None => env.with_uint(tags::SEGMENT_INDEX, u64::from(self.index)),
        };
        env.with_uint(tags::SEGMENT_COUNT, u64::from(self.count))
            .with_bytes(tags::BYTE_STRING, &self.payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.to_envelope().encode()
    }

    fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        let raw_id = env.require_bytes(tags::STREAM_ID)?;
        let stream_id = StreamId::from_bytes(raw_id).ok_or_else(|| {
            DecodeError::Malformed(format!("stream id is {} bytes, want 8", raw_id.len()))
        })?;
        let payload = Bytes::copy_from_slice(env.require_bytes(tags::BYTE_STRING)?);
        let count = small_uint(env.require_uint(tags::SEGMENT_COUNT)?, tags::SEGMENT_COUNT)?;

        let (destination, index) = if env.has(tags::HOST) || env.has(tags::PORT) {
            let host = env.require_text(tags::HOST)?.to_string();
            let port = u16::try_from(env.require_uint(tags::PORT)?)
                .map_err(|_| DecodeError::Malformed("port out of range".into()))?;
            (Some(Destination { host, port }), 0)
        } else {
            let index = small_uint(env.require_uint(tags::SEGMENT_INDEX)?, tags::SEGMENT_INDEX)?;
            (None, index)
        };

        // A close signal is honoured whatever its index/count say.
        if !payload.is_empty() && (count == 0 || index >= count) {
            return Err(DecodeError::Malformed(format!(
                "segment index {index} outside count {count}"
            )));
        }

        Ok(Self {
            stream_id,
            destination,
            index,
            count,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn from_selector(b: u8) -> Self {
        if b == b'm' {
            Network::Mainnet
        } else {
            Network::Testnet
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            Network::Mainnet => b'm',
            Network::Testnet => b't',
        }
    }
}

/// Header fields only the first transaction segment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOpen {
    pub txid: [u8; TXID_LEN],
    pub count: u8,
    pub network: Network,
}

/// A slice of a raw signed transaction being broadcast through the gateway.
///
/// Unlike stream chunks, continuation segments do not repeat the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSegment {
    pub short_id: [u8; SHORT_TXID_LEN],
    pub index: u8,
    pub open: Option<TxOpen>,
    pub payload: Bytes,
}

impl TxSegment {
    pub fn to_envelope(&self) -> Envelope {
        let env = Envelope::new().with_bytes(tags::SHORT_TXID, &self.short_id);
        let env = match &self.open {
            Some(open) => env
                .with_bytes(tags::TXID, &open.txid)
                .with_uint(tags::SEGMENT_COUNT, u64::from(open.count))
                .with_uint(tags::NETWORK, u64::from(open.network.selector())),
            None => env.with_uint(tags::SEGMENT_INDEX, u64::from(self.index)),
        };
        env.with_bytes(tags::BYTE_STRING, &self.payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.to_envelope().encode()
    }

    fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        let short_id = fixed::<SHORT_TXID_LEN>(env.require_bytes(tags::SHORT_TXID)?, "short txid")?;
        let payload = Bytes::copy_from_slice(env.require_bytes(tags::BYTE_STRING)?);

        if env.has(tags::TXID) || env.has(tags::NETWORK) {
            let txid = fixed::<TXID_LEN>(env.require_bytes(tags::TXID)?, "txid")?;
            let count = small_uint(env.require_uint(tags::SEGMENT_COUNT)?, tags::SEGMENT_COUNT)?;
            if count == 0 {
                return Err(DecodeError::Malformed("segment count 0".into()));
            }
            let network = network_selector(env)?;
            Ok(Self {
                short_id,
                index: 0,
                open: Some(TxOpen {
                    txid,
                    count,
                    network,
                }),
                payload,
            })
        } else {
            let index = small_uint(env.require_uint(tags::SEGMENT_INDEX)?, tags::SEGMENT_INDEX)?;
            Ok(Self {
                short_id,
                index,
                open: None,
                payload,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsBody {
    pub phone_number: String,
    pub text: String,
}

impl SmsBody {
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new()
            .with_text(tags::PHONE_NUMBER, &self.phone_number)
            .with_text(tags::MESSAGE_TEXT, &self.text)
    }

    fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        Ok(Self {
            phone_number: env.require_text(tags::PHONE_NUMBER)?.to_string(),
            text: env.require_text(tags::MESSAGE_TEXT)?.to_string(),
        })
    }
}

/// Content of one binary envelope, independent of packet metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sms(SmsBody),
    StreamChunk(StreamChunk),
    TxSegment(TxSegment),
}

impl Payload {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Payload::Sms(b) => b.to_envelope(),
            Payload::StreamChunk(c) => c.to_envelope(),
            Payload::TxSegment(s) => s.to_envelope(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.to_envelope().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_envelope(&Envelope::decode(bytes)?)
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        let has = |t| env.has(t);
        if has(tags::STREAM_ID) && has(tags::BYTE_STRING) {
            let open = has(tags::HOST) || has(tags::PORT);
            let continuation = has(tags::SEGMENT_INDEX) && has(tags::SEGMENT_COUNT);
            if open || continuation {
                return StreamChunk::from_envelope(env).map(Payload::StreamChunk);
            }
        } else if has(tags::SHORT_TXID) && has(tags::BYTE_STRING) {
            let first = has(tags::TXID) || has(tags::NETWORK);
            if first || has(tags::SEGMENT_INDEX) {
                return TxSegment::from_envelope(env).map(Payload::TxSegment);
            }
        } else if has(tags::PHONE_NUMBER) && has(tags::MESSAGE_TEXT) {
            return SmsBody::from_envelope(env).map(Payload::Sms);
        }
        Err(DecodeError::UnknownShape(env.tags()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub sender_gid: u64,
    pub receiver_gid: u64,
    pub sent_at: SystemTime,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub sender_gid: u64,
    pub receiver_gid: u64,
    pub sent_at: SystemTime,
    pub phone_number: String,
    pub text: String,
}

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(TextMessage),
    Sms(SmsMessage),
    StreamChunk(StreamChunk),
    TxSegment(TxSegment),
}

impl Message {
    pub fn decode(packet: &MeshPacket) -> Result<Self, DecodeError> {
        match &packet.data {
            MeshData::Text(text) => Ok(Message::Text(decode_text(packet, text))),
            MeshData::Binary(bytes) => match Payload::decode(bytes)? {
                Payload::Sms(body) => {
                    let sender_gid = if packet.sender_gid == GATEWAY_GID {
                        gid_from_phone_number(&body.phone_number).ok_or_else(|| {
                            DecodeError::Malformed(format!(
                                "gateway sms without usable phone number {:?}",
                                body.phone_number
                            ))
                        })?
                    } else {
                        packet.sender_gid
                    };
                    Ok(Message::Sms(SmsMessage {
                        sender_gid,
                        receiver_gid: packet.receiver_gid,
                        sent_at: packet.sent_at,
                        phone_number: body.phone_number,
                        text: body.text,
                    }))
                }
                Payload::StreamChunk(c) => Ok(Message::StreamChunk(c)),
                Payload::TxSegment(s) => Ok(Message::TxSegment(s)),
            },
        }
    }

    /// Packet content for this message. Metadata belongs to the transport.
    pub fn to_mesh_data(&self) -> Result<MeshData, EncodeError> {
        let payload = match self {
            Message::Text(t) => return Ok(MeshData::Text(t.text.clone())),
            Message::Sms(m) => Payload::Sms(SmsBody {
                phone_number: m.phone_number.clone(),
                text: m.text.clone(),
            }),
            Message::StreamChunk(c) => Payload::StreamChunk(c.clone()),
            Message::TxSegment(s) => Payload::TxSegment(s.clone()),
        };
        Ok(MeshData::Binary(Bytes::from(payload.encode()?)))
    }
}

// Gateway text messages are "<phone> <body>"; anything else is taken verbatim.
fn decode_text(packet: &MeshPacket, text: &str) -> TextMessage {
    let mut sender_gid = packet.sender_gid;
    let mut body = text;
    if packet.sender_gid == GATEWAY_GID {
        if let Some((phone, rest)) = text.split_once(' ') {
            if is_global_phone_number(phone) {
                if let Some(gid) = gid_from_phone_number(phone) {
                    sender_gid = gid;
                    body = rest;
                }
            }
        }
    }
    TextMessage {
        sender_gid,
        receiver_gid: packet.receiver_gid,
        sent_at: packet.sent_at,
        text: body.to_string(),
    }
}

/// GID for a phone number: every non-digit stripped, the rest parsed.
pub fn gid_from_phone_number(phone: &str) -> Option<u64> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// `[+]?[0-9.-]+`, the loose international format gateways emit.
pub fn is_global_phone_number(s: &str) -> bool {
    let rest = s.strip_prefix('+').unwrap_or(s);
    !rest.is_empty()
        && rest.chars().any(|c| c.is_ascii_digit())
        && rest.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}

fn small_uint(v: u64, tag: u64) -> Result<u8, DecodeError> {
    u8::try_from(v).map_err(|_| DecodeError::Malformed(format!("tag {tag}: {v} exceeds 255")))
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], DecodeError> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        DecodeError::Malformed(format!("{what} is {} bytes, want {N}", bytes.len()))
    })
}

fn network_selector(env: &Envelope) -> Result<Network, DecodeError> {
    match env.value(tags::NETWORK) {
        Some(Value::Integer(i)) => u8::try_from(*i)
            .map(Network::from_selector)
            .map_err(|_| DecodeError::Malformed("network selector out of range".into())),
        Some(Value::Text(s)) if s.len() == 1 => Ok(Network::from_selector(s.as_bytes()[0])),
        Some(_) => Err(DecodeError::Malformed("network selector has wrong type".into())),
        None => Err(DecodeError::Malformed(format!("tag {}: missing", tags::NETWORK))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn packet(sender_gid: u64, data: MeshData) -> MeshPacket {
        MeshPacket {
            sender_gid,
            receiver_gid: 46_725_174_784,
            sent_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            data,
        }
    }

    fn binary(env: Envelope) -> MeshData {
        MeshData::Binary(Bytes::from(env.encode().unwrap()))
    }

    #[test]
    fn gateway_sms_takes_sender_from_phone_number() {
        let env = Envelope::new()
            .with_text(tags::PHONE_NUMBER, "+15551234567")
            .with_text(tags::MESSAGE_TEXT, "hello");
        let msg = Message::decode(&packet(GATEWAY_GID, binary(env))).unwrap();
        match msg {
            Message::Sms(sms) => {
                assert_eq!(sms.sender_gid, 15_551_234_567);
                assert_eq!(sms.text, "hello");
                assert_eq!(sms.phone_number, "+15551234567");
            }
            other => panic!("expected sms, got {other:?}"),
        }
    }

    #[test]
    fn peer_sms_keeps_packet_sender() {
        let env = Envelope::new()
            .with_text(tags::PHONE_NUMBER, "+15551234567")
            .with_text(tags::MESSAGE_TEXT, "hi");
        let Message::Sms(sms) = Message::decode(&packet(42, binary(env))).unwrap() else {
            panic!("expected sms");
        };
        assert_eq!(sms.sender_gid, 42);
    }

    #[test]
    fn gateway_sms_without_digits_is_malformed() {
        let env = Envelope::new()
            .with_text(tags::PHONE_NUMBER, "unknown")
            .with_text(tags::MESSAGE_TEXT, "hi");
        assert!(matches!(
            Message::decode(&packet(GATEWAY_GID, binary(env))),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn gateway_text_splits_phone_prefix() {
        let msg = Message::decode(&packet(
            GATEWAY_GID,
            MeshData::Text("+15551234567 see you at 6".into()),
        ))
        .unwrap();
        let Message::Text(t) = msg else { panic!("expected text") };
        assert_eq!(t.sender_gid, 15_551_234_567);
        assert_eq!(t.text, "see you at 6");

        let Message::Text(t) =
            Message::decode(&packet(GATEWAY_GID, MeshData::Text("hello there".into()))).unwrap()
        else {
            panic!("expected text")
        };
        assert_eq!(t.sender_gid, GATEWAY_GID);
        assert_eq!(t.text, "hello there");
    }

    #[test]
    fn stream_chunk_shapes() {
        let id = StreamId::derive(42, "10.0.0.5", 9000);
        let open = StreamChunk {
            stream_id: id,
            destination: Some(Destination::new("10.0.0.5", 9000)),
            index: 0,
            count: 3,
            payload: Bytes::from_static(b"GET"),
        };
        let env = open.to_envelope();
        assert_eq!(
            env.tags(),
            vec![
                tags::BYTE_STRING,
                tags::SEGMENT_COUNT,
                tags::HOST,
                tags::PORT,
                tags::STREAM_ID
            ]
        );
        assert_eq!(Payload::decode(&open.encode().unwrap()).unwrap(), Payload::StreamChunk(open));

        let cont = StreamChunk {
            stream_id: id,
            destination: None,
            index: 2,
            count: 3,
            payload: Bytes::from_static(b" /"),
        };
        assert_eq!(
            cont.to_envelope().tags(),
            vec![
                tags::BYTE_STRING,
                tags::SEGMENT_INDEX,
                tags::SEGMENT_COUNT,
                tags::STREAM_ID
            ]
        );
        let back = Payload::decode(&cont.encode().unwrap()).unwrap();
        assert_eq!(back, Payload::StreamChunk(cont));
    }

    #[test]
    fn close_signal_ignores_index_and_count() {
        let env = Envelope::new()
            .with_bytes(tags::STREAM_ID, &[9; 8])
            .with_uint(tags::SEGMENT_INDEX, 7)
            .with_uint(tags::SEGMENT_COUNT, 0)
            .with_bytes(tags::BYTE_STRING, &[]);
        let Payload::StreamChunk(c) = Payload::from_envelope(&env).unwrap() else {
            panic!("expected chunk")
        };
        assert!(c.is_close());
    }

    #[test]
    fn bad_index_is_malformed() {
        let env = Envelope::new()
            .with_bytes(tags::STREAM_ID, &[9; 8])
            .with_uint(tags::SEGMENT_INDEX, 3)
            .with_uint(tags::SEGMENT_COUNT, 3)
            .with_bytes(tags::BYTE_STRING, b"x");
        assert!(matches!(
            Payload::from_envelope(&env),
            Err(DecodeError::Malformed(_))
        ));

        let short_id = Envelope::new()
            .with_bytes(tags::STREAM_ID, &[9; 4])
            .with_uint(tags::SEGMENT_INDEX, 0)
            .with_uint(tags::SEGMENT_COUNT, 1)
            .with_bytes(tags::BYTE_STRING, b"x");
        assert!(matches!(
            Payload::from_envelope(&short_id),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_shapes() {
        let env = Envelope::new().with_bytes(tags::STREAM_ID, &[1; 8]).with_bytes(tags::BYTE_STRING, b"x");
        assert!(matches!(
            Payload::from_envelope(&env),
            Err(DecodeError::UnknownShape(_))
        ));
        let env = Envelope::new().with_text(tags::MESSAGE_TEXT, "only text");
        assert!(matches!(
            Payload::from_envelope(&env),
            Err(DecodeError::UnknownShape(t)) if t == vec![tags::MESSAGE_TEXT]
        ));
        assert!(matches!(
            Payload::decode(&[0x01, 0x02]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn tx_first_segment_network_selector() {
        let seg = TxSegment {
            short_id: [3; 8],
            index: 0,
            open: Some(TxOpen {
                txid: [3; 32],
                count: 2,
                network: Network::Mainnet,
            }),
            payload: Bytes::from_static(&[0xde, 0xad]),
        };
        let env = seg.to_envelope();
        assert_eq!(env.uint(tags::NETWORK).unwrap(), Some(u64::from(b'm')));
        assert_eq!(Payload::from_envelope(&env).unwrap(), Payload::TxSegment(seg.clone()));

        // a one-character text selector is accepted too
        let text_sel = Envelope::new()
            .with_bytes(tags::SHORT_TXID, &[3; 8])
            .with_bytes(tags::TXID, &[3; 32])
            .with_uint(tags::SEGMENT_COUNT, 2)
            .with_text(tags::NETWORK, "t")
            .with_bytes(tags::BYTE_STRING, &[0xde, 0xad]);
        let Payload::TxSegment(s) = Payload::from_envelope(&text_sel).unwrap() else {
            panic!("expected tx segment")
        };
        assert_eq!(s.open.map(|o| o.network), Some(Network::Testnet));
    }

    #[test]
    fn tx_continuation_has_no_count() {
        let seg = TxSegment {
            short_id: [3; 8],
            index: 1,
            open: None,
            payload: Bytes::from_static(b"tail"),
        };
        let env = seg.to_envelope();
        assert!(!env.has(tags::SEGMENT_COUNT));
        assert_eq!(env.tags(), vec![tags::BYTE_STRING, tags::SEGMENT_INDEX, tags::SHORT_TXID]);
    }

    #[test]
    fn text_message_is_not_cbor() {
        let msg = Message::Text(TextMessage {
            sender_gid: 1,
            receiver_gid: 2,
            sent_at: UNIX_EPOCH,
            text: "plain".into(),
        });
        assert_eq!(msg.to_mesh_data().unwrap(), MeshData::Text("plain".into()));
    }

    #[test]
    fn phone_number_helpers() {
        assert_eq!(gid_from_phone_number("+1 (555) 123-4567"), Some(15_551_234_567));
        assert_eq!(gid_from_phone_number("abc"), None);
        assert!(is_global_phone_number("+1555.123-4567"));
        assert!(!is_global_phone_number("+"));
        assert!(!is_global_phone_number("hello"));
    }
}
