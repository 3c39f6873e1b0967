//! Binary WebSocket protocol for live trip sessions.
//!
//! Every frame is a 5-byte header followed by a bincode payload:
//!
//! ```text
//! +---------+------+----------------+-------------------+
//! | version | type | payload length | payload (bincode) |
//! |   u8    |  u8  |      u24       |                   |
//! +---------+------+----------------+-------------------+
//! ```
//!
//! Text frames carrying the JSON form of the same messages are accepted too,
//! which keeps the protocol poke-able from a browser console.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use crate::model::Collection;
use crate::{SessionId, TripId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Welcome = 0x02,
    Goodbye = 0x03,

    Changed = 0x20,

    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x20 => Ok(MessageType::Changed),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// What changed on the server, as far as devices need to know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    PackingListChanged,
    TripChanged,
    EquipmentChanged,
    CatalogChanged,
    TravelersChanged,
    VehiclesChanged,
}

impl ChangeKind {
    /// Collections a device must refetch after this notification
    pub fn collections(&self) -> &'static [Collection] {
        match self {
            ChangeKind::PackingListChanged => &[Collection::PackingEntries],
            ChangeKind::TripChanged => &[Collection::Trips],
            ChangeKind::EquipmentChanged => &[Collection::Equipment],
            ChangeKind::CatalogChanged => &[
                Collection::Categories,
                Collection::MainCategories,
                Collection::Tags,
            ],
            ChangeKind::TravelersChanged => &[Collection::Travelers],
            ChangeKind::VehiclesChanged => &[Collection::Vehicles],
        }
    }
}

/// Messages sent from device to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Keepalive; answered with `Pong`
    Ping { timestamp: u64 },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },
}

/// Messages sent from server to device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sent once after the session is registered in its room
    Welcome {
        protocol_version: u8,
        session_id: SessionId,
        trip_id: TripId,
        server_time: i64,
    },

    /// Something in the trip changed; refetch the affected collections
    Changed {
        trip_id: TripId,
        kind: ChangeKind,
        server_time: i64,
    },

    /// Keepalive answer
    Pong { timestamp: u64, server_time: i64 },
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::Ping { .. } => MessageType::Ping,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
        };
        frame(msg_type, &bincode::serialize(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Changed { .. } => MessageType::Changed,
            ServerMessage::Pong { .. } => MessageType::Pong,
        };
        frame(msg_type, &bincode::serialize(msg)?)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let payload = unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let payload = unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Decode a client message from a JSON text frame
    pub fn decode_client_text(text: &str) -> Result<ClientMessage, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a server message from a JSON text frame
    pub fn decode_server_text(text: &str) -> Result<ServerMessage, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

fn unframe(data: &[u8]) -> Result<&[u8], ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat(
            "Message too short".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    Ok(&data[HEADER_LEN..HEADER_LEN + payload_len])
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_frame_header() {
        let msg = ServerMessage::Changed {
            trip_id: "trip-1".to_string(),
            kind: ChangeKind::PackingListChanged,
            server_time: 1_700_000_000,
        };

        let bytes = SyncProtocol::encode_server(&msg).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], MessageType::Changed as u8);

        let decoded = SyncProtocol::decode_server(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ping_decodes() {
        let bytes = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 42 }).unwrap();
        assert_eq!(
            SyncProtocol::decode_client(&bytes).unwrap(),
            ClientMessage::Ping { timestamp: 42 }
        );
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp: 1 })
            .unwrap()
            .to_vec();
        bytes[0] = 99;

        let result = SyncProtocol::decode_client(&bytes);
        assert_eq!(
            result,
            Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, 99))
        );
    }

    #[test]
    fn test_short_and_truncated_frames() {
        assert!(matches!(
            SyncProtocol::decode_server(&[1, 2]),
            Err(ProtocolError::InvalidFormat(_))
        ));

        let bytes = SyncProtocol::encode_server(&ServerMessage::Pong {
            timestamp: 7,
            server_time: 8,
        })
        .unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            SyncProtocol::decode_server(truncated),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut bytes = SyncProtocol::encode_client(&ClientMessage::Goodbye { reason: None })
            .unwrap()
            .to_vec();
        bytes[1] = 0x77;
        assert_eq!(
            SyncProtocol::decode_client(&bytes),
            Err(ProtocolError::UnknownMessageType(0x77))
        );
    }

    #[test]
    fn test_json_text_fallback() {
        let msg = SyncProtocol::decode_client_text(r#"{"Ping":{"timestamp":5}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: 5 });
    }

    #[test]
    fn test_change_kind_collections() {
        assert_eq!(
            ChangeKind::PackingListChanged.collections(),
            &[Collection::PackingEntries]
        );
        assert_eq!(ChangeKind::CatalogChanged.collections().len(), 3);
    }
}
