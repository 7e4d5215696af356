//! Nearby Ranging Binary Protocol
//!
//! Framing for messages carried over an established pairwise channel.
//!
//! ```text
//! version(1) | type(1) | timestamp_ms(8, BE) | payload_len(2, BE) | payload
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{NearbyError, Result};
use crate::ranging::RangingToken;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Service type used when advertising and browsing
pub const SERVICE_TYPE: &str = "nearby-radar";

/// Discovery attribute carrying the tie-break key
pub const TIE_BREAK_ATTRIBUTE: &str = "tb";

/// Largest frame accepted on the wire
pub const MAX_FRAME_SIZE: usize = 4096;

const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    DiscoveryToken = 0x01, // Local ranging token for the receiving peer
}

impl TryFrom<u8> for MessageType {
    type Error = NearbyError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::DiscoveryToken),
            other => Err(NearbyError::Decode(format!(
                "unknown message type {:#04x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub message_type: MessageType,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            version: PROTOCOL_VERSION,
            message_type,
            timestamp,
            payload,
        }
    }

    /// Frame carrying our ranging token
    pub fn discovery_token(token: &RangingToken) -> Self {
        Self::new(MessageType::DiscoveryToken, token.as_bytes().to_vec())
    }

    /// The ranging token carried by a `DiscoveryToken` frame
    pub fn token(&self) -> Option<RangingToken> {
        match self.message_type {
            MessageType::DiscoveryToken => Some(RangingToken::new(self.payload.clone())),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = HEADER_SIZE + self.payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(NearbyError::Decode(format!(
                "frame too large: {} bytes",
                total
            )));
        }

        let mut buffer = Vec::with_capacity(total);
        buffer.push(self.version);
        buffer.push(self.message_type as u8);
        buffer.extend_from_slice(&self.timestamp.to_be_bytes());
        buffer.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&self.payload);
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(NearbyError::Decode(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(NearbyError::Decode(format!(
                "frame too large: {} bytes",
                data.len()
            )));
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(NearbyError::Decode(format!(
                "unsupported protocol version {}",
                version
            )));
        }

        let message_type = MessageType::try_from(data[1])?;

        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes.copy_from_slice(&data[2..10]);
        let timestamp = u64::from_be_bytes(timestamp_bytes);

        let payload_len = u16::from_be_bytes([data[10], data[11]]) as usize;
        let payload = &data[HEADER_SIZE..];
        if payload.len() != payload_len {
            return Err(NearbyError::Decode(format!(
                "payload length mismatch: header says {}, frame has {}",
                payload_len,
                payload.len()
            )));
        }

        if message_type == MessageType::DiscoveryToken && payload.is_empty() {
            return Err(NearbyError::Decode("empty ranging token".to_string()));
        }

        Ok(Self {
            version,
            message_type,
            timestamp,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_frame() -> Vec<u8> {
        Frame::discovery_token(&RangingToken::new(b"opaque-token".to_vec()))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_token_frame_decodes() {
        let bytes = token_frame();
        assert_eq!(bytes.len(), HEADER_SIZE + 12);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], 0x01);

        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.message_type, MessageType::DiscoveryToken);
        assert_eq!(
            frame.token(),
            Some(RangingToken::new(b"opaque-token".to_vec()))
        );
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = token_frame();
        bytes[0] = 9;
        assert!(matches!(Frame::decode(&bytes), Err(NearbyError::Decode(_))));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut bytes = token_frame();
        bytes[1] = 0x7f;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated_frames() {
        let bytes = token_frame();
        assert!(Frame::decode(&bytes[..5]).is_err());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).is_err());

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(Frame::decode(&extended).is_err());
    }

    #[test]
    fn test_rejects_empty_token() {
        let bytes = Frame::new(MessageType::DiscoveryToken, Vec::new())
            .encode()
            .unwrap();
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let frame = Frame::new(MessageType::DiscoveryToken, vec![7u8; MAX_FRAME_SIZE]);
        assert!(frame.encode().is_err());
    }
}
