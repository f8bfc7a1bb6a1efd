//! Codec and protocol errors
//!
//! A decode error closes the offending connection; nothing here is reported
//! back to the client except an unsupported protocol level, which the
//! broker answers with CONNACK 0x01.

use std::fmt;

/// Why bytes read from a client could not be turned into a [`Packet`](super::Packet)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends mid-packet; read more and retry
    InsufficientData,
    /// Fixed header names packet type 0 or 15
    InvalidPacketType(u8),
    /// Remaining length runs past four bytes
    InvalidRemainingLength,
    /// CONNECT names neither `MQTT` nor `MQIsdp`
    InvalidProtocolName,
    /// CONNECT level other than 3 (`MQIsdp`) or 4 (`MQTT`)
    InvalidProtocolVersion(u8),
    /// QoS bits set to 3
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved fixed-header or CONNECT flag bits are wrong
    InvalidFlags,
    /// CONNACK or SUBACK code outside the v3.1.1 table
    InvalidReturnCode(u8),
    MalformedPacket(&'static str),
    /// Remaining length above the configured maximum
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("incomplete packet"),
            Self::InvalidPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::InvalidRemainingLength => f.write_str("remaining length exceeds four bytes"),
            Self::InvalidProtocolName => f.write_str("unknown protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::InvalidFlags => f.write_str("reserved flag bits violated"),
            Self::InvalidReturnCode(c) => write!(f, "unknown return code {:#04x}", c),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => f.write_str("packet exceeds maximum size"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length would not fit the four-byte varint
    PacketTooLarge,
    /// A string or binary field is longer than 65535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet exceeds maximum remaining length"),
            Self::StringTooLong => f.write_str("field longer than 65535 bytes"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Session-level failure that ends a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// A refusing CONNACK carrying this return code went out
    ConnectionRefused(u8),
    /// The client broke the v3.1.1 packet sequence
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode: {}", e),
            Self::Encode(e) => write!(f, "encode: {}", e),
            Self::ConnectionRefused(code) => write!(f, "CONNACK refused with {:#04x}", code),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::ConnectionRefused(_) | Self::ProtocolViolation(_) => None,
        }
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
