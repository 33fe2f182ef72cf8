/// GATT/ATT vocabulary shared by both links.
///
/// Error codes follow the ATT error table (Core Spec Vol 3, Part F, 3.4.1.1).
/// The relay never invents codes of its own on the wire: relay-local conditions
/// such as upstream timeouts are collapsed into the nearest standard code.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Attribute handle within a GATT server
pub type Handle = u16;

/// Identifier a peripheral backend assigns to a victim-originated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// ATT opcodes the relay tracks for in-flight requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttOpcode {
    ReadRequest = 0x0A,
    ReadBlobRequest = 0x0C,
    WriteRequest = 0x12,
    WriteCommand = 0x52,
    HandleValueNotification = 0x1B,
    HandleValueIndication = 0x1D,
}

/// How the victim issued a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// Write Request, acknowledged with a Write Response
    Request,
    /// Write Command, never acknowledged
    Command,
}

impl WriteKind {
    pub fn opcode(&self) -> AttOpcode {
        match self {
            WriteKind::Request => AttOpcode::WriteRequest,
            WriteKind::Command => AttOpcode::WriteCommand,
        }
    }
}

/// Per-operation GATT failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    /// Application or profile defined code (0x80..=0xFF)
    Application(u8),
    /// Upstream operation exceeded its deadline
    Timeout,
}

impl GattErrorCode {
    /// ATT error code sent to the peer for this failure
    pub fn att_code(&self) -> u8 {
        match self {
            GattErrorCode::InvalidHandle => 0x01,
            GattErrorCode::ReadNotPermitted => 0x02,
            GattErrorCode::WriteNotPermitted => 0x03,
            GattErrorCode::InvalidPdu => 0x04,
            GattErrorCode::InsufficientAuthentication => 0x05,
            GattErrorCode::RequestNotSupported => 0x06,
            GattErrorCode::InvalidOffset => 0x07,
            GattErrorCode::InsufficientAuthorization => 0x08,
            GattErrorCode::PrepareQueueFull => 0x09,
            GattErrorCode::AttributeNotFound => 0x0A,
            GattErrorCode::AttributeNotLong => 0x0B,
            GattErrorCode::InsufficientEncryptionKeySize => 0x0C,
            GattErrorCode::InvalidAttributeValueLength => 0x0D,
            GattErrorCode::UnlikelyError | GattErrorCode::Timeout => 0x0E,
            GattErrorCode::InsufficientEncryption => 0x0F,
            GattErrorCode::UnsupportedGroupType => 0x10,
            GattErrorCode::InsufficientResources => 0x11,
            GattErrorCode::Application(code) => *code,
        }
    }

    /// Decode an ATT error code received from a peer
    pub fn from_att_code(code: u8) -> Self {
        match code {
            0x01 => GattErrorCode::InvalidHandle,
            0x02 => GattErrorCode::ReadNotPermitted,
            0x03 => GattErrorCode::WriteNotPermitted,
            0x04 => GattErrorCode::InvalidPdu,
            0x05 => GattErrorCode::InsufficientAuthentication,
            0x06 => GattErrorCode::RequestNotSupported,
            0x07 => GattErrorCode::InvalidOffset,
            0x08 => GattErrorCode::InsufficientAuthorization,
            0x09 => GattErrorCode::PrepareQueueFull,
            0x0A => GattErrorCode::AttributeNotFound,
            0x0B => GattErrorCode::AttributeNotLong,
            0x0C => GattErrorCode::InsufficientEncryptionKeySize,
            0x0D => GattErrorCode::InvalidAttributeValueLength,
            0x0F => GattErrorCode::InsufficientEncryption,
            0x10 => GattErrorCode::UnsupportedGroupType,
            0x11 => GattErrorCode::InsufficientResources,
            0x80..=0xFF => GattErrorCode::Application(code),
            _ => GattErrorCode::UnlikelyError,
        }
    }
}

impl fmt::Display for GattErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattErrorCode::Timeout => write!(f, "Timeout"),
            GattErrorCode::Application(code) => write!(f, "Application(0x{:02X})", code),
            other => write!(f, "{:?} (0x{:02X})", other, other.att_code()),
        }
    }
}

/// A failed GATT operation, carrying the code the requesting side should observe
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("GATT error: {code}")]
pub struct GattError {
    pub code: GattErrorCode,
}

impl GattError {
    pub fn new(code: GattErrorCode) -> Self {
        Self { code }
    }

    pub fn timeout() -> Self {
        Self::new(GattErrorCode::Timeout)
    }
}

impl From<GattErrorCode> for GattError {
    fn from(code: GattErrorCode) -> Self {
        Self::new(code)
    }
}

/// Answer delivered to the victim for a read or write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattResponse {
    /// Read (or read blob) value
    Value(Vec<u8>),
    /// Write Response
    WriteAck,
    /// Error Response
    Error(GattErrorCode),
}

impl GattResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, GattResponse::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_unlikely_error_on_wire() {
        assert_eq!(GattErrorCode::Timeout.att_code(), 0x0E);
        assert_eq!(GattErrorCode::UnlikelyError.att_code(), 0x0E);
    }

    #[test]
    fn test_att_code_decoding() {
        for code in 0x01u8..=0x11 {
            if code == 0x0E {
                continue;
            }
            assert_eq!(GattErrorCode::from_att_code(code).att_code(), code);
        }
        assert_eq!(
            GattErrorCode::from_att_code(0x80),
            GattErrorCode::Application(0x80)
        );
        // Reserved range collapses to a generic failure
        assert_eq!(
            GattErrorCode::from_att_code(0x42),
            GattErrorCode::UnlikelyError
        );
    }

    #[test]
    fn test_write_kind_opcodes() {
        assert_eq!(WriteKind::Request.opcode() as u8, 0x12);
        assert_eq!(WriteKind::Command.opcode() as u8, 0x52);
    }

    #[test]
    fn test_gatt_error_display() {
        let err = GattError::new(GattErrorCode::InvalidOffset);
        assert_eq!(err.to_string(), "GATT error: InvalidOffset (0x07)");
        assert_eq!(GattError::timeout().to_string(), "GATT error: Timeout");
    }
}
