// Pairing mirror: accept Just Works, refuse anything that needs a secret

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SMP IO capability advertised during pairing feature exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    #[default]
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    /// Name used by BlueZ agent registration
    pub fn bluez_name(&self) -> &'static str {
        match self {
            IoCapability::DisplayOnly => "DisplayOnly",
            IoCapability::DisplayYesNo => "DisplayYesNo",
            IoCapability::KeyboardOnly => "KeyboardOnly",
            IoCapability::NoInputNoOutput => "NoInputNoOutput",
            IoCapability::KeyboardDisplay => "KeyboardDisplay",
        }
    }
}

impl FromStr for IoCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "displayonly" => Ok(IoCapability::DisplayOnly),
            "displayyesno" => Ok(IoCapability::DisplayYesNo),
            "keyboardonly" => Ok(IoCapability::KeyboardOnly),
            "noinputnooutput" => Ok(IoCapability::NoInputNoOutput),
            "keyboarddisplay" => Ok(IoCapability::KeyboardDisplay),
            _ => Err(format!("unknown IO capability {:?}", s)),
        }
    }
}

/// Association model the victim attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairingMethod {
    JustWorks,
    NumericComparison,
    PasskeyEntry,
    OutOfBand,
    /// BR/EDR style PIN request
    LegacyPin,
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairingMethod::JustWorks => "Just Works",
            PairingMethod::NumericComparison => "Numeric Comparison",
            PairingMethod::PasskeyEntry => "Passkey Entry",
            PairingMethod::OutOfBand => "Out of Band",
            PairingMethod::LegacyPin => "Legacy PIN",
        };
        f.write_str(name)
    }
}

/// SMP Pairing Failed reason codes (Core Spec Vol 3, Part H, 3.5.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SmpErrorCode {
    PasskeyEntryFailed = 0x01,
    OobNotAvailable = 0x02,
    AuthenticationRequirements = 0x03,
    ConfirmValueFailed = 0x04,
    PairingNotSupported = 0x05,
    EncryptionKeySize = 0x06,
    CommandNotSupported = 0x07,
    UnspecifiedReason = 0x08,
}

/// Outcome handed back to the peripheral backend for a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingDecision {
    Accept,
    Reject(SmpErrorCode),
}

/// Decides how to answer the victim's pairing attempts.
///
/// The relay only mirrors unauthenticated pairing. A method that would need a
/// passkey or OOB data is refused outright with the SMP reason a device of the
/// mirrored IO capability would give; it is never downgraded behind the
/// victim's back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPolicy {
    io_capability: IoCapability,
}

impl PairingPolicy {
    pub fn new(io_capability: IoCapability) -> Self {
        Self { io_capability }
    }

    pub fn io_capability(&self) -> IoCapability {
        self.io_capability
    }

    pub fn evaluate(&self, method: PairingMethod) -> PairingDecision {
        match method {
            PairingMethod::JustWorks => PairingDecision::Accept,
            PairingMethod::OutOfBand => PairingDecision::Reject(SmpErrorCode::OobNotAvailable),
            PairingMethod::PasskeyEntry
            | PairingMethod::NumericComparison
            | PairingMethod::LegacyPin => match self.io_capability {
                IoCapability::NoInputNoOutput => {
                    PairingDecision::Reject(SmpErrorCode::AuthenticationRequirements)
                }
                _ => PairingDecision::Reject(SmpErrorCode::PairingNotSupported),
            },
        }
    }
}

impl Default for PairingPolicy {
    fn default() -> Self {
        Self::new(IoCapability::NoInputNoOutput)
    }
}
