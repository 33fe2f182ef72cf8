//! Pipeline configuration file
//!
//! ```json
//! { "transforms": [
//!     { "kind": "xor", "key": "ff", "direction": "outbound",
//!       "characteristic": "0000fff2-0000-1000-8000-00805f9b34fb" },
//!     { "kind": "drop", "direction": "inbound", "handle": 21, "reply": "ack" } ] }
//! ```
//!
//! Characteristic selectors are resolved to victim handles against the loaded
//! profile, so a config that names an unknown characteristic fails at startup
//! rather than silently matching nothing.

use super::{Direction, DropReply, Pipeline, Transform, TransformSlot};
use crate::gatt::{GattErrorCode, Handle};
use crate::topology::{parse_uuid, DeviceProfile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PipelineConfigError {
    #[error("Failed to read pipeline config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Pipeline config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid transform #{index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// Serialized form of a transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformKind {
    PassThrough,
    Replace { value: String },
    Xor { key: String },
    Drop {
        #[serde(default)]
        reply: DropReplySpec,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReplySpec {
    #[default]
    Ack,
    /// Hex value returned to reads
    Value(String),
    /// ATT error code
    Error(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: TransformKind,
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Victim-facing handle selector
    #[serde(default)]
    pub handle: Option<Handle>,
    /// Characteristic UUID selector, resolved through the profile
    #[serde(default)]
    pub characteristic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub transforms: Vec<TransformSpec>,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PipelineConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, PipelineConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolve selectors against `profile` and build the pipeline
    pub fn build(&self, profile: &DeviceProfile) -> Result<Pipeline, PipelineConfigError> {
        let mut slots = Vec::with_capacity(self.transforms.len());
        for (index, spec) in self.transforms.iter().enumerate() {
            slots.push(spec.to_slot(index, profile)?);
        }
        info!("Pipeline configured with {} transform(s)", slots.len());
        Ok(Pipeline::new(slots))
    }
}

impl TransformSpec {
    fn to_slot(
        &self,
        index: usize,
        profile: &DeviceProfile,
    ) -> Result<TransformSlot, PipelineConfigError> {
        let invalid = |reason: String| PipelineConfigError::Invalid { index, reason };
        let decode = |field: &str, text: &str| {
            hex::decode(text).map_err(|e| invalid(format!("{} is not hex: {}", field, e)))
        };

        let transform = match &self.kind {
            TransformKind::PassThrough => Transform::PassThrough,
            TransformKind::Replace { value } => Transform::Replace(decode("value", value)?),
            TransformKind::Xor { key } => {
                let key = decode("key", key)?;
                if key.is_empty() {
                    return Err(invalid("xor key is empty".into()));
                }
                Transform::Xor(key)
            }
            TransformKind::Drop { reply } => Transform::Drop(match reply {
                DropReplySpec::Ack => DropReply::Ack,
                DropReplySpec::Value(value) => DropReply::Value(decode("reply value", value)?),
                DropReplySpec::Error(code) => {
                    DropReply::Error(GattErrorCode::from_att_code(*code))
                }
            }),
        };

        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("{}#{}", transform.kind(), index));
        let mut slot = TransformSlot::new(name, transform);
        if let Some(direction) = self.direction {
            slot = slot.with_direction(direction);
        }

        let by_uuid = match &self.characteristic {
            Some(text) => {
                let uuid = parse_uuid(text)
                    .ok_or_else(|| invalid(format!("invalid characteristic UUID {:?}", text)))?;
                let characteristic = profile
                    .find_characteristic(&uuid)
                    .ok_or_else(|| invalid(format!("characteristic {} not in profile", uuid)))?;
                Some(characteristic.victim_handle)
            }
            None => None,
        };

        match (self.handle, by_uuid) {
            (Some(h), Some(u)) if h != u => {
                return Err(invalid(format!(
                    "handle 0x{:04X} disagrees with characteristic handle 0x{:04X}",
                    h, u
                )))
            }
            (Some(h), _) | (None, Some(h)) => {
                if profile.characteristic_at(h).is_none() {
                    return Err(invalid(format!("no characteristic value at handle 0x{:04X}", h)));
                }
                slot = slot.with_handle(h);
            }
            (None, None) => {}
        }

        Ok(slot)
    }
}
