/// Handle Translator
///
/// Bijection between the handles the victim sees and the handles of the real
/// device. Built once from a bound [`DeviceProfile`] before advertising starts
/// and never mutated afterwards: the only way to add an entry is through
/// [`HandleMappingBuilder`], which is consumed by `build()`. Lookups take
/// `&self` and need no locking.

use crate::gatt::Handle;
use crate::topology::DeviceProfile;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Which side of the relay a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleSpace {
    Victim,
    Target,
}

impl fmt::Display for HandleSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleSpace::Victim => f.write_str("victim"),
            HandleSpace::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Unknown {space} handle 0x{handle:04X}")]
    UnknownHandle { space: HandleSpace, handle: Handle },
    #[error("{space} handle 0x{handle:04X} mapped twice")]
    Duplicate { space: HandleSpace, handle: Handle },
    #[error("Characteristic {0} has no target handle; bind the profile first")]
    Unbound(uuid::Uuid),
}

/// Read-only victim <-> target handle bijection
#[derive(Debug, Clone, Default)]
pub struct HandleMapping {
    to_target: HashMap<Handle, Handle>,
    to_victim: HashMap<Handle, Handle>,
}

impl HandleMapping {
    pub fn builder() -> HandleMappingBuilder {
        HandleMappingBuilder::default()
    }

    /// Map every value handle and every bound descriptor of a profile
    pub fn from_profile(profile: &DeviceProfile) -> Result<Self, HandleError> {
        let mut builder = Self::builder();
        for (_, characteristic) in profile.characteristics() {
            let target = characteristic
                .target_handle
                .ok_or(HandleError::Unbound(characteristic.uuid))?;
            builder.insert(characteristic.victim_handle, target)?;

            for descriptor in &characteristic.descriptors {
                if let Some(target) = descriptor.target_handle {
                    builder.insert(descriptor.victim_handle, target)?;
                }
            }
        }
        Ok(builder.build())
    }

    pub fn to_target(&self, victim: Handle) -> Result<Handle, HandleError> {
        self.to_target
            .get(&victim)
            .copied()
            .ok_or(HandleError::UnknownHandle {
                space: HandleSpace::Victim,
                handle: victim,
            })
    }

    pub fn to_victim(&self, target: Handle) -> Result<Handle, HandleError> {
        self.to_victim
            .get(&target)
            .copied()
            .ok_or(HandleError::UnknownHandle {
                space: HandleSpace::Target,
                handle: target,
            })
    }

    pub fn len(&self) -> usize {
        self.to_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_target.is_empty()
    }

    /// (victim, target) pairs in victim handle order
    pub fn pairs(&self) -> Vec<(Handle, Handle)> {
        let mut pairs: Vec<_> = self.to_target.iter().map(|(v, t)| (*v, *t)).collect();
        pairs.sort_unstable();
        pairs
    }
}

/// Accumulates pairs until the mapping is frozen
#[derive(Debug, Default)]
pub struct HandleMappingBuilder {
    inner: HandleMapping,
}

impl HandleMappingBuilder {
    pub fn insert(&mut self, victim: Handle, target: Handle) -> Result<(), HandleError> {
        if self.inner.to_target.contains_key(&victim) {
            return Err(HandleError::Duplicate {
                space: HandleSpace::Victim,
                handle: victim,
            });
        }
        if self.inner.to_victim.contains_key(&target) {
            return Err(HandleError::Duplicate {
                space: HandleSpace::Target,
                handle: target,
            });
        }
        self.inner.to_target.insert(victim, target);
        self.inner.to_victim.insert(target, victim);
        Ok(())
    }

    pub fn build(self) -> HandleMapping {
        self.inner
    }
}
