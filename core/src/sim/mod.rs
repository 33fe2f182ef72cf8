//! In-memory Bluetooth backends
//!
//! [`SimCentral`] stands in for the real device behind the upstream link and
//! [`SimPeripheral`] for the host peripheral stack plus the victim. They drive
//! the relay end to end without an adapter, for tests and `--dry-run`.

pub mod central;
pub mod fixtures;
pub mod peripheral;

pub use central::{SimCentral, SIM_TARGET_HANDLE_BASE};
pub use peripheral::{PeripheralRecord, SimPeripheral};
