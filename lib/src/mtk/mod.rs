//! MediaTek BROM + Download-Agent loader (spec §4.4/§4.5): handshake,
//! target-configuration probe, two-stage payload upload, and the XML
//! protocol that takes over once DA1 is running.

pub mod brom;
pub mod chips;
pub mod da;

pub use brom::{BromClient, DeviceInfo};
pub use chips::ChipRecord;
pub use da::{DaClient, DaState, PartitionEntry};
