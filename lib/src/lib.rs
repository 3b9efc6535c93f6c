//! # flashkit
//!
//! A cross-vendor, low-level mobile-device flashing engine.
//!
//! `flashkit` speaks the native firmware-transport protocols of three chip
//! ecosystems directly over a byte-stream transport:
//!
//! - **Fastboot** — the Android bootloader USB command protocol
//!   ([`fastboot`]).
//! - **MediaTek BROM + Download Agent** — serial ROM-bootloader handshake
//!   and staged DA upload ([`mtk`]).
//! - **Spreadtrum/Unisoc FDL** — HDLC-framed staged bootloader upload
//!   ([`sprd`]).
//!
//! It also understands the binary formats these protocols depend on: the
//! Android Sparse image format ([`sparse`]), Spreadtrum PAC firmware
//! packages ([`sprd::pac`]), and the streaming `payload.bin` format used by
//! Android A/B OTA updates, which can be extracted straight out of a remote
//! ZIP without downloading the whole archive ([`ota`]).
//!
//! Driving any of these engines is the same shape of problem: advance a
//! finite protocol state machine over an unreliable duplex byte stream to a
//! device whose state is authoritative and whose errors are cryptic. Every
//! engine in this crate is built around that one discipline.
//!
//! ## Usage example
//!
//! ```no_run
//! use flashkit::{fastboot::FastbootClient, transport::UsbBulkTransport, progress::CancelToken};
//!
//! let transport = UsbBulkTransport::find_first(0x18d1, 0x4ee0)?;
//! let mut client = FastbootClient::new(transport);
//! let cancel = CancelToken::new();
//!
//! let vars = client.getvar_all(&cancel)?;
//! println!("max-download-size: {:?}", vars.get("max-download-size"));
//! # Ok::<(), flashkit::Error>(())
//! ```

pub mod error;
pub mod fastboot;
pub mod mtk;
pub mod ota;
pub mod progress;
pub mod sparse;
pub mod sprd;
pub mod transport;

pub use error::{Error, Result};
pub use progress::{CancelToken, Event};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts shared by every protocol engine.
///
/// Defaults mirror spec §4.8: transport read 30s, data-transfer phase 60s,
/// handshake 10s, device re-enumeration 15s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
  #[serde(with = "duration_secs")]
  pub read_timeout: Duration,
  #[serde(with = "duration_secs")]
  pub data_phase_timeout: Duration,
  #[serde(with = "duration_secs")]
  pub handshake_timeout: Duration,
  #[serde(with = "duration_secs")]
  pub reenumeration_timeout: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      read_timeout: Duration::from_secs(30),
      data_phase_timeout: Duration::from_secs(60),
      handshake_timeout: Duration::from_secs(10),
      reenumeration_timeout: Duration::from_secs(15),
    }
  }
}

mod duration_secs {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(d)?))
  }
}
