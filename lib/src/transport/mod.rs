//! Byte-stream transport abstraction (spec §4.1).
//!
//! Re-architected per spec §9: instead of a dynamic-dispatch `dyn Transport`
//! trait object (the shape a GC'd host language reaches for), this is a
//! closed set of transport variants behind one capability enum. Adding a
//! fourth transport is a compile error everywhere a match isn't exhaustive,
//! which is exactly the property spec §9 asks for.
//!
//! All operations are blocking with a mandatory timeout. A zero-length read
//! on a healthy transport is end-of-stream (fatal, `Error::Transport`); a
//! timeout is recoverable and surfaces as `Error::Transport` with a
//! distinguishable message so callers can retry. No partial send is ever
//! reported as success: [`DeviceTransport::send_all`] loops until the exact
//! byte count is written.

pub mod serial;
pub mod setup;
pub mod usb;

pub use serial::SerialTransport;
pub use usb::UsbBulkTransport;

use std::time::Duration;

use crate::error::Result;

/// A claimed, bound communication channel to a device: either a USB bulk
/// endpoint pair or a serial port. Modeled as an enum (not a trait object)
/// per spec §9's "closed set of transport variants".
pub enum DeviceTransport {
  UsbBulk(UsbBulkTransport),
  Serial(SerialTransport),
}

impl DeviceTransport {
  /// Write `data` in full, looping until every byte is accepted by the
  /// transport. Never reports a partial write as success.
  pub fn send_all(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
    let mut offset = 0;
    while offset < data.len() {
      let written = self.send(&data[offset..], timeout)?;
      if written == 0 {
        return Err(crate::error::Error::Transport(
          "zero-length write on healthy transport".into(),
        ));
      }
      offset += written;
    }
    Ok(())
  }

  /// Read until `buf` is completely filled, looping across partial reads.
  /// A zero-length read before `buf` is full is treated as end-of-stream.
  pub fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
      let read = self.recv(&mut buf[offset..], timeout)?;
      if read == 0 {
        return Err(crate::error::Error::Transport("unexpected end of stream".into()));
      }
      offset += read;
    }
    Ok(())
  }

  pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
    match self {
      DeviceTransport::UsbBulk(t) => t.send(data, timeout),
      DeviceTransport::Serial(t) => t.send(data, timeout),
    }
  }

  pub fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    match self {
      DeviceTransport::UsbBulk(t) => t.recv(buf, timeout),
      DeviceTransport::Serial(t) => t.recv(buf, timeout),
    }
  }

  pub fn disconnect(self) {
    match self {
      DeviceTransport::UsbBulk(t) => t.disconnect(),
      DeviceTransport::Serial(t) => t.disconnect(),
    }
  }
}

impl From<UsbBulkTransport> for DeviceTransport {
  fn from(t: UsbBulkTransport) -> Self {
    DeviceTransport::UsbBulk(t)
  }
}

impl From<SerialTransport> for DeviceTransport {
  fn from(t: SerialTransport) -> Self {
    DeviceTransport::Serial(t)
  }
}

/// Identity used to re-find a device after it re-enumerates (spec §4.1,
/// required after MediaTek DA1 upload causes the USB endpoint to vanish).
#[derive(Debug, Clone, Copy)]
pub struct UsbIdentity {
  pub vendor_id: u16,
  pub product_id: u16,
}
