//! Serial-port transport, grounded on the `serialport` crate usage in
//! MediaTek's own reference flashing tool: open by port name with an
//! explicit baud and read timeout, discover ports by VID/PID via
//! `available_ports()`, and clear stale buffered bytes after a handshake
//! spams the line with probe bytes.
//!
//! Used by [`crate::mtk::brom`] (BROM handshake over a CDC/VCOM port that
//! appears when the device is held in download mode) and [`crate::sprd::fdl`]
//! (HDLC-framed FDL upload over the same kind of port).

use std::time::Duration;

use serialport::{SerialPort, SerialPortType};

use crate::error::{Error, Result};

pub struct SerialTransport {
  port: Box<dyn SerialPort>,
  port_name: String,
}

impl SerialTransport {
  /// Open `port_name` at `baud_rate`, with `timeout` applied to every read.
  pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
    let port = serialport::new(port_name, baud_rate).timeout(timeout).open()?;

    tracing::info!(port_name, baud_rate, "serial port opened");

    Ok(Self {
      port,
      port_name: port_name.to_string(),
    })
  }

  /// Poll for the first serial port whose USB VID/PID matches, retrying
  /// every 250ms until `timeout` elapses. Used to find a BROM or FDL port
  /// that only appears once the device is held in download mode (spec
  /// §4.1).
  pub fn find_first(vendor_id: u16, product_id: u16, baud_rate: u32, timeout: Duration) -> Result<Self> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
      if let Some(info) = serialport::available_ports()?
        .into_iter()
        .find(|info| matches_ids(info, vendor_id, product_id))
      {
        return Self::open(&info.port_name, baud_rate, timeout);
      }
      if std::time::Instant::now() >= deadline {
        return Err(Error::NotFound);
      }
      std::thread::sleep(Duration::from_millis(250));
    }
  }

  pub fn port_name(&self) -> &str {
    &self.port_name
  }

  pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
    self.port.set_timeout(timeout)?;
    Ok(std::io::Write::write(&mut self.port, data)?)
  }

  pub fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    self.port.set_timeout(timeout)?;
    match std::io::Read::read(&mut self.port, buf) {
      Ok(n) => Ok(n),
      Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
      Err(err) => Err(err.into()),
    }
  }

  /// Discard any bytes buffered on either direction. Used after a
  /// handshake that spams probe bytes and must not leak stray echoes into
  /// the next protocol phase.
  pub fn clear(&mut self) -> Result<()> {
    Ok(self.port.clear(serialport::ClearBuffer::All)?)
  }

  pub fn disconnect(self) {
    tracing::info!(port_name = %self.port_name, "serial port closed");
  }
}

fn matches_ids(info: &serialport::SerialPortInfo, vendor_id: u16, product_id: u16) -> bool {
  matches!(
    &info.port_type,
    SerialPortType::UsbPort(p) if p.vid == vendor_id && p.pid == product_id
  )
}
