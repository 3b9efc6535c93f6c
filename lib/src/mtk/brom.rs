//! MediaTek BROM handshake, target-configuration probe, and staged
//! Download-Agent upload (spec §4.4).
//!
//! Grounded on `mt6572-mainline-da-boot`'s `bootrom::handshake` (byte-at-a-
//! time complement echo) and its boot-to-preloader flow (payload upload,
//! jump, reconnect) — generalized here from one fixed payload into a
//! chip-table-driven upload with an optional exploit stage for chips whose
//! BROM enforces secure boot.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::mtk::chips::{self, ChipRecord};
use crate::progress::CancelToken;
use crate::transport::{DeviceTransport, UsbIdentity};

const HANDSHAKE: [u8; 4] = [0xA0, 0x0A, 0x50, 0x05];

const CMD_HW_CODE: u8 = 0xFD;
const CMD_TARGET_CONFIG: u8 = 0xD8;
const CMD_HW_VER: u8 = 0xFC;
const CMD_ME_ID: u8 = 0xE1;
const CMD_SOC_ID: u8 = 0xE7;
const CMD_SEND_DA: u8 = 0xD7;
const CMD_JUMP_DA: u8 = 0xD5;
const CMD_WRITE32: u8 = 0xD4;
const CMD_READ32: u8 = 0xD1;
const CMD_SEND_CERT: u8 = 0xE0;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
  pub hw_code: u16,
  pub target_config: u32,
  pub hw_ver: u16,
  pub hw_subcode: u16,
  pub sw_ver: u16,
  pub me_id: [u8; 16],
  pub soc_id: [u8; 32],
  pub chip: Option<ChipRecord>,
}

pub struct BromClient {
  transport: DeviceTransport,
  timeout: Duration,
}

impl BromClient {
  pub fn new(transport: impl Into<DeviceTransport>, timeout: Duration) -> Self {
    Self { transport: transport.into(), timeout }
  }

  /// Send `{0xA0, 0x0A, 0x50, 0x05}` one byte at a time, expecting each
  /// echoed byte back as the bitwise complement of the one sent. Success
  /// means the device is in BROM; failure (while the device still answers
  /// other traffic) suggests Preloader mode instead.
  pub fn handshake(&mut self) -> Result<()> {
    for &byte in &HANDSHAKE {
      self.transport.send_all(&[byte], self.timeout)?;
      let mut echo = [0u8; 1];
      self.transport.recv_exact(&mut echo, self.timeout)?;
      if echo[0] != !byte {
        return Err(Error::Protocol(format!(
          "brom handshake echo mismatch: sent {byte:#04x}, got {:#04x}",
          echo[0]
        )));
      }
    }
    tracing::info!("brom handshake complete");
    Ok(())
  }

  fn send_cmd(&mut self, cmd: u8) -> Result<()> {
    self.transport.send_all(&[cmd], self.timeout)
  }

  /// Each command's reply is `{ status: u16 BE, payload }`; a non-zero
  /// status fails the call.
  fn read_status_and(&mut self, payload_len: usize) -> Result<Vec<u8>> {
    let mut status_buf = [0u8; 2];
    self.transport.recv_exact(&mut status_buf, self.timeout)?;
    let status = u16::from_be_bytes(status_buf);

    let mut payload = vec![0u8; payload_len];
    self.transport.recv_exact(&mut payload, self.timeout)?;

    if status != 0 {
      return Err(Error::Device(format!("brom command failed with status {status:#06x}")));
    }
    Ok(payload)
  }

  pub fn read_hw_code(&mut self) -> Result<u16> {
    self.send_cmd(CMD_HW_CODE)?;
    let payload = self.read_status_and(2)?;
    Ok(u16::from_be_bytes(payload.try_into().unwrap()))
  }

  pub fn read_target_config(&mut self) -> Result<u32> {
    self.send_cmd(CMD_TARGET_CONFIG)?;
    let payload = self.read_status_and(4)?;
    Ok(u32::from_be_bytes(payload.try_into().unwrap()))
  }

  fn read_hw_version(&mut self) -> Result<(u16, u16, u16)> {
    self.send_cmd(CMD_HW_VER)?;
    let payload = self.read_status_and(6)?;
    let hw_ver = u16::from_be_bytes(payload[0..2].try_into().unwrap());
    let hw_subcode = u16::from_be_bytes(payload[2..4].try_into().unwrap());
    let sw_ver = u16::from_be_bytes(payload[4..6].try_into().unwrap());
    Ok((hw_ver, hw_subcode, sw_ver))
  }

  fn read_me_id(&mut self) -> Result<[u8; 16]> {
    self.send_cmd(CMD_ME_ID)?;
    let payload = self.read_status_and(16)?;
    Ok(payload.try_into().unwrap())
  }

  fn read_soc_id(&mut self) -> Result<[u8; 32]> {
    self.send_cmd(CMD_SOC_ID)?;
    let payload = self.read_status_and(32)?;
    Ok(payload.try_into().unwrap())
  }

  /// Run the full info probe and resolve the chip table entry.
  pub fn probe(&mut self) -> Result<DeviceInfo> {
    let hw_code = self.read_hw_code()?;
    let target_config = self.read_target_config()?;
    let (hw_ver, hw_subcode, sw_ver) = self.read_hw_version()?;
    let me_id = self.read_me_id()?;
    let soc_id = self.read_soc_id()?;
    let chip = chips::lookup(hw_code);

    tracing::info!(hw_code, target_config, chip = chip.map(|c| c.name), "brom info probe complete");

    Ok(DeviceInfo { hw_code, target_config, hw_ver, hw_subcode, sw_ver, me_id, soc_id, chip })
  }

  fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
    self.send_cmd(CMD_WRITE32)?;
    self.transport.send_all(&addr.to_be_bytes(), self.timeout)?;
    self.transport.send_all(&1u32.to_be_bytes(), self.timeout)?; // word count
    self.read_status_and(0)?;
    self.transport.send_all(&value.to_be_bytes(), self.timeout)?;
    self.read_status_and(0)?;
    Ok(())
  }

  fn read32(&mut self, addr: u32) -> Result<u32> {
    self.send_cmd(CMD_READ32)?;
    self.transport.send_all(&addr.to_be_bytes(), self.timeout)?;
    self.transport.send_all(&1u32.to_be_bytes(), self.timeout)?;
    self.read_status_and(0)?;
    let payload = self.read_status_and(4)?;
    Ok(u32::from_be_bytes(payload.try_into().unwrap()))
  }

  /// `SEND_DA(addr, data_len, sig_len, data)`: the entire image is sent on
  /// the wire even when `sig_len` is smaller than the tail data, because
  /// the device's XOR-16 checksum covers the full transmitted payload.
  fn send_da(&mut self, addr: u32, sig_len: u32, data: &[u8], cancel: &CancelToken) -> Result<()> {
    self.send_cmd(CMD_SEND_DA)?;
    self.transport.send_all(&addr.to_be_bytes(), self.timeout)?;
    self.transport.send_all(&(data.len() as u32).to_be_bytes(), self.timeout)?;
    self.transport.send_all(&sig_len.to_be_bytes(), self.timeout)?;
    self.read_status_and(0)?;

    let mut checksum: u16 = 0;
    let mut offset = 0;
    while offset < data.len() {
      cancel.check()?;
      let end = (offset + 65536).min(data.len());
      self.transport.send_all(&data[offset..end], self.timeout)?;
      for chunk in data[offset..end].chunks(2) {
        let word = if chunk.len() == 2 {
          u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
          u16::from_be_bytes([chunk[0], 0])
        };
        checksum ^= word;
      }
      offset = end;
    }

    let mut device_checksum_buf = [0u8; 2];
    self.transport.recv_exact(&mut device_checksum_buf, self.timeout)?;
    let device_checksum = u16::from_be_bytes(device_checksum_buf);
    if device_checksum != checksum {
      return Err(Error::Device(format!(
        "DA checksum mismatch: computed {checksum:#06x}, device reported {device_checksum:#06x}"
      )));
    }
    self.read_status_and(0)?;
    Ok(())
  }

  fn jump_da(&mut self, addr: u32) -> Result<()> {
    self.send_cmd(CMD_JUMP_DA)?;
    self.transport.send_all(&addr.to_be_bytes(), self.timeout)?;
    self.read_status_and(0)?;
    Ok(())
  }

  /// Chip-specific exploit delivery for secure-boot-locked chips. Per spec
  /// §4.4 the core treats the payload as opaque: it is sent as a
  /// `SEND_DA`-style blob to the chip record's address with no parsed
  /// response, and success is inferred from the device re-enumerating with
  /// a zeroed target configuration afterwards.
  pub fn inject_exploit(&mut self, chip: &ChipRecord, payload: &[u8], cancel: &CancelToken) -> Result<()> {
    let addr = chip
      .exploit_payload_addr
      .ok_or_else(|| Error::UnsupportedFeature(format!("{} has no known exploit payload address", chip.name)))?;
    tracing::warn!(chip = chip.name, addr, "injecting brom exploit payload");
    self.send_da(addr, payload.len() as u32, payload, cancel)
  }

  /// `SEND_CERT`: BROM exploit vehicle for secure-boot-capable (SBC)
  /// devices that require a certificate chain before `SEND_DA` is honored.
  pub fn send_cert(&mut self, cert: &[u8], cancel: &CancelToken) -> Result<()> {
    self.send_cmd(CMD_SEND_CERT)?;
    self.transport.send_all(&(cert.len() as u32).to_be_bytes(), self.timeout)?;
    self.read_status_and(0)?;
    let mut offset = 0;
    while offset < cert.len() {
      cancel.check()?;
      let end = (offset + 65536).min(cert.len());
      self.transport.send_all(&cert[offset..end], self.timeout)?;
      offset = end;
    }
    self.read_status_and(0)?;
    Ok(())
  }

  /// Upload DA1, jump to it, and wait for the USB endpoint to re-appear.
  /// The endpoint vanishing is expected: the BROM boot ROM stops answering
  /// the moment DA1 takes over the bus.
  pub fn upload_da1(
    self,
    addr: u32,
    sig_len: u32,
    data: &[u8],
    new_identity: UsbIdentity,
    reenumeration_timeout: Duration,
    cancel: &CancelToken,
  ) -> Result<DeviceTransport> {
    let mut this = self;
    this.send_da(addr, sig_len, data, cancel)?;
    this.jump_da(addr)?;

    match this.transport {
      DeviceTransport::UsbBulk(usb) => {
        let reconnected = usb.reconnect_after_reenumeration(new_identity, reenumeration_timeout)?;
        Ok(DeviceTransport::UsbBulk(reconnected))
      }
      other => Ok(other),
    }
  }

  pub fn write32_checked(&mut self, addr: u32, value: u32) -> Result<()> {
    self.write32(addr, value)
  }

  pub fn read32_checked(&mut self, addr: u32) -> Result<u32> {
    self.read32(addr)
  }
}
