//! Spreadtrum BSL/HDLC framing and the two-stage FDL upload (spec §4.6).
//!
//! Frame layout: `0x7E | type (u16 BE) | length (u16 BE) | payload | crc16
//! (BE) | 0x7E`. `0x7E` and `0x7D` inside the frame body are byte-stuffed as
//! `0x7D 0x5E` and `0x7D 0x5D`. The CRC covers the unstuffed
//! `type|length|payload` bytes.

use std::time::Duration;

use crc::{Crc, CRC_16_IBM_3740 as CRC_16_CCITT_FALSE};

use crate::error::{Error, Result};
use crate::progress::CancelToken;
use crate::sprd::chips::SprdChipRecord;
use crate::transport::DeviceTransport;

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const MIDST_CHUNK_MAX: usize = 2 * 1024;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_CCITT_FALSE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BslCmd {
  Connect,
  StartData,
  MidstData,
  EndData,
  ExecData,
  ReadFlash,
  EraseFlash,
  ReadChipType,
  ReadPartition,
  Repartition,
  PowerOff,
  NormalReset,
  ReadNv,
  WriteNv,
  Ack,
  Nack,
}

impl BslCmd {
  fn code(self) -> u16 {
    match self {
      BslCmd::Connect => 0x0000,
      BslCmd::StartData => 0x0001,
      BslCmd::MidstData => 0x0002,
      BslCmd::EndData => 0x0003,
      BslCmd::ExecData => 0x0004,
      BslCmd::ReadFlash => 0x0006,
      BslCmd::EraseFlash => 0x0009,
      BslCmd::ReadChipType => 0x000D,
      BslCmd::ReadPartition => 0x0013,
      BslCmd::Repartition => 0x0014,
      BslCmd::PowerOff => 0x000A,
      BslCmd::NormalReset => 0x000B,
      BslCmd::ReadNv => 0x0020,
      BslCmd::WriteNv => 0x0021,
      BslCmd::Ack => 0x0080,
      BslCmd::Nack => 0x0081,
    }
  }

  fn from_code(code: u16) -> Option<Self> {
    Some(match code {
      0x0000 => BslCmd::Connect,
      0x0001 => BslCmd::StartData,
      0x0002 => BslCmd::MidstData,
      0x0003 => BslCmd::EndData,
      0x0004 => BslCmd::ExecData,
      0x0006 => BslCmd::ReadFlash,
      0x0009 => BslCmd::EraseFlash,
      0x000D => BslCmd::ReadChipType,
      0x0013 => BslCmd::ReadPartition,
      0x0014 => BslCmd::Repartition,
      0x000A => BslCmd::PowerOff,
      0x000B => BslCmd::NormalReset,
      0x0020 => BslCmd::ReadNv,
      0x0021 => BslCmd::WriteNv,
      0x0080 => BslCmd::Ack,
      0x0081 => BslCmd::Nack,
      _ => return None,
    })
  }
}

fn stuff(bytes: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(bytes.len());
  for &b in bytes {
    match b {
      FLAG => out.extend_from_slice(&[ESCAPE, 0x5E]),
      ESCAPE => out.extend_from_slice(&[ESCAPE, 0x5D]),
      other => out.push(other),
    }
  }
  out
}

fn unstuff(bytes: &[u8]) -> Result<Vec<u8>> {
  let mut out = Vec::with_capacity(bytes.len());
  let mut iter = bytes.iter().copied();
  while let Some(b) = iter.next() {
    if b == ESCAPE {
      match iter.next() {
        Some(0x5E) => out.push(FLAG),
        Some(0x5D) => out.push(ESCAPE),
        _ => return Err(Error::Protocol("invalid byte-stuffing escape sequence".into())),
      }
    } else {
      out.push(b);
    }
  }
  Ok(out)
}

/// Encode one complete on-wire frame for `cmd` carrying `payload`.
fn encode_frame(cmd: BslCmd, payload: &[u8]) -> Vec<u8> {
  let mut body = Vec::with_capacity(4 + payload.len());
  body.extend_from_slice(&cmd.code().to_be_bytes());
  body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
  body.extend_from_slice(payload);

  let crc = CRC.checksum(&body);

  let mut unescaped = body;
  unescaped.extend_from_slice(&crc.to_be_bytes());

  let mut frame = Vec::with_capacity(unescaped.len() + 2);
  frame.push(FLAG);
  frame.extend_from_slice(&stuff(&unescaped));
  frame.push(FLAG);
  frame
}

#[derive(Debug)]
struct DecodedFrame {
  cmd: BslCmd,
  payload: Vec<u8>,
}

fn decode_frame(raw: &[u8]) -> Result<DecodedFrame> {
  if raw.len() < 2 || raw[0] != FLAG || raw[raw.len() - 1] != FLAG {
    return Err(Error::Protocol("BSL frame missing flag bytes".into()));
  }
  let unescaped = unstuff(&raw[1..raw.len() - 1])?;
  if unescaped.len() < 6 {
    return Err(Error::Protocol("BSL frame shorter than header+crc".into()));
  }
  let (body, crc_bytes) = unescaped.split_at(unescaped.len() - 2);
  let declared_crc = u16::from_be_bytes(crc_bytes.try_into().unwrap());
  let computed_crc = CRC.checksum(body);
  if declared_crc != computed_crc {
    return Err(Error::Protocol(format!(
      "BSL frame CRC mismatch: declared {declared_crc:#06x}, computed {computed_crc:#06x}"
    )));
  }

  let code = u16::from_be_bytes(body[0..2].try_into().unwrap());
  let length = u16::from_be_bytes(body[2..4].try_into().unwrap()) as usize;
  let payload = body[4..].to_vec();
  if payload.len() != length {
    return Err(Error::Protocol("BSL frame length field does not match payload size".into()));
  }
  let cmd = BslCmd::from_code(code).ok_or_else(|| Error::Protocol(format!("unknown BSL command code {code:#06x}")))?;
  Ok(DecodedFrame { cmd, payload })
}

pub struct FdlClient {
  transport: DeviceTransport,
  timeout: Duration,
  consecutive_framing_errors: u32,
}

impl FdlClient {
  pub fn new(transport: impl Into<DeviceTransport>, timeout: Duration) -> Self {
    Self { transport: transport.into(), timeout, consecutive_framing_errors: 0 }
  }

  fn send_frame(&mut self, cmd: BslCmd, payload: &[u8]) -> Result<()> {
    self.transport.send_all(&encode_frame(cmd, payload), self.timeout)
  }

  /// Read one complete frame off the wire, scanning for the closing flag
  /// byte. Three consecutive framing-level errors kill the session (spec
  /// §4.6).
  fn recv_frame(&mut self) -> Result<DecodedFrame> {
    let mut raw = vec![0u8; 1];
    self.transport.recv_exact(&mut raw, self.timeout)?;
    if raw[0] != FLAG {
      return Err(Error::Protocol("expected BSL frame to start with flag byte".into()));
    }
    loop {
      let mut byte = [0u8; 1];
      self.transport.recv_exact(&mut byte, self.timeout)?;
      raw.push(byte[0]);
      if byte[0] == FLAG && raw.len() > 1 {
        break;
      }
    }

    match decode_frame(&raw) {
      Ok(frame) => {
        self.consecutive_framing_errors = 0;
        Ok(frame)
      }
      Err(err) => {
        self.consecutive_framing_errors += 1;
        if self.consecutive_framing_errors >= 3 {
          return Err(Error::Protocol("three consecutive BSL framing errors, session dead".into()));
        }
        Err(err)
      }
    }
  }

  fn expect_ack(&mut self) -> Result<()> {
    let frame = self.recv_frame()?;
    match frame.cmd {
      BslCmd::Ack => Ok(()),
      BslCmd::Nack => Err(Error::Device("BSL_REP_OPERATION_FAILED".into())),
      other => Err(Error::Protocol(format!("expected ACK, got {other:?}"))),
    }
  }

  pub fn connect(&mut self) -> Result<()> {
    self.send_frame(BslCmd::Connect, &[])?;
    self.expect_ack()
  }

  fn start_data(&mut self, addr: u32, size: u32) -> Result<()> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&addr.to_be_bytes());
    payload.extend_from_slice(&size.to_be_bytes());
    self.send_frame(BslCmd::StartData, &payload)?;
    self.expect_ack()
  }

  fn midst_data(&mut self, chunk: &[u8]) -> Result<()> {
    self.send_frame(BslCmd::MidstData, chunk)?;
    self.expect_ack()
  }

  fn end_data(&mut self) -> Result<()> {
    self.send_frame(BslCmd::EndData, &[])?;
    self.expect_ack()
  }

  fn exec_data(&mut self) -> Result<()> {
    // no reply is expected; the stage begins executing immediately.
    self.send_frame(BslCmd::ExecData, &[])
  }

  /// Upload one FDL stage: connect, start, stream in ≤2 KiB MIDST packets,
  /// end, exec. The caller is expected to rehandshake between FDL1 and
  /// FDL2 (spec §4.6 step 6).
  pub fn upload_stage(&mut self, addr: u32, data: &[u8], cancel: &CancelToken) -> Result<()> {
    self.connect()?;
    self.start_data(addr, data.len() as u32)?;
    for chunk in data.chunks(MIDST_CHUNK_MAX) {
      cancel.check()?;
      self.midst_data(chunk)?;
    }
    self.end_data()?;
    self.exec_data()
  }

  /// Drive the full two-stage upload for a chip record: FDL1, then
  /// (after the caller rehandshakes the transport) FDL2.
  pub fn upload_fdl1(&mut self, chip: &SprdChipRecord, fdl1: &[u8], cancel: &CancelToken) -> Result<()> {
    self.upload_stage(chip.fdl1_addr, fdl1, cancel)
  }

  pub fn upload_fdl2(&mut self, chip: &SprdChipRecord, fdl2: &[u8], cancel: &CancelToken) -> Result<()> {
    self.upload_stage(chip.fdl2_addr, fdl2, cancel)
  }

  pub fn read_chip_type(&mut self) -> Result<u32> {
    self.send_frame(BslCmd::ReadChipType, &[])?;
    let frame = self.recv_frame()?;
    if frame.payload.len() != 4 {
      return Err(Error::Protocol("READ_CHIP_TYPE reply is not 4 bytes".into()));
    }
    Ok(u32::from_be_bytes(frame.payload.try_into().unwrap()))
  }

  pub fn read_flash(&mut self, partition: &str, offset: u64, length: u64, cancel: &CancelToken) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(partition.len() as u16).to_be_bytes());
    payload.extend_from_slice(partition.as_bytes());
    payload.extend_from_slice(&offset.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    self.send_frame(BslCmd::ReadFlash, &payload)?;

    let mut out = Vec::with_capacity(length as usize);
    while (out.len() as u64) < length {
      cancel.check()?;
      let frame = self.recv_frame()?;
      if frame.cmd == BslCmd::Nack {
        return Err(Error::Device("BSL_REP_OPERATION_FAILED".into()));
      }
      out.extend_from_slice(&frame.payload);
    }
    Ok(out)
  }

  pub fn erase_flash(&mut self, partition: &str) -> Result<()> {
    self.send_frame(BslCmd::EraseFlash, partition.as_bytes())?;
    self.expect_ack()
  }

  /// Write a raw (already-expanded) image to `partition`: the partition
  /// name is carried in the `START_DATA` payload in place of a load
  /// address, since a flash write targets a named region rather than a
  /// RAM address the way an FDL stage upload does.
  pub fn write_partition_raw(&mut self, partition: &str, data: &[u8], cancel: &CancelToken) -> Result<()> {
    let mut start_payload = Vec::with_capacity(2 + partition.len() + 4);
    start_payload.extend_from_slice(&(partition.len() as u16).to_be_bytes());
    start_payload.extend_from_slice(partition.as_bytes());
    start_payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
    self.send_frame(BslCmd::StartData, &start_payload)?;
    self.expect_ack()?;

    for chunk in data.chunks(MIDST_CHUNK_MAX) {
      cancel.check()?;
      self.midst_data(chunk)?;
    }
    self.end_data()
  }

  pub fn read_partition_table(&mut self) -> Result<Vec<u8>> {
    self.send_frame(BslCmd::ReadPartition, &[])?;
    Ok(self.recv_frame()?.payload)
  }

  pub fn repartition(&mut self, table: &[u8]) -> Result<()> {
    self.send_frame(BslCmd::Repartition, table)?;
    self.expect_ack()
  }

  pub fn power_off(&mut self) -> Result<()> {
    self.send_frame(BslCmd::PowerOff, &[])
  }

  pub fn normal_reset(&mut self) -> Result<()> {
    self.send_frame(BslCmd::NormalReset, &[])
  }

  pub fn read_nv(&mut self, id: u16) -> Result<Vec<u8>> {
    self.send_frame(BslCmd::ReadNv, &id.to_be_bytes())?;
    Ok(self.recv_frame()?.payload)
  }

  pub fn write_nv(&mut self, id: u16, data: &[u8]) -> Result<()> {
    let mut payload = id.to_be_bytes().to_vec();
    payload.extend_from_slice(data);
    self.send_frame(BslCmd::WriteNv, &payload)?;
    self.expect_ack()
  }

  pub fn disconnect(self) {
    self.transport.disconnect();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_round_trips_with_flag_bytes_in_payload() {
    let payload = vec![0x7E, 0x01, 0x7D, 0x02];
    let frame = encode_frame(BslCmd::MidstData, &payload);
    assert_eq!(frame[0], FLAG);
    assert_eq!(*frame.last().unwrap(), FLAG);
    let decoded = decode_frame(&frame).unwrap();
    assert_eq!(decoded.cmd, BslCmd::MidstData);
    assert_eq!(decoded.payload, payload);
  }

  #[test]
  fn corrupted_crc_is_rejected() {
    let mut frame = encode_frame(BslCmd::Connect, &[]);
    let len = frame.len();
    frame[len - 2] ^= 0xFF;
    assert!(decode_frame(&frame).is_err());
  }

  #[test]
  fn stuffing_is_reversible() {
    let original = vec![0x7E, 0x7D, 0x00, 0x7E, 0x7D, 0x7D];
    let stuffed = stuff(&original);
    assert!(!stuffed.contains(&FLAG));
    assert_eq!(unstuff(&stuffed).unwrap(), original);
  }
}
