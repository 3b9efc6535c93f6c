//! MediaTek Download-Agent XML client: runs over the same transport after
//! DA1 has been jumped to. Line-oriented XML request/response with
//! length-prefixed data frames for payload transfer (spec §4.5).

use std::time::Duration;

use crate::error::{Error, Result};
use crate::progress::{CancelToken, Event, ProgressTracker};
use crate::transport::DeviceTransport;

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PACKET_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaState {
  Disconnected,
  HandshakeOk,
  Da1Uploaded,
  Da1Ready,
  Da2Uploaded,
  Operational,
  Failed,
}

#[derive(Debug, Clone)]
pub struct PartitionEntry {
  pub name: String,
  pub start_sector: u64,
  pub sector_count: u64,
  pub attributes: u64,
}

impl PartitionEntry {
  pub fn byte_len(&self, block_size: u64) -> u64 {
    self.sector_count * block_size
  }
}

pub struct DaClient {
  transport: DeviceTransport,
  state: DaState,
  packet_len: usize,
  block_size: u64,
  listener: Option<crate::progress::Callback>,
}

impl DaClient {
  /// Construct a client already past the DA1 jump (`state` starts at
  /// `Da1Uploaded`); call [`DaClient::sync`] to await DA1's `READY`.
  pub fn new(transport: DeviceTransport) -> Self {
    Self {
      transport,
      state: DaState::Da1Uploaded,
      packet_len: DEFAULT_PACKET_LEN,
      block_size: 4096,
      listener: None,
    }
  }

  pub fn set_listener(&mut self, listener: crate::progress::Callback) {
    self.listener = Some(listener);
  }

  fn emit(&self, event: Event) {
    if let Some(listener) = &self.listener {
      listener(event);
    }
  }

  pub fn state(&self) -> DaState {
    self.state
  }

  fn send_xml(&mut self, tag: &str, body: &str) -> Result<()> {
    let xml = format!("<{tag}>{body}</{tag}>\n");
    self.transport.send_all(xml.as_bytes(), SYNC_TIMEOUT)
  }

  /// Read one newline-terminated XML line.
  fn recv_xml_line(&mut self, timeout: Duration) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
      self.transport.recv_exact(&mut byte, timeout)?;
      if byte[0] == b'\n' {
        break;
      }
      buf.push(byte[0]);
    }
    Ok(String::from_utf8(buf)?)
  }

  /// Await DA1's `READY` sync, then send the runtime parameters block.
  pub fn sync(&mut self, storage_type: &str, emi_config: Option<&str>) -> Result<()> {
    let deadline = std::time::Instant::now() + SYNC_TIMEOUT;
    loop {
      if std::time::Instant::now() >= deadline {
        self.state = DaState::Failed;
        return Err(Error::Protocol("DA1 did not send READY within 30s".into()));
      }
      let line = self.recv_xml_line(Duration::from_millis(500)).unwrap_or_default();
      if line.contains("READY") {
        break;
      }
    }

    let mut body = format!("<storage>{storage_type}</storage>");
    if let Some(emi) = emi_config {
      body.push_str(&format!("<emi>{emi}</emi>"));
    }
    self.send_xml("runtime_parameters", &body)?;
    self.state = DaState::Da1Ready;
    Ok(())
  }

  /// Upload DA2 through DA1's XML channel via `boot_to`.
  pub fn boot_to(&mut self, da2: &[u8], addr: u32, cancel: &CancelToken) -> Result<()> {
    self.send_xml("boot_to", &format!("<addr>{addr:#x}</addr><length>{}</length>", da2.len()))?;
    self.stream_data(da2, cancel)?;
    self.state = DaState::Da2Uploaded;
    self.state = DaState::Operational;
    Ok(())
  }

  fn require_operational(&self) -> Result<()> {
    if self.state != DaState::Operational {
      return Err(Error::Protocol(format!("DA command requires OPERATIONAL state, got {:?}", self.state)));
    }
    Ok(())
  }

  /// Stream `data` in `packet_len`-sized packets, ACK'd after each one.
  fn stream_data(&mut self, data: &[u8], cancel: &CancelToken) -> Result<()> {
    let mut tracker = ProgressTracker::new(data.len() as u64);
    let mut offset = 0;
    while offset < data.len() {
      cancel.check()?;
      let end = (offset + self.packet_len).min(data.len());
      self.transport.send_all(&data[offset..end], SYNC_TIMEOUT)?;
      let ack = self.recv_xml_line(SYNC_TIMEOUT)?;
      if !ack.contains("ACK") {
        return Err(Error::Device(format!("DA did not ACK data packet: {ack}")));
      }
      let sent = (end - offset) as u64;
      offset = end;
      if let Some(progress) = tracker.advance(sent, offset == data.len()) {
        self.emit(Event::Progress(progress));
      }
    }
    Ok(())
  }

  pub fn get_hw_info(&mut self) -> Result<String> {
    self.require_operational()?;
    self.send_xml("cmd", "get_hw_info")?;
    self.recv_xml_line(SYNC_TIMEOUT)
  }

  /// Parse the device's partition table response into a list of entries.
  /// Byte size of each entry is `sector_count * block_size`, where
  /// `block_size` defaults to 4096 on eMMC and is overridden for NAND
  /// devices via [`DaClient::set_block_size`].
  pub fn get_partition_table(&mut self) -> Result<Vec<PartitionEntry>> {
    self.require_operational()?;
    self.send_xml("cmd", "get_partition_table")?;
    let line = self.recv_xml_line(SYNC_TIMEOUT)?;
    parse_partition_table(&line)
  }

  pub fn set_block_size(&mut self, block_size: u64) {
    self.block_size = block_size;
  }

  pub fn block_size(&self) -> u64 {
    self.block_size
  }

  pub fn read_partition(&mut self, name: &str, offset: u64, length: u64, cancel: &CancelToken) -> Result<Vec<u8>> {
    self.require_operational()?;
    self.send_xml("cmd", &format!("read_partition<name>{name}</name><offset>{offset}</offset><length>{length}</length>"))?;

    let mut out = Vec::with_capacity(length as usize);
    let mut tracker = ProgressTracker::new(length);
    while (out.len() as u64) < length {
      cancel.check()?;
      let remaining = length - out.len() as u64;
      let chunk_len = remaining.min(self.packet_len as u64) as usize;
      let mut chunk = vec![0u8; chunk_len];
      self.transport.recv_exact(&mut chunk, SYNC_TIMEOUT)?;
      out.extend_from_slice(&chunk);
      if let Some(progress) = tracker.advance(chunk_len as u64, out.len() as u64 == length) {
        self.emit(Event::Progress(progress));
      }
    }
    Ok(out)
  }

  pub fn write_partition(&mut self, name: &str, data: &[u8], cancel: &CancelToken) -> Result<()> {
    self.require_operational()?;
    self.send_xml("cmd", &format!("write_partition<name>{name}</name><length>{}</length>", data.len()))?;
    self.stream_data(data, cancel)
  }

  pub fn format_partition(&mut self, name: &str) -> Result<()> {
    self.require_operational()?;
    self.send_xml("cmd", &format!("format_partition<name>{name}</name>"))?;
    let ack = self.recv_xml_line(SYNC_TIMEOUT)?;
    if ack.contains("FAIL") {
      return Err(Error::Device(ack));
    }
    Ok(())
  }

  /// Negotiate an optional CRC32 check on data transfers.
  pub fn set_checksum_level(&mut self, level: u8) -> Result<()> {
    self.require_operational()?;
    self.send_xml("cmd", &format!("set_checksum_level<level>{level}</level>"))
  }

  pub fn reboot(&mut self) -> Result<()> {
    self.send_xml("cmd", "reboot")?;
    self.state = DaState::Disconnected;
    Ok(())
  }

  pub fn shutdown(&mut self) -> Result<()> {
    self.send_xml("cmd", "shutdown")?;
    self.state = DaState::Disconnected;
    Ok(())
  }

  pub fn send_sign_file(&mut self, data: &[u8], cancel: &CancelToken) -> Result<()> {
    self.require_operational()?;
    self.send_xml("cmd", &format!("send_sign_file<length>{}</length>", data.len()))?;
    self.stream_data(data, cancel)
  }

  pub fn read_auth_data(&mut self) -> Result<Vec<u8>> {
    self.require_operational()?;
    self.send_xml("cmd", "read_auth_data")?;
    Ok(self.recv_xml_line(SYNC_TIMEOUT)?.into_bytes())
  }

  pub fn write_sig_data(&mut self, data: &[u8], cancel: &CancelToken) -> Result<()> {
    self.require_operational()?;
    self.send_xml("cmd", &format!("write_sig_data<length>{}</length>", data.len()))?;
    self.stream_data(data, cancel)
  }

  pub fn check_da_sla_status(&mut self) -> Result<bool> {
    self.require_operational()?;
    self.send_xml("cmd", "check_da_sla_status")?;
    Ok(self.recv_xml_line(SYNC_TIMEOUT)?.contains("unlocked"))
  }

  pub fn disconnect(self) {
    self.transport.disconnect();
  }
}

/// Parse a `<partition>name,start,count,attrs</partition>`-per-line table.
/// The wire grammar is intentionally minimal text, not full XML parsing,
/// matching the "line-oriented" framing the protocol describes.
fn parse_partition_table(line: &str) -> Result<Vec<PartitionEntry>> {
  let mut entries = Vec::new();
  for part in line.split(';').filter(|s| !s.trim().is_empty()) {
    let fields: Vec<&str> = part.trim().split(',').collect();
    if fields.len() != 4 {
      return Err(Error::Protocol(format!("malformed partition table entry {part:?}")));
    }
    if fields[0].len() > 36 {
      return Err(Error::Protocol(format!("partition name {:?} exceeds 36 bytes", fields[0])));
    }
    entries.push(PartitionEntry {
      name: fields[0].to_string(),
      start_sector: fields[1].parse().map_err(|_| Error::Protocol("bad start_sector".into()))?,
      sector_count: fields[2].parse().map_err(|_| Error::Protocol("bad sector_count".into()))?,
      attributes: fields[3].parse().map_err(|_| Error::Protocol("bad attributes".into()))?,
    });
  }
  Ok(entries)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_partition_table_line() {
    let entries = parse_partition_table("boot,0,8192,0;recovery,8192,16384,0").unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "boot");
    assert_eq!(entries[1].byte_len(512), 16384 * 512);
  }

  #[test]
  fn rejects_overlong_partition_name() {
    let long_name = "a".repeat(40);
    let line = format!("{long_name},0,1,0");
    assert!(parse_partition_table(&line).is_err());
  }
}
