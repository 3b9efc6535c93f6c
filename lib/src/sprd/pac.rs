//! Spreadtrum PAC firmware-package parser (spec §4.6/§3).
//!
//! Fixed 2124-byte header, followed by a file table of 2580-byte entries.
//! Each entry names a file inside the package by a UTF-16LE string; files
//! may be GZIP-wrapped. One entry is conventionally an embedded `.xml`
//! config naming FDL1/FDL2 and the per-partition flash policy, parsed here
//! with the same minimal line-oriented approach as [`crate::mtk::da`]
//! rather than pulling in a full XML parser for one small fragment.

use std::convert::TryInto;
use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

const HEADER_SIZE: usize = 2124;
const ENTRY_SIZE: usize = 2580;
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, Clone)]
pub struct PacHeader {
  pub product_name: String,
  pub firmware_name: String,
  pub version: String,
  pub file_count: u32,
  pub file_table_offset: u32,
  pub pac_size: u32,
}

#[derive(Debug, Clone)]
pub struct PacFileEntry {
  pub file_name: String,
  pub partition_name: String,
  pub offset_in_pac: u32,
  pub compressed_size: u32,
  pub uncompressed_size: u32,
  pub load_address: u32,
  pub file_type: u32,
}

pub struct PacArchive<'a> {
  pub header: PacHeader,
  pub entries: Vec<PacFileEntry>,
  data: &'a [u8],
}

fn read_utf16le(bytes: &[u8]) -> String {
  let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
  let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
  String::from_utf16_lossy(&units[..end])
}

impl<'a> PacArchive<'a> {
  pub fn parse(data: &'a [u8]) -> Result<Self> {
    if data.len() < HEADER_SIZE {
      return Err(Error::Format("PAC file shorter than fixed header".into()));
    }
    let header = parse_header(&data[0..HEADER_SIZE])?;

    let table_start = header.file_table_offset as usize;
    let mut entries = Vec::with_capacity(header.file_count as usize);
    for i in 0..header.file_count as usize {
      let entry_start = table_start + i * ENTRY_SIZE;
      if entry_start + ENTRY_SIZE > data.len() {
        return Err(Error::Format("PAC file table entry out of bounds".into()));
      }
      entries.push(parse_entry(&data[entry_start..entry_start + ENTRY_SIZE])?);
    }

    Ok(Self { header, entries, data })
  }

  /// Return the raw (still possibly GZIP-wrapped) bytes for `entry`.
  fn raw_file_bytes(&self, entry: &PacFileEntry) -> Result<&'a [u8]> {
    let start = entry.offset_in_pac as usize;
    let end = start + entry.compressed_size as usize;
    self.data.get(start..end).ok_or_else(|| Error::Format("PAC file entry data out of bounds".into()))
  }

  /// Read and, if GZIP-wrapped, decompress one file's contents.
  pub fn read_file(&self, entry: &PacFileEntry) -> Result<Vec<u8>> {
    let raw = self.raw_file_bytes(entry)?;
    if raw.len() >= 2 && raw[0..2] == GZIP_MAGIC {
      let mut decoder = GzDecoder::new(raw);
      let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
      decoder.read_to_end(&mut out)?;
      Ok(out)
    } else {
      Ok(raw.to_vec())
    }
  }

  pub fn find(&self, file_name: &str) -> Option<&PacFileEntry> {
    self.entries.iter().find(|e| e.file_name.eq_ignore_ascii_case(file_name))
  }

  /// Locate the embedded `.xml` config and parse FDL names/addresses and
  /// the per-partition flash policy out of it.
  pub fn firmware_config(&self) -> Result<FirmwareConfig> {
    let xml_entry = self
      .entries
      .iter()
      .find(|e| e.file_name.to_ascii_lowercase().ends_with(".xml"))
      .ok_or_else(|| Error::Format("PAC package has no embedded .xml config".into()))?;
    let xml = String::from_utf8(self.read_file(xml_entry)?)?;
    parse_firmware_config(&xml)
  }
}

fn parse_header(bytes: &[u8]) -> Result<PacHeader> {
  // Layout (offsets chosen per the format's documented field order):
  // product_name: UTF-16LE[0..256), firmware_name: UTF-16LE[256..512),
  // version: UTF-16LE[512..768), file_count: u32 @2100, file_table_offset: u32 @2104,
  // pac_size: u32 @2108, crc: u32 @2120 (unchecked here, verified by the caller if needed).
  Ok(PacHeader {
    product_name: read_utf16le(&bytes[0..256]),
    firmware_name: read_utf16le(&bytes[256..512]),
    version: read_utf16le(&bytes[512..768]),
    file_count: u32::from_le_bytes(bytes[2100..2104].try_into()?),
    file_table_offset: u32::from_le_bytes(bytes[2104..2108].try_into()?),
    pac_size: u32::from_le_bytes(bytes[2108..2112].try_into()?),
  })
}

fn parse_entry(bytes: &[u8]) -> Result<PacFileEntry> {
  // file_name: UTF-16LE[0..512), partition_name: UTF-16LE[512..592),
  // offset_in_pac: u32 @2520, compressed_size: u32 @2524, uncompressed_size: u32 @2528,
  // load_address: u32 @2536, file_type: u32 @2560.
  Ok(PacFileEntry {
    file_name: read_utf16le(&bytes[0..512]),
    partition_name: read_utf16le(&bytes[512..592]),
    offset_in_pac: u32::from_le_bytes(bytes[2520..2524].try_into()?),
    compressed_size: u32::from_le_bytes(bytes[2524..2528].try_into()?),
    uncompressed_size: u32::from_le_bytes(bytes[2528..2532].try_into()?),
    load_address: u32::from_le_bytes(bytes[2536..2540].try_into()?),
    file_type: u32::from_le_bytes(bytes[2560..2564].try_into()?),
  })
}

#[derive(Debug, Clone, Default)]
pub struct FirmwareConfig {
  pub fdl1_file: Option<String>,
  pub fdl1_addr: Option<u32>,
  pub fdl2_file: Option<String>,
  pub fdl2_addr: Option<u32>,
  /// Per-partition flash policy: partition name -> whether it's sparse.
  pub partition_is_sparse: std::collections::BTreeMap<String, bool>,
}

/// Minimal tag-value scan of the embedded config: this is not a general
/// XML parser, just enough to pull `<File ID="FDL1" ...>` style attributes
/// out of the small fragment MediaTek-style PAC configs actually carry.
fn parse_firmware_config(xml: &str) -> Result<FirmwareConfig> {
  let mut config = FirmwareConfig::default();
  for line in xml.lines() {
    let line = line.trim();
    if line.contains("FDL1") {
      config.fdl1_file = extract_attr(line, "Name");
      config.fdl1_addr = extract_attr(line, "Addr").and_then(|s| parse_hex_or_dec(&s));
    } else if line.contains("FDL2") {
      config.fdl2_file = extract_attr(line, "Name");
      config.fdl2_addr = extract_attr(line, "Addr").and_then(|s| parse_hex_or_dec(&s));
    } else if let Some(partition) = extract_attr(line, "Partition") {
      let sparse = extract_attr(line, "Sparse").map(|s| s == "1" || s.eq_ignore_ascii_case("true")).unwrap_or(false);
      config.partition_is_sparse.insert(partition, sparse);
    }
  }
  Ok(config)
}

fn extract_attr(line: &str, key: &str) -> Option<String> {
  let needle = format!("{key}=\"");
  let start = line.find(&needle)? + needle.len();
  let end = line[start..].find('"')? + start;
  Some(line[start..end].to_string())
}

fn parse_hex_or_dec(s: &str) -> Option<u32> {
  if let Some(stripped) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
    u32::from_str_radix(stripped, 16).ok()
  } else {
    s.parse().ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extracts_quoted_attribute() {
    let line = r#"<File ID="FDL1" Name="fdl1.bin" Addr="0x40000000"/>"#;
    assert_eq!(extract_attr(line, "Name"), Some("fdl1.bin".into()));
    assert_eq!(parse_hex_or_dec(&extract_attr(line, "Addr").unwrap()), Some(0x4000_0000));
  }

  #[test]
  fn parses_firmware_config_fragment() {
    let xml = concat!(
      "<File ID=\"FDL1\" Name=\"fdl1.bin\" Addr=\"0x40000000\"/>\n",
      "<File ID=\"FDL2\" Name=\"fdl2.bin\" Addr=\"0x9EFFFE00\"/>\n",
      "<Partition Partition=\"boot\" Sparse=\"0\"/>\n",
    );
    let config = parse_firmware_config(xml).unwrap();
    assert_eq!(config.fdl1_file.as_deref(), Some("fdl1.bin"));
    assert_eq!(config.fdl2_addr, Some(0x9EFF_FE00));
    assert_eq!(config.partition_is_sparse.get("boot"), Some(&false));
  }
}
