//! `payload.bin` header and manifest decode (spec §3/§4.7).

use crate::error::{Error, Result};
use crate::ota::protobuf::{iter_fields, FieldValue};

const MAGIC: &[u8; 4] = b"CrAU";

#[derive(Debug, Clone, Copy)]
pub struct PayloadHeader {
  pub version: u64,
  pub manifest_len: u64,
  pub metadata_signature_len: u32,
  /// 24 bytes for v2 (carries `metadata_signature_len`), 20 for v1.
  pub header_len: u64,
}

/// Parse the fixed payload header from its first 24 bytes (callers only
/// need to range-fetch 20 for v1, but 24 bytes covers both and the v1
/// case simply never reads the trailing 4).
pub fn parse_header(bytes: &[u8]) -> Result<PayloadHeader> {
  if bytes.len() < 20 || &bytes[0..4] != MAGIC {
    return Err(Error::Format("payload.bin magic mismatch, expected CrAU".into()));
  }
  let version = u64::from_be_bytes(bytes[4..12].try_into()?);
  let manifest_len = u64::from_be_bytes(bytes[12..20].try_into()?);

  if version >= 2 {
    if bytes.len() < 24 {
      return Err(Error::Format("v2 payload header shorter than 24 bytes".into()));
    }
    let metadata_signature_len = u32::from_be_bytes(bytes[20..24].try_into()?);
    Ok(PayloadHeader { version, manifest_len, metadata_signature_len, header_len: 24 })
  } else {
    Ok(PayloadHeader { version, manifest_len, metadata_signature_len: 0, header_len: 20 })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
  Replace,
  ReplaceBz,
  ReplaceXz,
  Zero,
  Other(u64),
}

impl OperationType {
  fn from_code(code: u64) -> Self {
    match code {
      0 => OperationType::Replace,
      1 => OperationType::ReplaceBz,
      6 => OperationType::Zero,
      8 => OperationType::ReplaceXz,
      other => OperationType::Other(other),
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct Extent {
  pub start_block: u64,
  pub num_blocks: u64,
}

#[derive(Debug, Clone)]
pub struct Operation {
  pub op_type: OperationType,
  pub data_offset: u64,
  pub data_length: u64,
  pub dst_extents: Vec<Extent>,
}

#[derive(Debug, Clone)]
pub struct PartitionInfo {
  pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Partition {
  pub name: String,
  pub new_partition_info: PartitionInfo,
  pub operations: Vec<Operation>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
  pub block_size: u64,
  pub partitions: Vec<Partition>,
}

/// Decode the manifest's top-level fields: `block_size` (3) and
/// `partitions` (13, repeated). Every other field number is skipped by
/// its wire type without interpretation.
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
  let mut block_size = 4096u64;
  let mut partitions = Vec::new();

  for field in iter_fields(bytes) {
    let field = field?;
    match field.number {
      3 => {
        if let Some(v) = field.value.as_varint() {
          block_size = v;
        }
      }
      13 => {
        let body = field
          .value
          .as_bytes()
          .ok_or_else(|| Error::Format("partitions field is not length-delimited".into()))?;
        partitions.push(parse_partition(body)?);
      }
      _ => {} // unknown field, already consumed by iter_fields
    }
  }

  Ok(Manifest { block_size, partitions })
}

fn parse_partition(bytes: &[u8]) -> Result<Partition> {
  let mut name = String::new();
  let mut size = 0u64;
  let mut operations = Vec::new();

  for field in iter_fields(bytes) {
    let field = field?;
    match field.number {
      1 => {
        if let Some(b) = field.value.as_bytes() {
          name = String::from_utf8(b.to_vec())?;
        }
      }
      7 => {
        let body = field.value.as_bytes().ok_or_else(|| Error::Format("new_partition_info not length-delimited".into()))?;
        size = parse_new_partition_info(body)?;
      }
      8 => {
        let body = field.value.as_bytes().ok_or_else(|| Error::Format("operation not length-delimited".into()))?;
        operations.push(parse_operation(body)?);
      }
      _ => {}
    }
  }

  Ok(Partition { name, new_partition_info: PartitionInfo { size }, operations })
}

fn parse_new_partition_info(bytes: &[u8]) -> Result<u64> {
  let mut size = 0u64;
  for field in iter_fields(bytes) {
    let field = field?;
    if field.number == 1 {
      if let Some(v) = field.value.as_varint() {
        size = v;
      }
    }
  }
  Ok(size)
}

fn parse_operation(bytes: &[u8]) -> Result<Operation> {
  let mut op_type = OperationType::Replace;
  let mut data_offset = 0u64;
  let mut data_length = 0u64;
  let mut dst_extents = Vec::new();

  for field in iter_fields(bytes) {
    let field = field?;
    match field.number {
      1 => {
        if let Some(v) = field.value.as_varint() {
          op_type = OperationType::from_code(v);
        }
      }
      2 => {
        if let Some(v) = field.value.as_varint() {
          data_offset = v;
        }
      }
      3 => {
        if let Some(v) = field.value.as_varint() {
          data_length = v;
        }
      }
      6 => {
        let body = field.value.as_bytes().ok_or_else(|| Error::Format("dst_extents not length-delimited".into()))?;
        dst_extents.push(parse_extent(body)?);
      }
      _ => {}
    }
  }

  Ok(Operation { op_type, data_offset, data_length, dst_extents })
}

fn parse_extent(bytes: &[u8]) -> Result<Extent> {
  let mut start_block = 0u64;
  let mut num_blocks = 0u64;
  for field in iter_fields(bytes) {
    let field = field?;
    match field.number {
      1 => {
        if let FieldValue::Varint(v) = field.value {
          start_block = v;
        }
      }
      2 => {
        if let FieldValue::Varint(v) = field.value {
          num_blocks = v;
        }
      }
      _ => {}
    }
  }
  Ok(Extent { start_block, num_blocks })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_v2_header() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&2u64.to_be_bytes());
    bytes.extend_from_slice(&1000u64.to_be_bytes());
    bytes.extend_from_slice(&64u32.to_be_bytes());
    let header = parse_header(&bytes).unwrap();
    assert_eq!(header.header_len, 24);
    assert_eq!(header.manifest_len, 1000);
    assert_eq!(header.metadata_signature_len, 64);
  }

  #[test]
  fn rejects_bad_magic() {
    let bytes = [0u8; 24];
    assert!(parse_header(&bytes).is_err());
  }

  #[test]
  fn zero_op_with_no_data_is_valid_operation_type() {
    let op = OperationType::from_code(6);
    assert_eq!(op, OperationType::Zero);
  }
}
