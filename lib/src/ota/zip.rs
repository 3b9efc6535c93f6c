//! Remote ZIP/ZIP64 central-directory walk to locate `payload.bin` without
//! downloading the archive (spec §4.7).

use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::ota::range::RangeReader;

const EOCD_SIG: u32 = 0x0605_4B50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4B50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4B50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4B50;
const LOCAL_HEADER_SIG: u32 = 0x0403_4B50;

const EOCD_SEARCH_WINDOW: u64 = 64 * 1024;
const METHOD_STORED: u16 = 0;

/// Located `payload.bin` member: the absolute offset of its (already
/// stored, uncompressed) data, and its size.
#[derive(Debug, Clone, Copy)]
pub struct PayloadLocation {
  pub data_offset: u64,
  pub size: u64,
}

struct CentralDirectoryPointer {
  offset: u64,
  size: u64,
}

/// Walk the ZIP structure of `reader`'s resource and return the byte
/// range of its `payload.bin` member.
pub async fn locate_payload_bin(reader: &RangeReader) -> Result<PayloadLocation> {
  let tail = reader.read_tail(EOCD_SEARCH_WINDOW).await?;
  let eocd_pos = find_signature_backwards(&tail, EOCD_SIG)
    .ok_or_else(|| Error::Format("EOCD signature not found in last 64KiB".into()))?;

  let cd_ptr = match zip64_locator_offset(&tail, eocd_pos)? {
    Some(zip64_eocd_offset) => {
      let record = reader.read_range(zip64_eocd_offset, zip64_eocd_offset + 56).await?;
      if record.len() < 56 || u32::from_le_bytes(record[0..4].try_into()?) != ZIP64_EOCD_SIG {
        return Err(Error::Format("ZIP64 EOCD signature mismatch".into()));
      }
      CentralDirectoryPointer {
        size: u64::from_le_bytes(record[40..48].try_into()?),
        offset: u64::from_le_bytes(record[48..56].try_into()?),
      }
    }
    None => {
      let eocd = &tail[eocd_pos..];
      if eocd.len() < 22 {
        return Err(Error::Format("truncated EOCD record".into()));
      }
      CentralDirectoryPointer {
        offset: u32::from_le_bytes(eocd[16..20].try_into()?) as u64,
        size: u32::from_le_bytes(eocd[12..16].try_into()?) as u64,
      }
    }
  };

  let central_directory = reader.read_range(cd_ptr.offset, cd_ptr.offset + cd_ptr.size).await?;
  let entry = find_payload_entry(&central_directory)?
    .ok_or_else(|| Error::Format("payload.bin not found in ZIP central directory".into()))?;

  if entry.compression_method != METHOD_STORED {
    return Err(Error::UnsupportedFeature("unsupported compression on payload.bin".into()));
  }

  let local_header = reader.read_range(entry.local_header_offset, entry.local_header_offset + 30).await?;
  if local_header.len() < 30 || u32::from_le_bytes(local_header[0..4].try_into()?) != LOCAL_HEADER_SIG {
    return Err(Error::Format("local file header signature mismatch".into()));
  }
  let filename_len = u16::from_le_bytes(local_header[26..28].try_into()?) as u64;
  let extra_len = u16::from_le_bytes(local_header[28..30].try_into()?) as u64;
  let data_offset = entry.local_header_offset + 30 + filename_len + extra_len;

  Ok(PayloadLocation { data_offset, size: entry.uncompressed_size })
}

fn find_signature_backwards(buf: &[u8], sig: u32) -> Option<usize> {
  let needle = sig.to_le_bytes();
  if buf.len() < 4 {
    return None;
  }
  (0..=buf.len() - 4).rev().find(|&i| buf[i..i + 4] == needle)
}

/// If a ZIP64 end-of-central-directory locator immediately precedes the
/// EOCD record (by the fixed 20-byte locator size), return the absolute
/// file offset of the ZIP64 EOCD record it points to.
fn zip64_locator_offset(tail: &[u8], eocd_pos: usize) -> Result<Option<u64>> {
  if eocd_pos < 20 {
    return Ok(None);
  }
  let locator = &tail[eocd_pos - 20..eocd_pos];
  if u32::from_le_bytes(locator[0..4].try_into()?) != ZIP64_LOCATOR_SIG {
    return Ok(None);
  }
  Ok(Some(u64::from_le_bytes(locator[8..16].try_into()?)))
}

struct CentralDirEntry {
  compression_method: u16,
  uncompressed_size: u64,
  local_header_offset: u64,
  file_name: String,
}

fn find_payload_entry(central_directory: &[u8]) -> Result<Option<CentralDirEntry>> {
  let mut offset = 0usize;
  while offset + 46 <= central_directory.len() {
    let sig = u32::from_le_bytes(central_directory[offset..offset + 4].try_into()?);
    if sig != CENTRAL_DIR_SIG {
      break;
    }
    let compression_method = u16::from_le_bytes(central_directory[offset + 10..offset + 12].try_into()?);
    let mut compressed_size = u32::from_le_bytes(central_directory[offset + 20..offset + 24].try_into()?) as u64;
    let mut uncompressed_size = u32::from_le_bytes(central_directory[offset + 24..offset + 28].try_into()?) as u64;
    let filename_len = u16::from_le_bytes(central_directory[offset + 28..offset + 30].try_into()?) as usize;
    let extra_len = u16::from_le_bytes(central_directory[offset + 30..offset + 32].try_into()?) as usize;
    let comment_len = u16::from_le_bytes(central_directory[offset + 32..offset + 34].try_into()?) as usize;
    let mut local_header_offset = u32::from_le_bytes(central_directory[offset + 42..offset + 46].try_into()?) as u64;

    let name_start = offset + 46;
    let name_end = name_start + filename_len;
    if name_end > central_directory.len() {
      return Err(Error::Format("central directory entry name out of bounds".into()));
    }
    let file_name = String::from_utf8_lossy(&central_directory[name_start..name_end]).into_owned();

    let extra_start = name_end;
    let extra_end = extra_start + extra_len;
    if extra_end > central_directory.len() {
      return Err(Error::Format("central directory entry extra field out of bounds".into()));
    }
    let extra = &central_directory[extra_start..extra_end];

    if compressed_size == 0xFFFF_FFFF || uncompressed_size == 0xFFFF_FFFF || local_header_offset == 0xFFFF_FFFF {
      if let Some((cs, us, lho)) = parse_zip64_extra(extra, compressed_size, uncompressed_size, local_header_offset) {
        compressed_size = cs;
        uncompressed_size = us;
        local_header_offset = lho;
      }
    }

    if file_name.eq_ignore_ascii_case("payload.bin") {
      let _ = compressed_size;
      return Ok(Some(CentralDirEntry { compression_method, uncompressed_size, local_header_offset, file_name }));
    }

    offset = extra_end + comment_len;
  }
  Ok(None)
}

/// Decode the ZIP64 extra field (tag `0x0001`): it carries, in order,
/// whichever of uncompressed size / compressed size / local header offset
/// were `0xFFFFFFFF` in the fixed-width fields.
fn parse_zip64_extra(extra: &[u8], compressed: u64, uncompressed: u64, local_offset: u64) -> Option<(u64, u64, u64)> {
  let mut i = 0;
  while i + 4 <= extra.len() {
    let tag = u16::from_le_bytes(extra[i..i + 2].try_into().ok()?);
    let size = u16::from_le_bytes(extra[i + 2..i + 4].try_into().ok()?) as usize;
    let body_start = i + 4;
    if tag == 0x0001 && body_start + size <= extra.len() {
      let body = &extra[body_start..body_start + size];
      let mut cursor = 0;
      let mut out_uncompressed = uncompressed;
      let mut out_compressed = compressed;
      let mut out_offset = local_offset;

      if uncompressed == 0xFFFF_FFFF && cursor + 8 <= body.len() {
        out_uncompressed = u64::from_le_bytes(body[cursor..cursor + 8].try_into().ok()?);
        cursor += 8;
      }
      if compressed == 0xFFFF_FFFF && cursor + 8 <= body.len() {
        out_compressed = u64::from_le_bytes(body[cursor..cursor + 8].try_into().ok()?);
        cursor += 8;
      }
      if local_offset == 0xFFFF_FFFF && cursor + 8 <= body.len() {
        out_offset = u64::from_le_bytes(body[cursor..cursor + 8].try_into().ok()?);
      }
      return Some((out_compressed, out_uncompressed, out_offset));
    }
    i = body_start + size;
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn central_dir_entry(name: &str, method: u16, comp: u32, uncomp: u32, local_offset: u32) -> Vec<u8> {
    let mut e = Vec::new();
    e.extend_from_slice(&CENTRAL_DIR_SIG.to_le_bytes());
    e.extend_from_slice(&[0u8; 6]); // version made by / needed
    e.extend_from_slice(&method.to_le_bytes());
    e.extend_from_slice(&[0u8; 4]); // mod time/date
    e.extend_from_slice(&0u32.to_le_bytes()); // crc32
    e.extend_from_slice(&comp.to_le_bytes());
    e.extend_from_slice(&uncomp.to_le_bytes());
    e.extend_from_slice(&(name.len() as u16).to_le_bytes());
    e.extend_from_slice(&0u16.to_le_bytes()); // extra len
    e.extend_from_slice(&0u16.to_le_bytes()); // comment len
    e.extend_from_slice(&0u16.to_le_bytes()); // disk number
    e.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
    e.extend_from_slice(&0u32.to_le_bytes()); // external attrs
    e.extend_from_slice(&local_offset.to_le_bytes());
    e.extend_from_slice(name.as_bytes());
    e
  }

  #[test]
  fn finds_payload_bin_case_insensitively() {
    let mut cd = central_dir_entry("metadata", METHOD_STORED, 10, 10, 0);
    cd.extend(central_dir_entry("Payload.BIN", METHOD_STORED, 500, 500, 1000));
    let entry = find_payload_entry(&cd).unwrap().unwrap();
    assert_eq!(entry.local_header_offset, 1000);
    assert_eq!(entry.uncompressed_size, 500);
  }

  #[test]
  fn rejects_deflated_payload_bin() {
    let cd = central_dir_entry("payload.bin", 8, 500, 600, 1000);
    let entry = find_payload_entry(&cd).unwrap().unwrap();
    assert_ne!(entry.compression_method, METHOD_STORED);
  }

  #[test]
  fn finds_eocd_signature_scanning_backwards() {
    let mut tail = vec![0u8; 100];
    tail[50..54].copy_from_slice(&EOCD_SIG.to_le_bytes());
    assert_eq!(find_signature_backwards(&tail, EOCD_SIG), Some(50));
  }
}
