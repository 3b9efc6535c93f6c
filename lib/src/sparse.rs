//! Android Sparse image codec (spec §4.3).
//!
//! A Sparse image is a 28-byte header followed by `total_chunks` chunks,
//! each a 12-byte header plus variable data. Three chunk kinds carry
//! payload (`Raw`, `Fill`, `DontCare`); a fourth (`Crc32`) is a verification
//! marker with no effect on the expanded image and is parsed but ignored.

use std::convert::TryInto;

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0xED26FF3A;
const HEADER_SIZE: usize = 28;
const CHUNK_HEADER_SIZE: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
  Raw(Vec<u8>),
  Fill([u8; 4]),
  DontCare,
  Crc32(u32),
}

/// A chunk with its declared block count (for `Fill`/`DontCare`, the block
/// count cannot be derived from the payload and must travel with it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedChunk {
  pub chunk: Chunk,
  pub blocks: u32,
}

#[derive(Debug, Clone)]
pub struct SparseImage {
  pub block_size: u32,
  pub total_blocks: u32,
  pub chunks: Vec<SizedChunk>,
}

impl SparseImage {
  /// Parse a complete in-memory Sparse image per spec §4.3's validation
  /// rules: chunk-block sum must equal the header's `total_blocks`, and
  /// each chunk's declared `total_size` must match its kind's expected
  /// size exactly.
  pub fn parse(data: &[u8]) -> Result<Self> {
    if data.len() < HEADER_SIZE {
      return Err(Error::Format("sparse image shorter than header".into()));
    }
    let magic = u32::from_le_bytes(data[0..4].try_into()?);
    if magic != MAGIC {
      return Err(Error::Format(format!("bad sparse magic {:#x}", magic)));
    }
    let major = u16::from_le_bytes(data[4..6].try_into()?);
    if major != 1 {
      return Err(Error::Format(format!("unsupported sparse major version {major}")));
    }
    let block_size = u32::from_le_bytes(data[12..16].try_into()?);
    let total_blocks = u32::from_le_bytes(data[16..20].try_into()?);
    let total_chunks = u32::from_le_bytes(data[20..24].try_into()?);

    let mut offset = HEADER_SIZE;
    let mut chunks = Vec::with_capacity(total_chunks as usize);
    let mut block_sum: u64 = 0;

    for _ in 0..total_chunks {
      if offset + CHUNK_HEADER_SIZE > data.len() {
        return Err(Error::Format("truncated sparse chunk header".into()));
      }
      let chunk_type = u16::from_le_bytes(data[offset..offset + 2].try_into()?);
      let chunk_blocks = u32::from_le_bytes(data[offset + 4..offset + 8].try_into()?);
      let total_size = u32::from_le_bytes(data[offset + 8..offset + 12].try_into()?) as usize;
      let body_start = offset + CHUNK_HEADER_SIZE;
      let body_len = total_size
        .checked_sub(CHUNK_HEADER_SIZE)
        .ok_or_else(|| Error::Format("sparse chunk total_size smaller than header".into()))?;
      if body_start + body_len > data.len() {
        return Err(Error::Format("truncated sparse chunk body".into()));
      }
      let body = &data[body_start..body_start + body_len];

      let chunk = match chunk_type {
        CHUNK_TYPE_RAW => {
          if body_len != chunk_blocks as usize * block_size as usize {
            return Err(Error::Format("RAW chunk size does not match chunk_blocks*block_size".into()));
          }
          Chunk::Raw(body.to_vec())
        }
        CHUNK_TYPE_FILL => {
          if body_len != 4 {
            return Err(Error::Format("FILL chunk body is not 4 bytes".into()));
          }
          Chunk::Fill(body.try_into()?)
        }
        CHUNK_TYPE_DONT_CARE => {
          if body_len != 0 {
            return Err(Error::Format("DONT_CARE chunk carries a body".into()));
          }
          Chunk::DontCare
        }
        CHUNK_TYPE_CRC32 => {
          if body_len != 4 {
            return Err(Error::Format("CRC32 chunk body is not 4 bytes".into()));
          }
          Chunk::Crc32(u32::from_le_bytes(body.try_into()?))
        }
        other => return Err(Error::Format(format!("unknown sparse chunk type {other:#x}"))),
      };

      block_sum += chunk_blocks as u64;
      chunks.push(SizedChunk { chunk, blocks: chunk_blocks });
      offset = body_start + body_len;
    }

    if block_sum != total_blocks as u64 {
      return Err(Error::Format(format!(
        "sparse chunk block sum {block_sum} does not equal total_blocks {total_blocks}"
      )));
    }
    if let Some(last) = chunks.last() {
      if last.blocks == 0 && !matches!(last.chunk, Chunk::Crc32(_)) {
        return Err(Error::Format("sparse image's last chunk has zero chunk_blocks".into()));
      }
    }

    Ok(Self { block_size, total_blocks, chunks })
  }

  /// Total length in bytes of the fully expanded raw image.
  pub fn raw_len(&self) -> u64 {
    self.total_blocks as u64 * self.block_size as u64
  }

  /// Random-access read of `length` raw bytes starting at `offset`,
  /// resolving each requested byte to its containing chunk without
  /// materializing the whole expansion (spec §4.3 "sparse-to-raw
  /// streaming").
  pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
    if offset + length > self.raw_len() {
      return Err(Error::Format("sparse read past end of expanded image".into()));
    }
    let mut out = Vec::with_capacity(length as usize);
    let mut remaining_skip = offset;
    let mut remaining_len = length;

    for sized in &self.chunks {
      if remaining_len == 0 {
        break;
      }
      let chunk_bytes = sized.blocks as u64 * self.block_size as u64;
      if remaining_skip >= chunk_bytes {
        remaining_skip -= chunk_bytes;
        continue;
      }
      let in_chunk_offset = remaining_skip as usize;
      let available = chunk_bytes - remaining_skip;
      let take = available.min(remaining_len) as usize;

      match &sized.chunk {
        Chunk::Raw(data) => out.extend_from_slice(&data[in_chunk_offset..in_chunk_offset + take]),
        Chunk::Fill(pattern) => {
          for i in 0..take {
            out.push(pattern[(in_chunk_offset + i) % 4]);
          }
        }
        Chunk::DontCare => out.extend(std::iter::repeat(0u8).take(take)),
        Chunk::Crc32(_) => {}
      }

      remaining_skip = 0;
      remaining_len -= take as u64;
    }
    Ok(out)
  }

  /// Expand the whole image to raw bytes.
  pub fn to_raw(&self) -> Result<Vec<u8>> {
    self.read(0, self.raw_len())
  }

  /// Serialize back to the on-wire Sparse byte layout.
  pub fn encode(&self) -> Vec<u8> {
    encode(self.block_size, self.total_blocks, &self.chunks)
  }

  /// Split this image into a sequence of standalone sub-images, each no
  /// larger than `max_bytes` on the wire, per spec §4.3's
  /// "split-for-transfer". Oversized chunks are subdivided at block
  /// boundaries; `Raw` data is sliced, `Fill`/`DontCare` are duplicated
  /// with a reduced block count.
  pub fn split_for_transfer(&self, max_bytes: usize) -> Result<Vec<Vec<u8>>> {
    if max_bytes <= HEADER_SIZE + CHUNK_HEADER_SIZE {
      return Err(Error::Format("split_for_transfer max_bytes too small to hold any chunk".into()));
    }

    let mut sub_images = Vec::new();
    let mut current: Vec<SizedChunk> = Vec::new();
    let mut current_size = HEADER_SIZE;

    let flush = |current: &mut Vec<SizedChunk>, current_size: &mut usize, out: &mut Vec<Vec<u8>>| {
      if !current.is_empty() {
        let blocks: u64 = current.iter().map(|c| c.blocks as u64).sum();
        out.push(encode(self.block_size, blocks as u32, current));
        current.clear();
        *current_size = HEADER_SIZE;
      }
    };

    for sized in &self.chunks {
      let mut remaining = sized.clone();
      loop {
        let wire_size = chunk_wire_size(&remaining.chunk);
        if current_size + wire_size <= max_bytes {
          current_size += wire_size;
          current.push(remaining);
          break;
        }
        if current_size + CHUNK_HEADER_SIZE >= max_bytes && !current.is_empty() {
          flush(&mut current, &mut current_size, &mut sub_images);
          continue;
        }

        let budget_bytes = max_bytes.saturating_sub(current_size + CHUNK_HEADER_SIZE);
        let max_fit_blocks = match &remaining.chunk {
          Chunk::Raw(_) => (budget_bytes / self.block_size as usize) as u32,
          Chunk::Fill(_) | Chunk::DontCare => u32::MAX, // fixed-size payload regardless of block count
          Chunk::Crc32(_) => 0,
        };
        let take_blocks = max_fit_blocks.min(remaining.blocks);
        if take_blocks == 0 {
          flush(&mut current, &mut current_size, &mut sub_images);
          continue;
        }

        let (head, tail) = split_sized_chunk(&remaining, take_blocks, self.block_size);
        current_size += chunk_wire_size(&head.chunk);
        current.push(head);
        match tail {
          Some(tail) => {
            remaining = tail;
            flush(&mut current, &mut current_size, &mut sub_images);
          }
          None => break,
        }
      }
    }
    flush(&mut current, &mut current_size, &mut sub_images);

    Ok(sub_images)
  }
}

fn chunk_wire_size(chunk: &Chunk) -> usize {
  CHUNK_HEADER_SIZE
    + match chunk {
      Chunk::Raw(data) => data.len(),
      Chunk::Fill(_) => 4,
      Chunk::DontCare => 0,
      Chunk::Crc32(_) => 4,
    }
}

/// Split a sized chunk at `take_blocks`, returning the head (exactly
/// `take_blocks` blocks) and, if anything remains, the tail.
fn split_sized_chunk(sized: &SizedChunk, take_blocks: u32, block_size: u32) -> (SizedChunk, Option<SizedChunk>) {
  if take_blocks >= sized.blocks {
    return (sized.clone(), None);
  }
  match &sized.chunk {
    Chunk::Raw(data) => {
      let split_at = take_blocks as usize * block_size as usize;
      let (head, tail) = data.split_at(split_at);
      (
        SizedChunk { chunk: Chunk::Raw(head.to_vec()), blocks: take_blocks },
        Some(SizedChunk {
          chunk: Chunk::Raw(tail.to_vec()),
          blocks: sized.blocks - take_blocks,
        }),
      )
    }
    Chunk::Fill(pattern) => (
      SizedChunk { chunk: Chunk::Fill(*pattern), blocks: take_blocks },
      Some(SizedChunk {
        chunk: Chunk::Fill(*pattern),
        blocks: sized.blocks - take_blocks,
      }),
    ),
    Chunk::DontCare => (
      SizedChunk { chunk: Chunk::DontCare, blocks: take_blocks },
      Some(SizedChunk {
        chunk: Chunk::DontCare,
        blocks: sized.blocks - take_blocks,
      }),
    ),
    Chunk::Crc32(crc) => (SizedChunk { chunk: Chunk::Crc32(*crc), blocks: 0 }, None),
  }
}

fn encode(block_size: u32, total_blocks: u32, chunks: &[SizedChunk]) -> Vec<u8> {
  let mut out = Vec::with_capacity(HEADER_SIZE + chunks.len() * CHUNK_HEADER_SIZE);
  out.extend_from_slice(&MAGIC.to_le_bytes());
  out.extend_from_slice(&1u16.to_le_bytes()); // major
  out.extend_from_slice(&0u16.to_le_bytes()); // minor
  out.extend_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
  out.extend_from_slice(&(CHUNK_HEADER_SIZE as u16).to_le_bytes());
  out.extend_from_slice(&block_size.to_le_bytes());
  out.extend_from_slice(&total_blocks.to_le_bytes());
  out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
  out.extend_from_slice(&0u32.to_le_bytes()); // image checksum, unused

  for sized in chunks {
    let (chunk_type, body): (u16, Vec<u8>) = match &sized.chunk {
      Chunk::Raw(data) => (CHUNK_TYPE_RAW, data.clone()),
      Chunk::Fill(pattern) => (CHUNK_TYPE_FILL, pattern.to_vec()),
      Chunk::DontCare => (CHUNK_TYPE_DONT_CARE, Vec::new()),
      Chunk::Crc32(crc) => (CHUNK_TYPE_CRC32, crc.to_le_bytes().to_vec()),
    };
    out.extend_from_slice(&chunk_type.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved
    out.extend_from_slice(&sized.blocks.to_le_bytes());
    out.extend_from_slice(&((CHUNK_HEADER_SIZE + body.len()) as u32).to_le_bytes());
    out.extend_from_slice(&body);
  }

  out
}

/// Build a Sparse image from a raw byte slice, grouping runs of identical
/// blocks into `Fill`/`DontCare` chunks and everything else into `Raw`
/// chunks. Used by [`SparseImage::parse`]'s inverse, `raw_to_sparse`.
pub fn raw_to_sparse(raw: &[u8], block_size: u32) -> Result<SparseImage> {
  if raw.len() % block_size as usize != 0 {
    return Err(Error::Format("raw image length is not a multiple of block_size".into()));
  }
  let bs = block_size as usize;
  let total_blocks = (raw.len() / bs) as u32;

  let mut chunks: Vec<SizedChunk> = Vec::new();
  let mut i = 0usize;
  while i < raw.len() {
    let block = &raw[i..i + bs];
    if block.iter().all(|&b| b == 0) {
      extend_run(&mut chunks, Chunk::DontCare, 1);
    } else if let Some(pattern) = uniform_fill_pattern(block) {
      extend_run(&mut chunks, Chunk::Fill(pattern), 1);
    } else {
      extend_run(&mut chunks, Chunk::Raw(block.to_vec()), 1);
    }
    i += bs;
  }

  Ok(SparseImage { block_size, total_blocks, chunks })
}

fn uniform_fill_pattern(block: &[u8]) -> Option<[u8; 4]> {
  if block.len() % 4 != 0 {
    return None;
  }
  let pattern: [u8; 4] = block[0..4].try_into().ok()?;
  if block.chunks(4).all(|c| c == pattern) {
    Some(pattern)
  } else {
    None
  }
}

fn extend_run(chunks: &mut Vec<SizedChunk>, chunk: Chunk, blocks: u32) {
  if let Some(last) = chunks.last_mut() {
    match (&mut last.chunk, &chunk) {
      (Chunk::DontCare, Chunk::DontCare) => {
        last.blocks += blocks;
        return;
      }
      (Chunk::Fill(a), Chunk::Fill(b)) if a == b => {
        last.blocks += blocks;
        return;
      }
      (Chunk::Raw(data), Chunk::Raw(new_data)) => {
        data.extend_from_slice(new_data);
        last.blocks += blocks;
        return;
      }
      _ => {}
    }
  }
  chunks.push(SizedChunk { chunk, blocks });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_image() -> Vec<u8> {
    let block_size = 4096u32;
    let chunks = vec![
      SizedChunk { chunk: Chunk::Raw(vec![0xAB; (2 * block_size) as usize]), blocks: 2 },
      SizedChunk { chunk: Chunk::Fill([0xEF, 0xBE, 0xAD, 0xDE]), blocks: 1000 },
      SizedChunk { chunk: Chunk::DontCare, blocks: 3 },
    ];
    encode(block_size, 1005, &chunks)
  }

  #[test]
  fn parses_sample_and_expands_correctly() {
    let raw = sample_image();
    let image = SparseImage::parse(&raw).unwrap();
    assert_eq!(image.total_blocks, 1005);
    let expanded = image.to_raw().unwrap();
    assert_eq!(expanded.len(), (2 + 1000 + 3) * 4096);
    assert_eq!(&expanded[0..8192], &[0xAB; 8192][..]);
    let fill_region = &expanded[8192..8192 + 1000 * 4096];
    assert!(fill_region.chunks(4).all(|c| c == [0xEF, 0xBE, 0xAD, 0xDE]));
    let trailing = &expanded[expanded.len() - 3 * 4096..];
    assert!(trailing.iter().all(|&b| b == 0));
  }

  #[test]
  fn rejects_block_sum_mismatch() {
    let mut raw = sample_image();
    // corrupt total_blocks in the header
    raw[16..20].copy_from_slice(&999u32.to_le_bytes());
    assert!(SparseImage::parse(&raw).is_err());
  }

  #[test]
  fn rejects_zero_block_last_chunk() {
    let block_size = 4096u32;
    let chunks = vec![
      SizedChunk { chunk: Chunk::Raw(vec![0; block_size as usize]), blocks: 1 },
      SizedChunk { chunk: Chunk::DontCare, blocks: 0 },
    ];
    let raw = encode(block_size, 1, &chunks);
    assert!(SparseImage::parse(&raw).is_err());
  }

  #[test]
  fn random_access_read_resolves_arbitrary_offset() {
    let raw = sample_image();
    let image = SparseImage::parse(&raw).unwrap();
    // read straddling the RAW/FILL boundary
    let slice = image.read(8190, 10).unwrap();
    assert_eq!(&slice[0..2], &[0xAB, 0xAB]);
    assert_eq!(&slice[2..6], &[0xEF, 0xBE, 0xAD, 0xDE]);
  }

  #[test]
  fn split_for_transfer_respects_max_bytes_and_reassembles() {
    let raw = sample_image();
    let image = SparseImage::parse(&raw).unwrap();
    let max_bytes = HEADER_SIZE + CHUNK_HEADER_SIZE + 4096; // room for one RAW block at a time
    let parts = image.split_for_transfer(max_bytes).unwrap();
    assert!(parts.len() > 1);
    for part in &parts {
      assert!(part.len() <= max_bytes);
      SparseImage::parse(part).unwrap();
    }

    let mut reassembled = Vec::new();
    for part in &parts {
      reassembled.extend(SparseImage::parse(part).unwrap().to_raw().unwrap());
    }
    assert_eq!(reassembled, image.to_raw().unwrap());
  }

  #[test]
  fn raw_to_sparse_round_trips_through_sparse_to_raw() {
    let block_size = 4096u32;
    let mut raw = vec![0u8; block_size as usize * 3];
    raw[block_size as usize..2 * block_size as usize].fill(0x7A);
    let sparse = raw_to_sparse(&raw, block_size).unwrap();
    assert_eq!(sparse.to_raw().unwrap(), raw);
  }
}
