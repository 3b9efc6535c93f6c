//! Spreadtrum/Unisoc FDL loader (spec §4.6): HDLC-framed two-stage
//! bootloader upload, the PAC firmware-package format, and Sparse-image
//! preprocessing before a partition write.

pub mod chips;
pub mod fdl;
pub mod pac;

pub use chips::SprdChipRecord;
pub use fdl::{BslCmd, FdlClient};
pub use pac::{FirmwareConfig, PacArchive, PacFileEntry, PacHeader};

use crate::error::Result;
use crate::progress::CancelToken;
use crate::sparse::SparseImage;

/// Write `image` to `partition` through an FDL2 session, transparently
/// expanding it first if it is Sparse — FDL has no concept of sparse
/// chunk boundaries, so the raw stream is what goes on the wire (spec
/// §4.6 "Sparse passthrough").
pub fn write_partition_image(
  client: &mut FdlClient,
  partition: &str,
  image: &[u8],
  cancel: &CancelToken,
) -> Result<()> {
  let raw = match SparseImage::parse(image) {
    Ok(sparse) => sparse.to_raw()?,
    Err(_) => image.to_vec(),
  };
  client.write_partition_raw(partition, &raw, cancel)
}
