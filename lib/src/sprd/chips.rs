//! Spreadtrum/Unisoc chip table, same shape as [`crate::mtk::chips`]: a
//! static lookup keyed by the chip ID the bootrom reports on connect.

use lazy_static::lazy_static;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct SprdChipRecord {
  pub chip_id: u32,
  pub name: &'static str,
  pub fdl1_addr: u32,
  pub fdl2_addr: u32,
}

lazy_static! {
  pub static ref CHIPS: HashMap<u32, SprdChipRecord> = {
    let mut m = HashMap::new();
    for chip in KNOWN_CHIPS {
      m.insert(chip.chip_id, *chip);
    }
    m
  };
}

pub const KNOWN_CHIPS: &[SprdChipRecord] = &[
  SprdChipRecord { chip_id: 0x6531, name: "SC6531E", fdl1_addr: 0x4000_0000, fdl2_addr: 0x1400_0000 },
  SprdChipRecord { chip_id: 0x9832, name: "SC9832E", fdl1_addr: 0x5000_0000, fdl2_addr: 0x9EFF_FE00 },
  SprdChipRecord { chip_id: 0x9863, name: "SC9863A", fdl1_addr: 0x5500_0000, fdl2_addr: 0x9EFF_FE00 },
];

pub fn lookup(chip_id: u32) -> Option<SprdChipRecord> {
  CHIPS.get(&chip_id).copied()
}
