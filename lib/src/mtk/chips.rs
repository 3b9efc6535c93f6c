//! Static chip lookup table, grounded on the teacher's `lazy_static!
//! HashMap` pattern for `SUPERBIRD_PARTITIONS` — generalized from one fixed
//! device to a table keyed by MediaTek's `HW_CODE`.

use lazy_static::lazy_static;
use std::collections::HashMap;

/// Per-chip metadata needed to drive the BROM exploit path and the DA1
/// hand-off (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct ChipRecord {
  pub hw_code: u16,
  pub name: &'static str,
  /// Load address for a BROM-stage exploit payload, when one is known.
  pub exploit_payload_addr: Option<u32>,
  /// Whether this chip's BROM enforces secure-boot checks that the normal
  /// `SEND_DA`/`JUMP_DA` path cannot bypass.
  pub requires_exploit: bool,
}

lazy_static! {
  pub static ref CHIPS: HashMap<u16, ChipRecord> = {
    let mut m = HashMap::new();
    for chip in KNOWN_CHIPS {
      m.insert(chip.hw_code, *chip);
    }
    m
  };
}

pub const KNOWN_CHIPS: &[ChipRecord] = &[
  ChipRecord { hw_code: 0x6572, name: "MT6572", exploit_payload_addr: None, requires_exploit: false },
  ChipRecord { hw_code: 0x6580, name: "MT6580", exploit_payload_addr: None, requires_exploit: false },
  ChipRecord { hw_code: 0x6735, name: "MT6735", exploit_payload_addr: Some(0x10_0000), requires_exploit: true },
  ChipRecord { hw_code: 0x6765, name: "MT6765", exploit_payload_addr: Some(0x10_0000), requires_exploit: true },
  ChipRecord { hw_code: 0x6768, name: "MT6768", exploit_payload_addr: Some(0x10_0000), requires_exploit: true },
  ChipRecord { hw_code: 0x6785, name: "MT6785", exploit_payload_addr: Some(0x20_0000), requires_exploit: true },
];

pub fn lookup(hw_code: u16) -> Option<ChipRecord> {
  CHIPS.get(&hw_code).copied()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn looks_up_known_chip() {
    let chip = lookup(0x6572).unwrap();
    assert_eq!(chip.name, "MT6572");
    assert!(!chip.requires_exploit);
  }

  #[test]
  fn unknown_hw_code_returns_none() {
    assert!(lookup(0xFFFF).is_none());
  }
}
