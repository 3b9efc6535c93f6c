//! Linux host udev permission setup, generalized from the teacher's
//! single-device `setup_host_linux` into one rules file covering every
//! VID/PID family this crate talks to (fastboot, MediaTek BROM/Preloader,
//! Spreadtrum BSL/FDL).
//!
//! Not exercised on non-Linux hosts; `rusb`/`serialport` handle permissions
//! through the OS driver model there instead.

#[cfg(target_os = "linux")]
use std::{fs, path::PathBuf, process::Command};

use crate::error::Result;

/// A single `idVendor`/`idProduct` pair to grant the current user
/// read/write access to.
#[derive(Debug, Clone, Copy)]
pub struct UsbRule {
  pub vendor_id: u16,
  pub product_id: u16,
  pub label: &'static str,
}

/// The VID/PID families this crate needs host permission for: fastboot
/// (Google's shared VID with the standard fastboot PID), MediaTek BROM and
/// Preloader, and Spreadtrum's BSL/FDL boot ROM port.
pub const KNOWN_RULES: &[UsbRule] = &[
  UsbRule { vendor_id: 0x18d1, product_id: 0x4ee0, label: "fastboot" },
  UsbRule { vendor_id: 0x0e8d, product_id: 0x0003, label: "mtk-brom" },
  UsbRule { vendor_id: 0x0e8d, product_id: 0x2000, label: "mtk-preloader" },
  UsbRule { vendor_id: 0x1782, product_id: 0x4d00, label: "sprd-bootrom" },
];

#[cfg(target_os = "linux")]
pub fn setup_host_linux(rules: &[UsbRule]) -> Result<()> {
  let rules_path = PathBuf::from("/etc/udev/rules.d/98-flashkit.rules");

  let username = whoami::username()?;
  let mut rules_content = String::new();
  for rule in rules {
    rules_content.push_str(&format!(
      "SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{:04x}\", ATTRS{{idProduct}}==\"{:04x}\", OWNER=\"{}\", MODE=\"0666\" # {}\n",
      rule.vendor_id, rule.product_id, username, rule.label
    ));
  }

  let temp_dir = std::env::temp_dir();
  let temp_file_path = temp_dir.join("98-flashkit.rules");
  fs::write(&temp_file_path, &rules_content)?;
  tracing::debug!("created temporary rules file at: {}", temp_file_path.display());

  let pkexec_result = Command::new("pkexec")
    .args(["cp", &temp_file_path.to_string_lossy(), &rules_path.to_string_lossy()])
    .status();

  if let Ok(status) = pkexec_result {
    if status.success() {
      tracing::debug!("successfully installed udev rules using polkit");
      let reload_result = Command::new("pkexec")
        .args(["udevadm", "control", "--reload-rules"])
        .status();

      if let Ok(status) = reload_result {
        if status.success() {
          let _ = Command::new("pkexec").args(["udevadm", "trigger"]).status()?;

          tracing::info!("successfully activated udev rules. device should now be accessible.");
          let _ = fs::remove_file(&temp_file_path);
          return Ok(());
        }
      }

      tracing::warn!("installed rules but failed to reload automatically. please run:");
      tracing::warn!("  sudo udevadm control --reload-rules && sudo udevadm trigger");
    } else {
      tracing::warn!("polkit authentication failed or was canceled");
    }
  } else {
    tracing::warn!("failed to execute pkexec - polkit might not be available");
  }

  tracing::info!("to install the rules manually, run the following commands:");
  tracing::info!("  sudo cp {} /etc/udev/rules.d/", temp_file_path.display());
  tracing::info!("  sudo udevadm control --reload-rules && sudo udevadm trigger");

  Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn setup_host_linux(_rules: &[UsbRule]) -> Result<()> {
  Ok(())
}
