//! USB-bulk transport, grounded on the teacher's `AmlogicSoC` connection
//! logic (`lib/src/aml.rs::connect`): open the first device matching a
//! VID/PID, claim interface 0, discover the bulk IN/OUT endpoint pair from
//! the active config descriptor.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, UsbContext};

use crate::error::{Error, Result};
use crate::transport::UsbIdentity;

pub struct UsbBulkTransport {
  handle: DeviceHandle<Context>,
  interface_number: u8,
  endpoint_in: u8,
  endpoint_out: u8,
  identity: UsbIdentity,
}

impl UsbBulkTransport {
  /// Find and claim the first device matching `vendor_id`/`product_id`.
  pub fn find_first(vendor_id: u16, product_id: u16) -> Result<Self> {
    let context = Context::new()?;
    let device = context
      .devices()?
      .iter()
      .find(|device| matches_ids(device, vendor_id, product_id))
      .ok_or(Error::NotFound)?;

    Self::open(device, vendor_id, product_id)
  }

  fn open(device: Device<Context>, vendor_id: u16, product_id: u16) -> Result<Self> {
    let handle = device.open()?;
    handle.set_active_configuration(1)?;
    let interface_number: u8 = 0;
    handle.claim_interface(interface_number)?;

    let config_desc = device.active_config_descriptor()?;
    let interface = config_desc
      .interfaces()
      .find(|i| i.number() == interface_number)
      .ok_or_else(|| Error::Protocol("usb interface not found".into()))?;
    let descriptor = interface
      .descriptors()
      .next()
      .ok_or_else(|| Error::Protocol("usb interface has no alt setting".into()))?;

    let mut endpoint_in = None;
    let mut endpoint_out = None;
    for ep in descriptor.endpoint_descriptors() {
      match ep.direction() {
        Direction::In => endpoint_in = Some(ep.address()),
        Direction::Out => endpoint_out = Some(ep.address()),
      }
    }
    let endpoint_in = endpoint_in.ok_or_else(|| Error::Protocol("usb IN endpoint not found".into()))?;
    let endpoint_out = endpoint_out.ok_or_else(|| Error::Protocol("usb OUT endpoint not found".into()))?;

    tracing::info!(vendor_id, product_id, interface_number, "usb device claimed");

    Ok(Self {
      handle,
      interface_number,
      endpoint_in,
      endpoint_out,
      identity: UsbIdentity { vendor_id, product_id },
    })
  }

  pub fn identity(&self) -> UsbIdentity {
    self.identity
  }

  pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
    Ok(self.handle.write_bulk(self.endpoint_out, data, timeout)?)
  }

  pub fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    Ok(self.handle.read_bulk(self.endpoint_in, buf, timeout)?)
  }

  /// Control-transfer write (used by MediaTek BROM's vendor requests).
  pub fn write_control(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
    timeout: Duration,
  ) -> Result<usize> {
    Ok(self.handle.write_control(request_type, request, value, index, data, timeout)?)
  }

  /// Control-transfer read.
  pub fn read_control(
    &self,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    buf: &mut [u8],
    timeout: Duration,
  ) -> Result<usize> {
    Ok(self.handle.read_control(request_type, request, value, index, buf, timeout)?)
  }

  pub fn disconnect(self) {
    if let Err(err) = self.handle.release_interface(self.interface_number) {
      tracing::warn!(?err, "failed to release usb interface");
    }
  }

  /// Release the current handle and poll for a new device matching the
  /// same (or a caller-supplied different) VID/PID within `timeout`. Used
  /// after MediaTek DA1 upload causes the device to re-enumerate (spec
  /// §4.1, §4.4).
  pub fn reconnect_after_reenumeration(self, new_identity: UsbIdentity, timeout: Duration) -> Result<Self> {
    self.disconnect();

    let deadline = std::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(250);
    loop {
      let context = Context::new()?;
      if let Ok(devices) = context.devices() {
        if let Some(device) = devices
          .iter()
          .find(|device| matches_ids(device, new_identity.vendor_id, new_identity.product_id))
        {
          return Self::open(device, new_identity.vendor_id, new_identity.product_id);
        }
      }
      if std::time::Instant::now() >= deadline {
        return Err(Error::Transport(format!(
          "device did not re-enumerate within {:?}",
          timeout
        )));
      }
      std::thread::sleep(poll_interval);
    }
  }
}

fn matches_ids(device: &Device<Context>, vendor_id: u16, product_id: u16) -> bool {
  device
    .device_descriptor()
    .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
    .unwrap_or(false)
}
