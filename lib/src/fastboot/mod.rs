//! Fastboot protocol engine: command framing, response parsing, the
//! DATA-phase transfer state machine, and the Sparse-aware flash path.
//!
//! Grounded on the teacher's `AmlogicSoC` connection handle (`Arc`-wrapped,
//! cloneable, one claimed USB interface) and its step-by-step command
//! helpers (`bulkcmd`, `write_large_memory`) — the same per-command
//! `tracing::debug!`/timing shape is kept here for every fastboot verb.

mod wire;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::progress::{CancelToken, Event, ProgressTracker};
use crate::sparse::SparseImage;
use crate::transport::DeviceTransport;

pub use wire::Response;

const MAX_SUB_BLOCK: usize = 64 * 1024;
const GETVAR_ALL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct FastbootClient {
  transport: DeviceTransport,
  timeout: Duration,
  listener: Option<crate::progress::Callback>,
}

impl FastbootClient {
  pub fn new(transport: impl Into<DeviceTransport>) -> Self {
    Self {
      transport: transport.into(),
      timeout: Duration::from_secs(30),
      listener: None,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn set_listener(&mut self, listener: crate::progress::Callback) {
    self.listener = Some(listener);
  }

  fn emit(&self, event: Event) {
    if let Some(listener) = &self.listener {
      listener(event);
    }
  }

  /// Send a command string and collect the terminal `OKAY`/`FAIL` response,
  /// logging any `INFO`/`TEXT` lines seen along the way.
  fn command(&mut self, cmd: &str) -> Result<Response> {
    tracing::debug!(cmd, "sending fastboot command");
    self.transport.send_all(cmd.as_bytes(), self.timeout)?;
    loop {
      let response = wire::read_response(&mut self.transport, self.timeout)?;
      match &response {
        Response::Info(msg) | Response::Text(msg) => {
          tracing::info!(msg, "fastboot info");
          self.emit(Event::Log(msg.clone()));
        }
        Response::Okay(_) | Response::Fail(_) | Response::Data(_) => return Ok(response),
      }
    }
  }

  fn command_ok(&mut self, cmd: &str) -> Result<String> {
    match self.command(cmd)? {
      Response::Okay(msg) => Ok(msg),
      Response::Fail(msg) => Err(Error::Device(msg)),
      other => Err(Error::Protocol(format!("unexpected response to {cmd:?}: {other:?}"))),
    }
  }

  pub fn getvar(&mut self, name: &str) -> Result<String> {
    self.command_ok(&format!("getvar:{name}"))
  }

  /// Collect every `INFO key: value` line the device emits for
  /// `getvar:all`, time-bounded at 15 seconds (spec §4.2).
  pub fn getvar_all(&mut self, cancel: &CancelToken) -> Result<BTreeMap<String, String>> {
    let deadline = Instant::now() + GETVAR_ALL_TIMEOUT;
    let mut vars = BTreeMap::new();

    self.transport.send_all(b"getvar:all", self.timeout)?;
    loop {
      cancel.check()?;
      if Instant::now() >= deadline {
        return Err(Error::Protocol("getvar:all did not terminate within 15s".into()));
      }
      match wire::read_response(&mut self.transport, self.timeout)? {
        Response::Info(line) | Response::Text(line) => {
          if let Some((key, value)) = wire::parse_getvar_line(&line) {
            vars.insert(key, value);
          }
        }
        Response::Okay(_) => return Ok(vars),
        Response::Fail(msg) => return Err(Error::Device(msg)),
        Response::Data(_) => return Err(Error::Protocol("unexpected DATA during getvar:all".into())),
      }
    }
  }

  /// Drive the DATA-phase state machine: `download:<hex8>`, await `DATA`,
  /// stream the payload in ≤64 KiB sub-blocks, then await the write `OKAY`.
  pub fn download(&mut self, data: &[u8], cancel: &CancelToken) -> Result<()> {
    let cmd = format!("download:{:08x}", data.len());
    self.transport.send_all(cmd.as_bytes(), self.timeout)?;

    match wire::read_response(&mut self.transport, self.timeout)? {
      Response::Data(declared) => {
        if declared != data.len() as u32 {
          tracing::warn!(declared, actual = data.len(), "device DATA size mismatch");
        }
      }
      Response::Fail(msg) => return Err(Error::Device(msg)),
      other => return Err(Error::Protocol(format!("expected DATA, got {other:?}"))),
    }

    let mut tracker = ProgressTracker::new(data.len() as u64);
    let mut offset = 0;
    while offset < data.len() {
      cancel.check()?;
      let end = (offset + MAX_SUB_BLOCK).min(data.len());
      self.transport.send_all(&data[offset..end], self.timeout)?;
      let sent = (end - offset) as u64;
      offset = end;
      let force = offset == data.len();
      if let Some(progress) = tracker.advance(sent, force) {
        self.emit(Event::Progress(progress));
      }
    }

    match wire::read_response(&mut self.transport, self.timeout)? {
      Response::Okay(_) => Ok(()),
      Response::Fail(msg) => Err(Error::Device(msg)),
      other => Err(Error::Protocol(format!("expected OKAY after data phase, got {other:?}"))),
    }
  }

  pub fn flash(&mut self, partition: &str) -> Result<()> {
    self.command_ok(&format!("flash:{partition}")).map(|_| ())
  }

  pub fn erase(&mut self, partition: &str) -> Result<()> {
    self.command_ok(&format!("erase:{partition}")).map(|_| ())
  }

  pub fn reboot(&mut self) -> Result<()> {
    self.command_ok("reboot").map(|_| ())
  }

  pub fn reboot_bootloader(&mut self) -> Result<()> {
    self.command_ok("reboot-bootloader").map(|_| ())
  }

  pub fn reboot_fastboot(&mut self) -> Result<()> {
    self.command_ok("reboot-fastboot").map(|_| ())
  }

  pub fn reboot_recovery(&mut self) -> Result<()> {
    self.command_ok("reboot-recovery").map(|_| ())
  }

  pub fn set_active(&mut self, slot: &str) -> Result<()> {
    self.command_ok(&format!("set_active:{slot}")).map(|_| ())
  }

  pub fn flashing_unlock(&mut self) -> Result<()> {
    self.command_ok("flashing unlock").map(|_| ())
  }

  pub fn flashing_lock(&mut self) -> Result<()> {
    self.command_ok("flashing lock").map(|_| ())
  }

  /// Vendor `oem <subcmd>` passthrough. Returns the final response
  /// verbatim, whichever prefix it carries.
  pub fn oem(&mut self, subcmd: &str) -> Result<Response> {
    self.command(&format!("oem {subcmd}"))
  }

  /// Flash `image` to `partition`, transparently re-splitting it into
  /// standalone Sparse sub-images when it exceeds `max_download_size`
  /// (spec §4.2 "Sparse splitting for flash").
  pub fn flash_image(
    &mut self,
    partition: &str,
    image: &[u8],
    max_download_size: usize,
    cancel: &CancelToken,
  ) -> Result<()> {
    if image.len() <= max_download_size {
      self.download(image, cancel)?;
      return self.flash(partition);
    }

    let sparse = SparseImage::parse(image).map_err(|_| {
      Error::UnsupportedFeature("resparse unsupported: image exceeds max-download-size and is not Sparse".into())
    })?;

    for sub_image in sparse.split_for_transfer(max_download_size)? {
      cancel.check()?;
      self.download(&sub_image, cancel)?;
      self.flash(partition)?;
    }
    Ok(())
  }

  pub fn disconnect(self) {
    self.transport.disconnect();
  }
}
