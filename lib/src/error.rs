//! Error taxonomy shared across every protocol engine.
//!
//! Mirrors spec §7: `Transport`/`Protocol` errors are always session-fatal,
//! `Device`/`Format`/`UnsupportedFeature` are operation-fatal and leave the
//! session usable, `Cancelled` is cooperative and leaves session state
//! undefined.

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// Byte-stream I/O failure, timeout, or unexpected EOF. Session-fatal.
  #[error("transport error: {0}")]
  Transport(String),

  /// USB-specific transport failure.
  #[error("usb error: {0}")]
  Usb(#[from] rusb::Error),

  /// Serial-port transport failure.
  #[error("serial error: {0}")]
  Serial(#[from] serialport::Error),

  /// HTTP range-reader failure.
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// Generic I/O failure (files, pipes, local buffers).
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// Unexpected response prefix, framing error, CRC/checksum mismatch, or
  /// state-machine violation. Session-fatal.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// The device explicitly reported failure (`FAIL ...`, non-zero status
  /// code, `BSL_REP_OPERATION_FAILED`). Operation-fatal; session continues.
  #[error("device reported failure: {0}")]
  Device(String),

  /// Invalid magic, out-of-range field, or unsupported version in a binary
  /// format (Sparse, PAC, ZIP, OTA payload). Operation-fatal.
  #[error("format error: {0}")]
  Format(String),

  /// Known-but-not-implemented behavior (e.g. an unsupported compression
  /// codec, resparse on a non-sparse oversized image). Operation-fatal.
  #[error("unsupported feature: {0}")]
  UnsupportedFeature(String),

  /// Cooperative cancellation. Operation-fatal; session state undefined
  /// afterwards and the caller must disconnect.
  #[error("operation cancelled")]
  Cancelled,

  /// A device was searched for but none matching was found.
  #[error("device not found")]
  NotFound,

  /// The device is connected but not in the mode this operation requires.
  #[error("device in wrong mode")]
  WrongMode,

  /// Slice-to-array conversion failure while decoding a fixed-width field.
  #[error("slice conversion error: {0}")]
  Bytes(#[from] std::array::TryFromSliceError),

  /// UTF-8 decode failure on a field the wire format declares as text.
  #[error("utf8 conversion error: {0}")]
  Utf8(#[from] std::string::FromUtf8Error),

  /// Host username lookup failure during Linux udev rule setup.
  #[cfg(target_os = "linux")]
  #[error("whoami error: {0}")]
  Whoami(#[from] whoami::Error),
}

impl Error {
  /// The structured log tag this error's originating component should use,
  /// per spec §7 ("fastboot", "mtk.brom", "mtk.da", "sprd.fdl", "ota").
  /// Errors constructed generically (transport/io) carry no fixed tag;
  /// callers attach their own component tag when logging.
  pub fn is_session_fatal(&self) -> bool {
    matches!(
      self,
      Error::Transport(_) | Error::Usb(_) | Error::Serial(_) | Error::Io(_) | Error::Protocol(_)
    )
  }
}
