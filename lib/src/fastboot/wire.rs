//! Fastboot response framing: the 4-ASCII-byte prefix plus payload, and the
//! `getvar:all` line grammar.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::DeviceTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
  Okay(String),
  Fail(String),
  /// Declared byte count for the upcoming data phase.
  Data(u32),
  Info(String),
  Text(String),
}

/// Read one `PREFIX<payload>` frame. Fastboot has no explicit length field
/// for the prefix response itself; each underlying transport read returns
/// one complete USB/serial packet, which fastboot device firmware always
/// emits as a single bulk transfer no larger than 256 bytes of payload.
pub fn read_response(transport: &mut DeviceTransport, timeout: Duration) -> Result<Response> {
  let mut buf = [0u8; 4 + 256];
  let n = transport.recv(&mut buf, timeout)?;
  if n < 4 {
    return Err(Error::Protocol(format!("fastboot response shorter than prefix ({n} bytes)")));
  }
  let prefix = &buf[0..4];
  let payload = String::from_utf8_lossy(&buf[4..n]).into_owned();

  match prefix {
    b"OKAY" => Ok(Response::Okay(payload)),
    b"FAIL" => Ok(Response::Fail(payload)),
    b"INFO" => Ok(Response::Info(payload)),
    b"TEXT" => Ok(Response::Text(payload)),
    b"DATA" => {
      let declared = u32::from_str_radix(payload.trim(), 16)
        .map_err(|_| Error::Protocol(format!("malformed DATA size {payload:?}")))?;
      Ok(Response::Data(declared))
    }
    other => Err(Error::Protocol(format!(
      "unknown fastboot response prefix {:?}",
      String::from_utf8_lossy(other)
    ))),
  }
}

/// Parse one `getvar:all` line: `key: value` or `prefix:name: value`,
/// optionally prefixed by `(bootloader) `. The key is lowercased and is
/// everything up to the *last* `": "` separator.
pub fn parse_getvar_line(line: &str) -> Option<(String, String)> {
  let line = line.strip_prefix("(bootloader) ").unwrap_or(line);
  let sep = line.rfind(": ")?;
  let key = line[..sep].to_lowercase();
  let value = line[sep + 2..].to_string();
  Some((key, value))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_plain_getvar_line() {
    assert_eq!(
      parse_getvar_line("version-bootloader: 1.0"),
      Some(("version-bootloader".into(), "1.0".into()))
    );
  }

  #[test]
  fn parses_prefixed_getvar_line_with_bootloader_tag() {
    assert_eq!(
      parse_getvar_line("(bootloader) partition-type:boot: raw"),
      Some(("partition-type:boot".into(), "raw".into()))
    );
  }

  #[test]
  fn rejects_line_without_separator() {
    assert_eq!(parse_getvar_line("no-separator-here"), None);
  }
}
