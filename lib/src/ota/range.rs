//! HTTP byte-range reader for the OTA extraction path, grounded on the
//! reqwest + tokio stack used by the pack's OTA payload dumper for its
//! `remote_zip` feature: build a client once, issue `Range:` GETs, and
//! tolerate a server that ignores the header and streams the whole body.

use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};

use crate::error::{Error, Result};

/// A reader bound to one URL that performs independent range GETs.
/// Constructing a fresh [`RangeReader`] per concurrent worker (rather than
/// sharing one `Client`) is deliberate: spec §4.7's concurrency contract
/// requires worker tasks to be fully independent of the main engine's
/// transport handle.
#[derive(Clone)]
pub struct RangeReader {
  client: Client,
  url: String,
}

impl RangeReader {
  pub fn new(url: impl Into<String>) -> Result<Self> {
    let client = Client::builder().redirect(reqwest::redirect::Policy::limited(10)).build()?;
    Ok(Self { client, url: url.into() })
  }

  /// Total content length, via a `HEAD` request.
  pub async fn content_length(&self) -> Result<u64> {
    let resp = self.client.head(&self.url).send().await?.error_for_status()?;
    resp
      .content_length()
      .ok_or_else(|| Error::Protocol("server did not report Content-Length".into()))
  }

  /// Fetch exactly `[start, end)`. If the server ignores `Range:` and
  /// returns `200 OK` with the full body, the response is truncated to the
  /// requested slice (streamed-and-discarded past `end`, per spec §4.7).
  pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
    if end <= start {
      return Ok(Bytes::new());
    }
    let want = end - start;
    let resp = self
      .client
      .get(&self.url)
      .header(RANGE, format!("bytes={start}-{}", end - 1))
      .send()
      .await?;

    let status = resp.status();
    let is_partial = status == StatusCode::PARTIAL_CONTENT || resp.headers().contains_key(CONTENT_RANGE);
    let body = resp.error_for_status()?.bytes().await?;

    if is_partial {
      if (body.len() as u64) < want {
        return Err(Error::Protocol(format!(
          "range response shorter than requested: got {} wanted {want}",
          body.len()
        )));
      }
      Ok(body.slice(0..want as usize))
    } else {
      // server returned the whole resource; slice out our window.
      if (body.len() as u64) < end {
        return Err(Error::Protocol("full-body response shorter than requested range end".into()));
      }
      Ok(body.slice(start as usize..end as usize))
    }
  }

  /// Fetch the last `n` bytes of the resource, used to locate the EOCD.
  pub async fn read_tail(&self, n: u64) -> Result<Bytes> {
    let total = self.content_length().await?;
    let start = total.saturating_sub(n);
    self.read_range(start, total).await
  }
}
