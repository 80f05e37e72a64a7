//! HTTP provider: tracks fetched from a URL template and decoded locally.
//!
//! Bytes are pulled with ranged GETs through a block-sized in-memory buffer, so the
//! decoder can probe and seek without downloading the whole file first.

use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jukebox_player::decode::PcmStream;
use jukebox_player::provider::{Provider, TrackStream};
use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;

/// Placeholder replaced by the percent-encoded track id.
pub const TRACK_PLACEHOLDER: &str = "{track}";

/// Configuration for HTTP range fetching.
#[derive(Clone, Debug)]
pub struct HttpRangeConfig {
    /// Bytes per fetched block.
    pub block_size: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpRangeConfig {
    fn default() -> Self {
        Self {
            block_size: 512 * 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpProvider {
    name: String,
    url_template: String,
    range: HttpRangeConfig,
    resample_chunk_frames: usize,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        range: HttpRangeConfig,
        resample_chunk_frames: usize,
    ) -> Result<Self> {
        let name = name.into();
        let url_template = url_template.into();
        if !url_template.contains(TRACK_PLACEHOLDER) {
            return Err(anyhow!(
                "provider {name}: url_template must contain {TRACK_PLACEHOLDER}"
            ));
        }
        Ok(Self {
            name,
            url_template,
            range,
            resample_chunk_frames,
        })
    }

    pub fn track_url(&self, track_id: &str) -> String {
        track_url(&self.url_template, track_id)
    }
}

impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self, track_id: &str) -> Result<TrackStream> {
        if track_id.trim().is_empty() {
            return Err(anyhow!("empty track id"));
        }
        let url = self.track_url(track_id);
        tracing::debug!(provider = %self.name, url = %url, "opening http track");

        let mut hint = Hint::new();
        if let Some(ext) = extension_from_url(&url) {
            hint.with_extension(&ext);
        }
        let source = HttpRangeSource::new(url.clone(), self.range.clone());
        let stream = PcmStream::open(Box::new(source), hint, self.resample_chunk_frames)
            .with_context(|| format!("open {url}"))?;
        Ok(Box::new(stream))
    }
}

/// Substitute the percent-encoded `track_id` into `template`.
pub fn track_url(template: &str, track_id: &str) -> String {
    template.replace(TRACK_PLACEHOLDER, &urlencoding::encode(track_id))
}

/// File extension of the URL path, ignoring query and fragment.
fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A simple HTTP range reader with a small in-memory block cache.
pub(crate) struct HttpRangeSource {
    url: String,
    config: HttpRangeConfig,
    pos: u64,
    len: Option<u64>,
    buf: Vec<u8>,
    buf_start: u64,
}

impl HttpRangeSource {
    pub(crate) fn new(url: String, config: HttpRangeConfig) -> Self {
        Self {
            url,
            config,
            pos: 0,
            len: None,
            buf: Vec::new(),
            buf_start: 0,
        }
    }

    /// Ensure the total length is known by issuing a range probe.
    fn ensure_len(&mut self) -> io::Result<u64> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        let fetched = self.fetch_range(0, 0)?;
        let len = fetched
            .total
            .ok_or_else(|| io::Error::other("content length unavailable"))?;
        self.buf_start = fetched.start;
        self.buf = fetched.data;
        self.len = Some(len);
        Ok(len)
    }

    /// Fetch a byte range from the remote server.
    fn fetch_range(&self, start: u64, end: u64) -> io::Result<Fetched> {
        let range = format!("bytes={start}-{end}");
        let began = std::time::Instant::now();
        let resp = ureq::get(&self.url)
            .config()
            .timeout_per_call(Some(self.config.timeout))
            .build()
            .header("Range", &range)
            .call()
            .map_err(|e| io::Error::other(format!("http range request failed: {e}")))?;
        let elapsed = began.elapsed();

        let status = resp.status();
        let content_range = resp
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let mut data = Vec::new();
        let (_, body) = resp.into_parts();
        body.into_reader()
            .read_to_end(&mut data)
            .map_err(|e| io::Error::other(format!("http read failed: {e}")))?;
        if elapsed > Duration::from_millis(250) {
            tracing::warn!(
                took_ms = elapsed.as_millis() as u64,
                bytes = data.len(),
                range = range.as_str(),
                "http range fetch slow"
            );
        }

        match status {
            ureq::http::StatusCode::PARTIAL_CONTENT => Ok(Fetched {
                data,
                start,
                total: content_range
                    .as_deref()
                    .and_then(parse_content_range_total)
                    .or(content_length),
            }),
            // Range ignored: the body is the whole resource.
            ureq::http::StatusCode::OK => {
                let total = content_length.or(Some(data.len() as u64));
                Ok(Fetched { data, start: 0, total })
            }
            other => Err(io::Error::other(format!("unexpected http status {other}"))),
        }
    }

    /// Fill the in-memory buffer starting at the current position.
    fn refill(&mut self) -> io::Result<()> {
        let start = self.pos;
        let mut end = start
            .saturating_add(self.config.block_size as u64)
            .saturating_sub(1);
        if let Some(len) = self.len {
            if len > 0 {
                end = end.min(len.saturating_sub(1));
            }
        }

        let fetched = self.fetch_range(start, end)?;
        if let Some(total) = fetched.total {
            self.len = Some(total);
        }
        self.buf = fetched.data;
        self.buf_start = fetched.start;
        Ok(())
    }

    fn buffered(&self) -> bool {
        !self.buf.is_empty()
            && self.pos >= self.buf_start
            && self.pos < self.buf_start.saturating_add(self.buf.len() as u64)
    }
}

struct Fetched {
    data: Vec<u8>,
    /// Offset of `data[0]` in the resource.
    start: u64,
    total: Option<u64>,
}

impl Read for HttpRangeSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if let Some(len) = self.len {
            if self.pos >= len {
                return Ok(0);
            }
        }

        if !self.buffered() {
            self.refill()?;
            if !self.buffered() {
                return Ok(0);
            }
        }

        let offset = (self.pos - self.buf_start) as usize;
        let to_copy = (self.buf.len() - offset).min(out.len());
        out[..to_copy].copy_from_slice(&self.buf[offset..offset + to_copy]);
        self.pos = self.pos.saturating_add(to_copy as u64);
        Ok(to_copy)
    }
}

impl Seek for HttpRangeSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(x) => x,
            SeekFrom::Current(d) => add_signed(self.pos, d),
            SeekFrom::End(d) => {
                let len = self.ensure_len()?;
                add_signed(len, d)
            }
        };
        self.pos = target;
        Ok(self.pos)
    }
}

impl MediaSource for HttpRangeSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

/// Extract the total length from a Content-Range header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    // Format: "bytes start-end/total"
    let (_, total) = header.split_once('/')?;
    total.parse::<u64>().ok()
}

/// Add a signed delta to an unsigned base with saturation.
fn add_signed(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}
