//! Pull-based audio decoding into the provider stream format.
//!
//! [`PcmStream`] uses Symphonia to:
//! - probe the input container/codec
//! - decode packets into interleaved `f32` samples on demand
//! - fold the channel layout to stereo and resample to [`SAMPLE_RATE`] when needed
//! - serve the result as s16le bytes through [`std::io::Read`]
//!
//! Decoding happens on the reader's thread (the playback session), so there is no
//! extra decode thread to coordinate with on shutdown.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, CodecType, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::{CHANNELS, SAMPLE_RATE};
use crate::resample::StreamResampler;

/// Metadata captured while probing the source.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<&'static str>,
    pub sample_rate: u32,
    pub channels: usize,
    /// Total duration when the container reports it.
    pub duration_ms: Option<u64>,
}

/// Decoded track exposed as an s16le, interleaved stereo byte stream.
pub struct PcmStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    resampler: Option<StreamResampler>,
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,
    info: SourceInfo,
}

impl PcmStream {
    /// Probe `source` and prepare a decoder for its default track.
    pub fn open(
        source: Box<dyn MediaSource>,
        hint: Hint,
        resample_chunk_frames: usize,
    ) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .context("probe audio format")?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();
        let rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("create decoder")?;

        let resampler = if rate == SAMPLE_RATE {
            None
        } else {
            tracing::info!(from_hz = rate, to_hz = SAMPLE_RATE, "resampling track");
            Some(StreamResampler::new(rate, SAMPLE_RATE, CHANNELS, resample_chunk_frames)?)
        };

        let info = SourceInfo {
            codec: codec_label(codec_params.codec),
            sample_rate: rate,
            channels,
            duration_ms: duration_ms_from_codec_params(&codec_params),
        };

        Ok(Self {
            format,
            decoder,
            track_id,
            resampler,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
            info,
        })
    }

    /// Open a local file, using its extension as the format hint.
    pub fn open_file(path: &Path, resample_chunk_frames: usize) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        Self::open(Box::new(file), hint, resample_chunk_frames)
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Decode until some output bytes are pending or the stream ends.
    fn refill(&mut self) -> io::Result<()> {
        while !self.finished && self.pending_pos >= self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;

            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.finish()?;
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finish()?;
                    continue;
                }
                Err(SymphoniaError::IoError(e)) => return Err(e),
                Err(e) => return Err(io::Error::other(format!("read packet: {e}"))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(io::Error::other(format!("decode packet: {e}"))),
            };

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            let stereo = fold_to_stereo(sample_buf.samples(), self.info.channels);

            let out = match self.resampler.as_mut() {
                Some(rs) => rs.process(&stereo).map_err(|e| io::Error::other(format!("{e:#}")))?,
                None => stereo,
            };
            encode_s16le(&out, &mut self.pending);
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        if let Some(rs) = self.resampler.as_mut() {
            let tail = rs.flush().map_err(|e| io::Error::other(format!("{e:#}")))?;
            encode_s16le(&tail, &mut self.pending);
        }
        Ok(())
    }
}

impl Read for PcmStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.refill()?;
        let available = self.pending.len() - self.pending_pos;
        if available == 0 {
            return Ok(0);
        }
        let n = available.min(out.len());
        out[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        Ok(n)
    }
}

/// Fold interleaved `channels`-wide samples to stereo.
///
/// mono is duplicated; layouts wider than stereo keep the first two channels.
fn fold_to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|s| [*s, *s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

fn encode_s16le(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Short lowercase codec label for logs.
fn codec_label(codec: CodecType) -> Option<&'static str> {
    use symphonia::core::codecs::{
        CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_PCM_F32LE,
        CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24LE, CODEC_TYPE_VORBIS,
    };
    [
        (CODEC_TYPE_FLAC, "flac"),
        (CODEC_TYPE_MP3, "mp3"),
        (CODEC_TYPE_AAC, "aac"),
        (CODEC_TYPE_ALAC, "alac"),
        (CODEC_TYPE_VORBIS, "vorbis"),
        (CODEC_TYPE_PCM_S16LE, "pcm_s16"),
        (CODEC_TYPE_PCM_S16BE, "pcm_s16"),
        (CODEC_TYPE_PCM_S24LE, "pcm_s24"),
        (CODEC_TYPE_PCM_F32LE, "pcm_f32"),
    ]
    .into_iter()
    .find(|(c, _)| *c == codec)
    .map(|(_, label)| label)
}
