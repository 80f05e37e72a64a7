//! Audio output device (CPAL).
//!
//! Owns the CPAL stream on a dedicated thread (streams are not `Send` on every host) and
//! drives the [`SinkReader`] from the real-time callback:
//! - requests a fixed number of frames per callback from the sink (never blocks)
//! - maps the stereo frames onto the device channel layout
//! - converts `i16` samples to the device sample format

use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;

use crate::config::SAMPLE_RATE;
use crate::sink::{Frame, SILENCE, SinkReader};

/// Frames pre-allocated for the callback scratch buffer.
const SCRATCH_FRAMES: usize = 16_384;

/// A running output stream fed by a [`SinkReader`].
pub struct AudioOutput {
    device_name: String,
    shutdown_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl AudioOutput {
    /// Open the output device and start pulling from `reader`.
    ///
    /// `device` selects the first output whose name contains the substring (case-insensitive);
    /// `None` uses the host default.
    pub fn open(device: Option<String>, reader: SinkReader) -> Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<String>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let join = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let (stream, name) = match start_stream(&host, device.as_deref(), reader) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(name));
                let _ = shutdown_rx.recv();
                if let Err(e) = stream.pause() {
                    tracing::debug!("output stream pause on shutdown failed: {e}");
                }
                drop(stream);
            })
            .context("spawn audio output thread")?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(anyhow!("audio output thread exited during setup"));
            }
        };

        Ok(Self {
            device_name,
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Stop the stream and release the device. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("audio output thread panicked");
            }
            tracing::info!(device = %self.device_name, "audio output released");
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of all output devices on the default host.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.to_string());
    }
    Ok(names)
}

fn start_stream(
    host: &cpal::Host,
    needle: Option<&str>,
    reader: SinkReader,
) -> Result<(cpal::Stream, String)> {
    let device = pick_device(host, needle)?;
    let name = device.description()?.to_string();
    let config = pick_output_config(&device)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }
    if stream_config.sample_rate != SAMPLE_RATE {
        tracing::warn!(
            device = %name,
            device_rate_hz = stream_config.sample_rate,
            track_rate_hz = SAMPLE_RATE,
            "device does not support the track rate; playback pitch will be off"
        );
    }
    tracing::info!(
        device = %name,
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        sample_format = ?config.sample_format(),
        buffer_size = ?stream_config.buffer_size,
        "device output config"
    );

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, reader)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, reader)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, reader)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, reader)?,
        other => return Err(anyhow!("Unsupported sample format: {other:?}")),
    };
    stream.play()?;
    Ok((stream, name))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut reader: SinkReader,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<i16>,
{
    let channels_out = (config.channels as usize).max(1);
    let mut scratch: Vec<Frame> = Vec::with_capacity(SCRATCH_FRAMES);

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            // Only grows when the host hands us a larger period than seen before.
            scratch.resize(frames, SILENCE);
            reader.fill(&mut scratch[..frames]);
            for (i, frame) in scratch[..frames].iter().enumerate() {
                for ch in 0..channels_out {
                    let sample = map_channel(frame, channels_out, ch);
                    data[i * channels_out + ch] = <T as cpal::Sample>::from_sample::<i16>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Sample for device channel `dst_ch` out of a stereo frame.
///
/// mono: average L/R; stereo: pass-through; more channels: left, right, then the right
/// channel repeated.
fn map_channel(frame: &Frame, dst_channels: usize, dst_ch: usize) -> i16 {
    if dst_channels == 1 {
        return ((frame[0] as i32 + frame[1] as i32) / 2) as i16;
    }
    frame[dst_ch.min(1)]
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// default device.
fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let devices = host.output_devices().context("No output devices")?;
        for d in devices {
            let matched = d
                .description()
                .ok()
                .map(|n| matches_device_name(&n.to_string(), needle))
                .unwrap_or(false);
            if matched {
                return Ok(d);
            }
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose an output config at [`SAMPLE_RATE`] when any range allows it, preferring
/// formats that need no conversion from `i16`, then stereo layouts.
fn pick_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let mut best: Option<(Candidate, cpal::SupportedStreamConfigRange)> = None;
    for range in ranges {
        let candidate = Candidate {
            exact_rate: range.min_sample_rate() <= SAMPLE_RATE
                && SAMPLE_RATE <= range.max_sample_rate(),
            format_rank: sample_format_rank(range.sample_format()),
            stereo: range.channels() == 2,
        };
        let replace = match &best {
            None => true,
            Some((b, _)) => candidate.is_better_than(b),
        };
        if replace {
            best = Some((candidate, range));
        }
    }

    match best {
        Some((c, range)) if c.exact_rate => Ok(range.with_sample_rate(SAMPLE_RATE)),
        _ => device
            .default_output_config()
            .context("No output config supports the track rate and no default config"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    exact_rate: bool,
    format_rank: u8,
    stereo: bool,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.exact_rate != other.exact_rate {
            self.exact_rate
        } else if self.format_rank != other.format_rank {
            self.format_rank < other.format_rank
        } else {
            self.stereo && !other.stereo
        }
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Fixed buffer size when the device advertises a range; capped to keep pause latency low.
fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4_096;
            let chosen = if *max > MAX_FRAMES {
                if *min > MAX_FRAMES { *min } else { MAX_FRAMES }
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
