use std::time::Duration;

/// Output sample rate every track is rendered at.
pub const SAMPLE_RATE: u32 = 44_100;
/// Interleaved channels per frame.
pub const CHANNELS: usize = 2;
/// Bytes per frame on a provider stream (s16le, interleaved).
pub const BYTES_PER_FRAME: usize = CHANNELS * 2;

/// Playback tuning parameters shared by the session, sink and decoder.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Frames read from the source per sink push.
    pub frames_per_buffer: usize,
    /// Sink queue capacity, in batches of `frames_per_buffer` frames.
    pub sink_capacity: usize,
    /// Wait between retries when the source has no data yet or the sink is full.
    pub retry_backoff: Duration,
    /// Upper bound on waiting for queued audio to play out at shutdown.
    pub drain_timeout: Duration,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frames_per_buffer: 1048,
            sink_capacity: 8,
            retry_backoff: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(2),
            resample_chunk_frames: 1024,
        }
    }
}
