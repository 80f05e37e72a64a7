//! Streaming resampler for decoded stereo audio.
//!
//! Wraps Rubato's async sinc resampler behind a push/flush interface: input is buffered
//! until a full chunk is available, and the tail is processed as a partial chunk when
//! the source ends.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32> + Send>,
    channels: usize,
    chunk_frames: usize,
    input: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    /// Build a resampler converting interleaved `channels`-wide audio from `src_rate` to
    /// `dst_rate`, consuming `chunk_frames` input frames per step.
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 {
            return Err(anyhow!("source sample rate is zero"));
        }
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;

        // Headroom for the ratio plus Rubato's relative ratio slack.
        let out_factor = (f_ratio * 1.1).ceil().max(1.0) as usize + 2;

        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            chunk_frames,
            input: Vec::with_capacity(chunk_frames * channels * 2),
            out: vec![0.0; chunk_frames * channels * out_factor],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Feed interleaved samples and return whatever output became available.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        self.input.extend_from_slice(interleaved);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut produced = Vec::new();
        let mut offset = 0;
        while self.input.len() - offset >= chunk_samples {
            let chunk = self.input[offset..offset + chunk_samples].to_vec();
            self.run(&chunk, None, &mut produced)?;
            offset += chunk_samples;
        }
        self.input.drain(..offset);
        Ok(produced)
    }

    /// Process any buffered tail as a partial chunk.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut produced = Vec::new();
        let tail_frames = self.input.len() / self.channels;
        if tail_frames > 0 {
            let tail = std::mem::take(&mut self.input);
            self.run(&tail[..tail_frames * self.channels], Some(tail_frames), &mut produced)?;
        }
        self.input.clear();
        Ok(produced)
    }

    fn run(
        &mut self,
        input: &[f32],
        partial_len: Option<usize>,
        produced: &mut Vec<f32>,
    ) -> Result<()> {
        let frames = input.len() / self.channels;
        let input_adapter = InterleavedSlice::new(input, self.channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;

        let out_capacity_frames = self.out.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;

        produced.extend_from_slice(&self.out[..nbr_out * self.channels]);
        Ok(())
    }
}
