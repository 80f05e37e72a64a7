//! Bounded hand-off between the playback session and the audio callback.
//!
//! The producer side ([`AudioSink`]) pushes whole frame batches and never blocks: a full
//! queue hands the batch back so the caller can retry later. The consumer side
//! ([`SinkReader`]) is owned by the device callback and fills fixed-size requests from a
//! carried-over leftover plus non-blocking dequeues, padding with silence on underrun.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::CHANNELS;

/// One interleaved stereo sample pair.
pub type Frame = [i16; CHANNELS];

/// Zero-valued frame written on underrun.
pub const SILENCE: Frame = [0; CHANNELS];

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The queue is at capacity; the batch is returned untouched.
    #[error("audio sink is full")]
    Full(Vec<Frame>),
    #[error("audio sink is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct SinkShared {
    closed: AtomicBool,
    played_frames: AtomicU64,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
}

/// Counters maintained by the consumer side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub played_frames: u64,
    pub underrun_frames: u64,
    pub underrun_events: u64,
}

/// Producer handle. Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct AudioSink {
    tx: Sender<Vec<Frame>>,
    shared: Arc<SinkShared>,
}

/// Consumer half, moved into the device callback.
pub struct SinkReader {
    rx: Receiver<Vec<Frame>>,
    leftover: Vec<Frame>,
    pos: usize,
    shared: Arc<SinkShared>,
}

impl AudioSink {
    /// Create a sink whose queue holds at most `capacity` batches.
    pub fn new(capacity: usize) -> (AudioSink, SinkReader) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let shared = Arc::new(SinkShared::default());
        (
            AudioSink {
                tx,
                shared: shared.clone(),
            },
            SinkReader {
                rx,
                leftover: Vec::new(),
                pos: 0,
                shared,
            },
        )
    }

    /// Enqueue a batch without blocking.
    pub fn push(&self, frames: Vec<Frame>) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        if frames.is_empty() {
            return Ok(());
        }
        match self.tx.try_send(frames) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frames)) => Err(SinkError::Full(frames)),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Closed),
        }
    }

    /// Batches waiting for the consumer (best-effort snapshot).
    pub fn queued_batches(&self) -> usize {
        self.tx.len()
    }

    /// Reject further pushes; the consumer outputs silence from now on.
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait until the queue is empty or `timeout` elapses.
    ///
    /// Returns `true` if the queue drained. Frames already handed to the consumer's
    /// leftover are not counted.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.tx.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            played_frames: self.shared.played_frames.load(Ordering::Relaxed),
            underrun_frames: self.shared.underrun_frames.load(Ordering::Relaxed),
            underrun_events: self.shared.underrun_events.load(Ordering::Relaxed),
        }
    }
}

impl SinkReader {
    /// Fill `out` completely and return how many frames came from the queue.
    ///
    /// Never blocks and never takes a lock: drains the leftover first, then dequeues
    /// batches with `try_recv`, and pads whatever is still missing with [`SILENCE`].
    pub fn fill(&mut self, out: &mut [Frame]) -> usize {
        if self.shared.closed.load(Ordering::Acquire) {
            out.fill(SILENCE);
            return 0;
        }

        let mut written = 0usize;
        while written < out.len() {
            if self.pos < self.leftover.len() {
                let n = (out.len() - written).min(self.leftover.len() - self.pos);
                out[written..written + n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
                self.pos += n;
                written += n;
                continue;
            }
            match self.rx.try_recv() {
                Ok(batch) => {
                    self.leftover = batch;
                    self.pos = 0;
                }
                Err(_) => break,
            }
        }

        if written < out.len() {
            out[written..].fill(SILENCE);
            // Only count gaps inside a stream, not the idle silence between tracks.
            if written > 0 {
                self.shared.underrun_events.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .underrun_frames
                    .fetch_add((out.len() - written) as u64, Ordering::Relaxed);
            }
        }
        if written > 0 {
            self.shared
                .played_frames
                .fetch_add(written as u64, Ordering::Relaxed);
        }
        written
    }
}
