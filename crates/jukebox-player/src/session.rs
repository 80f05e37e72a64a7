//! One track's playback: a worker thread that copies a provider stream into the sink.
//!
//! The worker reads `frames_per_buffer` frames at a time, converts whole frames and
//! pushes them as one batch. Short reads accumulate; a full sink or a source with no data
//! yet is retried after a short back-off. Control messages are observed between reads:
//! - `stop` halts reading without discarding queued audio
//! - `resume` continues from where reading stopped
//! - `close` ends the session; it takes effect even while stopped or while the sink is full

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::config::{BYTES_PER_FRAME, PlaybackConfig};
use crate::provider::TrackStream;
use crate::sink::{AudioSink, Frame, SinkError};

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The source reached end of stream and every frame was handed to the sink.
    Finished,
    /// Closed on request.
    Closed,
    /// The source or the sink failed.
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Stop,
    Resume,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Running,
    Stopped,
    Ended,
}

/// Handle to a running playback session.
pub struct PlaybackSession {
    label: String,
    control_tx: Sender<Control>,
    closing: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    state: SessionState,
    end_rx: Receiver<SessionEnd>,
    join: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    /// Start copying `source` into `sink` on a new thread.
    pub fn start(
        label: impl Into<String>,
        source: TrackStream,
        sink: AudioSink,
        config: &PlaybackConfig,
    ) -> Result<Self> {
        let label = label.into();
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (end_tx, end_rx) = crossbeam_channel::bounded(1);
        let closing = Arc::new(AtomicBool::new(false));
        let ended = Arc::new(AtomicBool::new(false));

        let frames_per_buffer = config.frames_per_buffer.max(1);
        let worker = Worker {
            source,
            sink,
            control_rx,
            closing: closing.clone(),
            stopped: false,
            pending: None,
            eof: false,
            buf: vec![0u8; frames_per_buffer * BYTES_PER_FRAME],
            filled: 0,
            backoff: config.retry_backoff,
        };

        let thread_ended = ended.clone();
        let thread_label = label.clone();
        let join = std::thread::Builder::new()
            .name("playback-session".to_string())
            .spawn(move || {
                let outcome = worker.run();
                thread_ended.store(true, Ordering::Release);
                match &outcome {
                    SessionEnd::Failed(e) => {
                        tracing::warn!(track = %thread_label, error = %e, "playback session failed")
                    }
                    other => tracing::debug!(
                        track = %thread_label,
                        outcome = ?other,
                        "playback session ended"
                    ),
                }
                let _ = end_tx.send(outcome);
            })
            .context("spawn playback session")?;

        tracing::debug!(track = %label, "playback session started");
        Ok(Self {
            label,
            control_tx,
            closing,
            ended,
            state: SessionState::Running,
            end_rx,
            join: Some(join),
        })
    }

    /// Halt reading. Returns `false` unless the session was running.
    pub fn stop(&mut self) -> bool {
        if self.state != SessionState::Running || self.is_ended() {
            return false;
        }
        if self.control_tx.send(Control::Stop).is_err() {
            return false;
        }
        self.state = SessionState::Stopped;
        true
    }

    /// Continue reading. Returns `false` unless the session was stopped.
    pub fn resume(&mut self) -> bool {
        if self.state != SessionState::Stopped || self.is_ended() {
            return false;
        }
        if self.control_tx.send(Control::Resume).is_err() {
            return false;
        }
        self.state = SessionState::Running;
        true
    }

    /// End the session and wait for the worker to exit. Idempotent.
    pub fn close(&mut self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.control_tx.send(Control::Close);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!(track = %self.label, "playback session panicked");
            }
        }
        self.state = SessionState::Ended;
    }

    /// Whether the worker has exited.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Receives the single [`SessionEnd`] once the worker exits.
    pub fn end(&self) -> Receiver<SessionEnd> {
        self.end_rx.clone()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    source: TrackStream,
    sink: AudioSink,
    control_rx: Receiver<Control>,
    closing: Arc<AtomicBool>,
    stopped: bool,
    pending: Option<Vec<Frame>>,
    eof: bool,
    buf: Vec<u8>,
    filled: usize,
    backoff: Duration,
}

enum Step {
    Continue,
    Done(SessionEnd),
}

impl Worker {
    fn run(mut self) -> SessionEnd {
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Done(outcome) => return outcome,
            }
        }
    }

    fn step(&mut self) -> Step {
        if self.closing.load(Ordering::Acquire) {
            return Step::Done(SessionEnd::Closed);
        }

        if self.stopped {
            return match self.control_rx.recv() {
                Ok(control) => self.apply(control),
                Err(_) => Step::Done(SessionEnd::Closed),
            };
        }

        loop {
            match self.control_rx.try_recv() {
                Ok(control) => {
                    if let Step::Done(outcome) = self.apply(control) {
                        return Step::Done(outcome);
                    }
                    if self.stopped {
                        return Step::Continue;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Step::Done(SessionEnd::Closed),
            }
        }

        if let Some(batch) = self.pending.take() {
            return match self.sink.push(batch) {
                Ok(()) => Step::Continue,
                Err(SinkError::Full(batch)) => {
                    self.pending = Some(batch);
                    self.wait_backoff()
                }
                Err(SinkError::Closed) => {
                    Step::Done(SessionEnd::Failed("audio sink closed".to_string()))
                }
            };
        }

        if self.eof {
            return Step::Done(SessionEnd::Finished);
        }

        match self.source.read(&mut self.buf[self.filled..]) {
            Ok(0) => {
                self.eof = true;
                let whole = self.filled - self.filled % BYTES_PER_FRAME;
                if whole < self.filled {
                    tracing::debug!(
                        dropped_bytes = self.filled - whole,
                        "discarding trailing partial frame"
                    );
                }
                self.take_frames(whole);
                Step::Continue
            }
            Ok(n) => {
                self.filled += n;
                if self.filled == self.buf.len() {
                    self.take_frames(self.filled);
                }
                Step::Continue
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_backoff(),
            Err(e) => Step::Done(SessionEnd::Failed(format!("read track: {e}"))),
        }
    }

    fn apply(&mut self, control: Control) -> Step {
        match control {
            Control::Stop => self.stopped = true,
            Control::Resume => self.stopped = false,
            Control::Close => return Step::Done(SessionEnd::Closed),
        }
        Step::Continue
    }

    /// Sleep for the back-off, waking early on a control message.
    fn wait_backoff(&mut self) -> Step {
        match self.control_rx.recv_timeout(self.backoff) {
            Ok(control) => self.apply(control),
            Err(RecvTimeoutError::Timeout) => Step::Continue,
            Err(RecvTimeoutError::Disconnected) => Step::Done(SessionEnd::Closed),
        }
    }

    /// Convert the first `len` buffered bytes into the pending batch.
    fn take_frames(&mut self, len: usize) {
        let frames = bytes_to_frames(&self.buf[..len]);
        self.filled = 0;
        if !frames.is_empty() {
            self.pending = Some(frames);
        }
    }
}

/// Decode s16le interleaved stereo; a trailing partial frame is ignored.
pub fn bytes_to_frames(bytes: &[u8]) -> Vec<Frame> {
    bytes
        .chunks_exact(BYTES_PER_FRAME)
        .map(|b| {
            [
                i16::from_le_bytes([b[0], b[1]]),
                i16::from_le_bytes([b[2], b[3]]),
            ]
        })
        .collect()
}
