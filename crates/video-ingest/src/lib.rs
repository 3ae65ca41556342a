//! Video capture with reconnection resilience.
//!
//! [`ResilientCapture`] owns at most one open source handle at a time and
//! exposes a single contract: `acquire` returns either the next frame or
//! [`Acquired::Unavailable`]. Failed opens and failed reads release the
//! handle and start a fixed cooldown window; open attempts inside the window
//! return `Unavailable` immediately so a dead camera cannot cause
//! reconnection churn. There is no retry cap; sources are assumed to come
//! back eventually.
//!
//! Each connection runs its reader on a dedicated thread feeding a small
//! bounded channel, which both bounds read latency (`recv_timeout`) and
//! backpressures the source when the pipeline falls behind. Dropping the
//! receiver tears the reader down.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod synthetic;

#[cfg(feature = "backend-opencv")]
pub mod cv;

/// Raw BGR frame captured from a video source, stamped by the capture layer.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug)]
pub enum FrameFormat {
    Bgr8,
}

/// Pixels handed up by a source backend; sequence and timestamp are assigned
/// by the capture layer.
pub struct SourceFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source read failed: {0}")]
    Read(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A connected video source. Implementations block in `read_frame` for at
/// most one frame interval; the capture layer enforces the hard timeout.
pub trait VideoSource: Send {
    fn read_frame(&mut self) -> Result<SourceFrame, CaptureError>;
}

/// Factory invoked on every (re)connection attempt.
pub type SourceOpener = Box<dyn Fn() -> Result<Box<dyn VideoSource>, CaptureError> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Outcome of one `acquire` call.
pub enum Acquired {
    Frame(Frame),
    Unavailable,
}

#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    /// Window after a failure during which no reopen is attempted.
    pub cooldown: Duration,
    /// Upper bound on waiting for the next frame of a connected source.
    pub read_timeout: Duration,
    /// Upper bound on waiting for the first frame after an open.
    pub open_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            open_timeout: Duration::from_secs(5),
        }
    }
}

type ReaderMessage = Result<(SourceFrame, i64), CaptureError>;

pub struct ResilientCapture {
    opener: SourceOpener,
    options: CaptureOptions,
    receiver: Option<Receiver<ReaderMessage>>,
    state: ConnectionState,
    cooldown_until: Option<Instant>,
    next_sequence: u64,
}

impl ResilientCapture {
    pub fn new(opener: SourceOpener, options: CaptureOptions) -> Self {
        Self {
            opener,
            options,
            receiver: None,
            state: ConnectionState::Disconnected,
            cooldown_until: None,
            next_sequence: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Fetch the next frame, reconnecting as needed. Never blocks longer
    /// than one read (or open) timeout.
    pub fn acquire(&mut self) -> Acquired {
        match self.state {
            ConnectionState::Connected => self.read_next(),
            _ => self.try_connect(),
        }
    }

    /// Release any open handle without starting a cooldown. Used for polite
    /// shutdown.
    pub fn release(&mut self) {
        if self.receiver.take().is_some() {
            debug!("Capture handle released");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn read_next(&mut self) -> Acquired {
        let receiver = match self.receiver.as_ref() {
            Some(receiver) => receiver,
            None => {
                self.disconnect("no open handle");
                return Acquired::Unavailable;
            }
        };

        match receiver.recv_timeout(self.options.read_timeout) {
            Ok(Ok((frame, timestamp_ms))) => Acquired::Frame(self.stamp(frame, timestamp_ms)),
            Ok(Err(err)) => {
                self.disconnect(&err.to_string());
                Acquired::Unavailable
            }
            Err(RecvTimeoutError::Timeout) => {
                self.disconnect("frame read timed out");
                Acquired::Unavailable
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnect("reader thread exited");
                Acquired::Unavailable
            }
        }
    }

    fn try_connect(&mut self) -> Acquired {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return Acquired::Unavailable;
            }
        }
        self.cooldown_until = None;
        self.state = ConnectionState::Connecting;
        debug!("Connecting to video source");

        let source = match (self.opener)() {
            Ok(source) => source,
            Err(err) => {
                warn!("Failed to open video source: {err}");
                self.enter_cooldown();
                return Acquired::Unavailable;
            }
        };

        let (tx, rx) = bounded::<ReaderMessage>(2);
        thread::spawn(move || {
            let mut source = source;
            loop {
                let message = source
                    .read_frame()
                    .map(|frame| (frame, Utc::now().timestamp_millis()));
                let failed = message.is_err();
                if tx.send(message).is_err() || failed {
                    break;
                }
            }
        });

        // An open that yields no first frame counts as an open failure.
        match rx.recv_timeout(self.options.open_timeout) {
            Ok(Ok((frame, timestamp_ms))) => {
                self.receiver = Some(rx);
                self.state = ConnectionState::Connected;
                info!("Video source connected");
                Acquired::Frame(self.stamp(frame, timestamp_ms))
            }
            Ok(Err(err)) => {
                warn!("Video source opened but failed before first frame: {err}");
                self.enter_cooldown();
                Acquired::Unavailable
            }
            Err(_) => {
                warn!("Video source opened but yielded no frame in time");
                self.enter_cooldown();
                Acquired::Unavailable
            }
        }
    }

    fn disconnect(&mut self, reason: &str) {
        warn!("Video source disconnected: {reason}");
        self.receiver = None;
        self.enter_cooldown();
    }

    fn enter_cooldown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.cooldown_until = Some(Instant::now() + self.options.cooldown);
    }

    fn stamp(&mut self, frame: SourceFrame, timestamp_ms: i64) -> Frame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Frame {
            data: frame.data,
            width: frame.width,
            height: frame.height,
            sequence,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct ScriptedSource {
        frames_before_failure: usize,
        served: usize,
    }

    impl VideoSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<SourceFrame, CaptureError> {
            if self.served >= self.frames_before_failure {
                return Err(CaptureError::Read("scripted failure".into()));
            }
            self.served += 1;
            Ok(SourceFrame {
                data: vec![0u8; 4 * 4 * 3],
                width: 4,
                height: 4,
            })
        }
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            cooldown: Duration::from_millis(50),
            read_timeout: Duration::from_millis(200),
            open_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn failed_open_enters_cooldown_without_hammering_the_source() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let opener_attempts = attempts.clone();
        let opener: SourceOpener = Box::new(move || {
            opener_attempts.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::Open { uri: "test".into() })
        });
        let mut capture = ResilientCapture::new(opener, options());

        assert!(matches!(capture.acquire(), Acquired::Unavailable));
        assert!(matches!(capture.acquire(), Acquired::Unavailable));
        assert!(matches!(capture.acquire(), Acquired::Unavailable));
        // Only the first call may touch the source; the rest land in cooldown.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(capture.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnects_after_cooldown_elapses() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let opener_attempts = attempts.clone();
        let opener: SourceOpener = Box::new(move || {
            if opener_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CaptureError::Open { uri: "test".into() })
            } else {
                Ok(Box::new(ScriptedSource {
                    frames_before_failure: usize::MAX,
                    served: 0,
                }) as Box<dyn VideoSource>)
            }
        });
        let mut capture = ResilientCapture::new(opener, options());

        assert!(matches!(capture.acquire(), Acquired::Unavailable));
        thread::sleep(Duration::from_millis(70));
        match capture.acquire() {
            Acquired::Frame(frame) => assert_eq!(frame.sequence, 0),
            Acquired::Unavailable => panic!("expected a frame after cooldown"),
        }
        assert_eq!(capture.state(), ConnectionState::Connected);
    }

    #[test]
    fn read_failure_releases_handle_and_sequence_stays_monotonic() {
        let opener: SourceOpener = Box::new(|| {
            Ok(Box::new(ScriptedSource {
                frames_before_failure: 2,
                served: 0,
            }) as Box<dyn VideoSource>)
        });
        let mut capture = ResilientCapture::new(opener, options());

        let mut sequences = Vec::new();
        for _ in 0..2 {
            if let Acquired::Frame(frame) = capture.acquire() {
                sequences.push(frame.sequence);
            }
        }
        assert_eq!(sequences, vec![0, 1]);

        // Third read hits the scripted failure.
        assert!(matches!(capture.acquire(), Acquired::Unavailable));
        assert_eq!(capture.state(), ConnectionState::Disconnected);

        // Cooldown gates an immediate reopen.
        assert!(matches!(capture.acquire(), Acquired::Unavailable));

        thread::sleep(Duration::from_millis(70));
        match capture.acquire() {
            Acquired::Frame(frame) => assert_eq!(frame.sequence, 2),
            Acquired::Unavailable => panic!("expected reconnection after cooldown"),
        }
    }
}
