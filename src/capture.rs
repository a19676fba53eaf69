//! Dual-stream capture loop.
//!
//! Each cycle pulls one image from each camera, drops incomplete or
//! timed-out images, converts complete ones to RGB and hands them to the
//! stream's sink. Pairing is positional: hardware triggering aligns the
//! exposures, the loop only keeps both sinks advancing together.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::convert;
use crate::error::{CameraError, CaptureError};
use crate::sink::VideoSink;
use crate::traits::{Camera, Frame, GrabbedImage, ImageStatus, PixelFormat};

/// Per-retrieval timeout used when none is configured.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

/// Status recorded for a retrieval that timed out.
pub const TIMEOUT_STATUS: i64 = -1;

/// Status recorded for a complete image whose buffer could not be converted.
pub const CONVERSION_FAILED_STATUS: i64 = -2;

/// How the two streams are scheduled within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Primary then secondary on the calling thread.
    #[default]
    Sequential,
    /// One worker thread per stream, meeting at a barrier every cycle.
    Concurrent,
}

/// Cancellation flag checked before every blocking retrieval.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the capture loop to stop at its next retrieval.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Metadata of a frame that reached its sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Sensor encoding before conversion.
    pub pixel_format: PixelFormat,
    /// Device timestamp.
    pub timestamp: Duration,
    /// Device frame counter.
    pub frame_id: u64,
}

impl From<&Frame<'_>> for FrameInfo {
    fn from(frame: &Frame<'_>) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            pixel_format: frame.pixel_format,
            timestamp: frame.timestamp,
            frame_id: frame.frame_id,
        }
    }
}

/// Outcome of one retrieval on one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameResult {
    /// A complete frame was written.
    Frame(FrameInfo),
    /// Nothing was written; carries the device status code.
    Incomplete {
        /// Device status, [`TIMEOUT_STATUS`] or [`CONVERSION_FAILED_STATUS`].
        status: i64,
    },
}

impl FrameResult {
    /// Whether a frame was forwarded.
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}

/// Both streams' results for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCycleRecord {
    /// Zero-based cycle number.
    pub cycle: u64,
    /// Time since loop entry when the cycle finished.
    pub elapsed: Duration,
    /// Primary stream.
    pub left: FrameResult,
    /// Secondary stream.
    pub right: FrameResult,
}

impl CaptureCycleRecord {
    /// Difference between the two device timestamps, when both are complete.
    pub fn timestamp_skew(&self) -> Option<Duration> {
        match (self.left, self.right) {
            (FrameResult::Frame(left), FrameResult::Frame(right)) => {
                Some(left.timestamp.abs_diff(right.timestamp))
            }
            _ => None,
        }
    }
}

/// Counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Images retrieved complete.
    pub complete: u64,
    /// Images the device marked incomplete.
    pub incomplete: u64,
    /// Retrievals that timed out.
    pub timeouts: u64,
    /// Complete images dropped because conversion failed.
    pub dropped: u64,
    /// Frames accepted by the sink.
    pub written: u64,
}

/// Result of a finished capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Cycles run.
    pub cycles: u64,
    /// Time from loop entry to exit.
    pub elapsed: Duration,
    /// Primary stream counters.
    pub left: StreamStats,
    /// Secondary stream counters.
    pub right: StreamStats,
    /// Whether the stop signal ended the loop before its deadline.
    pub cancelled: bool,
}

/// Time-bounded capture over a primary and a secondary camera.
#[derive(Debug, Clone)]
pub struct CaptureLoop {
    duration: Duration,
    frame_timeout: Duration,
    stop: StopSignal,
}

impl CaptureLoop {
    /// Capture for roughly `duration`.
    ///
    /// The deadline is checked after each full cycle, so the last cycle may
    /// finish after it.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            stop: StopSignal::new(),
        }
    }

    /// Set the per-retrieval timeout.
    #[must_use]
    pub const fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Use an external stop signal.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Run the sequential loop.
    pub fn run<P, S, L, R>(
        &self,
        primary: &mut P,
        secondary: &mut S,
        left: &mut L,
        right: &mut R,
    ) -> Result<CaptureSummary, CaptureError>
    where
        P: Camera,
        S: Camera,
        L: VideoSink,
        R: VideoSink,
    {
        self.run_with(primary, secondary, left, right, |_| {})
    }

    /// Run the sequential loop, reporting every cycle to `observer`.
    pub fn run_with<P, S, L, R, F>(
        &self,
        primary: &mut P,
        secondary: &mut S,
        left: &mut L,
        right: &mut R,
        mut observer: F,
    ) -> Result<CaptureSummary, CaptureError>
    where
        P: Camera,
        S: Camera,
        L: VideoSink,
        R: VideoSink,
        F: FnMut(&CaptureCycleRecord),
    {
        let mut left_stream = Stream::new(primary.serial_number(), "left");
        let mut right_stream = Stream::new(secondary.serial_number(), "right");
        let mut cycles = 0;
        let mut cancelled = false;

        info!(duration = ?self.duration, "capture started");
        let start = Instant::now();
        loop {
            if self.stop.is_triggered() {
                cancelled = true;
                break;
            }
            let left_result = left_stream.cycle(primary, left, self.frame_timeout)?;

            if self.stop.is_triggered() {
                cancelled = true;
                break;
            }
            let right_result = right_stream.cycle(secondary, right, self.frame_timeout)?;

            let elapsed = start.elapsed();
            observer(&CaptureCycleRecord {
                cycle: cycles,
                elapsed,
                left: left_result,
                right: right_result,
            });
            cycles += 1;

            if elapsed > self.duration {
                break;
            }
        }

        let summary = CaptureSummary {
            cycles,
            elapsed: start.elapsed(),
            left: left_stream.stats,
            right: right_stream.stats,
            cancelled,
        };
        log_summary(&summary);
        Ok(summary)
    }

    /// Run one worker thread per stream.
    ///
    /// The workers meet at a barrier after every cycle; the barrier leader
    /// decides whether another cycle runs so both stop on the same cycle.
    /// A panic inside a cycle is caught and reported as a device error, so
    /// the other worker is released at the next barrier.
    pub fn run_concurrent<P, S, L, R>(
        &self,
        primary: &mut P,
        secondary: &mut S,
        left: &mut L,
        right: &mut R,
    ) -> Result<CaptureSummary, CaptureError>
    where
        P: Camera + Send,
        S: Camera + Send,
        L: VideoSink + Send,
        R: VideoSink + Send,
    {
        let rendezvous = Rendezvous {
            barrier: Barrier::new(2),
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            start: Instant::now(),
            duration: self.duration,
            stop: &self.stop,
        };
        let timeout = self.frame_timeout;

        info!(duration = ?self.duration, "concurrent capture started");
        let (left_outcome, right_outcome) = thread::scope(|scope| {
            let rendezvous = &rendezvous;
            let left_worker = scope.spawn(move || {
                let stream = Stream::new(primary.serial_number(), "left");
                stream.run_worker(primary, left, timeout, rendezvous)
            });
            let right_stream = Stream::new(secondary.serial_number(), "right");
            let right_outcome = right_stream.run_worker(secondary, right, timeout, rendezvous);
            let left_outcome = left_worker.join().unwrap_or_else(|_| {
                (
                    StreamStats::default(),
                    Err(CaptureError::Device {
                        serial: String::new(),
                        source: CameraError::Acquisition("left capture worker panicked".to_owned()),
                    }),
                )
            });
            (left_outcome, right_outcome)
        });

        let (left_stats, left_result) = left_outcome;
        let (right_stats, right_result) = right_outcome;
        left_result?;
        right_result?;

        let summary = CaptureSummary {
            cycles: rendezvous.cycles.load(Ordering::SeqCst),
            elapsed: rendezvous.start.elapsed(),
            left: left_stats,
            right: right_stats,
            cancelled: self.stop.is_triggered(),
        };
        log_summary(&summary);
        Ok(summary)
    }
}

/// Shared cycle state of the two workers.
struct Rendezvous<'a> {
    barrier: Barrier,
    done: AtomicBool,
    failed: AtomicBool,
    cycles: AtomicU64,
    start: Instant,
    duration: Duration,
    stop: &'a StopSignal,
}

/// Per-stream identity and counters.
struct Stream {
    serial: String,
    name: &'static str,
    stats: StreamStats,
}

impl Stream {
    fn new(serial: &str, name: &'static str) -> Self {
        Self {
            serial: serial.to_owned(),
            name,
            stats: StreamStats::default(),
        }
    }

    /// Retrieve one image and forward it to the sink if it is usable.
    fn cycle<C: Camera, K: VideoSink>(
        &mut self,
        camera: &mut C,
        sink: &mut K,
        timeout: Duration,
    ) -> Result<FrameResult, CaptureError> {
        let serial = self.serial.as_str();
        debug!(serial, stream = self.name, "reading frame");

        let image = match camera.next_image(timeout) {
            Ok(image) => image,
            Err(CameraError::Timeout) => {
                warn!(serial, stream = self.name, timeout = ?timeout, "image retrieval timed out");
                self.stats.timeouts += 1;
                return Ok(FrameResult::Incomplete {
                    status: TIMEOUT_STATUS,
                });
            }
            Err(source) => {
                return Err(CaptureError::Device {
                    serial: serial.to_owned(),
                    source,
                })
            }
        };

        if let ImageStatus::Incomplete(status) = image.status() {
            image.release();
            warn!(serial, stream = self.name, status, "image incomplete");
            self.stats.incomplete += 1;
            return Ok(FrameResult::Incomplete { status });
        }

        let frame = image.frame();
        let info = FrameInfo::from(&frame);
        let written = convert::check_frame(&frame).map(|_| sink.write_frame(&frame));
        // The sink copies the frame, so the device buffer goes back to the
        // pool on every path.
        image.release();

        self.stats.complete += 1;
        match written {
            Err(err) => {
                warn!(serial, stream = self.name, error = %err, "dropping unconvertible frame");
                self.stats.dropped += 1;
                Ok(FrameResult::Incomplete {
                    status: CONVERSION_FAILED_STATUS,
                })
            }
            Ok(result) => {
                result?;
                self.stats.written += 1;
                debug!(serial, stream = self.name, frame_id = info.frame_id, "frame written");
                Ok(FrameResult::Frame(info))
            }
        }
    }

    fn run_worker<C: Camera, K: VideoSink>(
        mut self,
        camera: &mut C,
        sink: &mut K,
        timeout: Duration,
        rendezvous: &Rendezvous<'_>,
    ) -> (StreamStats, Result<(), CaptureError>) {
        let mut outcome = Ok(());
        loop {
            if outcome.is_ok() && !rendezvous.stop.is_triggered() {
                // A panic must not skip the barrier, or the other worker
                // waits forever.
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.cycle(camera, sink, timeout)
                }))
                .unwrap_or_else(|_| {
                    error!(serial = %self.serial, stream = self.name, "capture worker panicked");
                    Err(CaptureError::Device {
                        serial: self.serial.clone(),
                        source: CameraError::Acquisition(format!(
                            "{} capture worker panicked",
                            self.name
                        )),
                    })
                });
                if let Err(err) = result {
                    rendezvous.failed.store(true, Ordering::SeqCst);
                    outcome = Err(err);
                }
            }

            if rendezvous.barrier.wait().is_leader() {
                rendezvous.cycles.fetch_add(1, Ordering::SeqCst);
                if rendezvous.start.elapsed() > rendezvous.duration
                    || rendezvous.stop.is_triggered()
                    || rendezvous.failed.load(Ordering::SeqCst)
                {
                    rendezvous.done.store(true, Ordering::SeqCst);
                }
            }
            rendezvous.barrier.wait();

            if rendezvous.done.load(Ordering::SeqCst) {
                return (self.stats, outcome);
            }
        }
    }
}

fn log_summary(summary: &CaptureSummary) {
    info!(
        cycles = summary.cycles,
        elapsed = ?summary.elapsed,
        left_written = summary.left.written,
        right_written = summary.right.written,
        left_incomplete = summary.left.incomplete + summary.left.timeouts,
        right_incomplete = summary.right.incomplete + summary.right.timeouts,
        cancelled = summary.cancelled,
        "capture finished"
    );
}
