//! Error types for device control, configuration, recording and sessions.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;
use crate::traits::PixelFormat;

/// Error reported by a camera backend.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device has no node with this name.
    #[error("node {0} does not exist")]
    NodeNotFound(String),
    /// The node exists but cannot be read in the current mode.
    #[error("node {0} is not readable")]
    NotReadable(String),
    /// The node exists but cannot be written in the current mode.
    #[error("node {0} is not writable")]
    NotWritable(String),
    /// An enumeration node has no entry with this name.
    #[error("node {node} has no entry {entry}")]
    EntryNotFound {
        /// Enumeration node name.
        node: String,
        /// Requested entry name.
        entry: String,
    },
    /// The value was passed to the device and refused.
    #[error("write to {node} rejected: {reason}")]
    WriteRejected {
        /// Node name.
        node: String,
        /// Reason given by the device.
        reason: String,
    },
    /// The value type does not match the node type.
    #[error("node {node} expects {expected}")]
    TypeMismatch {
        /// Node name.
        node: String,
        /// Expected node kind.
        expected: &'static str,
    },
    /// No image arrived before the retrieval timeout.
    #[error("image retrieval timed out")]
    Timeout,
    /// Acquisition control (init, start, stop, release) failed.
    #[error("acquisition error: {0}")]
    Acquisition(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A property write refused during device setup. Always fatal to the session.
#[derive(Debug, Error)]
#[error("configuring {property} on camera {serial} failed: {reason}")]
pub struct ConfigurationError {
    /// Serial number of the device being configured.
    pub serial: String,
    /// Property that could not be applied.
    pub property: String,
    /// Underlying cause.
    #[source]
    pub reason: CameraError,
}

/// Error raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    FileRead {
        /// Config path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML or misses a required field.
    #[error("failed to parse config {path}: {message}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },
    /// A field is present but holds an unusable value.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted field path, e.g. `acquisition_settings.fps`.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Error raised by a video sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The output file could not be created.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Output path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
    /// Writing a frame failed.
    #[error("failed to write frame: {0}")]
    Write(#[from] std::io::Error),
    /// The frame does not match the size the sink was opened with.
    #[error("frame is {actual_width}x{actual_height}, sink expects {width}x{height}")]
    FrameSize {
        /// Sink width.
        width: u32,
        /// Sink height.
        height: u32,
        /// Frame width.
        actual_width: u32,
        /// Frame height.
        actual_height: u32,
    },
    /// The frame encoding differs from the one the sink was opened with.
    #[error("frame is {actual}, sink expects {expected}")]
    PixelFormat {
        /// Sink pixel format.
        expected: PixelFormat,
        /// Frame pixel format.
        actual: PixelFormat,
    },
    /// The frame could not be converted for this output.
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    /// The encoding pipeline could not be built or reported an error.
    #[error("encoding pipeline: {0}")]
    Pipeline(String),
    /// The sink was already finished.
    #[error("sink already closed")]
    Closed,
}

/// A raw buffer that cannot be converted to RGB.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The buffer holds fewer bytes than the geometry requires.
    #[error("buffer holds {actual} bytes, {width}x{height} {format} needs {expected}")]
    BufferTooSmall {
        /// Frame width.
        width: u32,
        /// Frame height.
        height: u32,
        /// Pixel format name.
        format: &'static str,
        /// Required byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },
}

/// Error that ends the capture loop early.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A device failed in a way other than a timeout or incomplete image.
    #[error("camera {serial}: {source}")]
    Device {
        /// Device serial number.
        serial: String,
        /// Underlying error.
        source: CameraError,
    },
    /// A sink refused a frame.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A check on captured data or recorded writes did not hold.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Teardown step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Stopping acquisition.
    EndAcquisition,
    /// Releasing the device handle.
    Release,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndAcquisition => write!(f, "end acquisition"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Failure of one teardown step on one device.
#[derive(Debug, Error)]
#[error("{step} failed on camera {serial}: {source}")]
pub struct DeviceTeardownError {
    /// Device serial number.
    pub serial: String,
    /// Step that failed.
    pub step: TeardownStep,
    /// Underlying error.
    pub source: CameraError,
}

/// All teardown failures of a session, collected after every step ran.
#[derive(Debug, Default)]
pub struct TeardownErrors(pub Vec<DeviceTeardownError>);

impl std::error::Error for TeardownErrors {}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} teardown step(s) failed", self.0.len())?;
        for err in &self.0 {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl TeardownErrors {
    /// Whether every teardown step succeeded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Error ending an acquisition session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A device rejected part of its setup sequence.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// A device failed outside the configuration sequence.
    #[error("camera {serial}: {source}")]
    Device {
        /// Device serial number.
        serial: String,
        /// Underlying error.
        source: CameraError,
    },
    /// A video sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// The capture loop stopped on a fatal error.
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The session plan is inconsistent.
    #[error("invalid session plan: {0}")]
    Plan(String),
    /// An operation was called out of order.
    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        /// State the operation requires.
        expected: SessionState,
        /// Current state.
        actual: SessionState,
    },
    /// Capture succeeded but releasing the devices did not.
    #[error(transparent)]
    Teardown(#[from] TeardownErrors),
}
