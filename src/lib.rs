//! Sync-Cam-Capture: hardware-triggered dual camera capture.
//!
//! A primary camera drives a trigger line that a secondary camera exposes
//! on. This library configures both through an ordered sequence of property
//! writes, arms them consumer first, and records both streams into paired
//! `left_`/`right_` video files for a bounded duration.
//!
//! Devices are reached through the [`Camera`] and [`NodeMap`] traits, with a
//! V4L2 backend for real hardware and a simulated rig for tests.

pub mod capture;
pub mod config;
pub mod configurator;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod error;
pub mod mock;
pub mod session;
pub mod sink;
pub mod traits;
pub mod validation;

pub use capture::{CaptureLoop, CaptureMode, CaptureSummary, StopSignal};
pub use config::{CameraConfig, RigConfig};
pub use configurator::Configurator;
pub use device::V4l2Camera;
pub use error::{CameraError, ConfigurationError, SessionError};
pub use session::{AcquisitionSession, SessionPlan, SessionState};
pub use sink::{open_sink, output_paths, Codec, OutputSink, SinkSpec, VideoSink};
pub use traits::{Camera, GrabbedImage, NodeMap, PixelFormat, Role};
