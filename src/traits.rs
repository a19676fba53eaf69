//! Core traits and types for the camera abstraction.
//!
//! A camera is driven through two seams: a [`NodeMap`] of named, typed
//! properties used during setup, and the [`Camera`] acquisition calls used
//! while frames flow.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use crate::error::CameraError;

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Position of a camera in the trigger chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Generates the trigger signal on one of its output lines.
    Primary,
    /// Exposes on edges received from the primary.
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Value held by a property node.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Integer node value.
    Integer(i64),
    /// Float node value.
    Float(f64),
    /// Boolean node value.
    Boolean(bool),
    /// Enumeration node value, by entry name.
    Enumeration(String),
}

impl PropertyValue {
    /// Name of the node kind this value fits.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Enumeration(_) => "enumeration",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Enumeration(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Enumeration(value.to_owned())
    }
}

/// Type of a property node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Integer register.
    Integer,
    /// Float register.
    Float,
    /// Boolean register.
    Boolean,
    /// Enumeration with named entries.
    Enumeration,
    /// Executable command.
    Command,
    /// Read-only string.
    String,
}

/// Access a node currently allows. Depends on the device mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Node exists but is locked in the current mode.
    NotAvailable,
    /// Node can only be read.
    ReadOnly,
    /// Node can only be written (or executed).
    WriteOnly,
    /// Node can be read and written.
    ReadWrite,
}

impl AccessMode {
    /// Whether the node can be read.
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether the node can be written or executed.
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Description of a property node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node type.
    pub kind: NodeKind,
    /// Current access.
    pub access: AccessMode,
}

/// One entry of an enumeration node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumEntry {
    /// Symbolic entry name, e.g. `Continuous`.
    pub name: String,
    /// Integer value the device stores for this entry.
    pub value: i64,
    /// Whether the entry is currently selectable.
    pub readable: bool,
}

/// Named, typed property store of one device.
pub trait NodeMap {
    /// Look up a node by name.
    fn node(&self, name: &str) -> Option<NodeInfo>;

    /// Read the current value of a node.
    fn read(&self, name: &str) -> Result<PropertyValue>;

    /// Write a node. The device may reject the value.
    fn write(&mut self, name: &str, value: PropertyValue) -> Result<()>;

    /// Look up an entry of an enumeration node by name.
    fn entry(&self, name: &str, entry: &str) -> Option<EnumEntry>;

    /// Execute a command node.
    fn execute(&mut self, name: &str) -> Result<()>;

    /// Whether the node exists and is readable.
    fn is_readable(&self, name: &str) -> bool {
        self.node(name).is_some_and(|node| node.access.is_readable())
    }

    /// Whether the node exists and is writable.
    fn is_writable(&self, name: &str) -> bool {
        self.node(name).is_some_and(|node| node.access.is_writable())
    }
}

/// Sensor pixel encoding of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit Bayer, RGGB tile.
    BayerRG8,
    /// 8-bit Bayer, GBRG tile.
    BayerGB8,
    /// 8-bit Bayer, GRBG tile.
    BayerGR8,
    /// 8-bit Bayer, BGGR tile.
    BayerBG8,
    /// 8-bit monochrome.
    Mono8,
    /// 24-bit interleaved RGB.
    RGB8,
}

impl PixelFormat {
    /// Name of the enumeration entry for this format.
    pub const fn name(self) -> &'static str {
        match self {
            Self::BayerRG8 => "BayerRG8",
            Self::BayerGB8 => "BayerGB8",
            Self::BayerGR8 => "BayerGR8",
            Self::BayerBG8 => "BayerBG8",
            Self::Mono8 => "Mono8",
            Self::RGB8 => "RGB8",
        }
    }

    /// Bytes used per pixel in the raw buffer.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::RGB8 => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "BayerRG8" => Ok(Self::BayerRG8),
            "BayerGB8" => Ok(Self::BayerGB8),
            "BayerGR8" => Ok(Self::BayerGR8),
            "BayerBG8" => Ok(Self::BayerBG8),
            "Mono8" => Ok(Self::Mono8),
            "RGB8" => Ok(Self::RGB8),
            other => Err(format!("unsupported pixel format {other}")),
        }
    }
}

/// A captured frame borrowed from a device buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Raw pixel data.
    pub data: &'a [u8],
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Encoding of `data`.
    pub pixel_format: PixelFormat,
    /// Monotonic device timestamp.
    pub timestamp: Duration,
    /// Device frame counter.
    pub frame_id: u64,
}

/// Transfer status the device reports for a retrieved image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// Every byte of the image arrived.
    Complete,
    /// The image is partial or corrupt; carries the device status code.
    Incomplete(i64),
}

/// An image held in a device buffer until released.
///
/// Dropping the image releases the buffer; [`GrabbedImage::release`] makes
/// the release explicit at the call site.
pub trait GrabbedImage {
    /// Transfer status of the image.
    fn status(&self) -> ImageStatus;

    /// Pixel data and geometry.
    fn frame(&self) -> Frame<'_>;

    /// Return the buffer to the device.
    fn release(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// Abstraction over one physical camera.
pub trait Camera {
    /// Property store of the device.
    type Nodes: NodeMap;

    /// Image type returned by `next_image`.
    type Image<'a>: GrabbedImage
    where
        Self: 'a;

    /// Serial number, for diagnostics only.
    fn serial_number(&self) -> &str;

    /// Open the device for control.
    fn init(&mut self) -> Result<()>;

    /// Release the device handle.
    fn deinit(&mut self) -> Result<()>;

    /// Property store. Only valid between `init` and `deinit`.
    fn node_map(&mut self) -> &mut Self::Nodes;

    /// Start acquisition. The device waits for frames afterwards.
    fn begin_acquisition(&mut self) -> Result<()>;

    /// Stop acquisition.
    fn end_acquisition(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next image.
    fn next_image(&mut self, timeout: Duration) -> Result<Self::Image<'_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_names_round_trip() {
        for format in [
            PixelFormat::BayerRG8,
            PixelFormat::BayerGB8,
            PixelFormat::BayerGR8,
            PixelFormat::BayerBG8,
            PixelFormat::Mono8,
            PixelFormat::RGB8,
        ] {
            assert_eq!(format.name().parse::<PixelFormat>(), Ok(format));
        }
        assert!("YUV422".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::ReadWrite.is_readable());
        assert!(AccessMode::ReadWrite.is_writable());
        assert!(!AccessMode::ReadOnly.is_writable());
        assert!(!AccessMode::WriteOnly.is_readable());
        assert!(!AccessMode::NotAvailable.is_readable());
        assert!(!AccessMode::NotAvailable.is_writable());
    }

    #[test]
    fn test_property_value_display() {
        assert_eq!(PropertyValue::from(1280_i64).to_string(), "1280");
        assert_eq!(PropertyValue::from(1.5_f64).to_string(), "1.5");
        assert_eq!(PropertyValue::from("Continuous").to_string(), "Continuous");
        assert_eq!(PropertyValue::from(true).to_string(), "true");
    }
}
