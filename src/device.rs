//! V4L2 camera backend using the v4l crate.
//!
//! The property store is assembled from three sources:
//!
//! - stream format and parameters, exposed as `Width`, `Height`,
//!   `PixelFormat`, `OffsetX`/`OffsetY` and the `AcquisitionFrameRate*` nodes;
//! - every driver control, under its name in CamelCase
//!   (`"Trigger Mode"` becomes `TriggerMode`);
//! - standard feature aliases (`ExposureTime`, `ExposureAuto`, `Gain`,
//!   `GainAuto`, `BalanceWhiteAuto`, `BalanceRatio`) over the V4L2 user and
//!   camera class controls.
//!
//! Controls the driver reports as inactive are read-only, so a manual value
//! is locked until its auto mode is switched off, as on GenICam devices.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};
use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::control::{Control, Description, Flags as ControlFlags, MenuItem, Type as ControlType, Value};
use v4l::fraction::Fraction;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream as _, Stream as _};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::configurator::nodes;
use crate::traits::{
    AccessMode, Camera, CameraError, EnumEntry, Frame, GrabbedImage, ImageStatus, NodeInfo,
    NodeKind, NodeMap, PixelFormat, PropertyValue, Result,
};

/// Buffers queued for mmap streaming.
const BUFFER_COUNT: u32 = 4;

// V4L2 control ids (linux/v4l2-controls.h).
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_RED_BALANCE: u32 = 0x0098_090e;
const CID_BLUE_BALANCE: u32 = 0x0098_090f;
const CID_AUTOGAIN: u32 = 0x0098_0912;
const CID_GAIN: u32 = 0x0098_0913;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

// V4L2_CID_EXPOSURE_AUTO menu values.
const EXPOSURE_AUTO: i64 = 0;
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// `V4L2_CID_EXPOSURE_ABSOLUTE` counts in 100 µs units.
const EXPOSURE_UNIT_US: f64 = 100.0;

/// Nodes with no V4L2 counterpart, accepted and remembered.
const STORED_ENUMS: [(&str, &[&str]); 3] = [
    (nodes::ACQUISITION_MODE, &["Continuous"]),
    (nodes::FRAME_RATE_AUTO, &["Off", "Continuous"]),
    (nodes::EXPOSURE_COMPENSATION_AUTO, &["Off", "Once", "Continuous"]),
];

const AUTO_ENTRIES: [&str; 2] = ["Off", "Continuous"];
const BALANCE_CHANNELS: [&str; 2] = ["Red", "Blue"];

/// Convert a driver control or menu item name to a feature name.
///
/// `"Exposure Time, Absolute"` becomes `ExposureTimeAbsolute`.
pub fn feature_name(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

/// FourCC for a pixel format.
pub fn fourcc_for(format: PixelFormat) -> FourCC {
    let code = match format {
        PixelFormat::BayerRG8 => b"RGGB",
        PixelFormat::BayerGB8 => b"GBRG",
        PixelFormat::BayerGR8 => b"GRBG",
        PixelFormat::BayerBG8 => b"BGGR",
        PixelFormat::Mono8 => b"GREY",
        PixelFormat::RGB8 => b"RGB3",
    };
    FourCC::new(code)
}

/// Pixel format of a FourCC, if it is one the converter handles.
pub fn pixel_format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"RGGB" => Some(PixelFormat::BayerRG8),
        b"GBRG" => Some(PixelFormat::BayerGB8),
        b"GRBG" => Some(PixelFormat::BayerGR8),
        b"BGGR" => Some(PixelFormat::BayerBG8),
        b"GREY" => Some(PixelFormat::Mono8),
        b"RGB3" => Some(PixelFormat::RGB8),
        _ => None,
    }
}

fn stream_error(context: &str, err: &std::io::Error) -> CameraError {
    CameraError::Acquisition(format!("{context}: {err}"))
}

/// How a feature name maps onto the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Width,
    Height,
    Offset,
    PixelFormat,
    FrameRate,
    FrameRateEnabled,
    Stored,
    ExposureTime(u32),
    ExposureAuto(u32),
    AutoSwitch(u32),
    BalanceRatioSelector,
    BalanceRatio,
    Control(u32),
}

/// Property store of one V4L2 device.
pub struct V4l2NodeMap {
    device: Device,
    controls: Vec<Description>,
    stored: HashMap<String, String>,
    frame_rate_enabled: bool,
    balance_channel: String,
    streaming: bool,
}

impl V4l2NodeMap {
    fn new(device: Device) -> Self {
        let stored = STORED_ENUMS
            .iter()
            .filter_map(|(name, entries)| Some(((*name).to_owned(), (*entries.first()?).to_owned())))
            .collect();
        Self {
            device,
            controls: Vec::new(),
            stored,
            frame_rate_enabled: false,
            balance_channel: "Red".to_owned(),
            streaming: false,
        }
    }

    /// Re-read the control list; access flags change with auto modes.
    fn refresh(&mut self) -> Result<()> {
        self.controls = self.device.query_controls()?;
        Ok(())
    }

    fn control(&self, id: u32) -> Option<&Description> {
        self.controls.iter().find(|desc| desc.id == id)
    }

    fn control_by_name(&self, name: &str) -> Option<&Description> {
        self.controls
            .iter()
            .find(|desc| control_kind(desc).is_some() && feature_name(&desc.name) == name)
    }

    fn binding(&self, name: &str) -> Option<Binding> {
        let present = |id| self.control(id).map(|_| id);
        let binding = match name {
            nodes::WIDTH => Binding::Width,
            nodes::HEIGHT => Binding::Height,
            nodes::OFFSET_X | nodes::OFFSET_Y => Binding::Offset,
            nodes::PIXEL_FORMAT => Binding::PixelFormat,
            nodes::FRAME_RATE => Binding::FrameRate,
            nodes::FRAME_RATE_ENABLED => Binding::FrameRateEnabled,
            nodes::EXPOSURE_TIME => Binding::ExposureTime(present(CID_EXPOSURE_ABSOLUTE)?),
            nodes::EXPOSURE_AUTO => Binding::ExposureAuto(present(CID_EXPOSURE_AUTO)?),
            nodes::GAIN => Binding::Control(present(CID_GAIN)?),
            nodes::GAIN_AUTO => Binding::AutoSwitch(present(CID_AUTOGAIN)?),
            nodes::BALANCE_WHITE_AUTO => Binding::AutoSwitch(present(CID_AUTO_WHITE_BALANCE)?),
            nodes::BALANCE_RATIO_SELECTOR | nodes::BALANCE_RATIO => {
                present(CID_RED_BALANCE)?;
                present(CID_BLUE_BALANCE)?;
                if name == nodes::BALANCE_RATIO {
                    Binding::BalanceRatio
                } else {
                    Binding::BalanceRatioSelector
                }
            }
            _ if self.stored.contains_key(name) => Binding::Stored,
            _ => Binding::Control(self.control_by_name(name)?.id),
        };
        Some(binding)
    }

    fn control_access(&self, id: u32) -> AccessMode {
        let Some(desc) = self.control(id) else {
            return AccessMode::NotAvailable;
        };
        if desc.flags.contains(ControlFlags::DISABLED) {
            AccessMode::NotAvailable
        } else if desc.flags.contains(ControlFlags::READ_ONLY)
            || desc.flags.contains(ControlFlags::INACTIVE)
            || desc.flags.contains(ControlFlags::GRABBED)
        {
            AccessMode::ReadOnly
        } else if desc.flags.contains(ControlFlags::WRITE_ONLY) {
            AccessMode::WriteOnly
        } else {
            AccessMode::ReadWrite
        }
    }

    fn info(&self, binding: Binding) -> Option<NodeInfo> {
        let geometry_access = if self.streaming {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let (kind, access) = match binding {
            Binding::Width | Binding::Height | Binding::Offset => (NodeKind::Integer, geometry_access),
            Binding::PixelFormat => (NodeKind::Enumeration, geometry_access),
            Binding::FrameRate => (
                NodeKind::Float,
                if self.frame_rate_enabled {
                    AccessMode::ReadWrite
                } else {
                    AccessMode::ReadOnly
                },
            ),
            Binding::FrameRateEnabled => (NodeKind::Boolean, AccessMode::ReadWrite),
            Binding::Stored | Binding::BalanceRatioSelector => {
                (NodeKind::Enumeration, AccessMode::ReadWrite)
            }
            Binding::ExposureTime(id) => (NodeKind::Float, self.control_access(id)),
            Binding::ExposureAuto(id) | Binding::AutoSwitch(id) => {
                (NodeKind::Enumeration, self.control_access(id))
            }
            Binding::BalanceRatio => (NodeKind::Float, self.control_access(self.balance_id())),
            Binding::Control(id) => (control_kind(self.control(id)?)?, self.control_access(id)),
        };
        Some(NodeInfo { kind, access })
    }

    fn balance_id(&self) -> u32 {
        if self.balance_channel == "Blue" {
            CID_BLUE_BALANCE
        } else {
            CID_RED_BALANCE
        }
    }

    fn read_control(&self, id: u32) -> Result<i64> {
        match self.device.control(id)?.value {
            Value::Integer(value) => Ok(value),
            Value::Boolean(value) => Ok(i64::from(value)),
            _ => Err(CameraError::TypeMismatch {
                node: format!("control {id:#x}"),
                expected: "integer",
            }),
        }
    }

    fn write_control(&self, id: u32, value: i64) -> Result<()> {
        let value = match self.control(id).map(|desc| desc.typ) {
            Some(ControlType::Boolean) => Value::Boolean(value != 0),
            _ => Value::Integer(value),
        };
        self.device.set_control(Control { id, value })?;
        Ok(())
    }

    /// Entries of an enumeration node with their device values.
    fn entries(&self, binding: Binding) -> Vec<(String, i64)> {
        let named = |names: &[&str]| -> Vec<(String, i64)> {
            (0..).zip(names).map(|(value, name)| ((*name).to_owned(), value)).collect()
        };
        match binding {
            Binding::PixelFormat => self
                .device
                .enum_formats()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|desc| pixel_format_for(desc.fourcc))
                .map(|format| (format.name().to_owned(), 0))
                .collect(),
            Binding::Stored => Vec::new(),
            Binding::BalanceRatioSelector => named(&BALANCE_CHANNELS),
            Binding::AutoSwitch(_) => named(&AUTO_ENTRIES),
            Binding::ExposureAuto(id) => {
                let automatic = if self.menu_has(id, EXPOSURE_AUTO) {
                    EXPOSURE_AUTO
                } else {
                    EXPOSURE_APERTURE_PRIORITY
                };
                vec![("Off".to_owned(), EXPOSURE_MANUAL), ("Continuous".to_owned(), automatic)]
            }
            Binding::Control(id) => match self.control(id) {
                Some(desc) if desc.typ == ControlType::Boolean => named(&["Off", "On"]),
                Some(desc) => desc
                    .items
                    .iter()
                    .flatten()
                    .map(|(index, item)| {
                        let name = match item {
                            MenuItem::Name(name) => feature_name(name),
                            MenuItem::Value(value) => value.to_string(),
                        };
                        (name, i64::from(*index))
                    })
                    .collect(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Current entry of an enumeration, or the raw value if no entry matches.
    fn read_entry(&self, binding: Binding, id: u32) -> Result<PropertyValue> {
        let raw = self.read_control(id)?;
        Ok(self
            .entries(binding)
            .into_iter()
            .find(|(_, value)| *value == raw)
            .map_or(PropertyValue::Integer(raw), |(entry, _)| {
                PropertyValue::Enumeration(entry)
            }))
    }

    fn menu_has(&self, id: u32, value: i64) -> bool {
        self.control(id).is_some_and(|desc| {
            desc.items
                .iter()
                .flatten()
                .any(|(index, _)| i64::from(*index) == value)
        })
    }

    fn entry_value(&self, name: &str, binding: Binding, entry: &str) -> Result<i64> {
        self.entries(binding)
            .into_iter()
            .find(|(candidate, _)| candidate == entry)
            .map(|(_, value)| value)
            .ok_or_else(|| CameraError::EntryNotFound {
                node: name.to_owned(),
                entry: entry.to_owned(),
            })
    }

    fn set_dimension(&self, name: &str, value: u32, width: bool) -> Result<()> {
        let mut format = self.device.format()?;
        if width {
            format.width = value;
        } else {
            format.height = value;
        }
        let actual = self.device.set_format(&format)?;
        let applied = if width { actual.width } else { actual.height };
        if applied == value {
            Ok(())
        } else {
            Err(CameraError::WriteRejected {
                node: name.to_owned(),
                reason: format!("driver adjusted {value} to {applied}"),
            })
        }
    }

    fn frame_rate(&self) -> Result<f64> {
        let interval = self.device.params()?.interval;
        if interval.numerator == 0 {
            return Err(CameraError::NotReadable(nodes::FRAME_RATE.to_owned()));
        }
        Ok(f64::from(interval.denominator) / f64::from(interval.numerator))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn set_frame_rate(&self, fps: f64) -> Result<()> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(CameraError::WriteRejected {
                node: nodes::FRAME_RATE.to_owned(),
                reason: format!("{fps} is not a positive rate"),
            });
        }
        let params = if fps.fract().abs() < f64::EPSILON {
            Parameters::with_fps(fps as u32)
        } else {
            Parameters::new(Fraction::new(1000, (fps * 1000.0).round() as u32))
        };
        self.device.set_params(&params)?;
        Ok(())
    }

    fn stream_format(&self) -> Result<(u32, u32, PixelFormat)> {
        let format = self.device.format()?;
        let pixel_format = pixel_format_for(format.fourcc).ok_or_else(|| {
            CameraError::Acquisition(format!("unsupported stream format {}", format.fourcc))
        })?;
        Ok((format.width, format.height, pixel_format))
    }
}

/// Node kind of a driver control, for the control types exposed.
fn control_kind(desc: &Description) -> Option<NodeKind> {
    match desc.typ {
        ControlType::Integer | ControlType::Integer64 => Some(NodeKind::Integer),
        ControlType::Boolean => Some(NodeKind::Boolean),
        ControlType::Menu | ControlType::IntegerMenu => Some(NodeKind::Enumeration),
        ControlType::Button => Some(NodeKind::Command),
        _ => None,
    }
}

fn type_mismatch(name: &str, expected: &'static str) -> CameraError {
    CameraError::TypeMismatch {
        node: name.to_owned(),
        expected,
    }
}

impl NodeMap for V4l2NodeMap {
    fn node(&self, name: &str) -> Option<NodeInfo> {
        self.info(self.binding(name)?)
    }

    #[allow(clippy::cast_precision_loss)]
    fn read(&self, name: &str) -> Result<PropertyValue> {
        let binding = self
            .binding(name)
            .ok_or_else(|| CameraError::NodeNotFound(name.to_owned()))?;
        let value = match binding {
            Binding::Width => i64::from(self.device.format()?.width).into(),
            Binding::Height => i64::from(self.device.format()?.height).into(),
            Binding::Offset => 0_i64.into(),
            Binding::PixelFormat => self.stream_format()?.2.name().into(),
            Binding::FrameRate => self.frame_rate()?.into(),
            Binding::FrameRateEnabled => self.frame_rate_enabled.into(),
            Binding::Stored => self
                .stored
                .get(name)
                .map(String::as_str)
                .unwrap_or_default()
                .into(),
            Binding::BalanceRatioSelector => self.balance_channel.as_str().into(),
            Binding::BalanceRatio => {
                let id = self.balance_id();
                let default = self.control(id).map_or(1, |desc| desc.default.max(1));
                (self.read_control(id)? as f64 / default as f64).into()
            }
            Binding::ExposureTime(id) => (self.read_control(id)? as f64 * EXPOSURE_UNIT_US).into(),
            Binding::ExposureAuto(id) | Binding::AutoSwitch(id) => self.read_entry(binding, id)?,
            Binding::Control(id) => match self.info(binding).map(|info| info.kind) {
                Some(NodeKind::Integer) => self.read_control(id)?.into(),
                Some(NodeKind::Boolean) => (self.read_control(id)? != 0).into(),
                Some(NodeKind::Enumeration) => self.read_entry(binding, id)?,
                _ => return Err(CameraError::NotReadable(name.to_owned())),
            },
        };
        Ok(value)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn write(&mut self, name: &str, value: PropertyValue) -> Result<()> {
        let binding = self
            .binding(name)
            .ok_or_else(|| CameraError::NodeNotFound(name.to_owned()))?;
        if !self.info(binding).is_some_and(|info| info.access.is_writable()) {
            return Err(CameraError::NotWritable(name.to_owned()));
        }
        let dimension = |value: &PropertyValue| match value {
            PropertyValue::Integer(v) => u32::try_from(*v).map_err(|_| CameraError::WriteRejected {
                node: name.to_owned(),
                reason: format!("{v} is out of range"),
            }),
            _ => Err(type_mismatch(name, "integer")),
        };

        match (binding, &value) {
            (Binding::Width, _) => self.set_dimension(name, dimension(&value)?, true)?,
            (Binding::Height, _) => self.set_dimension(name, dimension(&value)?, false)?,
            (Binding::Offset, _) => {
                if dimension(&value)? != 0 {
                    return Err(CameraError::WriteRejected {
                        node: name.to_owned(),
                        reason: "V4L2 capture has no region-of-interest offset".to_owned(),
                    });
                }
            }
            (Binding::PixelFormat, PropertyValue::Enumeration(entry)) => {
                let format: PixelFormat = entry.parse().map_err(|_| CameraError::EntryNotFound {
                    node: name.to_owned(),
                    entry: entry.clone(),
                })?;
                let mut current = self.device.format()?;
                current.fourcc = fourcc_for(format);
                let actual = self.device.set_format(&current)?;
                if actual.fourcc != current.fourcc {
                    return Err(CameraError::WriteRejected {
                        node: name.to_owned(),
                        reason: format!("driver kept {}", actual.fourcc),
                    });
                }
            }
            (Binding::FrameRate, PropertyValue::Float(fps)) => self.set_frame_rate(*fps)?,
            (Binding::FrameRateEnabled, PropertyValue::Boolean(enabled)) => {
                self.frame_rate_enabled = *enabled;
            }
            (Binding::Stored, PropertyValue::Enumeration(entry)) => {
                let known = STORED_ENUMS
                    .iter()
                    .any(|(node, entries)| *node == name && entries.contains(&entry.as_str()));
                if !known {
                    return Err(CameraError::EntryNotFound {
                        node: name.to_owned(),
                        entry: entry.clone(),
                    });
                }
                self.stored.insert(name.to_owned(), entry.clone());
            }
            (Binding::BalanceRatioSelector, PropertyValue::Enumeration(entry)) => {
                self.entry_value(name, binding, entry)?;
                self.balance_channel.clone_from(entry);
            }
            (Binding::BalanceRatio, PropertyValue::Float(ratio)) => {
                let id = self.balance_id();
                let default = self.control(id).map_or(1, |desc| desc.default.max(1));
                self.write_control(id, (ratio * default as f64).round() as i64)?;
            }
            (Binding::ExposureTime(id), PropertyValue::Float(us)) => {
                self.write_control(id, (us / EXPOSURE_UNIT_US).round().max(1.0) as i64)?;
            }
            (Binding::ExposureAuto(id) | Binding::AutoSwitch(id), PropertyValue::Enumeration(entry)) => {
                let raw = self.entry_value(name, binding, entry)?;
                self.write_control(id, raw)?;
            }
            (Binding::Control(id), PropertyValue::Enumeration(entry)) => {
                let raw = self.entry_value(name, binding, entry)?;
                self.write_control(id, raw)?;
            }
            (Binding::Control(id), PropertyValue::Integer(raw)) => self.write_control(id, *raw)?,
            (Binding::Control(id), PropertyValue::Boolean(flag)) => {
                self.write_control(id, i64::from(*flag))?;
            }
            (Binding::Control(id), PropertyValue::Float(raw)) => {
                self.write_control(id, raw.round() as i64)?;
            }
            _ => {
                let expected = match self.info(binding).map(|info| info.kind) {
                    Some(NodeKind::Float) => "float",
                    Some(NodeKind::Boolean) => "boolean",
                    Some(NodeKind::Integer) => "integer",
                    _ => "enumeration",
                };
                return Err(type_mismatch(name, expected));
            }
        }

        debug!(node = name, value = %value, "v4l2 node written");
        self.refresh()
    }

    fn entry(&self, name: &str, entry: &str) -> Option<EnumEntry> {
        let binding = self.binding(name)?;
        let entries = if binding == Binding::Stored {
            STORED_ENUMS
                .iter()
                .find(|(node, _)| *node == name)
                .map(|(_, entries)| (0..).zip(entries.iter()).map(|(i, e)| ((*e).to_owned(), i)).collect())
                .unwrap_or_default()
        } else {
            self.entries(binding)
        };
        entries
            .into_iter()
            .find(|(candidate, _)| candidate == entry)
            .map(|(name, value)| EnumEntry {
                name,
                value,
                readable: true,
            })
    }

    fn execute(&mut self, name: &str) -> Result<()> {
        match self.binding(name) {
            Some(Binding::Control(id))
                if self.control(id).is_some_and(|desc| desc.typ == ControlType::Button) =>
            {
                self.write_control(id, 1)?;
                self.refresh()
            }
            Some(_) => Err(CameraError::NotWritable(name.to_owned())),
            None => Err(CameraError::NodeNotFound(name.to_owned())),
        }
    }
}

/// A V4L2 capture device driven as a [`Camera`].
pub struct V4l2Camera {
    index: u32,
    serial: String,
    nodes: V4l2NodeMap,
    stream: Option<MmapStream<'static>>,
    format: (u32, u32, PixelFormat),
    initialized: bool,
}

impl V4l2Camera {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    ///
    /// The bus info stands in for the serial number.
    pub fn open(index: u32) -> Result<Self> {
        let device = Device::new(index as usize)
            .map_err(|err| stream_error(&format!("failed to open /dev/video{index}"), &err))?;
        let caps = device
            .query_caps()
            .map_err(|err| stream_error("failed to query capabilities", &err))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(v4l::capability::Flags::STREAMING)
        {
            return Err(CameraError::Acquisition(format!(
                "/dev/video{index} ({}) cannot stream video capture",
                caps.card
            )));
        }
        info!(index, card = %caps.card, driver = %caps.driver, bus = %caps.bus, "v4l2 device opened");

        Ok(Self {
            index,
            serial: caps.bus,
            nodes: V4l2NodeMap::new(device),
            stream: None,
            format: (0, 0, PixelFormat::BayerRG8),
            initialized: false,
        })
    }

    /// Device index.
    pub const fn index(&self) -> u32 {
        self.index
    }
}

impl Camera for V4l2Camera {
    type Nodes = V4l2NodeMap;
    type Image<'a> = V4l2Image<'a>;

    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn init(&mut self) -> Result<()> {
        self.nodes.refresh()?;
        self.initialized = true;
        debug!(serial = %self.serial, controls = self.nodes.controls.len(), "v4l2 controls loaded");
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.stream = None;
        self.nodes.streaming = false;
        self.initialized = false;
        Ok(())
    }

    fn node_map(&mut self) -> &mut Self::Nodes {
        &mut self.nodes
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(CameraError::Acquisition("camera not initialized".to_owned()));
        }
        self.format = self.nodes.stream_format()?;
        let mut stream = MmapStream::with_buffers(&self.nodes.device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| stream_error("failed to create stream", &err))?;
        stream
            .start()
            .map_err(|err| stream_error("failed to start stream", &err))?;
        self.stream = Some(stream);
        self.nodes.streaming = true;
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.nodes.streaming = false;
        stream
            .stop()
            .map_err(|err| stream_error("failed to stop stream", &err))
    }

    fn next_image(&mut self, timeout: Duration) -> Result<Self::Image<'_>> {
        let (width, height, pixel_format) = self.format;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::Acquisition("acquisition not started".to_owned()))?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                CameraError::Timeout
            } else {
                stream_error("failed to dequeue buffer", &err)
            }
        })?;

        let expected = width as usize * height as usize * pixel_format.bytes_per_pixel();
        let used = (meta.bytesused as usize).min(buf.len());
        let status = if meta.flags.contains(BufferFlags::ERROR) || used < expected {
            ImageStatus::Incomplete(i64::from(meta.flags.bits()))
        } else {
            ImageStatus::Complete
        };

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(V4l2Image {
            data: buf.get(..used).unwrap_or_default(),
            status,
            width,
            height,
            pixel_format,
            timestamp: Duration::new(secs, nanos),
            frame_id: u64::from(meta.sequence),
        })
    }
}

/// A dequeued V4L2 buffer.
///
/// The buffer is requeued by the stream on the next dequeue, so releasing
/// only ends the borrow.
pub struct V4l2Image<'a> {
    data: &'a [u8],
    status: ImageStatus,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    timestamp: Duration,
    frame_id: u64,
}

impl GrabbedImage for V4l2Image<'_> {
    fn status(&self) -> ImageStatus {
        self.status
    }

    fn frame(&self) -> Frame<'_> {
        Frame {
            data: self.data,
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            timestamp: self.timestamp,
            frame_id: self.frame_id,
        }
    }
}
