//! Simulated rig for testing without hardware.
//!
//! [`MockNodeMap`] persists writes and enforces the dependencies a real
//! device enforces (manual values locked while their auto mode is on, ratio
//! writes addressed through a selector, geometry locked while streaming).
//! [`MockCamera`] serves Bayer colour bars with scripted transfer statuses.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::configurator::nodes;
use crate::convert::{to_rgb, RgbImage};
use crate::error::SinkError;
use crate::sink::VideoSink;
use crate::traits::{
    AccessMode, Camera, CameraError, EnumEntry, Frame, GrabbedImage, ImageStatus, NodeInfo,
    NodeKind, NodeMap, PixelFormat, PropertyValue, Result,
};

/// Pure RGB colours of the eight bars, left to right.
pub const COLOR_BARS: [(u8, u8, u8); 8] = [
    (255, 255, 255), // White
    (255, 255, 0),   // Yellow
    (0, 255, 255),   // Cyan
    (0, 255, 0),     // Green
    (255, 0, 255),   // Magenta
    (255, 0, 0),     // Red
    (0, 0, 255),     // Blue
    (0, 0, 0),       // Black
];

const AUTO_MODES: [&str; 3] = ["Off", "Once", "Continuous"];
const LINES: [&str; 4] = ["Line0", "Line1", "Line2", "Line3"];

/// Ordered record of device calls shared between cameras.
///
/// Lets a test assert on the interleaving of calls across both devices.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `"<serial> <event>"`.
    pub fn record(&self, serial: &str, event: &str) {
        if let Ok(mut events) = self.0.lock() {
            events.push(format!("{serial} {event}"));
        }
    }

    /// Snapshot of every recorded event.
    pub fn events(&self) -> Vec<String> {
        self.0.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Position of the first event equal to `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

#[derive(Debug, Clone)]
struct MockNode {
    kind: NodeKind,
    access: AccessMode,
    value: Option<PropertyValue>,
    entries: Vec<String>,
}

impl MockNode {
    fn new(kind: NodeKind, value: Option<PropertyValue>) -> Self {
        Self {
            kind,
            access: AccessMode::ReadWrite,
            value,
            entries: Vec::new(),
        }
    }

    fn enumeration(default: &str, entries: &[&str]) -> Self {
        Self {
            entries: entries.iter().map(|&e| e.to_owned()).collect(),
            ..Self::new(NodeKind::Enumeration, Some(default.into()))
        }
    }

    fn command() -> Self {
        Self {
            access: AccessMode::WriteOnly,
            ..Self::new(NodeKind::Command, None)
        }
    }
}

/// In-memory property store with a recorded write log.
#[derive(Debug, Clone)]
pub struct MockNodeMap {
    serial: String,
    nodes: HashMap<String, MockNode>,
    ratios: HashMap<String, f64>,
    write_log: Vec<(String, PropertyValue)>,
    rejected: HashSet<String>,
    removed: HashSet<String>,
    user_set_loads: usize,
    streaming: bool,
    events: Option<EventLog>,
}

impl Default for MockNodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNodeMap {
    /// Create a store holding every node the setup sequence uses.
    pub fn new() -> Self {
        let mut map = Self {
            serial: "mock".to_owned(),
            nodes: HashMap::new(),
            ratios: HashMap::from([("Red".to_owned(), 1.0), ("Blue".to_owned(), 1.0)]),
            write_log: Vec::new(),
            rejected: HashSet::new(),
            removed: HashSet::new(),
            user_set_loads: 0,
            streaming: false,
            events: None,
        };
        map.load_defaults();
        map
    }

    fn load_defaults(&mut self) {
        let formats = [
            PixelFormat::BayerRG8,
            PixelFormat::BayerGB8,
            PixelFormat::BayerGR8,
            PixelFormat::BayerBG8,
            PixelFormat::Mono8,
            PixelFormat::RGB8,
        ]
        .map(PixelFormat::name);

        let defaults = [
            (nodes::WIDTH, MockNode::new(NodeKind::Integer, Some(64_i64.into()))),
            (nodes::HEIGHT, MockNode::new(NodeKind::Integer, Some(32_i64.into()))),
            (nodes::OFFSET_X, MockNode::new(NodeKind::Integer, Some(0_i64.into()))),
            (nodes::OFFSET_Y, MockNode::new(NodeKind::Integer, Some(0_i64.into()))),
            (nodes::PIXEL_FORMAT, MockNode::enumeration("BayerRG8", &formats)),
            (
                nodes::ACQUISITION_MODE,
                MockNode::enumeration("SingleFrame", &["Continuous", "SingleFrame", "MultiFrame"]),
            ),
            (nodes::FRAME_RATE_AUTO, MockNode::enumeration("Continuous", &["Off", "Continuous"])),
            (nodes::FRAME_RATE_ENABLED, MockNode::new(NodeKind::Boolean, Some(false.into()))),
            (nodes::FRAME_RATE, MockNode::new(NodeKind::Float, Some(30.0.into()))),
            (nodes::EXPOSURE_COMPENSATION_AUTO, MockNode::enumeration("Off", &AUTO_MODES)),
            (nodes::EXPOSURE_AUTO, MockNode::enumeration("Continuous", &AUTO_MODES)),
            (nodes::EXPOSURE_TIME, MockNode::new(NodeKind::Float, Some(10_000.0.into()))),
            (nodes::GAIN_AUTO, MockNode::enumeration("Continuous", &AUTO_MODES)),
            (nodes::GAIN, MockNode::new(NodeKind::Float, Some(0.0.into()))),
            (nodes::BALANCE_WHITE_AUTO, MockNode::enumeration("Continuous", &AUTO_MODES)),
            (nodes::BALANCE_RATIO_SELECTOR, MockNode::enumeration("Red", &["Red", "Blue"])),
            (nodes::BALANCE_RATIO, MockNode::new(NodeKind::Float, None)),
            (nodes::TRIGGER_MODE, MockNode::enumeration("Off", &["Off", "On"])),
            (
                nodes::TRIGGER_SELECTOR,
                MockNode::enumeration("FrameStart", &["FrameStart", "AcquisitionStart"]),
            ),
            (
                nodes::TRIGGER_SOURCE,
                MockNode::enumeration("Software", &["Software", "Line0", "Line1", "Line2", "Line3"]),
            ),
            (
                nodes::TRIGGER_OVERLAP,
                MockNode::enumeration("Off", &["Off", "ReadOut", "PreviousFrame"]),
            ),
            (nodes::LINE_SELECTOR, MockNode::enumeration("Line0", &LINES)),
            (nodes::LINE_MODE, MockNode::enumeration("Input", &["Input", "Output"])),
            (
                nodes::LINE_SOURCE,
                MockNode::enumeration("Off", &["Off", "ExposureActive", "FrameTriggerWait", "UserOutput0"]),
            ),
            (
                nodes::USER_SET_SELECTOR,
                MockNode::enumeration("Default", &["Default", "UserSet0", "UserSet1"]),
            ),
            (nodes::USER_SET_LOAD, MockNode::command()),
        ];

        for (name, node) in defaults {
            if !self.removed.contains(name) {
                self.nodes.insert(name.to_owned(), node);
            }
        }
        self.ratios = HashMap::from([("Red".to_owned(), 1.0), ("Blue".to_owned(), 1.0)]);
    }

    /// Refuse every write to `node` with [`CameraError::WriteRejected`].
    #[must_use]
    pub fn reject_writes_to(mut self, node: &str) -> Self {
        self.rejected.insert(node.to_owned());
        self
    }

    /// Remove `node` from the store.
    #[must_use]
    pub fn without_node(mut self, node: &str) -> Self {
        self.nodes.remove(node);
        self.removed.insert(node.to_owned());
        self
    }

    /// Record successful writes and command executions into `events`.
    #[must_use]
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    fn set_serial(&mut self, serial: &str) {
        serial.clone_into(&mut self.serial);
    }

    fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    /// Successful writes, in order.
    pub fn write_log(&self) -> Vec<(String, PropertyValue)> {
        self.write_log.clone()
    }

    /// Stored ratio of a white balance channel.
    pub fn ratio(&self, channel: &str) -> Option<f64> {
        self.ratios.get(channel).copied()
    }

    /// How often the user set load command ran.
    pub const fn user_set_loads(&self) -> usize {
        self.user_set_loads
    }

    fn enum_value(&self, name: &str) -> Option<&str> {
        match self.nodes.get(name).and_then(|node| node.value.as_ref()) {
            Some(PropertyValue::Enumeration(entry)) => Some(entry),
            _ => None,
        }
    }

    fn integer(&self, name: &str) -> Option<i64> {
        match self.nodes.get(name).and_then(|node| node.value.as_ref()) {
            Some(PropertyValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    /// Current access of `name` after applying the dependency rules.
    fn access(&self, name: &str, node: &MockNode) -> AccessMode {
        let locked_by = |auto: &str| self.enum_value(auto).is_some_and(|mode| mode != "Off");
        let locked = match name {
            nodes::EXPOSURE_TIME => locked_by(nodes::EXPOSURE_AUTO),
            nodes::GAIN => locked_by(nodes::GAIN_AUTO),
            nodes::BALANCE_RATIO => locked_by(nodes::BALANCE_WHITE_AUTO),
            nodes::FRAME_RATE => {
                !matches!(
                    self.nodes.get(nodes::FRAME_RATE_ENABLED).and_then(|n| n.value.as_ref()),
                    Some(PropertyValue::Boolean(true))
                )
            }
            nodes::FRAME_RATE_ENABLED => locked_by(nodes::FRAME_RATE_AUTO),
            nodes::WIDTH
            | nodes::HEIGHT
            | nodes::OFFSET_X
            | nodes::OFFSET_Y
            | nodes::PIXEL_FORMAT
            | nodes::ACQUISITION_MODE => self.streaming,
            _ => false,
        };
        if locked && node.access == AccessMode::ReadWrite {
            AccessMode::ReadOnly
        } else {
            node.access
        }
    }

    fn record(&mut self, name: &str, value: PropertyValue) {
        if let Some(events) = &self.events {
            events.record(&self.serial, &format!("write {name}={value}"));
        }
        self.write_log.push((name.to_owned(), value));
    }

    /// Sensor frame period, and whether a manual frame rate is in force.
    fn frame_clock(&self) -> (Duration, bool) {
        let enabled = matches!(
            self.nodes.get(nodes::FRAME_RATE_ENABLED).and_then(|n| n.value.as_ref()),
            Some(PropertyValue::Boolean(true))
        );
        match self.nodes.get(nodes::FRAME_RATE).and_then(|n| n.value.as_ref()) {
            Some(PropertyValue::Float(fps)) if enabled && *fps > 0.0 => {
                (Duration::from_secs_f64(1.0 / fps), true)
            }
            _ => (DEFAULT_FRAME_PERIOD, false),
        }
    }

    /// Geometry and format the sensor would stream with.
    fn stream_format(&self) -> (u32, u32, PixelFormat) {
        let dimension = |name| {
            self.integer(name)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0)
        };
        let format = self
            .enum_value(nodes::PIXEL_FORMAT)
            .and_then(|name| name.parse().ok())
            .unwrap_or(PixelFormat::BayerRG8);
        (dimension(nodes::WIDTH), dimension(nodes::HEIGHT), format)
    }
}

impl NodeMap for MockNodeMap {
    fn node(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.get(name).map(|node| NodeInfo {
            kind: node.kind,
            access: self.access(name, node),
        })
    }

    fn read(&self, name: &str) -> Result<PropertyValue> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| CameraError::NodeNotFound(name.to_owned()))?;
        if !self.access(name, node).is_readable() {
            return Err(CameraError::NotReadable(name.to_owned()));
        }
        if name == nodes::BALANCE_RATIO {
            let channel = self.enum_value(nodes::BALANCE_RATIO_SELECTOR).unwrap_or("Red");
            return self
                .ratio(channel)
                .map(PropertyValue::Float)
                .ok_or_else(|| CameraError::NotReadable(name.to_owned()));
        }
        node.value
            .clone()
            .ok_or_else(|| CameraError::NotReadable(name.to_owned()))
    }

    fn write(&mut self, name: &str, value: PropertyValue) -> Result<()> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| CameraError::NodeNotFound(name.to_owned()))?;
        if !self.access(name, node).is_writable() {
            return Err(CameraError::NotWritable(name.to_owned()));
        }
        if self.rejected.contains(name) {
            return Err(CameraError::WriteRejected {
                node: name.to_owned(),
                reason: "rejected by device".to_owned(),
            });
        }

        let expected = match node.kind {
            NodeKind::Integer => "integer",
            NodeKind::Float => "float",
            NodeKind::Boolean => "boolean",
            NodeKind::Enumeration => "enumeration",
            NodeKind::Command | NodeKind::String => {
                return Err(CameraError::NotWritable(name.to_owned()))
            }
        };
        if value.kind_name() != expected {
            return Err(CameraError::TypeMismatch {
                node: name.to_owned(),
                expected,
            });
        }
        match &value {
            PropertyValue::Enumeration(entry) if !node.entries.contains(entry) => {
                return Err(CameraError::EntryNotFound {
                    node: name.to_owned(),
                    entry: entry.clone(),
                });
            }
            PropertyValue::Integer(v) if *v < 0 => {
                return Err(CameraError::WriteRejected {
                    node: name.to_owned(),
                    reason: format!("{v} is below the minimum"),
                });
            }
            _ => {}
        }

        if name == nodes::BALANCE_RATIO {
            if let PropertyValue::Float(ratio) = value {
                let channel = self
                    .enum_value(nodes::BALANCE_RATIO_SELECTOR)
                    .unwrap_or("Red")
                    .to_owned();
                self.ratios.insert(channel, ratio);
            }
        } else if let Some(node) = self.nodes.get_mut(name) {
            node.value = Some(value.clone());
        }
        self.record(name, value);
        Ok(())
    }

    fn entry(&self, name: &str, entry: &str) -> Option<EnumEntry> {
        let node = self.nodes.get(name)?;
        let index = node.entries.iter().position(|e| e == entry)?;
        Some(EnumEntry {
            name: entry.to_owned(),
            value: i64::try_from(index).unwrap_or(i64::MAX),
            readable: true,
        })
    }

    fn execute(&mut self, name: &str) -> Result<()> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| CameraError::NodeNotFound(name.to_owned()))?;
        if node.kind != NodeKind::Command || !node.access.is_writable() {
            return Err(CameraError::NotWritable(name.to_owned()));
        }
        if name == nodes::USER_SET_LOAD {
            if self.streaming {
                return Err(CameraError::Acquisition(
                    "user set cannot be loaded while streaming".to_owned(),
                ));
            }
            self.load_defaults();
            self.user_set_loads += 1;
        }
        if let Some(events) = &self.events {
            events.record(&self.serial, &format!("execute {name}"));
        }
        Ok(())
    }
}

/// Shared call counters of one [`MockCamera`].
#[derive(Debug, Default)]
pub struct MockCounts {
    inits: AtomicU64,
    deinits: AtomicU64,
    begins: AtomicU64,
    ends: AtomicU64,
    images: AtomicU64,
    releases: AtomicU64,
}

impl MockCounts {
    /// Successful `init` calls.
    pub fn inits(&self) -> u64 {
        self.inits.load(Ordering::SeqCst)
    }

    /// Successful `deinit` calls.
    pub fn deinits(&self) -> u64 {
        self.deinits.load(Ordering::SeqCst)
    }

    /// Successful `begin_acquisition` calls.
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    /// `end_acquisition` calls, failed ones included.
    pub fn ends(&self) -> u64 {
        self.ends.load(Ordering::SeqCst)
    }

    /// Images handed out.
    pub fn images(&self) -> u64 {
        self.images.load(Ordering::SeqCst)
    }

    /// Images returned to the pool.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Transfer status the mock reports for successive retrievals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusScript {
    /// Every image is complete.
    #[default]
    Complete,
    /// Retrievals 1, 3, 5, ... (zero-based) are incomplete.
    IncompleteOnOdd,
    /// Cycle through the given statuses; `None` is a timeout.
    Sequence(Vec<Option<ImageStatus>>),
}

impl StatusScript {
    /// Status code reported for scripted incomplete images.
    pub const INCOMPLETE_STATUS: i64 = 3;

    fn status(&self, retrieval: u64) -> Option<ImageStatus> {
        match self {
            Self::Complete => Some(ImageStatus::Complete),
            Self::IncompleteOnOdd if retrieval % 2 == 1 => {
                Some(ImageStatus::Incomplete(Self::INCOMPLETE_STATUS))
            }
            Self::IncompleteOnOdd => Some(ImageStatus::Complete),
            Self::Sequence(steps) if steps.is_empty() => Some(ImageStatus::Complete),
            Self::Sequence(steps) => {
                let len = u64::try_from(steps.len()).unwrap_or(u64::MAX);
                usize::try_from(retrieval % len)
                    .ok()
                    .and_then(|i| steps.get(i))
                    .copied()
                    .unwrap_or(Some(ImageStatus::Complete))
            }
        }
    }
}

/// Device call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockFailure {
    /// `init`.
    Init,
    /// `deinit`.
    Deinit,
    /// `begin_acquisition`.
    BeginAcquisition,
    /// `end_acquisition`.
    EndAcquisition,
    /// `next_image`, with a non-timeout error.
    NextImage,
}

const DEFAULT_FRAME_PERIOD: Duration = Duration::from_micros(33_333);

/// Simulated camera serving colour bars.
///
/// When the store has a manual frame rate enabled at acquisition start,
/// images are delivered on that sensor clock; otherwise they are served
/// immediately (after any configured retrieval delay).
#[derive(Debug)]
pub struct MockCamera {
    serial: String,
    nodes: MockNodeMap,
    initialized: bool,
    acquiring: bool,
    script: StatusScript,
    delay: Duration,
    failures: HashSet<MockFailure>,
    counts: Arc<MockCounts>,
    events: Option<EventLog>,
    buffer: Vec<u8>,
    format: (u32, u32, PixelFormat),
    retrievals: u64,
    frame_period: Duration,
    paced: bool,
    started: Option<Instant>,
}

impl MockCamera {
    /// Create a camera with a fresh property store.
    pub fn new(serial: &str) -> Self {
        let mut nodes = MockNodeMap::new();
        nodes.set_serial(serial);
        Self {
            serial: serial.to_owned(),
            nodes,
            initialized: false,
            acquiring: false,
            script: StatusScript::Complete,
            delay: Duration::ZERO,
            failures: HashSet::new(),
            counts: Arc::new(MockCounts::default()),
            events: None,
            buffer: Vec::new(),
            format: (0, 0, PixelFormat::BayerRG8),
            retrievals: 0,
            frame_period: DEFAULT_FRAME_PERIOD,
            paced: false,
            started: None,
        }
    }

    /// Set the sensor size the store reports before configuration.
    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        for (name, value) in [(nodes::WIDTH, width), (nodes::HEIGHT, height)] {
            if let Some(node) = self.nodes.nodes.get_mut(name) {
                node.value = Some(i64::from(value).into());
            }
        }
        self
    }

    /// Replace the property store.
    #[must_use]
    pub fn with_node_map(mut self, mut nodes: MockNodeMap) -> Self {
        nodes.set_serial(&self.serial);
        if let Some(events) = &self.events {
            nodes.events = Some(events.clone());
        }
        self.nodes = nodes;
        self
    }

    /// Script the transfer status of successive images.
    #[must_use]
    pub fn with_script(mut self, script: StatusScript) -> Self {
        self.script = script;
        self
    }

    /// Block every retrieval for `delay`.
    #[must_use]
    pub const fn with_retrieval_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `call` fail.
    #[must_use]
    pub fn failing(mut self, call: MockFailure) -> Self {
        self.failures.insert(call);
        self
    }

    /// Record device calls and property writes into `events`.
    #[must_use]
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.nodes.events = Some(events.clone());
        self.events = Some(events);
        self
    }

    /// Counters that stay readable after the camera is moved.
    pub fn counts(&self) -> Arc<MockCounts> {
        Arc::clone(&self.counts)
    }

    fn fail_if(&self, call: MockFailure) -> Result<()> {
        if self.failures.contains(&call) {
            Err(CameraError::Acquisition(format!("injected {call:?} failure")))
        } else {
            Ok(())
        }
    }

    fn record(&self, event: &str) {
        if let Some(events) = &self.events {
            events.record(&self.serial, event);
        }
    }
}

impl Camera for MockCamera {
    type Nodes = MockNodeMap;
    type Image<'a> = MockImage<'a>;

    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn init(&mut self) -> Result<()> {
        self.fail_if(MockFailure::Init)?;
        self.initialized = true;
        self.counts.inits.fetch_add(1, Ordering::SeqCst);
        self.record("init");
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.fail_if(MockFailure::Deinit)?;
        self.initialized = false;
        self.counts.deinits.fetch_add(1, Ordering::SeqCst);
        self.record("deinit");
        Ok(())
    }

    fn node_map(&mut self) -> &mut Self::Nodes {
        &mut self.nodes
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(CameraError::Acquisition("camera not initialized".to_owned()));
        }
        self.fail_if(MockFailure::BeginAcquisition)?;

        self.format = self.nodes.stream_format();
        let (width, height, format) = self.format;
        self.buffer = color_bars(width, height, format);
        (self.frame_period, self.paced) = self.nodes.frame_clock();
        self.started = Some(Instant::now());
        self.acquiring = true;
        self.nodes.set_streaming(true);
        self.counts.begins.fetch_add(1, Ordering::SeqCst);
        self.record("begin_acquisition");
        debug!(serial = %self.serial, width, height, %format, "mock acquisition started");
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        self.counts.ends.fetch_add(1, Ordering::SeqCst);
        self.fail_if(MockFailure::EndAcquisition)?;
        self.acquiring = false;
        self.nodes.set_streaming(false);
        self.record("end_acquisition");
        Ok(())
    }

    fn next_image(&mut self, timeout: Duration) -> Result<Self::Image<'_>> {
        if !self.acquiring {
            return Err(CameraError::Acquisition("acquisition not started".to_owned()));
        }
        self.fail_if(MockFailure::NextImage)?;

        let retrieval = self.retrievals;
        self.retrievals += 1;
        let Some(status) = self.script.status(retrieval) else {
            thread::sleep(timeout);
            return Err(CameraError::Timeout);
        };
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let frame_id = self.counts.images.load(Ordering::SeqCst);
        if let (true, Some(started)) = (self.paced, self.started) {
            // Exposure of frame n ends one period after frame n-1.
            let periods = u32::try_from(retrieval + 1).unwrap_or(u32::MAX);
            let due = started + self.frame_period.saturating_mul(periods);
            let wait = due.saturating_duration_since(Instant::now());
            if wait > timeout {
                thread::sleep(timeout);
                return Err(CameraError::Timeout);
            }
            thread::sleep(wait);
        }
        self.counts.images.fetch_add(1, Ordering::SeqCst);
        let timestamp = self
            .frame_period
            .saturating_mul(u32::try_from(retrieval).unwrap_or(u32::MAX));
        let (width, height, pixel_format) = self.format;
        Ok(MockImage {
            data: &self.buffer,
            status,
            width,
            height,
            pixel_format,
            timestamp,
            frame_id,
            counts: &self.counts,
        })
    }
}

/// Image borrowed from a [`MockCamera`]; counts its release on drop.
#[derive(Debug)]
pub struct MockImage<'a> {
    data: &'a [u8],
    status: ImageStatus,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    timestamp: Duration,
    frame_id: u64,
    counts: &'a MockCounts,
}

impl GrabbedImage for MockImage<'_> {
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

impl Drop for MockImage<'_> {
    fn drop(&mut self) {
        self.counts.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Raw sensor buffer of eight vertical colour bars in `format`.
pub fn color_bars(width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let bar_width = (width / 8).max(1);
    let mut data = Vec::with_capacity(width as usize * height as usize * format.bytes_per_pixel());
    for y in 0..height {
        for x in 0..width {
            let bar = usize::try_from(x / bar_width).unwrap_or(usize::MAX).min(7);
            let (r, g, b) = COLOR_BARS.get(bar).copied().unwrap_or_default();
            let even_row = y % 2 == 0;
            let even_col = x % 2 == 0;
            match format {
                PixelFormat::RGB8 => data.extend([r, g, b]),
                PixelFormat::Mono8 => data.push(crate::convert::rgb_to_ycbcr(r, g, b).0),
                PixelFormat::BayerRG8 => data.push(match (even_row, even_col) {
                    (true, true) => r,
                    (false, false) => b,
                    _ => g,
                }),
                PixelFormat::BayerBG8 => data.push(match (even_row, even_col) {
                    (true, true) => b,
                    (false, false) => r,
                    _ => g,
                }),
                PixelFormat::BayerGB8 => data.push(match (even_row, even_col) {
                    (true, false) => b,
                    (false, true) => r,
                    _ => g,
                }),
                PixelFormat::BayerGR8 => data.push(match (even_row, even_col) {
                    (true, false) => r,
                    (false, true) => b,
                    _ => g,
                }),
            }
        }
    }
    data
}

/// Sink that keeps every frame in memory, converted to RGB.
#[derive(Debug, Default)]
pub struct MemorySink {
    frames: Vec<RgbImage>,
    finished: bool,
    fail_after: Option<u64>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `count` frames, then fail every write.
    #[must_use]
    pub const fn failing_after(mut self, count: u64) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Frames written so far.
    pub fn frames(&self) -> &[RgbImage] {
        &self.frames
    }

    /// Whether `finish` ran.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl VideoSink for MemorySink {
    fn write_frame(&mut self, frame: &Frame<'_>) -> std::result::Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Closed);
        }
        if self.fail_after.is_some_and(|limit| self.frames_written() >= limit) {
            return Err(SinkError::Write(std::io::Error::other("injected sink failure")));
        }
        self.frames.push(to_rgb(frame)?);
        Ok(())
    }

    fn finish(&mut self) -> std::result::Result<u64, SinkError> {
        self.finished = true;
        Ok(self.frames_written())
    }

    fn frames_written(&self) -> u64 {
        u64::try_from(self.frames.len()).unwrap_or(u64::MAX)
    }
}
