//! Ordered property writes that bring one camera into its configured mode.
//!
//! Devices reject writes whose prerequisites are not in place yet (a manual
//! exposure time while auto exposure is on, a ratio before its selector), so
//! the sequence in [`Configurator::apply`] is fixed.

use tracing::{info, warn};

use crate::config::{CameraConfig, GpioConfig, PrimaryGpio, SecondaryGpio, WhiteBalance};
use crate::error::{CameraError, ConfigurationError};
use crate::traits::{NodeMap, PropertyValue};

/// Standard feature names used during setup.
pub mod nodes {
    /// Image width.
    pub const WIDTH: &str = "Width";
    /// Image height.
    pub const HEIGHT: &str = "Height";
    /// Horizontal ROI offset.
    pub const OFFSET_X: &str = "OffsetX";
    /// Vertical ROI offset.
    pub const OFFSET_Y: &str = "OffsetY";
    /// Sensor pixel format.
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    /// Single frame, multi frame or continuous acquisition.
    pub const ACQUISITION_MODE: &str = "AcquisitionMode";
    /// Automatic frame rate control.
    pub const FRAME_RATE_AUTO: &str = "AcquisitionFrameRateAuto";
    /// Manual frame rate control switch.
    pub const FRAME_RATE_ENABLED: &str = "AcquisitionFrameRateEnabled";
    /// Frame rate in Hz.
    pub const FRAME_RATE: &str = "AcquisitionFrameRate";
    /// Exposure compensation auto mode.
    pub const EXPOSURE_COMPENSATION_AUTO: &str = "pgrExposureCompensationAuto";
    /// Exposure auto mode.
    pub const EXPOSURE_AUTO: &str = "ExposureAuto";
    /// Exposure time in microseconds.
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    /// Gain auto mode.
    pub const GAIN_AUTO: &str = "GainAuto";
    /// Gain in dB.
    pub const GAIN: &str = "Gain";
    /// White balance auto mode.
    pub const BALANCE_WHITE_AUTO: &str = "BalanceWhiteAuto";
    /// Channel addressed by `BalanceRatio`.
    pub const BALANCE_RATIO_SELECTOR: &str = "BalanceRatioSelector";
    /// Ratio of the selected channel.
    pub const BALANCE_RATIO: &str = "BalanceRatio";
    /// Trigger enable.
    pub const TRIGGER_MODE: &str = "TriggerMode";
    /// Trigger addressed by the other trigger features.
    pub const TRIGGER_SELECTOR: &str = "TriggerSelector";
    /// Trigger input.
    pub const TRIGGER_SOURCE: &str = "TriggerSource";
    /// Whether a trigger may arrive during readout.
    pub const TRIGGER_OVERLAP: &str = "TriggerOverlap";
    /// I/O line addressed by the other line features.
    pub const LINE_SELECTOR: &str = "LineSelector";
    /// Line direction.
    pub const LINE_MODE: &str = "LineMode";
    /// Signal driven onto an output line.
    pub const LINE_SOURCE: &str = "LineSource";
    /// Stored configuration addressed by `UserSetLoad`.
    pub const USER_SET_SELECTOR: &str = "UserSetSelector";
    /// Loads the selected user set.
    pub const USER_SET_LOAD: &str = "UserSetLoad";
}

/// Applies a [`CameraConfig`] to one device's property store.
pub struct Configurator<'a, N: NodeMap + ?Sized> {
    nodes: &'a mut N,
    serial: &'a str,
}

impl<'a, N: NodeMap + ?Sized> Configurator<'a, N> {
    /// Wrap the property store of the camera with the given serial number.
    pub fn new(nodes: &'a mut N, serial: &'a str) -> Self {
        Self { nodes, serial }
    }

    /// Run the full setup sequence. Stops at the first rejected write.
    pub fn apply(&mut self, config: &CameraConfig) -> Result<(), ConfigurationError> {
        self.apply_geometry(config)?;
        self.apply_acquisition(config.fps)?;
        self.apply_exposure(config.exposure_time_us)?;
        self.apply_gain(&config.gain_auto, config.gain_value)?;
        self.apply_white_balance(&config.white_balance)?;
        match &config.gpio {
            GpioConfig::Primary(gpio) => self.apply_primary_gpio(gpio),
            GpioConfig::Secondary(gpio) => self.apply_secondary_gpio(gpio),
        }
    }

    fn apply_geometry(&mut self, config: &CameraConfig) -> Result<(), ConfigurationError> {
        let geometry = config.geometry;
        self.set(nodes::WIDTH, i64::from(geometry.width).into())?;
        self.set(nodes::HEIGHT, i64::from(geometry.height).into())?;
        self.set(nodes::OFFSET_X, i64::from(geometry.offset_x).into())?;
        self.set(nodes::OFFSET_Y, i64::from(geometry.offset_y).into())?;
        self.set(nodes::PIXEL_FORMAT, config.pixel_format.as_str().into())
    }

    fn apply_acquisition(&mut self, fps: f64) -> Result<(), ConfigurationError> {
        self.set(nodes::ACQUISITION_MODE, "Continuous".into())?;
        // Frame rate auto must be off before the rate is enabled or written.
        self.set(nodes::FRAME_RATE_AUTO, "Off".into())?;
        self.set(nodes::FRAME_RATE_ENABLED, true.into())?;
        self.set(nodes::FRAME_RATE, fps.into())
    }

    fn apply_exposure(&mut self, exposure_time_us: f64) -> Result<(), ConfigurationError> {
        self.set(nodes::EXPOSURE_COMPENSATION_AUTO, "Once".into())?;
        self.set(nodes::EXPOSURE_AUTO, "Off".into())?;
        self.set(nodes::EXPOSURE_TIME, exposure_time_us.into())
    }

    fn apply_gain(&mut self, auto_mode: &str, value: f64) -> Result<(), ConfigurationError> {
        self.set(nodes::GAIN_AUTO, auto_mode.into())?;
        self.set(nodes::GAIN, value.into())
    }

    fn apply_white_balance(&mut self, balance: &WhiteBalance) -> Result<(), ConfigurationError> {
        self.set(nodes::BALANCE_WHITE_AUTO, balance.auto_mode().into())?;
        if let WhiteBalance::Manual {
            blue_ratio,
            red_ratio,
        } = *balance
        {
            // Each selector write is followed by its own ratio write.
            self.set(nodes::BALANCE_RATIO_SELECTOR, "Blue".into())?;
            self.set(nodes::BALANCE_RATIO, blue_ratio.into())?;
            self.set(nodes::BALANCE_RATIO_SELECTOR, "Red".into())?;
            self.set(nodes::BALANCE_RATIO, red_ratio.into())?;
        }
        Ok(())
    }

    fn apply_primary_gpio(&mut self, gpio: &PrimaryGpio) -> Result<(), ConfigurationError> {
        self.set(nodes::TRIGGER_MODE, gpio.trigger_mode.as_str().into())?;
        self.set(nodes::LINE_SELECTOR, gpio.line_selector.as_str().into())?;
        self.set(nodes::LINE_MODE, gpio.line_mode.as_str().into())?;
        self.set(nodes::LINE_SOURCE, gpio.line_source.as_str().into())
    }

    fn apply_secondary_gpio(&mut self, gpio: &SecondaryGpio) -> Result<(), ConfigurationError> {
        self.set(nodes::TRIGGER_SELECTOR, gpio.trigger_selector.as_str().into())?;
        self.set(nodes::TRIGGER_MODE, gpio.trigger_mode.as_str().into())?;
        self.set(nodes::TRIGGER_SOURCE, gpio.trigger_source.as_str().into())?;
        self.set(nodes::TRIGGER_OVERLAP, gpio.trigger_overlap.as_str().into())?;
        // The input line is the one the trigger source names.
        self.set(nodes::LINE_SELECTOR, gpio.trigger_source.as_str().into())
    }

    /// Switch hardware triggering on.
    pub fn enable_trigger(&mut self) -> Result<(), ConfigurationError> {
        self.set(nodes::TRIGGER_MODE, "On".into())
    }

    /// Switch hardware triggering off so the camera free-runs.
    pub fn disable_trigger(&mut self) -> Result<(), ConfigurationError> {
        self.set(nodes::TRIGGER_MODE, "Off".into())
    }

    /// Reset the device to a stored user set.
    ///
    /// Best effort: every obstacle is logged as a warning and skips the load.
    /// Returns whether the user set was loaded.
    pub fn load_user_set(&mut self, name: &str) -> bool {
        let serial = self.serial;
        if !self.nodes.is_readable(nodes::USER_SET_SELECTOR)
            || !self.nodes.is_writable(nodes::USER_SET_SELECTOR)
        {
            warn!(serial, "user set selector is not accessible");
            return false;
        }

        match self.nodes.entry(nodes::USER_SET_SELECTOR, name) {
            Some(entry) if entry.readable => {}
            _ => {
                warn!(serial, user_set = name, "user set is not available");
                return false;
            }
        }

        if let Err(err) = self
            .nodes
            .write(nodes::USER_SET_SELECTOR, PropertyValue::Enumeration(name.to_owned()))
        {
            warn!(serial, user_set = name, error = %err, "user set selection rejected");
            return false;
        }
        info!(serial, user_set = name, "user set selected");

        if !self.nodes.is_writable(nodes::USER_SET_LOAD) {
            warn!(serial, "user set load is not executable");
            return false;
        }
        if let Err(err) = self.nodes.execute(nodes::USER_SET_LOAD) {
            warn!(serial, user_set = name, error = %err, "user set load failed");
            return false;
        }
        info!(serial, user_set = name, "user set loaded");
        true
    }

    fn set(&mut self, property: &str, value: PropertyValue) -> Result<(), ConfigurationError> {
        self.write_checked(property, &value)
            .map_err(|reason| ConfigurationError {
                serial: self.serial.to_owned(),
                property: property.to_owned(),
                reason,
            })?;
        info!(serial = self.serial, property, value = %value, "property applied");
        Ok(())
    }

    fn write_checked(&mut self, property: &str, value: &PropertyValue) -> Result<(), CameraError> {
        let node = self
            .nodes
            .node(property)
            .ok_or_else(|| CameraError::NodeNotFound(property.to_owned()))?;
        if !node.access.is_writable() {
            return Err(CameraError::NotWritable(property.to_owned()));
        }
        if let PropertyValue::Enumeration(entry) = value {
            match self.nodes.entry(property, entry) {
                Some(found) if found.readable => {}
                _ => {
                    return Err(CameraError::EntryNotFound {
                        node: property.to_owned(),
                        entry: entry.clone(),
                    })
                }
            }
        }
        self.nodes.write(property, value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Geometry;
    use crate::mock::MockNodeMap;
    use crate::traits::Role;
    use crate::validation::validate_write_order;

    fn camera_config(role: Role, white_balance: WhiteBalance) -> CameraConfig {
        let gpio = match role {
            Role::Primary => GpioConfig::Primary(PrimaryGpio {
                trigger_mode: "Off".to_owned(),
                line_selector: "Line2".to_owned(),
                line_mode: "Output".to_owned(),
                line_source: "ExposureActive".to_owned(),
            }),
            Role::Secondary => GpioConfig::Secondary(SecondaryGpio {
                trigger_selector: "FrameStart".to_owned(),
                trigger_mode: "On".to_owned(),
                trigger_source: "Line3".to_owned(),
                trigger_overlap: "ReadOut".to_owned(),
            }),
        };
        CameraConfig {
            geometry: Geometry {
                width: 1280,
                height: 720,
                offset_x: 0,
                offset_y: 0,
            },
            pixel_format: "BayerRG8".to_owned(),
            fps: 30.0,
            exposure_time_us: 5000.0,
            gain_auto: "Off".to_owned(),
            gain_value: 10.0,
            white_balance,
            gpio,
        }
    }

    fn manual() -> WhiteBalance {
        WhiteBalance::Manual {
            blue_ratio: 1.2,
            red_ratio: 0.9,
        }
    }

    const COMMON_ORDER: [&str; 19] = [
        nodes::WIDTH,
        nodes::HEIGHT,
        nodes::OFFSET_X,
        nodes::OFFSET_Y,
        nodes::PIXEL_FORMAT,
        nodes::ACQUISITION_MODE,
        nodes::FRAME_RATE_AUTO,
        nodes::FRAME_RATE_ENABLED,
        nodes::FRAME_RATE,
        nodes::EXPOSURE_COMPENSATION_AUTO,
        nodes::EXPOSURE_AUTO,
        nodes::EXPOSURE_TIME,
        nodes::GAIN_AUTO,
        nodes::GAIN,
        nodes::BALANCE_WHITE_AUTO,
        nodes::BALANCE_RATIO_SELECTOR,
        nodes::BALANCE_RATIO,
        nodes::BALANCE_RATIO_SELECTOR,
        nodes::BALANCE_RATIO,
    ];

    #[test]
    fn test_primary_write_order() {
        let mut store = MockNodeMap::new();
        Configurator::new(&mut store, "P1")
            .apply(&camera_config(Role::Primary, manual()))
            .expect("configuration should succeed");

        let mut expected = COMMON_ORDER.to_vec();
        expected.extend([
            nodes::TRIGGER_MODE,
            nodes::LINE_SELECTOR,
            nodes::LINE_MODE,
            nodes::LINE_SOURCE,
        ]);
        let result = validate_write_order(&store.write_log(), &expected);
        assert!(result.is_ok(), "write order mismatch: {result:?}");
    }

    #[test]
    fn test_secondary_write_order() {
        let mut store = MockNodeMap::new();
        Configurator::new(&mut store, "S1")
            .apply(&camera_config(Role::Secondary, manual()))
            .expect("configuration should succeed");

        let mut expected = COMMON_ORDER.to_vec();
        expected.extend([
            nodes::TRIGGER_SELECTOR,
            nodes::TRIGGER_MODE,
            nodes::TRIGGER_SOURCE,
            nodes::TRIGGER_OVERLAP,
            nodes::LINE_SELECTOR,
        ]);
        let result = validate_write_order(&store.write_log(), &expected);
        assert!(result.is_ok(), "write order mismatch: {result:?}");
    }

    #[test]
    fn test_manual_white_balance_pairs_selector_and_ratio() {
        let mut store = MockNodeMap::new();
        Configurator::new(&mut store, "P1")
            .apply(&camera_config(Role::Primary, manual()))
            .expect("configuration should succeed");

        let balance: Vec<(String, PropertyValue)> = store
            .write_log()
            .into_iter()
            .filter(|(node, _)| node.starts_with("BalanceRatio"))
            .collect();
        assert_eq!(
            balance,
            vec![
                (nodes::BALANCE_RATIO_SELECTOR.to_owned(), "Blue".into()),
                (nodes::BALANCE_RATIO.to_owned(), 1.2.into()),
                (nodes::BALANCE_RATIO_SELECTOR.to_owned(), "Red".into()),
                (nodes::BALANCE_RATIO.to_owned(), 0.9.into()),
            ]
        );
        assert_eq!(store.ratio("Blue"), Some(1.2));
        assert_eq!(store.ratio("Red"), Some(0.9));
    }

    #[test]
    fn test_auto_white_balance_skips_ratios() {
        let mut store = MockNodeMap::new();
        Configurator::new(&mut store, "P1")
            .apply(&camera_config(
                Role::Primary,
                WhiteBalance::Auto("Continuous".to_owned()),
            ))
            .expect("configuration should succeed");

        let log = store.write_log();
        assert!(log.iter().all(|(node, _)| !node.starts_with("BalanceRatio")));
        assert!(log.contains(&(nodes::BALANCE_WHITE_AUTO.to_owned(), "Continuous".into())));
    }

    #[test]
    fn test_secondary_line_selector_mirrors_trigger_source() {
        let mut store = MockNodeMap::new();
        Configurator::new(&mut store, "S1")
            .apply(&camera_config(Role::Secondary, manual()))
            .expect("configuration should succeed");

        assert_eq!(
            store.read(nodes::LINE_SELECTOR).expect("readable"),
            store.read(nodes::TRIGGER_SOURCE).expect("readable"),
        );
        assert_eq!(store.read(nodes::LINE_SELECTOR).expect("readable"), "Line3".into());
    }

    #[test]
    fn test_geometry_and_format_read_back() {
        let mut store = MockNodeMap::new();
        Configurator::new(&mut store, "P1")
            .apply(&camera_config(Role::Primary, manual()))
            .expect("configuration should succeed");

        assert_eq!(store.read(nodes::WIDTH).expect("readable"), 1280_i64.into());
        assert_eq!(store.read(nodes::HEIGHT).expect("readable"), 720_i64.into());
        assert_eq!(
            store.read(nodes::PIXEL_FORMAT).expect("readable"),
            "BayerRG8".into()
        );
    }

    #[test]
    fn test_exposure_time_rejected_while_auto_exposure_on() {
        let mut store = MockNodeMap::new();
        let mut configurator = Configurator::new(&mut store, "P1");
        configurator
            .set(nodes::EXPOSURE_AUTO, "Continuous".into())
            .expect("auto exposure write should succeed");
        let err = configurator
            .set(nodes::EXPOSURE_TIME, 5000.0.into())
            .expect_err("manual exposure must be locked");
        assert_eq!(err.property, nodes::EXPOSURE_TIME);
        assert!(matches!(err.reason, CameraError::NotWritable(_)));
    }

    #[test]
    fn test_unknown_entry_is_configuration_error() {
        let mut store = MockNodeMap::new();
        let mut config = camera_config(Role::Primary, manual());
        config.pixel_format = "YUV422Packed".to_owned();

        let err = Configurator::new(&mut store, "P1")
            .apply(&config)
            .expect_err("unknown pixel format must fail");
        assert_eq!(err.serial, "P1");
        assert_eq!(err.property, nodes::PIXEL_FORMAT);
        assert!(matches!(err.reason, CameraError::EntryNotFound { .. }));
        // Nothing after the failed write was attempted.
        assert_eq!(store.write_log().len(), 4);
    }

    #[test]
    fn test_rejected_write_aborts_sequence() {
        let mut store = MockNodeMap::new().reject_writes_to(nodes::GAIN);
        let err = Configurator::new(&mut store, "P1")
            .apply(&camera_config(Role::Primary, manual()))
            .expect_err("rejected gain write must fail");
        assert_eq!(err.property, nodes::GAIN);
        assert!(store
            .write_log()
            .iter()
            .all(|(node, _)| node != nodes::BALANCE_WHITE_AUTO));
    }

    #[test]
    fn test_trigger_toggle_is_idempotent() {
        let mut store = MockNodeMap::new();
        let mut configurator = Configurator::new(&mut store, "P1");
        configurator.disable_trigger().expect("disable should succeed");
        configurator.disable_trigger().expect("disable should succeed");
        assert_eq!(store.read(nodes::TRIGGER_MODE).expect("readable"), "Off".into());

        let mut configurator = Configurator::new(&mut store, "P1");
        configurator.enable_trigger().expect("enable should succeed");
        configurator.enable_trigger().expect("enable should succeed");
        assert_eq!(store.read(nodes::TRIGGER_MODE).expect("readable"), "On".into());
    }

    #[test]
    fn test_load_user_set() {
        let mut store = MockNodeMap::new();
        assert!(Configurator::new(&mut store, "P1").load_user_set("Default"));
        assert_eq!(store.user_set_loads(), 1);
    }

    #[test]
    fn test_load_user_set_skips_missing_entry() {
        let mut store = MockNodeMap::new();
        assert!(!Configurator::new(&mut store, "P1").load_user_set("UserSet7"));
        assert_eq!(store.user_set_loads(), 0);
    }

    #[test]
    fn test_load_user_set_skips_inaccessible_selector() {
        let mut store = MockNodeMap::new().without_node(nodes::USER_SET_SELECTOR);
        assert!(!Configurator::new(&mut store, "P1").load_user_set("Default"));

        let mut store = MockNodeMap::new().without_node(nodes::USER_SET_LOAD);
        assert!(!Configurator::new(&mut store, "P1").load_user_set("Default"));
        assert_eq!(store.user_set_loads(), 0);
    }
}
