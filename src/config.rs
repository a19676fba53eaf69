//! Rig configuration: file loading, validation, and per-role camera settings.

use std::path::Path;

use serde::Deserialize;

use crate::capture::CaptureMode;
use crate::error::ConfigError;
use crate::sink::{Codec, SinkSpec};
use crate::traits::{PixelFormat, Role};

/// Entry name that selects manual mode on auto-mode enumerations.
pub const MANUAL_MODE: &str = "Off";

/// Whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RigConfig {
    /// Sensor geometry and pixel format.
    pub camera_settings: CameraSettings,
    /// Frame rate.
    pub acquisition_settings: AcquisitionSettings,
    /// Exposure.
    pub exposure_settings: ExposureSettings,
    /// Gain.
    pub gain_settings: GainSettings,
    /// White balance.
    pub white_balance_settings: WhiteBalanceSettings,
    /// Trigger output wiring of the primary camera.
    pub gpio_primary: PrimaryGpio,
    /// Trigger input wiring of the secondary camera.
    pub gpio_secondary: SecondaryGpio,
    /// Recording session options.
    #[serde(default)]
    pub session: SessionSettings,
    /// Device selection for the V4L2 backend.
    #[serde(default)]
    pub devices: DeviceSettings,
}

/// `camera_settings` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSettings {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Horizontal region-of-interest offset.
    pub offset_x: u32,
    /// Vertical region-of-interest offset.
    pub offset_y: u32,
    /// Pixel format entry name, e.g. `BayerRG8`.
    pub pixel_format: String,
}

/// `acquisition_settings` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionSettings {
    /// Frames per second.
    pub fps: f64,
}

/// `exposure_settings` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExposureSettings {
    /// Exposure time in microseconds.
    pub exposure_time: f64,
}

/// `gain_settings` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GainSettings {
    /// `GainAuto` entry name.
    pub gain_auto: String,
    /// Gain in dB.
    pub gain_value: f64,
}

/// `white_balance_settings` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WhiteBalanceSettings {
    /// `BalanceWhiteAuto` entry name.
    pub white_balance_auto: String,
    /// Blue ratio, required when auto mode is `Off`.
    pub white_balance_blue_ratio: Option<f64>,
    /// Red ratio, required when auto mode is `Off`.
    pub white_balance_red_ratio: Option<f64>,
}

/// `gpio_primary` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrimaryGpio {
    /// `TriggerMode` entry name.
    pub trigger_mode: String,
    /// Output line, e.g. `Line2`.
    pub line_selector: String,
    /// Line direction, e.g. `Output`.
    pub line_mode: String,
    /// Signal routed to the line, e.g. `ExposureActive`.
    pub line_source: String,
}

/// `gpio_secondary` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecondaryGpio {
    /// Trigger being configured, e.g. `FrameStart`.
    pub trigger_selector: String,
    /// `TriggerMode` entry name.
    pub trigger_mode: String,
    /// Input line the trigger arrives on. The line selector mirrors it.
    pub trigger_source: String,
    /// Trigger overlap, e.g. `ReadOut`.
    pub trigger_overlap: String,
}

/// `session` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Recording length in seconds.
    pub duration_seconds: f64,
    /// Base output name; files are written as `left_<output>` and `right_<output>`.
    pub output: String,
    /// User set loaded before configuration.
    pub user_set: String,
    /// Disable triggering on the primary once both cameras are armed.
    pub primary_free_run: bool,
    /// Capture loop strategy.
    pub capture_mode: CaptureMode,
    /// Per-retrieval timeout in milliseconds.
    pub frame_timeout_ms: u64,
    /// Output encoding.
    pub codec: Codec,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            duration_seconds: 1.0,
            output: "output.mp4".to_owned(),
            user_set: "Default".to_owned(),
            primary_free_run: true,
            capture_mode: CaptureMode::Sequential,
            frame_timeout_ms: 1000,
            codec: Codec::Mp4,
        }
    }
}

/// `devices` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// V4L2 index of the primary camera.
    pub primary: u32,
    /// V4L2 index of the secondary camera.
    pub secondary: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            primary: 0,
            secondary: 1,
        }
    }
}

/// Region of interest and output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Horizontal offset.
    pub offset_x: u32,
    /// Vertical offset.
    pub offset_y: u32,
}

/// White balance mode.
#[derive(Debug, Clone, PartialEq)]
pub enum WhiteBalance {
    /// Device-controlled balance with the given `BalanceWhiteAuto` entry.
    Auto(String),
    /// Fixed ratios, written with auto mode `Off`.
    Manual {
        /// Blue channel ratio.
        blue_ratio: f64,
        /// Red channel ratio.
        red_ratio: f64,
    },
}

impl WhiteBalance {
    /// `BalanceWhiteAuto` entry for this mode.
    pub fn auto_mode(&self) -> &str {
        match self {
            Self::Auto(mode) => mode,
            Self::Manual { .. } => MANUAL_MODE,
        }
    }
}

/// Role-specific trigger wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioConfig {
    /// Trigger source wiring.
    Primary(PrimaryGpio),
    /// Trigger sink wiring.
    Secondary(SecondaryGpio),
}

/// Settings for one camera, fixed for the session.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    /// Geometry.
    pub geometry: Geometry,
    /// Pixel format entry name.
    pub pixel_format: String,
    /// Frames per second.
    pub fps: f64,
    /// Exposure time in microseconds.
    pub exposure_time_us: f64,
    /// `GainAuto` entry name.
    pub gain_auto: String,
    /// Gain in dB.
    pub gain_value: f64,
    /// White balance mode.
    pub white_balance: WhiteBalance,
    /// Trigger wiring for this camera's role.
    pub gpio: GpioConfig,
}

impl CameraConfig {
    /// Role implied by the wiring variant.
    pub const fn role(&self) -> Role {
        match self.gpio {
            GpioConfig::Primary(_) => Role::Primary,
            GpioConfig::Secondary(_) => Role::Secondary,
        }
    }
}

impl RigConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents, path)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, Path::new("<inline>"))
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.message().to_owned(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the file format cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let camera = &self.camera_settings;
        if camera.width == 0 || camera.height == 0 {
            return Err(invalid("camera_settings.width", "image size must be non-zero"));
        }
        if camera.pixel_format.trim().is_empty() {
            return Err(invalid("camera_settings.pixel_format", "must not be empty"));
        }
        positive("acquisition_settings.fps", self.acquisition_settings.fps)?;
        positive(
            "exposure_settings.exposure_time",
            self.exposure_settings.exposure_time,
        )?;
        if !self.gain_settings.gain_value.is_finite() {
            return Err(invalid("gain_settings.gain_value", "must be a finite number"));
        }

        let wb = &self.white_balance_settings;
        if wb.white_balance_auto == MANUAL_MODE {
            let blue = wb.white_balance_blue_ratio.ok_or_else(|| {
                invalid(
                    "white_balance_settings.white_balance_blue_ratio",
                    "required when white_balance_auto is Off",
                )
            })?;
            let red = wb.white_balance_red_ratio.ok_or_else(|| {
                invalid(
                    "white_balance_settings.white_balance_red_ratio",
                    "required when white_balance_auto is Off",
                )
            })?;
            positive("white_balance_settings.white_balance_blue_ratio", blue)?;
            positive("white_balance_settings.white_balance_red_ratio", red)?;
        }

        positive("session.duration_seconds", self.session.duration_seconds)?;
        if self.session.frame_timeout_ms == 0 {
            return Err(invalid("session.frame_timeout_ms", "must be positive"));
        }
        if self.session.output.trim().is_empty() {
            return Err(invalid("session.output", "must not be empty"));
        }
        Ok(())
    }

    /// Stream parameters both sinks are opened with.
    pub fn sink_spec(&self) -> Result<SinkSpec, ConfigError> {
        let camera = &self.camera_settings;
        let pixel_format = camera
            .pixel_format
            .parse::<PixelFormat>()
            .map_err(|reason| ConfigError::Invalid {
                field: "camera_settings.pixel_format",
                reason,
            })?;
        Ok(SinkSpec {
            codec: self.session.codec,
            fps: self.acquisition_settings.fps,
            width: camera.width,
            height: camera.height,
            pixel_format,
        })
    }

    /// Settings for the camera playing `role`.
    pub fn camera_config(&self, role: Role) -> CameraConfig {
        let camera = &self.camera_settings;
        let wb = &self.white_balance_settings;
        let white_balance = match (
            wb.white_balance_auto.as_str(),
            wb.white_balance_blue_ratio,
            wb.white_balance_red_ratio,
        ) {
            (MANUAL_MODE, Some(blue_ratio), Some(red_ratio)) => WhiteBalance::Manual {
                blue_ratio,
                red_ratio,
            },
            (mode, _, _) => WhiteBalance::Auto(mode.to_owned()),
        };
        let gpio = match role {
            Role::Primary => GpioConfig::Primary(self.gpio_primary.clone()),
            Role::Secondary => GpioConfig::Secondary(self.gpio_secondary.clone()),
        };

        CameraConfig {
            geometry: Geometry {
                width: camera.width,
                height: camera.height,
                offset_x: camera.offset_x,
                offset_y: camera.offset_y,
            },
            pixel_format: camera.pixel_format.clone(),
            fps: self.acquisition_settings.fps,
            exposure_time_us: self.exposure_settings.exposure_time,
            gain_auto: self.gain_settings.gain_auto.clone(),
            gain_value: self.gain_settings.gain_value,
            white_balance,
            gpio,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("must be positive, got {value}"),
        })
    }
}
