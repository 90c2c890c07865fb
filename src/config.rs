//! Stream configuration shared between acquisition and the checker.
//!
//! The configuration describes the negotiated video stream (resolution,
//! format, transfer limits, clock). It changes only when the device commits a
//! new format, so it lives behind a single mutex and the checker takes one
//! [`StreamConfig`] snapshot per packet.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors from loading or parsing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Unrecognised frame format tag.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    /// A field holds a value that cannot be used.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// I/O error while reading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Sony vendor id with a PTS clock reported in Hz*1000.
const QUIRK_VENDOR_ID: u16 = 0x054c;
const QUIRK_PRODUCT_ID: u16 = 0x0e4f;

/// Video payload format negotiated with the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// Uncompressed YUY2, 2 bytes per pixel
    Yuyv,
    /// Motion JPEG
    #[default]
    Mjpeg,
    /// Uncompressed RGB
    Rgb,
    /// Frame-based H.264
    H264,
}

impl FrameFormat {
    /// Map a `bDescriptorSubtype` from a UVC frame descriptor.
    ///
    /// Unknown subtypes fall back to MJPEG.
    pub fn from_subtype(subtype: u8) -> Self {
        match subtype {
            5 => FrameFormat::Yuyv,
            7 => FrameFormat::Mjpeg,
            13 => FrameFormat::Rgb,
            17 => FrameFormat::H264,
            other => {
                log::warn!(
                    "Unsupported frame format subtype {}, using mjpeg",
                    other
                );
                FrameFormat::Mjpeg
            }
        }
    }

    /// Lowercase tag as used in configs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameFormat::Yuyv => "yuyv",
            FrameFormat::Mjpeg => "mjpeg",
            FrameFormat::Rgb => "rgb",
            FrameFormat::H264 => "h264",
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "yuyv" | "yuy2" => Ok(FrameFormat::Yuyv),
            "mjpeg" | "mjpg" => Ok(FrameFormat::Mjpeg),
            "rgb" => Ok(FrameFormat::Rgb),
            "h264" => Ok(FrameFormat::H264),
            other => Err(ConfigError::InvalidFormat(other.to_string())),
        }
    }
}

/// Negotiated stream parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Human readable device name
    pub device_name: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Nominal frames per second
    pub fps: u32,
    /// Payload format
    pub frame_format: FrameFormat,
    /// `dwMaxVideoFrameSize` from the committed probe
    pub max_frame_size: usize,
    /// `dwMaxPayloadTransferSize` from the committed probe
    pub max_payload_size: usize,
    /// `dwClockFrequency` as reported by the device, before quirks
    pub clock_frequency: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0,
            product_id: 0,
            device_name: String::new(),
            width: 1280,
            height: 720,
            fps: 30,
            frame_format: FrameFormat::Mjpeg,
            max_frame_size: 16 * 1024 * 1024,
            max_payload_size: 1024 * 1024,
            clock_frequency: 48_000_000,
        }
    }
}

impl StreamConfig {
    /// Size of an uncompressed 2-byte-per-pixel frame at this resolution.
    pub fn raw_frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    /// PTS/SCR clock in Hz after device quirks.
    ///
    /// `clock_frequency` always holds the value the device reported; this is
    /// the only place the quirk is applied.
    pub fn effective_clock_frequency(&self) -> u32 {
        if self.vendor_id == QUIRK_VENDOR_ID && self.product_id == QUIRK_PRODUCT_ID {
            self.clock_frequency / 1000
        } else {
            self.clock_frequency
        }
    }

    /// Check that the values can drive the checker.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for zero fps or zero transfer limits.
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fps",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_size",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` or `ConfigError::Json` if the file cannot be
    /// read or parsed, and `ConfigError::InvalidValue` if validation fails.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: StreamConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Which closed frames are handed to the presentation side as images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureFlags {
    /// Frames with a frame error
    pub error: bool,
    /// Frames flagged by a heuristic
    pub suspicious: bool,
    /// Clean frames
    pub valid: bool,
}

impl Default for CaptureFlags {
    fn default() -> Self {
        Self {
            error: true,
            suspicious: true,
            valid: false,
        }
    }
}

impl CaptureFlags {
    /// Emit no images.
    pub fn none() -> Self {
        Self {
            error: false,
            suspicious: false,
            valid: false,
        }
    }

    /// Parse a comma separated list such as `"error,suspicious"`.
    ///
    /// `"none"` disables capture; unknown entries are logged and ignored.
    pub fn from_env_str(s: &str) -> Self {
        let mut flags = Self::none();
        for item in s.split(',').map(|i| i.trim().to_lowercase()) {
            match item.as_str() {
                "" | "none" => {}
                "error" | "errors" => flags.error = true,
                "suspicious" => flags.suspicious = true,
                "valid" => flags.valid = true,
                "all" => {
                    flags.error = true;
                    flags.suspicious = true;
                    flags.valid = true;
                }
                other => log::warn!("Unknown capture flag '{}', ignoring", other),
            }
        }
        flags
    }

    /// Read `UVC_INSPECT_CAPTURE`, falling back to the defaults.
    pub fn from_env() -> Self {
        std::env::var("UVC_INSPECT_CAPTURE")
            .map(|v| Self::from_env_str(&v))
            .unwrap_or_default()
    }
}

/// Configuration handle shared between the control path and the checker.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<Mutex<StreamConfig>>,
}

impl SharedConfig {
    /// Wrap an initial configuration.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamConfig> {
        // A panic while holding the lock cannot leave the plain-data config half written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consistent copy of the current configuration.
    pub fn snapshot(&self) -> StreamConfig {
        self.lock().clone()
    }

    /// Replace the configuration, as on a committed format change.
    pub fn configure(&self, config: StreamConfig) {
        log::info!(
            "Stream configured: {:04x}:{:04x} {} {}x{} {} fps {}, max frame {} B, max payload {} B, clock {} Hz",
            config.vendor_id,
            config.product_id,
            config.device_name,
            config.width,
            config.height,
            config.fps,
            config.frame_format,
            config.max_frame_size,
            config.max_payload_size,
            config.effective_clock_frequency()
        );
        *self.lock() = config;
    }

    /// Modify individual fields under the lock.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut StreamConfig),
    {
        let mut guard = self.lock();
        f(&mut guard);
        log::debug!("Stream config updated: {:?}", *guard);
    }
}
