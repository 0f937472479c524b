pub mod camera;
pub mod capture;
pub mod discovery;
pub mod error;
pub mod params;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture::buffers::BUFFER_COUNT;
use capture::frame::PIXELFORMAT_JPEG;
use pipeline::DecodeMode;

pub use camera::{Camera, CameraOptions, CameraState};
pub use error::{CaptureError, ControlError, DecodeError, ParamError};
pub use pipeline::{DecodedFrame, DecoderStats, FrameSink};

/// Environment prefix for overrides, e.g. `IRIS__CAPTURE__WIDTH=640`
pub const ENV_PREFIX: &str = "IRIS";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub decode: DecodeConfig,
    pub params: ParamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: PathBuf,
    /// "JPEG" or "YUYV"
    pub encoding: String,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub sample_timeout_ms: u64,
    pub interval_numerator: u32,
    pub interval_denominator: u32,
    pub pin_core: Option<usize>,
}

impl CaptureConfig {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    /// `W*H` as accepted by `Camera::start`
    pub fn resolution(&self) -> String {
        format!("{}*{}", self.width, self.height)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            encoding: PIXELFORMAT_JPEG.to_string(),
            width: 1280,
            height: 720,
            buffer_count: BUFFER_COUNT,
            sample_timeout_ms: 5_000,
            interval_numerator: 1,
            interval_denominator: 30,
            pin_core: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub mode: DecodeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsConfig {
    /// Push the default parameter profile when a device is opened
    pub apply_defaults: bool,
    /// Parameter file applied after the defaults
    pub file: Option<PathBuf>,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            apply_defaults: true,
            file: None,
        }
    }
}

impl Config {
    /// Layers built-in defaults, the optional TOML file at `path` and
    /// `IRIS__SECTION__KEY` environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_a_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.capture.device, PathBuf::from("/dev/video0"));
        assert_eq!(config.capture.encoding, "JPEG");
        assert_eq!(config.capture.resolution(), "1280*720");
        assert_eq!(config.capture.buffer_count, 8);
        assert_eq!(config.capture.sample_timeout(), Duration::from_secs(5));
        assert_eq!(config.decode.mode, DecodeMode::Sync);
        assert!(config.params.apply_defaults);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[capture]\nencoding = \"YUYV\"\nwidth = 640\nheight = 480\n\n[decode]\nmode = \"pingpong\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.encoding, "YUYV");
        assert_eq!(config.capture.resolution(), "640*480");
        assert_eq!(config.capture.buffer_count, 8);
        assert_eq!(config.decode.mode, DecodeMode::PingPong);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load(Some(Path::new("/nonexistent/iris.toml"))).unwrap();
        assert_eq!(config.capture.width, 1280);
    }
}
