//! Error taxonomy for the capture stack

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::camera::CameraState;

/// Failures that abort `Camera::start` and friends.
///
/// Every variant is returned only after the resources acquired so far have
/// been released in reverse order.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture device {path:?}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path:?} is not usable for streaming capture: {reason}")]
    Capability { path: PathBuf, reason: String },

    #[error("format {encoding:?} {width}x{height} rejected: {reason}")]
    Format {
        encoding: String,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("buffer setup failed during {stage}: {source}")]
    Buffer {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("stream control failed: {0}")]
    Stream(#[source] io::Error),

    #[error("invalid resolution {0:?}, expected WIDTH*HEIGHT")]
    Resolution(String),

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CameraState,
    },

    #[error("no capture device matches {vendor_id:04x}:{product_id:04x}")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Why a control write did not reach the hardware.
///
/// `Unsupported` is the expected outcome on cameras lacking a control and
/// is only ever logged by `ParameterStore::set`.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no device is bound")]
    Unbound,

    #[error("unknown parameter {0:?}")]
    UnknownName(String),

    #[error("control {id:#010x} is not supported")]
    Unsupported { id: u32 },

    #[error("control {id:#010x} is disabled")]
    Disabled { id: u32 },

    #[error("control {id:#010x}: {source}")]
    Io {
        id: u32,
        #[source]
        source: io::Error,
    },
}

/// A sample that could not be turned into pixels. Drops that frame only.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a complete JPEG image ({len} bytes)")]
    InvalidJpeg { len: usize },

    #[error("jpeg decode failed: {0}")]
    Jpeg(String),

    #[error("decoded {actual_width}x{actual_height}, expected {width}x{height}")]
    Geometry {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("payload truncated: {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("no decoder for format {0:?}")]
    Unsupported(String),
}

impl From<jpeg_decoder::Error> for DecodeError {
    fn from(err: jpeg_decoder::Error) -> Self {
        DecodeError::Jpeg(err.to_string())
    }
}

/// Parameter file persistence errors.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize parameters: {0}")]
    Serialize(#[from] toml::ser::Error),
}
