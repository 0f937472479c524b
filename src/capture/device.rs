//! One open capture node and its negotiated format

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::capture::driver::{Capability, CaptureDriver, DeviceProvider, OpenMode};
use crate::capture::frame::{PixelFormat, StreamFormat};
use crate::error::CaptureError;
use crate::pipeline::Decoder;

/// Capture interval hint as a `numerator/denominator` fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for FrameInterval {
    fn default() -> Self {
        Self {
            numerator: 1,
            denominator: 30,
        }
    }
}

pub struct DeviceHandle {
    driver: Option<Arc<dyn CaptureDriver>>,
    path: PathBuf,
    format: Option<StreamFormat>,
    capability: Option<Capability>,
}

impl DeviceHandle {
    /// Opens `path` for streaming, selects input 0 and hints the frame
    /// interval. A node that refuses input 0 is closed again; the interval
    /// hint is best effort.
    #[instrument(skip(provider))]
    pub fn open(
        provider: &dyn DeviceProvider,
        path: &Path,
        interval: FrameInterval,
    ) -> Result<Self, CaptureError> {
        if path.as_os_str().is_empty() {
            return Err(CaptureError::DeviceOpen {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty path"),
            });
        }

        let driver = provider
            .open(path, OpenMode::Stream)
            .map_err(|source| CaptureError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        if let Err(source) = driver.select_input(0) {
            warn!(path = %path.display(), %source, "failed to select input 0");
            drop(driver);
            return Err(CaptureError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            });
        }
        if let Err(err) = driver.set_frame_interval(interval.numerator, interval.denominator) {
            warn!(
                path = %path.display(),
                %err,
                "driver ignored frame interval {}/{}",
                interval.numerator,
                interval.denominator
            );
        }

        info!(path = %path.display(), "device opened");
        Ok(Self {
            driver: Some(driver),
            path: path.to_path_buf(),
            format: None,
            capability: None,
        })
    }

    /// Verifies the node supports streaming video capture. The handle is
    /// closed when it does not.
    pub fn check_capability(&mut self) -> Result<&Capability, CaptureError> {
        let driver = self.driver()?;
        let queried = driver.query_capability();

        let cap = match queried {
            Ok(cap) if cap.can_stream_capture() => cap,
            Ok(cap) => {
                self.close();
                return Err(CaptureError::Capability {
                    path: self.path.clone(),
                    reason: format!("{} lacks streaming video capture ({:?})", cap.card, cap.flags),
                });
            }
            Err(err) => {
                self.close();
                return Err(CaptureError::Capability {
                    path: self.path.clone(),
                    reason: err.to_string(),
                });
            }
        };

        info!(card = %cap.card, driver = %cap.driver, bus = %cap.bus_info, "capabilities ok");
        Ok(self.capability.insert(cap))
    }

    /// Negotiates `width`x`height` in `encoding` ("JPEG" or "YUYV") and sizes
    /// the decoder's output for the result.
    #[instrument(skip(self, decoder))]
    pub fn set_format(
        &mut self,
        width: u32,
        height: u32,
        encoding: &str,
        decoder: &Decoder,
    ) -> Result<&StreamFormat, CaptureError> {
        let reject = |reason: String| CaptureError::Format {
            encoding: encoding.to_string(),
            width,
            height,
            reason,
        };

        if encoding.is_empty() {
            return Err(reject("empty encoding".into()));
        }
        let pixel_format = PixelFormat::from_name(encoding);
        let fourcc = pixel_format
            .fourcc()
            .ok_or_else(|| reject("unknown encoding".into()))?;

        let driver = self.driver()?;
        let applied = driver
            .set_format(width, height, fourcc)
            .map_err(|err| reject(err.to_string()))?;

        if applied.fourcc != fourcc {
            return Err(reject(format!("driver substituted {}", applied.fourcc)));
        }
        if applied.width != width || applied.height != height {
            warn!(
                requested = %format_args!("{width}x{height}"),
                applied = %format_args!("{}x{}", applied.width, applied.height),
                "driver adjusted frame size"
            );
        }

        let format = StreamFormat {
            width: applied.width,
            height: applied.height,
            pixel_format,
        };
        decoder.set_format(&format);
        info!(
            format = %format.pixel_format,
            resolution = %format.resolution(),
            "format negotiated"
        );

        Ok(self.format.insert(format))
    }

    /// Releases the driver handle. Safe to call more than once.
    pub fn close(&mut self) {
        if self.driver.take().is_some() {
            info!(path = %self.path.display(), "device closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_some()
    }

    pub fn driver(&self) -> Result<Arc<dyn CaptureDriver>, CaptureError> {
        self.driver.clone().ok_or_else(|| CaptureError::DeviceOpen {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "device closed"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    pub fn capability(&self) -> Option<&Capability> {
        self.capability.as_ref()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{FailPoint, SimulatedDriver, SimulatedProvider};
    use crate::pipeline::{DecodeMode, FrameSink};
    use v4l::capability::Flags as CapFlags;

    fn decoder() -> Decoder {
        Decoder::new(DecodeMode::Sync, FrameSink::new(|_| {}))
    }

    fn provider(driver: SimulatedDriver) -> SimulatedProvider {
        SimulatedProvider::single(Arc::new(driver))
    }

    #[test]
    fn open_missing_node_fails() {
        let provider = provider(SimulatedDriver::webcam());
        let err = DeviceHandle::open(&provider, Path::new("/dev/video9"), FrameInterval::default())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));

        let err = DeviceHandle::open(&provider, Path::new(""), FrameInterval::default())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
    }

    #[test]
    fn open_fails_when_input_cannot_be_selected() {
        let driver = SimulatedDriver::webcam();
        driver.fail_at(FailPoint::SelectInput);
        let provider = provider(driver);

        let err = DeviceHandle::open(&provider, Path::new("/dev/video0"), FrameInterval::default())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
    }

    #[test]
    fn capability_failure_closes_device() {
        let driver = SimulatedDriver::webcam().with_capability_flags(CapFlags::VIDEO_CAPTURE);
        let provider = provider(driver);
        let mut handle =
            DeviceHandle::open(&provider, Path::new("/dev/video0"), FrameInterval::default())
                .unwrap();

        let err = handle.check_capability().err().unwrap();
        assert!(matches!(err, CaptureError::Capability { .. }));
        assert!(!handle.is_open());
    }

    #[test]
    fn set_format_rejects_bad_encodings() {
        let provider = provider(SimulatedDriver::webcam());
        let mut handle =
            DeviceHandle::open(&provider, Path::new("/dev/video0"), FrameInterval::default())
                .unwrap();
        let decoder = decoder();

        assert!(matches!(
            handle.set_format(640, 480, "", &decoder),
            Err(CaptureError::Format { .. })
        ));
        assert!(matches!(
            handle.set_format(640, 480, "H264", &decoder),
            Err(CaptureError::Format { .. })
        ));
        // size the simulated camera does not offer
        assert!(matches!(
            handle.set_format(1920, 1080, "JPEG", &decoder),
            Err(CaptureError::Format { .. })
        ));
        assert!(handle.format().is_none());
    }

    #[test]
    fn set_format_stores_negotiated_geometry() {
        let provider = provider(SimulatedDriver::webcam());
        let mut handle =
            DeviceHandle::open(&provider, Path::new("/dev/video0"), FrameInterval::default())
                .unwrap();
        handle.check_capability().unwrap();

        let format = handle.set_format(640, 480, "YUYV", &decoder()).unwrap();
        assert_eq!(format.width, 640);
        assert_eq!(format.height, 480);
        assert_eq!(format.pixel_format, PixelFormat::Yuyv);
    }

    #[test]
    fn close_is_idempotent() {
        let provider = provider(SimulatedDriver::webcam());
        let mut handle =
            DeviceHandle::open(&provider, Path::new("/dev/video0"), FrameInterval::default())
                .unwrap();
        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(handle.driver().is_err());
    }
}
