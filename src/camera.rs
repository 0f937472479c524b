//! Camera lifecycle: open, negotiate, stream, pause and tear down

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::capture::buffers::{BufferPool, BUFFER_COUNT};
use crate::capture::device::{DeviceHandle, FrameInterval};
use crate::capture::driver::{CaptureDriver, DeviceProvider};
use crate::capture::frame::{Resolution, StreamFormat};
use crate::capture::sampler::{CaptureLoop, LoopOptions};
use crate::discovery::{self, FormatEntry};
use crate::error::{CaptureError, ParamError};
use crate::params::{ControlRange, ParameterStore};
use crate::pipeline::{DecodeMode, Decoder, DecoderStats, FrameSink};
use crate::Config;

/// Where a [`Camera`] is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Idle,
    Opened,
    Formatted,
    Streaming,
    Paused,
    Stopped,
}

/// Session settings that do not change between starts
#[derive(Debug, Clone)]
pub struct CameraOptions {
    pub buffer_count: u32,
    pub frame_interval: FrameInterval,
    pub loop_options: LoopOptions,
    /// Push the default parameter profile right after opening
    pub apply_default_params: bool,
    /// Parameter file loaded after the defaults
    pub param_file: Option<PathBuf>,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            buffer_count: BUFFER_COUNT,
            frame_interval: FrameInterval::default(),
            loop_options: LoopOptions::default(),
            apply_default_params: true,
            param_file: None,
        }
    }
}

impl From<&Config> for CameraOptions {
    fn from(config: &Config) -> Self {
        Self {
            buffer_count: config.capture.buffer_count,
            frame_interval: FrameInterval {
                numerator: config.capture.interval_numerator,
                denominator: config.capture.interval_denominator,
            },
            loop_options: LoopOptions {
                sample_timeout: config.capture.sample_timeout(),
                pin_core: config.capture.pin_core,
            },
            apply_default_params: config.params.apply_defaults,
            param_file: config.params.file.clone(),
        }
    }
}

/// Everything acquired by a successful start, released by `stop`
struct Session {
    driver: Arc<dyn CaptureDriver>,
    device: DeviceHandle,
    capture: CaptureLoop,
}

/// One capture device driven end to end.
///
/// Owns the decoder for its whole life; the device, buffer pool and capture
/// thread only exist between `start` and `stop`.
pub struct Camera {
    provider: Arc<dyn DeviceProvider>,
    decoder: Arc<Decoder>,
    params: ParameterStore,
    options: CameraOptions,
    state: CameraState,
    session: Option<Session>,
    path: Option<PathBuf>,
    formats: Vec<FormatEntry>,
    resolutions: Vec<Resolution>,
}

impl Camera {
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        mode: DecodeMode,
        sink: FrameSink,
        options: CameraOptions,
    ) -> Self {
        Self {
            provider,
            decoder: Arc::new(Decoder::new(mode, sink)),
            params: ParameterStore::new(),
            options,
            state: CameraState::Idle,
            session: None,
            path: None,
            formats: Vec::new(),
            resolutions: Vec::new(),
        }
    }

    pub fn from_config(provider: Arc<dyn DeviceProvider>, config: &Config, sink: FrameSink) -> Self {
        Self::new(provider, config.decode.mode, sink, CameraOptions::from(config))
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CameraState::Streaming | CameraState::Paused)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> Option<&StreamFormat> {
        self.session.as_ref().and_then(|s| s.device.format())
    }

    pub fn mode(&self) -> DecodeMode {
        self.decoder.mode()
    }

    pub fn stats(&self) -> DecoderStats {
        self.decoder.stats()
    }

    /// Swaps the frame consumer; takes effect from the next frame.
    pub fn replace_sink(&self, sink: FrameSink) {
        self.decoder.replace_sink(sink);
    }

    fn set_state(&mut self, state: CameraState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "camera state");
            self.state = state;
        }
    }

    /// Opens `path` and streams `encoding` at `resolution` (`W*H`).
    ///
    /// A running session is stopped first. On failure everything acquired
    /// so far is released and the camera is back to `Idle`.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn start(
        &mut self,
        path: &Path,
        encoding: &str,
        resolution: &str,
    ) -> Result<(), CaptureError> {
        let resolution: Resolution = resolution.parse()?;
        if encoding.is_empty() {
            return Err(CaptureError::Format {
                encoding: String::new(),
                width: resolution.width,
                height: resolution.height,
                reason: "empty encoding".into(),
            });
        }

        if self.session.is_some() {
            self.stop();
        }
        self.path = Some(path.to_path_buf());

        match self.bring_up(path, encoding, resolution) {
            Ok(session) => {
                self.session = Some(session);
                self.set_state(CameraState::Streaming);
                Ok(())
            }
            Err(err) => {
                warn!(%err, "start failed, released partial session");
                self.params.unbind();
                self.set_state(CameraState::Idle);
                Err(err)
            }
        }
    }

    // Locals drop in reverse order, so an early return releases the pool
    // before the device.
    fn bring_up(
        &mut self,
        path: &Path,
        encoding: &str,
        resolution: Resolution,
    ) -> Result<Session, CaptureError> {
        let mut device =
            DeviceHandle::open(self.provider.as_ref(), path, self.options.frame_interval)?;
        device.check_capability()?;
        let driver = device.driver()?;
        self.set_state(CameraState::Opened);

        self.params.bind(Arc::clone(&driver));
        if self.options.apply_default_params {
            self.params.apply_defaults();
        }
        if let Some(file) = self.options.param_file.clone() {
            if let Err(err) = self.params.load(&file) {
                warn!(%err, "parameter file not applied");
            }
        }

        device.set_format(resolution.width, resolution.height, encoding, &self.decoder)?;
        self.set_state(CameraState::Formatted);

        let pool = BufferPool::attach(Arc::clone(&driver), self.options.buffer_count)?;
        self.decoder.start()?;

        if let Err(source) = driver.stream_on() {
            self.decoder.stop();
            return Err(CaptureError::Stream(source));
        }

        let capture = match CaptureLoop::spawn(
            pool,
            Arc::clone(&self.decoder),
            self.options.loop_options,
        ) {
            Ok(capture) => capture,
            Err(err) => {
                if let Err(off) = driver.stream_off() {
                    warn!(%off, "stream off failed");
                }
                self.decoder.stop();
                return Err(err);
            }
        };

        Ok(Session {
            driver,
            device,
            capture,
        })
    }

    /// Starts the first device with the given USB identity.
    ///
    /// `resolution_index` picks from the device's sizes for `encoding`,
    /// largest first; an out-of-range index falls back to the largest.
    #[instrument(skip(self), fields(id = %format_args!("{vendor_id:04x}:{product_id:04x}")))]
    pub fn start_by_id(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        encoding: &str,
        resolution_index: usize,
    ) -> Result<(), CaptureError> {
        let device = discovery::find_by_id(self.provider.as_ref(), vendor_id, product_id)?;
        let sizes = discovery::resolutions(self.provider.as_ref(), &device.path, encoding)?;

        let index = if resolution_index < sizes.len() {
            resolution_index
        } else {
            warn!(
                resolution_index,
                available = sizes.len(),
                "resolution index out of range, using the largest"
            );
            0
        };
        let Some(resolution) = sizes.get(index).copied() else {
            return Err(CaptureError::Format {
                encoding: encoding.to_string(),
                width: 0,
                height: 0,
                reason: "device offers no frame sizes for this encoding".into(),
            });
        };

        self.resolutions = sizes;
        self.start(&device.path, encoding, &resolution.to_string())
    }

    /// Stops streaming and releases the device. Does nothing when no
    /// session is running.
    #[instrument(skip(self))]
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.capture.terminate();
        if let Err(err) = session.driver.stream_off() {
            warn!(%err, "stream off failed");
        }
        let pool = session.capture.join();
        self.decoder.stop();
        if let Some(mut pool) = pool {
            pool.detach();
        }
        self.params.unbind();
        session.device.close();

        self.set_state(CameraState::Stopped);
    }

    /// Stops and starts again on the last device path.
    pub fn restart(&mut self, encoding: &str, resolution: &str) -> Result<(), CaptureError> {
        let Some(path) = self.path.clone() else {
            return Err(CaptureError::InvalidState {
                operation: "restart",
                state: self.state,
            });
        };
        self.stop();
        self.start(&path, encoding, resolution)
    }

    /// Keeps the stream running but stops handing samples to the decoder.
    pub fn pause(&mut self) -> Result<(), CaptureError> {
        let paused = match (&self.session, self.state) {
            (Some(session), CameraState::Streaming) => session.capture.pause(),
            _ => false,
        };
        if !paused {
            return Err(CaptureError::InvalidState {
                operation: "pause",
                state: self.state,
            });
        }
        self.set_state(CameraState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), CaptureError> {
        let resumed = match (&self.session, self.state) {
            (Some(session), CameraState::Paused) => session.capture.resume(),
            _ => false,
        };
        if !resumed {
            return Err(CaptureError::InvalidState {
                operation: "resume",
                state: self.state,
            });
        }
        self.set_state(CameraState::Streaming);
        Ok(())
    }

    /// Stops and forgets everything learned about the device.
    pub fn clear(&mut self) {
        self.stop();
        self.formats.clear();
        self.resolutions.clear();
        self.path = None;
        self.set_state(CameraState::Idle);
    }

    /// Pixel formats of `path`, cached until `clear`.
    pub fn pixel_formats(&mut self, path: &Path) -> Result<&[FormatEntry], CaptureError> {
        if self.formats.is_empty() {
            self.formats = discovery::pixel_formats(self.provider.as_ref(), path)?;
        }
        Ok(&self.formats)
    }

    /// Frame sizes of `path` in `encoding`, largest first. Replaces the
    /// cached list.
    pub fn resolutions(
        &mut self,
        path: &Path,
        encoding: &str,
    ) -> Result<&[Resolution], CaptureError> {
        self.resolutions = discovery::resolutions(self.provider.as_ref(), path, encoding)?;
        Ok(&self.resolutions)
    }

    pub fn cached_resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    pub fn param(&self, name: &str) -> i32 {
        self.params.get(name)
    }

    pub fn set_param(&mut self, name: &str, value: i32) {
        self.params.set(name, value);
    }

    pub fn param_range(&self, name: &str) -> Option<ControlRange> {
        self.params.range(name)
    }

    pub fn apply_default_params(&mut self) {
        self.params.apply_defaults();
    }

    pub fn apply_auto_params(&mut self) {
        self.params.apply_auto();
    }

    pub fn refresh_params(&mut self) -> BTreeMap<String, i32> {
        self.params.refresh()
    }

    pub fn save_params(&mut self, path: &Path) -> Result<(), ParamError> {
        self.params.save(path)
    }

    pub fn load_params(&mut self, path: &Path) -> Result<usize, ParamError> {
        self.params.load(path)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{FailPoint, SimulatedDriver, SimulatedProvider};
    use std::time::Duration;

    fn camera(driver: &Arc<SimulatedDriver>) -> Camera {
        let provider = Arc::new(SimulatedProvider::single(Arc::clone(driver)));
        Camera::new(
            provider,
            DecodeMode::Sync,
            FrameSink::noop(),
            CameraOptions {
                loop_options: LoopOptions {
                    sample_timeout: Duration::from_millis(50),
                    pin_core: None,
                },
                ..CameraOptions::default()
            },
        )
    }

    #[test]
    fn rejects_bad_arguments_without_opening() {
        let driver = Arc::new(SimulatedDriver::webcam());
        let mut camera = camera(&driver);
        let path = Path::new("/dev/video0");

        assert!(matches!(
            camera.start(path, "", "640*480"),
            Err(CaptureError::Format { .. })
        ));
        assert!(matches!(
            camera.start(path, "JPEG", ""),
            Err(CaptureError::Resolution(_))
        ));
        assert_eq!(camera.state(), CameraState::Idle);
        assert!(camera.path().is_none());
    }

    #[test]
    fn every_failing_stage_unwinds_to_idle() {
        let cases = [
            FailPoint::SetFormat,
            FailPoint::RequestBuffers,
            FailPoint::MapBuffer(2),
            FailPoint::StreamOn,
        ];
        for point in cases {
            let driver = Arc::new(SimulatedDriver::webcam());
            driver.fail_at(point);
            let mut camera = camera(&driver);

            let result = camera.start(Path::new("/dev/video0"), "JPEG", "640*480");
            assert!(result.is_err(), "{point:?} should fail start");
            assert_eq!(camera.state(), CameraState::Idle);
            assert_eq!(driver.mapped_regions(), 0, "{point:?} leaked a mapping");
            assert!(!driver.is_streaming());
        }
    }

    #[test]
    fn pause_and_resume_need_the_right_state() {
        let driver = Arc::new(SimulatedDriver::webcam());
        let mut camera = camera(&driver);
        assert!(matches!(
            camera.pause(),
            Err(CaptureError::InvalidState {
                operation: "pause",
                state: CameraState::Idle
            })
        ));

        camera
            .start(Path::new("/dev/video0"), "YUYV", "64*48")
            .unwrap();
        assert!(camera.resume().is_err());
        camera.pause().unwrap();
        assert_eq!(camera.state(), CameraState::Paused);
        assert!(camera.pause().is_err());
        camera.resume().unwrap();
        assert_eq!(camera.state(), CameraState::Streaming);

        camera.stop();
        assert_eq!(camera.state(), CameraState::Stopped);
        assert!(camera.pause().is_err());
    }

    #[test]
    fn restart_needs_a_known_path() {
        let driver = Arc::new(SimulatedDriver::webcam());
        let mut camera = camera(&driver);
        assert!(matches!(
            camera.restart("JPEG", "640*480"),
            Err(CaptureError::InvalidState { .. })
        ));

        camera
            .start(Path::new("/dev/video0"), "YUYV", "64*48")
            .unwrap();
        camera.restart("YUYV", "320*240").unwrap();
        assert_eq!(camera.format().map(|f| f.width), Some(320));
        assert_eq!(driver.counters().stream_on.load(std::sync::atomic::Ordering::Relaxed), 2);

        camera.clear();
        assert_eq!(camera.state(), CameraState::Idle);
        assert!(camera.path().is_none());
    }

    #[test]
    fn start_by_id_falls_back_to_largest_size() {
        let driver = Arc::new(SimulatedDriver::webcam());
        let mut camera = camera(&driver);

        camera.start_by_id(0x046d, 0x0825, "YUYV", 99).unwrap();
        assert_eq!(camera.format().map(|f| f.resolution()), Some(Resolution::new(1280, 720)));
        assert_eq!(camera.cached_resolutions().len(), 4);

        assert!(matches!(
            camera.start_by_id(0xdead, 0xbeef, "YUYV", 0),
            Err(CaptureError::NotFound { .. })
        ));
    }
}
