//! In-process stand-in for a V4L2 capture node.
//!
//! `SimulatedDriver` keeps the kernel side of the buffer protocol honest:
//! slots move between queued and dequeued exactly like a real driver, and
//! any protocol misuse (double queue, dequeue of an unqueued slot) is
//! counted as a violation. Payloads are written into anonymous mappings
//! handed out by `map_buffer`, so the pipeline reads them through the same
//! zero-copy path as real hardware.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use memmap2::{MmapOptions, MmapRaw};
use tracing::trace;
use v4l::capability::Flags as CapFlags;
use v4l::FourCC;

use crate::capture::driver::{
    AppliedFormat, BufferInfo, Capability, CaptureDriver, ControlInfo, Dequeued, DeviceNode,
    DeviceProvider, FormatDescription, MappedRegion, OpenMode, Readiness,
};

/// Protocol step at which the simulated driver can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    SelectInput,
    SetFormat,
    RequestBuffers,
    QueryBuffer(u32),
    MapBuffer(u32),
    QueueBuffer(u32),
    StreamOn,
    /// Every dequeue fails with `EIO`
    Dequeue,
    /// Format enumeration fails, hiding the node from `enumerate`
    EnumFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Queued,
    Dequeued,
}

/// What the simulated sensor produces
#[derive(Debug, Clone)]
pub enum FrameSource {
    /// Each payload is delivered once, in order
    Sequence(VecDeque<Vec<u8>>),
    /// The same payload forever
    Repeat(Vec<u8>),
}

/// A capture format advertised by the simulated node
#[derive(Debug, Clone)]
pub struct SimFormat {
    pub fourcc: FourCC,
    pub description: String,
    pub sizes: Vec<(u32, u32)>,
}

impl SimFormat {
    pub fn mjpeg(sizes: &[(u32, u32)]) -> Self {
        Self {
            fourcc: FourCC::new(b"MJPG"),
            description: "Motion-JPEG".into(),
            sizes: sizes.to_vec(),
        }
    }

    pub fn yuyv(sizes: &[(u32, u32)]) -> Self {
        Self {
            fourcc: FourCC::new(b"YUYV"),
            description: "YUYV 4:2:2".into(),
            sizes: sizes.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
struct SimControl {
    info: ControlInfo,
    value: i32,
}

struct SimState {
    formats: Vec<SimFormat>,
    controls: BTreeMap<u32, SimControl>,
    format: Option<AppliedFormat>,
    regions: Vec<Arc<MmapRaw>>,
    slots: Vec<SlotState>,
    ready: VecDeque<u32>,
    source: FrameSource,
    streaming: bool,
    fail: Option<FailPoint>,
    sequence: u32,
}

/// Counters describing how the pipeline drove the simulated node
#[derive(Debug, Default)]
pub struct SimCounters {
    pub dequeued: AtomicU64,
    pub queued: AtomicU64,
    pub stream_on: AtomicU64,
    pub stream_off: AtomicU64,
    pub released: AtomicU64,
    pub violations: AtomicU64,
}

pub struct SimulatedDriver {
    capability: Capability,
    frame_interval: Duration,
    state: Mutex<SimState>,
    counters: SimCounters,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn einval(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.to_string())
}

fn injected(point: FailPoint) -> io::Error {
    io::Error::other(format!("injected failure at {point:?}"))
}

impl SimulatedDriver {
    /// A UVC-like webcam offering MJPEG and YUYV at a few sizes, with the
    /// usual user and camera class controls.
    pub fn webcam() -> Self {
        let sizes = [(1280, 720), (640, 480), (320, 240), (64, 48)];
        Self::new(
            vec![SimFormat::mjpeg(&sizes), SimFormat::yuyv(&sizes)],
            FrameSource::Sequence(VecDeque::new()),
        )
        .with_controls(default_controls())
    }

    pub fn new(formats: Vec<SimFormat>, source: FrameSource) -> Self {
        Self {
            capability: Capability {
                driver: "iris-sim".into(),
                card: "Simulated Camera".into(),
                bus_info: "sim:0".into(),
                flags: CapFlags::VIDEO_CAPTURE | CapFlags::STREAMING,
            },
            frame_interval: Duration::from_millis(2),
            state: Mutex::new(SimState {
                formats,
                controls: BTreeMap::new(),
                format: None,
                regions: Vec::new(),
                slots: Vec::new(),
                ready: VecDeque::new(),
                source,
                streaming: false,
                fail: None,
                sequence: 0,
            }),
            counters: SimCounters::default(),
        }
    }

    pub fn with_capability_flags(mut self, flags: CapFlags) -> Self {
        self.capability.flags = flags;
        self
    }

    /// Delay between frames while streaming
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_controls(self, controls: Vec<ControlInfo>) -> Self {
        {
            let mut state = lock(&self.state);
            for info in controls {
                let value = info.default_value;
                state.controls.insert(info.id, SimControl { info, value });
            }
        }
        self
    }

    pub fn with_source(self, source: FrameSource) -> Self {
        lock(&self.state).source = source;
        self
    }

    pub fn fail_at(&self, point: FailPoint) {
        lock(&self.state).fail = Some(point);
    }

    /// Appends payloads to a `Sequence` source (replacing a `Repeat` one).
    pub fn push_frames<I>(&self, frames: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut state = lock(&self.state);
        match &mut state.source {
            FrameSource::Sequence(queue) => queue.extend(frames),
            source @ FrameSource::Repeat(_) => {
                *source = FrameSource::Sequence(frames.into_iter().collect());
            }
        }
    }

    pub fn counters(&self) -> &SimCounters {
        &self.counters
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).streaming
    }

    /// Regions still mapped by someone other than the driver itself.
    pub fn mapped_regions(&self) -> usize {
        lock(&self.state)
            .regions
            .iter()
            .filter(|region| Arc::strong_count(region) > 1)
            .count()
    }

    pub fn control_value(&self, id: u32) -> Option<i32> {
        lock(&self.state).controls.get(&id).map(|c| c.value)
    }

    fn check(&self, state: &SimState, point: FailPoint) -> io::Result<()> {
        if state.fail == Some(point) {
            Err(injected(point))
        } else {
            Ok(())
        }
    }

    fn buffer_length(state: &SimState) -> usize {
        let frame = state
            .format
            .map(|f| f.width as usize * f.height as usize * 2)
            .unwrap_or(0);
        let payload = match &state.source {
            FrameSource::Sequence(queue) => queue.iter().map(Vec::len).max().unwrap_or(0),
            FrameSource::Repeat(payload) => payload.len(),
        };
        frame.max(payload).max(4096)
    }

    fn next_payload(state: &mut SimState) -> Option<Vec<u8>> {
        match &mut state.source {
            FrameSource::Sequence(queue) => queue.pop_front(),
            FrameSource::Repeat(payload) => Some(payload.clone()),
        }
    }

    fn has_payload(state: &SimState) -> bool {
        match &state.source {
            FrameSource::Sequence(queue) => !queue.is_empty(),
            FrameSource::Repeat(_) => true,
        }
    }
}

impl CaptureDriver for SimulatedDriver {
    fn query_capability(&self) -> io::Result<Capability> {
        Ok(self.capability.clone())
    }

    fn select_input(&self, index: u32) -> io::Result<()> {
        let state = lock(&self.state);
        self.check(&state, FailPoint::SelectInput)?;
        if index != 0 {
            return Err(einval("only input 0 exists"));
        }
        Ok(())
    }

    fn set_frame_interval(&self, _numerator: u32, _denominator: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_format(&self, width: u32, height: u32, fourcc: FourCC) -> io::Result<AppliedFormat> {
        let mut state = lock(&self.state);
        self.check(&state, FailPoint::SetFormat)?;
        if state.streaming || !state.regions.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let format = state
            .formats
            .iter()
            .find(|f| f.fourcc == fourcc)
            .ok_or_else(|| einval("unsupported pixel format"))?;
        if !format.sizes.contains(&(width, height)) {
            return Err(einval("unsupported frame size"));
        }
        let applied = AppliedFormat {
            width,
            height,
            fourcc,
        };
        state.format = Some(applied);
        Ok(applied)
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut state = lock(&self.state);
        if count == 0 {
            if state.streaming {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            state.regions.clear();
            state.slots.clear();
            state.ready.clear();
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }
        self.check(&state, FailPoint::RequestBuffers)?;
        if state.format.is_none() {
            return Err(einval("format not set"));
        }

        let length = Self::buffer_length(&state);
        let mut regions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let map = MmapOptions::new().len(length).map_anon()?;
            regions.push(Arc::new(MmapRaw::from(map)));
        }
        state.regions = regions;
        state.slots = vec![SlotState::Dequeued; count as usize];
        state.ready.clear();
        Ok(count)
    }

    fn release_buffers(&self) -> io::Result<()> {
        self.request_buffers(0).map(|_| ())
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let state = lock(&self.state);
        self.check(&state, FailPoint::QueryBuffer(index))?;
        let region = state
            .regions
            .get(index as usize)
            .ok_or_else(|| einval("buffer index out of range"))?;
        Ok(BufferInfo {
            index,
            offset: index * region.len() as u32,
            length: region.len() as u32,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MappedRegion> {
        let state = lock(&self.state);
        self.check(&state, FailPoint::MapBuffer(info.index))?;
        let region = state
            .regions
            .get(info.index as usize)
            .ok_or_else(|| einval("buffer index out of range"))?;
        Ok(MappedRegion::shared(Arc::clone(region)))
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        self.check(&state, FailPoint::QueueBuffer(index))?;
        match state.slots.get(index as usize).copied() {
            None => Err(einval("buffer index out of range")),
            Some(SlotState::Queued) => {
                self.counters.violations.fetch_add(1, Ordering::Relaxed);
                Err(einval("buffer already queued"))
            }
            Some(SlotState::Dequeued) => {
                state.slots[index as usize] = SlotState::Queued;
                state.ready.push_back(index);
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn dequeue_buffer(&self) -> io::Result<Dequeued> {
        let mut state = lock(&self.state);
        self.check(&state, FailPoint::Dequeue)
            .map_err(|_| io::Error::from_raw_os_error(libc::EIO))?;
        if !state.streaming {
            return Err(einval("not streaming"));
        }
        if !Self::has_payload(&state) {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let Some(index) = state.ready.pop_front() else {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };
        // Only a queued slot may be filled; anything else means the client
        // still holds it.
        if state.slots[index as usize] != SlotState::Queued {
            self.counters.violations.fetch_add(1, Ordering::Relaxed);
            return Err(einval("buffer is not queued"));
        }
        let payload = Self::next_payload(&mut state).unwrap_or_default();
        let region = Arc::clone(&state.regions[index as usize]);
        let bytes_used = payload.len().min(region.len());
        // SAFETY: the slot is queued, so no reader holds a view of it; the
        // region is at least `bytes_used` long.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), region.as_mut_ptr(), bytes_used);
        }
        state.slots[index as usize] = SlotState::Dequeued;
        state.sequence = state.sequence.wrapping_add(1);
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        trace!(index, bytes_used, "sim dequeue");

        Ok(Dequeued {
            index,
            bytes_used: bytes_used as u32,
            sequence: state.sequence,
        })
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = lock(&self.state);
        self.check(&state, FailPoint::StreamOn)?;
        if state.regions.is_empty() {
            return Err(einval("no buffers"));
        }
        state.streaming = true;
        self.counters.stream_on.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.streaming = false;
        // STREAMOFF returns every buffer to userspace.
        for slot in state.slots.iter_mut() {
            *slot = SlotState::Dequeued;
        }
        state.ready.clear();
        self.counters.stream_off.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let ready = {
            let state = lock(&self.state);
            // A stopped stream reports an error condition, which poll()
            // surfaces as readable.
            if !state.streaming {
                return Ok(Readiness::Ready);
            }
            !state.ready.is_empty() && Self::has_payload(&state)
        };
        if ready {
            thread::sleep(self.frame_interval);
            Ok(Readiness::Ready)
        } else {
            thread::sleep(timeout.min(Duration::from_millis(10)));
            Ok(Readiness::TimedOut)
        }
    }

    fn query_control(&self, id: u32) -> io::Result<ControlInfo> {
        lock(&self.state)
            .controls
            .get(&id)
            .map(|c| c.info.clone())
            .ok_or_else(|| einval("unknown control"))
    }

    fn control(&self, id: u32) -> io::Result<i32> {
        lock(&self.state)
            .controls
            .get(&id)
            .map(|c| c.value)
            .ok_or_else(|| einval("unknown control"))
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        let mut state = lock(&self.state);
        let control = state
            .controls
            .get_mut(&id)
            .ok_or_else(|| einval("unknown control"))?;
        if value < control.info.minimum || value > control.info.maximum {
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }
        control.value = value;
        Ok(())
    }

    fn enum_formats(&self) -> io::Result<Vec<FormatDescription>> {
        let state = lock(&self.state);
        self.check(&state, FailPoint::EnumFormat)?;
        Ok(state
            .formats
            .iter()
            .enumerate()
            .map(|(index, f)| FormatDescription {
                index: index as u32,
                fourcc: f.fourcc,
                description: f.description.clone(),
            })
            .collect())
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> io::Result<Vec<(u32, u32)>> {
        let state = lock(&self.state);
        let format = state
            .formats
            .iter()
            .find(|f| f.fourcc == fourcc)
            .ok_or_else(|| einval("unsupported pixel format"))?;
        Ok(format.sizes.clone())
    }
}

fn control(id: u32, name: &str, minimum: i32, maximum: i32, default_value: i32) -> ControlInfo {
    ControlInfo {
        id,
        name: name.into(),
        minimum,
        maximum,
        step: 1,
        default_value,
        flags: 0,
    }
}

/// Controls a typical UVC webcam exposes.
pub fn default_controls() -> Vec<ControlInfo> {
    use crate::params::cid;

    vec![
        control(cid::AUTO_WHITE_BALANCE, "White Balance, Automatic", 0, 1, 1),
        control(cid::WHITE_BALANCE_TEMPERATURE, "White Balance Temperature", 2800, 6500, 4600),
        control(cid::AUTOBRIGHTNESS, "Brightness, Automatic", 0, 1, 0),
        control(cid::BRIGHTNESS, "Brightness", -64, 64, 0),
        control(cid::CONTRAST, "Contrast", 0, 64, 32),
        control(cid::SATURATION, "Saturation", 0, 128, 64),
        control(cid::HUE, "Hue", -40, 40, 0),
        control(cid::SHARPNESS, "Sharpness", 0, 6, 3),
        control(cid::BACKLIGHT_COMPENSATION, "Backlight Compensation", 0, 2, 1),
        control(cid::GAMMA, "Gamma", 0, 500, 100),
        control(cid::EXPOSURE_AUTO, "Auto Exposure", 0, 3, 3),
        control(cid::EXPOSURE_ABSOLUTE, "Exposure Time, Absolute", 1, 5000, 156),
        control(cid::AUTOGAIN, "Gain, Automatic", 0, 1, 1),
        control(cid::GAIN, "Gain", 0, 100, 0),
        control(cid::POWER_LINE_FREQUENCY, "Power Line Frequency", 0, 2, 1),
        control(cid::HUE_AUTO, "Hue, Automatic", 0, 1, 0),
        control(cid::FOCUS_AUTO, "Focus, Automatic Continuous", 0, 1, 1),
    ]
}

struct SimNode {
    modalias: String,
    driver: Arc<SimulatedDriver>,
}

/// A device namespace populated with simulated nodes.
///
/// `open` hands out the registered driver itself, so tests can inspect the
/// node the pipeline is driving.
#[derive(Default)]
pub struct SimulatedProvider {
    nodes: Mutex<HashMap<PathBuf, SimNode>>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<PathBuf>, modalias: &str, driver: Arc<SimulatedDriver>) {
        let node = SimNode {
            modalias: modalias.to_string(),
            driver,
        };
        self.nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.into(), node);
    }

    /// A provider with one simulated webcam at `/dev/video0`.
    pub fn single(driver: Arc<SimulatedDriver>) -> Self {
        let provider = Self::new();
        provider.add("/dev/video0", "usb:v046Dp0825d0012dcEFdsc02dp01ic0Eisc01ip00in00", driver);
        provider
    }
}

impl DeviceProvider for SimulatedProvider {
    fn scan(&self) -> io::Result<Vec<DeviceNode>> {
        let nodes = self
            .nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut found: Vec<DeviceNode> = nodes
            .keys()
            .map(|path| DeviceNode {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: path.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn modalias(&self, node: &DeviceNode) -> io::Result<String> {
        self.nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&node.path)
            .map(|n| n.modalias.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn open(&self, path: &Path, _mode: OpenMode) -> io::Result<Arc<dyn CaptureDriver>> {
        let nodes = self
            .nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let node = nodes
            .get(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let driver: Arc<dyn CaptureDriver> = node.driver.clone();
        Ok(driver)
    }
}
