//! The kernel capture protocol as seen by the rest of the pipeline.
//!
//! `CaptureDriver` is one open video node; `DeviceProvider` is the device
//! namespace it was opened from. The real implementations live in
//! [`crate::capture::v4l2`], the in-process ones in [`crate::capture::sim`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapRaw;
use v4l::capability::Flags as CapFlags;
use v4l::FourCC;

/// Result of `VIDIOC_QUERYCAP`
#[derive(Debug, Clone)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Capabilities of this node (device caps when the driver reports them)
    pub flags: CapFlags,
}

impl Capability {
    pub fn can_stream_capture(&self) -> bool {
        self.flags.contains(CapFlags::VIDEO_CAPTURE) && self.flags.contains(CapFlags::STREAMING)
    }
}

/// Format the driver settled on after `VIDIOC_S_FMT`
#[derive(Debug, Clone, Copy)]
pub struct AppliedFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
}

/// Placement of one kernel buffer, from `VIDIOC_QUERYBUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A buffer handed back by `VIDIOC_DQBUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
}

/// Outcome of waiting for the node to become readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub index: u32,
    pub fourcc: FourCC,
    pub description: String,
}

/// Control metadata from `VIDIOC_QUERYCTRL`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

pub const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;

impl ControlInfo {
    pub fn is_disabled(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_DISABLED != 0
    }
}

/// How a node is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read/write, for streaming
    Stream,
    /// Non-blocking, for probing during enumeration
    Probe,
}

/// One kernel buffer mapped into our address space.
///
/// The mapping is reference counted so a driver may keep its own handle on
/// the pages it fills.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    map: Arc<MmapRaw>,
}

impl MappedRegion {
    pub fn new(map: MmapRaw) -> Self {
        Self { map: Arc::new(map) }
    }

    pub fn shared(map: Arc<MmapRaw>) -> Self {
        Self { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Borrows the first `len` bytes of the region.
    ///
    /// # Safety
    ///
    /// The caller must own the buffer (dequeued and not yet requeued), so
    /// the driver is not writing to it for the lifetime of the slice.
    pub unsafe fn bytes(&self, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.map.as_ptr(), len.min(self.map.len()))
    }
}

/// A video node in the device namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub name: String,
    pub path: PathBuf,
}

/// One open V4L2 capture node.
///
/// Methods map onto the ioctls the pipeline issues. Implementations must
/// be callable from the capture thread and the controlling thread at once:
/// `stream_off` is issued while the capture thread may be waiting.
pub trait CaptureDriver: Send + Sync {
    fn query_capability(&self) -> io::Result<Capability>;
    fn select_input(&self, index: u32) -> io::Result<()>;
    fn set_frame_interval(&self, numerator: u32, denominator: u32) -> io::Result<()>;
    fn set_format(&self, width: u32, height: u32, fourcc: FourCC) -> io::Result<AppliedFormat>;

    /// Requests `count` MMAP buffers, returning how many the driver granted.
    fn request_buffers(&self, count: u32) -> io::Result<u32>;
    /// Frees every kernel buffer (`REQBUFS` with a zero count).
    fn release_buffers(&self) -> io::Result<()>;
    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo>;
    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MappedRegion>;
    fn queue_buffer(&self, index: u32) -> io::Result<()>;
    fn dequeue_buffer(&self) -> io::Result<Dequeued>;

    fn stream_on(&self) -> io::Result<()>;
    fn stream_off(&self) -> io::Result<()>;
    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness>;

    fn query_control(&self, id: u32) -> io::Result<ControlInfo>;
    fn control(&self, id: u32) -> io::Result<i32>;
    fn set_control(&self, id: u32, value: i32) -> io::Result<()>;

    /// Format descriptors in driver order.
    fn enum_formats(&self) -> io::Result<Vec<FormatDescription>>;
    /// Frame sizes for `fourcc` in driver order. Stepwise ranges report
    /// their maximum.
    fn enum_frame_sizes(&self, fourcc: FourCC) -> io::Result<Vec<(u32, u32)>>;
}

/// Where capture nodes come from.
pub trait DeviceProvider: Send + Sync {
    /// Candidate capture nodes (character devices named `video*`).
    fn scan(&self) -> io::Result<Vec<DeviceNode>>;
    /// The node's modalias attribute, e.g. `usb:v046Dp0825d0012...`.
    fn modalias(&self, node: &DeviceNode) -> io::Result<String>;
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn CaptureDriver>>;
}
