//! V4L2 capture through the `v4l` crate with memory-mapped buffers.
//!
//! Capabilities, formats, frame sizes, the capture interval and controls go
//! through `v4l::Device` and its `Capture` trait. `v4l` only exposes buffer
//! I/O as an owning `MmapStream`, while the pipeline shares its slots between
//! the capture thread and the decoders, so input selection and the
//! REQBUFS/QUERYBUF/QBUF/DQBUF/STREAMON/STREAMOFF sequence are issued with
//! `v4l::v4l2::ioctl` on the device's own handle.

use std::fs;
use std::io;
use std::os::raw::{c_int, c_void};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use memmap2::MmapOptions;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::format::FieldOrder;
use v4l::framesize::FrameSizeEnum;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction, Memory};

use crate::capture::driver::{
    AppliedFormat, BufferInfo, Capability, CaptureDriver, ControlInfo, Dequeued, DeviceNode,
    DeviceProvider, FormatDescription, MappedRegion, OpenMode, Readiness,
};

/// Issues a raw ioctl on `fd`, retrying when a signal interrupts it.
///
/// # Safety
///
/// `arg` must be the argument type the kernel expects for `request`.
unsafe fn xioctl<T>(fd: c_int, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        match v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

fn mmap_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: all-zero is a valid bit pattern for this plain C struct.
        ..unsafe { std::mem::zeroed() }
    }
}

fn control_info(desc: &v4l::control::Description) -> ControlInfo {
    let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    ControlInfo {
        id: desc.id,
        name: desc.name.clone(),
        minimum: clamp(desc.minimum),
        maximum: clamp(desc.maximum),
        step: desc.step.min(i32::MAX as u64) as i32,
        default_value: clamp(desc.default),
        flags: desc.flags.bits(),
    }
}

/// One open `/dev/video*` node
pub struct V4l2Driver {
    device: Device,
    path: PathBuf,
    /// Filled on the first control query; the set is fixed while open.
    controls: Mutex<Option<Arc<Vec<ControlInfo>>>>,
}

impl V4l2Driver {
    pub fn open(path: &Path, mode: OpenMode) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        debug!(path = %path.display(), ?mode, "opened video node");

        Ok(Self {
            device,
            path: path.to_path_buf(),
            controls: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn controls(&self) -> io::Result<Arc<Vec<ControlInfo>>> {
        let mut cached = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(controls) = cached.as_ref() {
            return Ok(Arc::clone(controls));
        }
        let controls: Arc<Vec<ControlInfo>> =
            Arc::new(self.device.query_controls()?.iter().map(control_info).collect());
        debug!(count = controls.len(), "controls queried");
        *cached = Some(Arc::clone(&controls));
        Ok(controls)
    }
}

impl CaptureDriver for V4l2Driver {
    fn query_capability(&self) -> io::Result<Capability> {
        let caps = self.device.query_caps()?;
        Ok(Capability {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            flags: caps.capabilities,
        })
    }

    fn select_input(&self, index: u32) -> io::Result<()> {
        let mut input = index as c_int;
        // SAFETY: VIDIOC_S_INPUT takes a pointer to an int.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_S_INPUT, &mut input) }
    }

    fn set_frame_interval(&self, numerator: u32, denominator: u32) -> io::Result<()> {
        let params = Parameters::new(Fraction::new(numerator, denominator));
        let applied = self.device.set_params(&params)?;
        debug!(interval = %applied.interval, "capture interval set");
        Ok(())
    }

    fn set_format(&self, width: u32, height: u32, fourcc: FourCC) -> io::Result<AppliedFormat> {
        let mut format = Format::new(width, height, fourcc);
        format.field_order = FieldOrder::Interlaced;
        let applied = self.device.set_format(&format)?;

        Ok(AppliedFormat {
            width: applied.width,
            height: applied.height,
            fourcc: applied.fourcc,
        })
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: all-zero is a valid bit pattern for this plain C struct.
            ..unsafe { std::mem::zeroed() }
        };
        // SAFETY: `req` is a live v4l2_requestbuffers.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_REQBUFS, &mut req)? };
        Ok(req.count)
    }

    fn release_buffers(&self) -> io::Result<()> {
        self.request_buffers(0).map(|_| ())
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let mut buf = mmap_buffer(index);
        // SAFETY: `buf` is a live v4l2_buffer.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_QUERYBUF, &mut buf)? };

        Ok(BufferInfo {
            index,
            // SAFETY: MMAP buffers report their placement in `m.offset`.
            offset: unsafe { buf.m.offset },
            length: buf.length,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MappedRegion> {
        let map = MmapOptions::new()
            .offset(info.offset as u64)
            .len(info.length as usize)
            .map_raw(self.fd())?;
        Ok(MappedRegion::new(map))
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut buf = mmap_buffer(index);
        // SAFETY: `buf` is a live v4l2_buffer.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_QBUF, &mut buf) }
    }

    fn dequeue_buffer(&self) -> io::Result<Dequeued> {
        let mut buf = mmap_buffer(0);
        // SAFETY: `buf` is a live v4l2_buffer.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_DQBUF, &mut buf)? };

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut buf_type = Type::VideoCapture as c_int;
        // SAFETY: VIDIOC_STREAMON reads one int.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_STREAMON, &mut buf_type)? };
        info!(path = %self.path.display(), "stream on");
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut buf_type = Type::VideoCapture as c_int;
        // SAFETY: VIDIOC_STREAMOFF reads one int.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_STREAMOFF, &mut buf_type)? };
        info!(path = %self.path.display(), "stream off");
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        match self.device.handle().poll(libc::POLLIN, millis) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => Ok(Readiness::Ready),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Readiness::Interrupted),
            Err(err) => Err(err),
        }
    }

    fn query_control(&self, id: u32) -> io::Result<ControlInfo> {
        self.controls()?
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn control(&self, id: u32) -> io::Result<i32> {
        match self.device.control(id)?.value {
            Value::Integer(value) => Ok(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
            Value::Boolean(value) => Ok(value as i32),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("control {id:#x} is not an integer"),
            )),
        }
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value as i64),
        })
    }

    fn enum_formats(&self) -> io::Result<Vec<FormatDescription>> {
        Ok(self
            .device
            .enum_formats()?
            .into_iter()
            .map(|desc| FormatDescription {
                index: desc.index,
                fourcc: desc.fourcc,
                description: desc.description,
            })
            .collect())
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> io::Result<Vec<(u32, u32)>> {
        Ok(self
            .device
            .enum_framesizes(fourcc)?
            .into_iter()
            .map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => (d.width, d.height),
                FrameSizeEnum::Stepwise(s) => (s.max_width, s.max_height),
            })
            .collect())
    }
}

/// The host's `/dev` namespace
#[derive(Debug, Clone)]
pub struct V4l2Provider {
    dev_dir: PathBuf,
    sysfs_dir: PathBuf,
}

impl Default for V4l2Provider {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sysfs_dir: PathBuf::from("/sys/class/video4linux"),
        }
    }
}

impl DeviceProvider for V4l2Provider {
    fn scan(&self) -> io::Result<Vec<DeviceNode>> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(&self.dev_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_char_device() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains("video") {
                continue;
            }
            nodes.push(DeviceNode {
                path: entry.path(),
                name,
            });
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    fn modalias(&self, node: &DeviceNode) -> io::Result<String> {
        let path = self.sysfs_dir.join(&node.name).join("device/modalias");
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn CaptureDriver>> {
        Ok(Arc::new(V4l2Driver::open(path, mode)?))
    }
}
