//! The ring of kernel-owned, memory-mapped capture buffers

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::capture::driver::{CaptureDriver, MappedRegion};
use crate::capture::frame::FrameView;
use crate::error::CaptureError;

/// Buffers requested from the driver by default
pub const BUFFER_COUNT: u32 = 8;

const OWNER_KERNEL: u8 = 0;
const OWNER_USER: u8 = 1;

/// Who currently holds a buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Queued; the driver may be writing to it
    Kernel,
    /// Dequeued; readable by us until requeued
    User,
}

struct Slot {
    region: MappedRegion,
    owner: AtomicU8,
}

impl Slot {
    fn owner(&self) -> Owner {
        match self.owner.load(Ordering::Acquire) {
            OWNER_KERNEL => Owner::Kernel,
            _ => Owner::User,
        }
    }
}

/// Exclusive owner of the mapped buffer ring of one device.
///
/// The pool size is fixed by `attach` and every kernel index maps to exactly
/// one slot.
pub struct BufferPool {
    driver: Option<Arc<dyn CaptureDriver>>,
    slots: Vec<Slot>,
}

impl BufferPool {
    /// Requests `count` buffers, maps each one and hands it to the driver.
    ///
    /// All or nothing: on any failure the regions mapped so far are unmapped
    /// and the kernel buffers are released before the error is returned.
    pub fn attach(driver: Arc<dyn CaptureDriver>, count: u32) -> Result<Self, CaptureError> {
        let granted = driver
            .request_buffers(count)
            .map_err(|source| CaptureError::Buffer {
                stage: "request",
                source,
            })?;
        if granted == 0 {
            return Err(CaptureError::Buffer {
                stage: "request",
                source: io::Error::new(io::ErrorKind::OutOfMemory, "driver granted no buffers"),
            });
        }
        if granted != count {
            warn!(requested = count, granted, "driver adjusted buffer count");
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match Self::map_slot(driver.as_ref(), index) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    drop(slots);
                    if let Err(release) = driver.release_buffers() {
                        error!(%release, "failed to release kernel buffers");
                    }
                    return Err(err);
                }
            }
        }

        info!(buffers = granted, "buffer pool attached");
        Ok(Self {
            driver: Some(driver),
            slots,
        })
    }

    fn map_slot(driver: &dyn CaptureDriver, index: u32) -> Result<Slot, CaptureError> {
        let info = driver
            .query_buffer(index)
            .map_err(|source| CaptureError::Buffer {
                stage: "query",
                source,
            })?;
        let region = driver
            .map_buffer(&info)
            .map_err(|source| CaptureError::Buffer { stage: "map", source })?;
        driver
            .queue_buffer(index)
            .map_err(|source| CaptureError::Buffer {
                stage: "queue",
                source,
            })?;
        debug!(index, offset = info.offset, length = info.length, "buffer mapped");

        Ok(Slot {
            region,
            owner: AtomicU8::new(OWNER_KERNEL),
        })
    }

    /// Unmaps every region and releases the kernel buffers. Idempotent.
    pub fn detach(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        self.slots.clear();
        match driver.release_buffers() {
            Ok(()) => info!("buffer pool detached"),
            Err(err) => error!(%err, "failed to release kernel buffers"),
        }
    }

    pub fn driver(&self) -> Option<&dyn CaptureDriver> {
        self.driver.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.driver.is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owner(&self, index: u32) -> Option<Owner> {
        self.slots.get(index as usize).map(Slot::owner)
    }

    /// Takes the next filled buffer from the driver.
    ///
    /// `WouldBlock` means nothing is ready yet. An index outside the pool is
    /// handed straight back to the driver and reported as an error.
    pub fn dequeue(&self) -> io::Result<DequeuedBuffer<'_>> {
        let driver = self
            .driver
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pool detached"))?;
        let dequeued = driver.dequeue_buffer()?;

        let Some(slot) = self.slots.get(dequeued.index as usize) else {
            if let Err(err) = driver.queue_buffer(dequeued.index) {
                warn!(index = dequeued.index, %err, "failed to hand back unknown buffer");
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver returned unknown buffer index {}", dequeued.index),
            ));
        };
        if slot.owner.swap(OWNER_USER, Ordering::AcqRel) == OWNER_USER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver returned buffer {} while it is still dequeued", dequeued.index),
            ));
        }

        Ok(DequeuedBuffer {
            driver,
            slot,
            index: dequeued.index,
            bytes_used: dequeued.bytes_used as usize,
            sequence: dequeued.sequence,
            requeued: false,
        })
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A buffer we own until it is requeued, either explicitly or on drop.
pub struct DequeuedBuffer<'a> {
    driver: &'a dyn CaptureDriver,
    slot: &'a Slot,
    index: u32,
    bytes_used: usize,
    sequence: u32,
    requeued: bool,
}

impl DequeuedBuffer<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Borrowed view of the filled bytes, valid until requeue.
    pub fn view(&self) -> FrameView<'_> {
        // SAFETY: the slot is user-owned until `requeue`, which needs
        // `&mut self` and so cannot run while this borrow is live.
        let data = unsafe { self.slot.region.bytes(self.bytes_used) };
        FrameView {
            index: self.index,
            sequence: self.sequence,
            data,
        }
    }

    /// Hands the buffer back to the driver.
    pub fn requeue(mut self) -> io::Result<()> {
        self.requeue_inner()
    }

    fn requeue_inner(&mut self) -> io::Result<()> {
        if self.requeued {
            return Ok(());
        }
        self.requeued = true;
        self.slot.owner.store(OWNER_KERNEL, Ordering::Release);
        self.driver.queue_buffer(self.index)
    }
}

impl Drop for DequeuedBuffer<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.requeue_inner() {
            warn!(index = self.index, %err, "failed to requeue buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{FailPoint, SimulatedDriver};
    use std::sync::atomic::Ordering;
    use v4l::FourCC;

    fn driver() -> Arc<SimulatedDriver> {
        let driver = Arc::new(SimulatedDriver::webcam());
        driver.set_format(64, 48, FourCC::new(b"YUYV")).unwrap();
        driver
    }

    #[test]
    fn attach_maps_and_queues_every_buffer() {
        let driver = driver();
        let pool = BufferPool::attach(driver.clone(), BUFFER_COUNT).unwrap();

        assert_eq!(pool.len(), BUFFER_COUNT as usize);
        assert_eq!(driver.mapped_regions(), BUFFER_COUNT as usize);
        assert_eq!(driver.counters().queued.load(Ordering::Relaxed), 8);
        assert!((0..8).all(|i| pool.owner(i) == Some(Owner::Kernel)));
    }

    #[test]
    fn failed_attach_releases_everything() {
        for point in [FailPoint::QueryBuffer(3), FailPoint::MapBuffer(5), FailPoint::QueueBuffer(7)] {
            let driver = driver();
            driver.fail_at(point);

            let err = BufferPool::attach(driver.clone(), BUFFER_COUNT).err().unwrap();
            let expected = match point {
                FailPoint::QueryBuffer(_) => "query",
                FailPoint::MapBuffer(_) => "map",
                _ => "queue",
            };
            assert!(matches!(err, CaptureError::Buffer { stage, .. } if stage == expected));
            assert_eq!(driver.mapped_regions(), 0);
            assert_eq!(driver.counters().released.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn detach_is_idempotent() {
        let driver = driver();
        let mut pool = BufferPool::attach(driver.clone(), 4).unwrap();
        pool.detach();
        pool.detach();
        drop(pool);

        assert_eq!(driver.mapped_regions(), 0);
        assert_eq!(driver.counters().released.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dequeued_buffer_requeues_on_drop() {
        let driver = driver();
        driver.push_frames([vec![7u8; 32], vec![9u8; 16]]);
        let pool = BufferPool::attach(driver.clone(), 4).unwrap();
        driver.stream_on().unwrap();

        {
            let buffer = pool.dequeue().unwrap();
            let view = buffer.view();
            assert_eq!(view.data, &[7u8; 32][..]);
            assert_eq!(pool.owner(buffer.index()), Some(Owner::User));
        }
        assert!((0..4).all(|i| pool.owner(i) == Some(Owner::Kernel)));

        let buffer = pool.dequeue().unwrap();
        assert_eq!(buffer.view().data.len(), 16);
        buffer.requeue().unwrap();

        // source exhausted
        let err = pool.dequeue().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(driver.counters().violations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn held_buffer_is_never_handed_out_again() {
        let driver = driver();
        driver.push_frames([vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]]);
        let pool = BufferPool::attach(driver.clone(), 4).unwrap();
        driver.stream_on().unwrap();

        let held = pool.dequeue().unwrap();
        let second = pool.dequeue().unwrap();
        assert_ne!(held.index(), second.index());
        assert_eq!(held.view().data, &[1u8; 8][..]);
        assert_eq!(second.view().data, &[2u8; 8][..]);
        second.requeue().unwrap();

        let third = pool.dequeue().unwrap();
        assert_ne!(third.index(), held.index());
        assert_eq!(pool.owner(held.index()), Some(Owner::User));
        drop(third);
        drop(held);

        assert_eq!(driver.counters().dequeued.load(Ordering::Relaxed), 3);
        assert_eq!(driver.counters().violations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn double_queue_is_a_violation() {
        let driver = driver();
        let pool = BufferPool::attach(driver.clone(), 2).unwrap();
        assert_eq!(pool.owner(0), Some(Owner::Kernel));

        assert!(driver.queue_buffer(0).is_err());
        assert_eq!(driver.counters().violations.load(Ordering::Relaxed), 1);
    }
}
