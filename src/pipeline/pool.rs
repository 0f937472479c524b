//! Reusable decoded-frame storage

/// Allocation granularity for pixel buffers
const FRAME_ALIGN: usize = 1024;

fn align_up(len: usize) -> usize {
    (len + FRAME_ALIGN - 1) & !(FRAME_ALIGN - 1)
}

/// One decoded output buffer.
///
/// Capacity only grows (rounded up to 1 KiB), so switching back and forth
/// between formats does not reallocate.
#[derive(Debug, Default)]
pub struct PixelFrame {
    data: Vec<u8>,
    len: usize,
}

impl PixelFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the logical length to `len`, growing the backing store when it
    /// is too small. Returns whether a reallocation happened.
    pub fn allocate(&mut self, len: usize) -> bool {
        let grew = len > self.data.len();
        if grew {
            self.data.resize(align_up(len), 0);
        }
        self.len = len;
        grew
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

/// Fixed ring of output frames owned by one decoder
#[derive(Debug)]
pub struct FramePool {
    frames: Vec<PixelFrame>,
    next: usize,
}

impl FramePool {
    pub fn new(slots: usize) -> Self {
        Self {
            frames: (0..slots.max(1)).map(|_| PixelFrame::new()).collect(),
            next: 0,
        }
    }

    /// Sizes every slot for frames of `len` bytes.
    pub fn resize_all(&mut self, len: usize) {
        for frame in &mut self.frames {
            frame.allocate(len);
        }
    }

    /// The next slot in ring order.
    pub fn next_slot(&mut self) -> &mut PixelFrame {
        let index = self.next;
        self.next = (self.next + 1) % self.frames.len();
        &mut self.frames[index]
    }

    pub fn slots(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.frames.iter().map(PixelFrame::capacity).sum()
    }

    /// Capacity of the smallest slot.
    pub fn slot_capacity(&self) -> usize {
        self.frames.iter().map(PixelFrame::capacity).min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_grows_aligned_and_never_shrinks() {
        let mut frame = PixelFrame::new();
        assert!(frame.allocate(1000));
        assert_eq!(frame.capacity(), 1024);
        assert_eq!(frame.len(), 1000);

        assert!(frame.allocate(1025));
        assert_eq!(frame.capacity(), 2048);

        assert!(!frame.allocate(10));
        assert_eq!(frame.capacity(), 2048);
        assert_eq!(frame.as_slice().len(), 10);
    }

    #[test]
    fn pool_cycles_through_slots() {
        let mut pool = FramePool::new(4);
        pool.resize_all(3 * 1024);
        assert_eq!(pool.capacity_bytes(), 4 * 3 * 1024);

        let first = pool.next_slot() as *const PixelFrame;
        for _ in 0..3 {
            assert_ne!(pool.next_slot() as *const PixelFrame, first);
        }
        assert_eq!(pool.next_slot() as *const PixelFrame, first);
    }
}
