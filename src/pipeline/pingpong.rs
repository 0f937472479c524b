//! Spinning decode thread over a ring of input slots

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};

use crossbeam::utils::{Backoff, CachePadded};
use tracing::{debug, info, warn};

use crate::capture::frame::{FrameView, StreamFormat};
use crate::error::CaptureError;
use crate::pipeline::pool::FramePool;
use crate::pipeline::Delivery;

const SLOTS: usize = 8;

#[derive(Default)]
struct InputSlot {
    bytes: Vec<u8>,
    /// Publication number of the sample held here, 0 when empty
    published: u64,
    sequence: u32,
}

struct Output {
    format: Option<StreamFormat>,
    frames: FramePool,
}

struct Shared {
    delivery: Arc<Delivery>,
    inputs: Vec<Mutex<InputSlot>>,
    /// Next slot the capture thread writes
    in_index: CachePadded<AtomicUsize>,
    /// Latest slot published to the decode thread
    out_index: CachePadded<AtomicUsize>,
    /// Publication counter, bumped after `out_index`
    published: CachePadded<AtomicU64>,
    running: AtomicBool,
    /// Set once a panicked decode left an input slot poisoned
    poisoned: AtomicBool,
    output: Mutex<Output>,
}

/// Low-latency decoder that busy-waits for new samples.
///
/// `sample` copies into the next input slot unless the decode thread is
/// still reading it, in which case the sample is dropped. The decode thread
/// decodes each published sample at most once, always the newest.
pub struct PingPongDecoder {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PingPongDecoder {
    pub(crate) fn new(delivery: Arc<Delivery>) -> Self {
        Self {
            shared: Arc::new(Shared {
                delivery,
                inputs: (0..SLOTS).map(|_| Mutex::new(InputSlot::default())).collect(),
                in_index: CachePadded::new(AtomicUsize::new(0)),
                out_index: CachePadded::new(AtomicUsize::new(0)),
                published: CachePadded::new(AtomicU64::new(0)),
                running: AtomicBool::new(false),
                poisoned: AtomicBool::new(false),
                output: Mutex::new(Output {
                    format: None,
                    frames: FramePool::new(SLOTS),
                }),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn set_format(&self, format: &StreamFormat) {
        let mut output = self.shared.output.lock().unwrap_or_else(|p| p.into_inner());
        output.frames.resize_all(format.output_len());
        output.format = Some(format.clone());
    }

    /// Called from the capture thread only.
    pub fn sample(&self, view: FrameView<'_>) {
        let shared = &self.shared;
        shared.delivery.record_sample();

        if !shared.running.load(Ordering::Acquire) {
            shared.delivery.record_drop(view.sequence);
            return;
        }

        let index = shared.in_index.load(Ordering::Relaxed);
        let mut slot = match shared.inputs[index].try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::WouldBlock) => {
                shared.delivery.record_drop(view.sequence);
                return;
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                if !shared.poisoned.swap(true, Ordering::Relaxed) {
                    warn!(index, "input slot poisoned by a decode panic, reusing it");
                }
                poisoned.into_inner()
            }
        };
        let published = shared.published.load(Ordering::Relaxed) + 1;
        slot.bytes.clear();
        slot.bytes.extend_from_slice(view.data);
        slot.published = published;
        slot.sequence = view.sequence;
        drop(slot);

        shared.out_index.store(index, Ordering::Release);
        shared.published.store(published, Ordering::Release);
        shared.in_index.store((index + 1) % SLOTS, Ordering::Relaxed);
    }

    pub fn start(&self) -> Result<(), CaptureError> {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("iris-pingpong".into())
            .spawn(move || run(&shared))
            .map_err(|source| {
                self.shared.running.store(false, Ordering::Release);
                CaptureError::Thread {
                    name: "decode",
                    source,
                }
            })?;
        *handle = Some(spawned);
        info!("ping-pong decoder started");
        Ok(())
    }

    pub fn stop(&self) {
        let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        if handle.join().is_err() {
            warn!("ping-pong decode thread panicked");
        }
        info!("ping-pong decoder stopped");
    }

    pub fn output_capacity(&self) -> usize {
        self.shared.output
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .frames
            .slot_capacity()
    }

    pub(crate) fn delivery(&self) -> &Delivery {
        &self.shared.delivery
    }
}

fn run(shared: &Shared) {
    let backoff = Backoff::new();
    let mut last = shared.published.load(Ordering::Acquire);

    while shared.running.load(Ordering::Acquire) {
        if shared.published.load(Ordering::Acquire) == last {
            backoff.snooze();
            continue;
        }
        backoff.reset();

        let index = shared.out_index.load(Ordering::Acquire);
        let slot = shared.inputs[index].lock().unwrap_or_else(|p| p.into_inner());
        if slot.published <= last {
            continue;
        }
        last = slot.published;

        let mut output = shared.output.lock().unwrap_or_else(|p| p.into_inner());
        let Output { format, frames } = &mut *output;
        match format.as_ref() {
            Some(format) => shared.delivery.process(format, &slot.bytes, frames.next_slot()),
            None => {
                debug!(sequence = slot.sequence, "no format set, sample ignored");
                shared.delivery.record_drop(slot.sequence);
            }
        }
    }

    debug!("ping-pong decode thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::pipeline::{DecodeMode, Decoder, FrameSink};
    use std::time::{Duration, Instant};

    #[test]
    fn each_sample_is_decoded_at_most_once_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let decoder = Decoder::new(
            DecodeMode::PingPong,
            FrameSink::new(move |frame| {
                // first pixel's blue channel encodes the sample number
                log.lock().unwrap().push(frame.pixels[0]);
            }),
        );
        decoder.set_format(&StreamFormat {
            width: 2,
            height: 1,
            pixel_format: PixelFormat::Yuyv,
        });
        decoder.start().unwrap();

        for n in 0..50u32 {
            // luma 16 + n * 4 -> distinct gray levels
            let y = 16 + (n as u8) * 4;
            decoder.sample(FrameView {
                index: n % 8,
                sequence: n,
                data: &[y, 128, y, 128],
            });
            thread::sleep(Duration::from_millis(1));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while decoder.stats().decoded == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        decoder.stop();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "reordered or repeated: {seen:?}");
        assert!(seen.len() as u64 <= decoder.stats().samples);
    }

    #[test]
    fn samples_before_start_are_dropped() {
        let decoder = Decoder::new(DecodeMode::PingPong, FrameSink::noop());
        decoder.sample(FrameView {
            index: 0,
            sequence: 0,
            data: &[0; 4],
        });
        assert_eq!(decoder.stats().dropped, 1);
        decoder.stop();
    }

    #[test]
    fn slot_poisoned_by_a_panicking_consumer_is_reused() {
        let panicked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&panicked);
        let decoder = Decoder::new(
            DecodeMode::PingPong,
            FrameSink::new(move |_| {
                flag.store(true, Ordering::SeqCst);
                panic!("consumer failure");
            }),
        );
        decoder.set_format(&StreamFormat {
            width: 2,
            height: 1,
            pixel_format: PixelFormat::Yuyv,
        });
        decoder.start().unwrap();

        let data = [16u8, 128, 16, 128];
        decoder.sample(FrameView {
            index: 0,
            sequence: 0,
            data: &data,
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while !panicked.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(panicked.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(20));

        // wrap around to the slot the decode thread held when it panicked
        for sequence in 1..=SLOTS as u32 {
            decoder.sample(FrameView {
                index: sequence % 8,
                sequence,
                data: &data,
            });
        }
        decoder.stop();

        let stats = decoder.stats();
        assert_eq!(stats.samples, SLOTS as u64 + 1);
        assert_eq!(stats.dropped, 0);
    }
}
