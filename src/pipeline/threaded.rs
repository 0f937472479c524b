//! One decode thread fed through a single shared scratch buffer

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capture::frame::{FrameView, StreamFormat};
use crate::error::CaptureError;
use crate::pipeline::pool::FramePool;
use crate::pipeline::Delivery;

const OUTPUT_SLOTS: usize = 4;
const STOP_WAIT: Duration = Duration::from_millis(500);

// Handshake between `sample` and the decode thread.
const IDLE: u8 = 0;
const ARMED: u8 = 1;
const FILLING: u8 = 2;
const READY: u8 = 3;
const PROCESSING: u8 = 4;
const TERMINATE: u8 = 5;

struct Scratch {
    bytes: Vec<u8>,
    sequence: u32,
}

struct Output {
    format: Option<StreamFormat>,
    frames: FramePool,
}

struct Shared {
    delivery: Arc<Delivery>,
    state: AtomicU8,
    scratch: Mutex<Scratch>,
    wake: Condvar,
    output: Mutex<Output>,
}

/// Decodes on a dedicated thread. `sample` copies the bytes and returns at
/// once; samples arriving while the thread is busy are dropped.
pub struct ThreadedDecoder {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedDecoder {
    pub(crate) fn new(delivery: Arc<Delivery>) -> Self {
        Self {
            shared: Arc::new(Shared {
                delivery,
                state: AtomicU8::new(IDLE),
                scratch: Mutex::new(Scratch {
                    bytes: Vec::new(),
                    sequence: 0,
                }),
                wake: Condvar::new(),
                output: Mutex::new(Output {
                    format: None,
                    frames: FramePool::new(OUTPUT_SLOTS),
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

    pub fn sample(&self, view: FrameView<'_>) {
        let shared = &self.shared;
        shared.delivery.record_sample();

        if shared
            .state
            .compare_exchange(ARMED, FILLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            shared.delivery.record_drop(view.sequence);
            return;
        }

        let mut scratch = shared.scratch.lock().unwrap_or_else(|p| p.into_inner());
        scratch.bytes.clear();
        scratch.bytes.extend_from_slice(view.data);
        scratch.sequence = view.sequence;
        // A concurrent stop wins over the hand-off.
        if shared
            .state
            .compare_exchange(FILLING, READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            shared.wake.notify_all();
        }
    }

    pub fn start(&self) -> Result<(), CaptureError> {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return Ok(());
        }

        self.shared.state.store(ARMED, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("iris-decode".into())
            .spawn(move || run(&shared))
            .map_err(|source| {
                self.shared.state.store(IDLE, Ordering::Release);
                CaptureError::Thread {
                    name: "decode",
                    source,
                }
            })?;
        *handle = Some(spawned);
        info!("async decoder started");
        Ok(())
    }

    /// Requests termination and waits, in bounded rounds, for the decode
    /// thread to acknowledge before joining it.
    pub fn stop(&self) {
        let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            return;
        };

        let shared = &self.shared;
        let mut scratch = shared.scratch.lock().unwrap_or_else(|p| p.into_inner());
        // A sample caught mid hand-off is never decoded.
        if matches!(shared.state.swap(TERMINATE, Ordering::AcqRel), FILLING | READY) {
            shared.delivery.record_drop(scratch.sequence);
        }
        let mut rounds = 0u32;
        while shared.state.load(Ordering::Acquire) != IDLE && !handle.is_finished() {
            shared.wake.notify_all();
            let (guard, timeout) = shared
                .wake
                .wait_timeout(scratch, STOP_WAIT)
                .unwrap_or_else(|p| p.into_inner());
            scratch = guard;
            if timeout.timed_out() {
                rounds += 1;
                warn!(rounds, "decode thread has not acknowledged stop yet");
            }
        }
        drop(scratch);

        if handle.join().is_err() {
            warn!("decode thread panicked");
        }
        shared.state.store(IDLE, Ordering::Release);
        info!("async decoder stopped");
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
    let mut pending = Vec::new();

    loop {
        let sequence = {
            let mut scratch = shared.scratch.lock().unwrap_or_else(|p| p.into_inner());
            loop {
                match shared.state.load(Ordering::Acquire) {
                    READY => break,
                    TERMINATE => {
                        shared.state.store(IDLE, Ordering::Release);
                        shared.wake.notify_all();
                        debug!("decode thread exiting");
                        return;
                    }
                    _ => {
                        scratch = shared
                            .wake
                            .wait_timeout(scratch, STOP_WAIT)
                            .unwrap_or_else(|p| p.into_inner())
                            .0;
                    }
                }
            }
            std::mem::swap(&mut scratch.bytes, &mut pending);
            // Fails only when stop was requested meanwhile.
            let _ = shared.state.compare_exchange(
                READY,
                PROCESSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            scratch.sequence
        };

        {
            let mut output = shared.output.lock().unwrap_or_else(|p| p.into_inner());
            let Output { format, frames } = &mut *output;
            match format.as_ref() {
                Some(format) => shared.delivery.process(format, &pending, frames.next_slot()),
                None => {
                    debug!(sequence, "no format set, sample ignored");
                    shared.delivery.record_drop(sequence);
                }
            }
        }

        let _ = shared
            .state
            .compare_exchange(PROCESSING, ARMED, Ordering::AcqRel, Ordering::Acquire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::pipeline::{DecodeMode, Decoder, FrameSink};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn yuyv(width: u32, height: u32) -> StreamFormat {
        StreamFormat {
            width,
            height,
            pixel_format: PixelFormat::Yuyv,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn delivers_on_decode_thread_and_drops_when_busy() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let decoder = Decoder::new(
            DecodeMode::Async,
            FrameSink::new(move |frame| {
                assert_eq!(frame.channels, 4);
                thread::sleep(Duration::from_millis(30));
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );
        decoder.set_format(&yuyv(4, 2));
        decoder.start().unwrap();

        let data = [128u8; 16];
        for sequence in 0..20 {
            decoder.sample(FrameView {
                index: 0,
                sequence,
                data: &data,
            });
            thread::sleep(Duration::from_millis(2));
        }

        assert!(wait_for(|| delivered.load(Ordering::Relaxed) >= 1));
        decoder.stop();

        let stats = decoder.stats();
        assert_eq!(stats.samples, 20);
        assert!(stats.dropped > 0);
        assert_eq!(stats.samples, stats.dropped + stats.decoded + stats.failed);
    }

    #[test]
    fn stop_is_idempotent_and_samples_after_stop_are_dropped() {
        let decoder = Decoder::new(DecodeMode::Async, FrameSink::noop());
        decoder.set_format(&yuyv(2, 1));
        decoder.start().unwrap();
        decoder.stop();
        decoder.stop();

        decoder.sample(FrameView {
            index: 0,
            sequence: 1,
            data: &[16, 128, 16, 128],
        });
        let stats = decoder.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.decoded, 0);
    }

    #[test]
    fn restart_after_stop() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let decoder = Decoder::new(
            DecodeMode::Async,
            FrameSink::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );
        decoder.set_format(&yuyv(2, 1));
        decoder.start().unwrap();
        decoder.stop();
        decoder.start().unwrap();

        let data = [16u8, 128, 16, 128];
        assert!(wait_for(|| {
            decoder.sample(FrameView {
                index: 0,
                sequence: 1,
                data: &data,
            });
            delivered.load(Ordering::Relaxed) > 0
        }));
        decoder.stop();
    }

    #[test]
    fn samples_without_a_format_are_counted_as_drops() {
        let decoder = Decoder::new(DecodeMode::Async, FrameSink::noop());
        decoder.start().unwrap();

        let data = [16u8, 128, 16, 128];
        decoder.sample(FrameView {
            index: 0,
            sequence: 1,
            data: &data,
        });
        assert!(wait_for(|| decoder.stats().dropped == 1));
        decoder.stop();

        let stats = decoder.stats();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.samples, stats.dropped + stats.decoded + stats.failed);
    }
}
