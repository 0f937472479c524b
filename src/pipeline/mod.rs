//! Sample decoding and delivery to the frame consumer
//!
//! A [`Decoder`] receives borrowed kernel buffers from the capture thread
//! and turns them into pixel frames under one of three strategies:
//!
//! - [`DecodeMode::Sync`] decodes inline on the capture thread.
//! - [`DecodeMode::Async`] hands the latest sample to one decode thread and
//!   drops samples that arrive while it is busy.
//! - [`DecodeMode::PingPong`] spins a decode thread over a ring of input
//!   slots for the lowest latency, at a continuous CPU cost.

pub mod convert;
pub mod pingpong;
pub mod pool;
pub mod sync;
pub mod threaded;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capture::frame::{FrameView, PixelFormat, StreamFormat};
use crate::error::CaptureError;

pub use pingpong::PingPongDecoder;
pub use pool::{FramePool, PixelFrame};
pub use sync::SyncDecoder;
pub use threaded::ThreadedDecoder;

/// A decoded frame as handed to the consumer.
///
/// `pixels` is borrowed from the decoder's output ring and is only valid
/// for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// 3 for RGB (rows padded to 4 bytes), 4 for ARGB
    pub channels: u32,
    pub pixels: &'a [u8],
}

/// Consumer callback for decoded frames
pub struct FrameSink(Box<dyn Fn(DecodedFrame<'_>) + Send + Sync>);

impl FrameSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(DecodedFrame<'_>) + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    /// A sink that discards every frame
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn deliver(&self, frame: DecodedFrame<'_>) {
        (self.0)(frame)
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameSink")
    }
}

/// Decoding strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    #[default]
    Sync,
    Async,
    PingPong,
}

impl DecodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeMode::Sync => "sync",
            DecodeMode::Async => "async",
            DecodeMode::PingPong => "pingpong",
        }
    }
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(DecodeMode::Sync),
            "async" => Ok(DecodeMode::Async),
            "pingpong" | "ping-pong" => Ok(DecodeMode::PingPong),
            other => Err(format!("unknown decode mode {other:?}")),
        }
    }
}

/// Snapshot of a decoder's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    /// Samples handed in by the capture thread
    pub samples: u64,
    /// Samples discarded because the decoder was busy
    pub dropped: u64,
    /// Frames delivered to the consumer
    pub decoded: u64,
    /// Samples that failed to decode
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    samples: AtomicU64,
    dropped: AtomicU64,
    decoded: AtomicU64,
    failed: AtomicU64,
}

/// State shared by every strategy: the swappable sink and the counters.
pub(crate) struct Delivery {
    mode: DecodeMode,
    sink: ArcSwap<FrameSink>,
    counters: CachePadded<Counters>,
}

impl Delivery {
    fn new(mode: DecodeMode, sink: FrameSink) -> Self {
        Self {
            mode,
            sink: ArcSwap::from_pointee(sink),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub(crate) fn record_sample(&self) {
        self.counters.samples.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_samples_total", "mode" => self.mode.as_str()).increment(1);
    }

    pub(crate) fn record_drop(&self, sequence: u32) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_frames_dropped_total", "mode" => self.mode.as_str()).increment(1);
        trace!(sequence, mode = %self.mode, "sample dropped");
    }

    /// Decodes `input` into `frame` and hands the result to the sink.
    /// Failures drop this frame only.
    pub(crate) fn process(&self, format: &StreamFormat, input: &[u8], frame: &mut PixelFrame) {
        if let PixelFormat::Other(name) = &format.pixel_format {
            trace!(format = %name, "no decoder for format, sample skipped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        frame.allocate(format.output_len());
        let started = Instant::now();
        if let Err(err) = convert::decode_into(format, input, frame.as_mut_slice()) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("iris_decode_errors_total", "mode" => self.mode.as_str())
                .increment(1);
            debug!(%err, len = input.len(), "decode failed");
            return;
        }
        metrics::histogram!("iris_decode_time_us").record(started.elapsed().as_micros() as f64);

        let sink = self.sink.load();
        sink.deliver(DecodedFrame {
            width: format.width,
            height: format.height,
            channels: format.pixel_format.channels(),
            pixels: frame.as_slice(),
        });
        self.counters.decoded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_frames_decoded_total", "mode" => self.mode.as_str()).increment(1);
    }

    fn replace_sink(&self, sink: FrameSink) {
        self.sink.store(Arc::new(sink));
    }

    fn stats(&self) -> DecoderStats {
        DecoderStats {
            samples: self.counters.samples.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            decoded: self.counters.decoded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// The active decoding strategy.
///
/// Every method takes `&self`: the capture thread calls `sample` while the
/// controlling thread drives the rest.
pub enum Decoder {
    Sync(SyncDecoder),
    Async(ThreadedDecoder),
    PingPong(PingPongDecoder),
}

impl Decoder {
    pub fn new(mode: DecodeMode, sink: FrameSink) -> Self {
        let delivery = Arc::new(Delivery::new(mode, sink));
        match mode {
            DecodeMode::Sync => Decoder::Sync(SyncDecoder::new(delivery)),
            DecodeMode::Async => Decoder::Async(ThreadedDecoder::new(delivery)),
            DecodeMode::PingPong => Decoder::PingPong(PingPongDecoder::new(delivery)),
        }
    }

    pub fn mode(&self) -> DecodeMode {
        match self {
            Decoder::Sync(_) => DecodeMode::Sync,
            Decoder::Async(_) => DecodeMode::Async,
            Decoder::PingPong(_) => DecodeMode::PingPong,
        }
    }

    /// Resizes every output slot for `format`.
    pub fn set_format(&self, format: &StreamFormat) {
        match self {
            Decoder::Sync(d) => d.set_format(format),
            Decoder::Async(d) => d.set_format(format),
            Decoder::PingPong(d) => d.set_format(format),
        }
    }

    /// Consumes one borrowed sample. Must not retain `view` past return.
    pub fn sample(&self, view: FrameView<'_>) {
        match self {
            Decoder::Sync(d) => d.sample(view),
            Decoder::Async(d) => d.sample(view),
            Decoder::PingPong(d) => d.sample(view),
        }
    }

    /// Starts the decode thread, if the strategy has one.
    pub fn start(&self) -> Result<(), CaptureError> {
        match self {
            Decoder::Sync(_) => Ok(()),
            Decoder::Async(d) => d.start(),
            Decoder::PingPong(d) => d.start(),
        }
    }

    /// Stops and joins the decode thread. Idempotent.
    pub fn stop(&self) {
        match self {
            Decoder::Sync(_) => {}
            Decoder::Async(d) => d.stop(),
            Decoder::PingPong(d) => d.stop(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.delivery().stats()
    }

    /// Bytes every output slot can hold without reallocating.
    pub fn output_capacity(&self) -> usize {
        match self {
            Decoder::Sync(d) => d.output_capacity(),
            Decoder::Async(d) => d.output_capacity(),
            Decoder::PingPong(d) => d.output_capacity(),
        }
    }

    /// Swaps the consumer without stopping the stream.
    pub fn replace_sink(&self, sink: FrameSink) {
        self.delivery().replace_sink(sink)
    }

    fn delivery(&self) -> &Delivery {
        match self {
            Decoder::Sync(d) => d.delivery(),
            Decoder::Async(d) => d.delivery(),
            Decoder::PingPong(d) => d.delivery(),
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.stop();
    }
}
