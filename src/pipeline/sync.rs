//! Inline decoding on the capture thread

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::capture::frame::{FrameView, StreamFormat};
use crate::pipeline::pool::FramePool;
use crate::pipeline::Delivery;

const OUTPUT_SLOTS: usize = 4;

struct Output {
    format: Option<StreamFormat>,
    frames: FramePool,
}

/// Decodes each sample before `sample` returns. A slow decode delays the
/// next dequeue.
pub struct SyncDecoder {
    delivery: Arc<Delivery>,
    // Only contended while the format changes.
    output: Mutex<Output>,
}

impl SyncDecoder {
    pub(crate) fn new(delivery: Arc<Delivery>) -> Self {
        Self {
            delivery,
            output: Mutex::new(Output {
                format: None,
                frames: FramePool::new(OUTPUT_SLOTS),
            }),
        }
    }

    pub fn set_format(&self, format: &StreamFormat) {
        let mut output = self.output.lock().unwrap_or_else(|p| p.into_inner());
        output.frames.resize_all(format.output_len());
        output.format = Some(format.clone());
    }

    pub fn sample(&self, view: FrameView<'_>) {
        self.delivery.record_sample();

        let mut output = self.output.lock().unwrap_or_else(|p| p.into_inner());
        let Output { format, frames } = &mut *output;
        let Some(format) = format.as_ref() else {
            trace!(sequence = view.sequence, "no format set, sample ignored");
            self.delivery.record_drop(view.sequence);
            return;
        };
        self.delivery.process(format, view.data, frames.next_slot());
    }

    pub fn output_capacity(&self) -> usize {
        self.output
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .frames
            .slot_capacity()
    }

    pub(crate) fn delivery(&self) -> &Delivery {
        &self.delivery
    }
}
