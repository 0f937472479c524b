//! Dedicated capture thread: wait, dequeue, sample, requeue

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::capture::buffers::BufferPool;
use crate::capture::driver::Readiness;
use crate::error::CaptureError;
use crate::pipeline::Decoder;

/// Backoff after a hard driver error
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Default wait for the device to become readable
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleState {
    Running = 0,
    Paused = 1,
    Terminated = 2,
}

impl SampleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SampleState::Running,
            1 => SampleState::Paused,
            _ => SampleState::Terminated,
        }
    }
}

/// Pause/resume/terminate signalling shared with the capture thread.
///
/// `Terminated` is final: no transition leaves it.
pub struct SampleControl {
    state: AtomicU8,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Default for SampleControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SampleState::Running as u8),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    pub fn state(&self) -> SampleState {
        SampleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SampleState, to: SampleState) -> bool {
        let changed = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if changed {
            let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
            self.wake.notify_all();
        }
        changed
    }

    /// Running -> Paused. Returns whether the state changed.
    pub fn pause(&self) -> bool {
        self.transition(SampleState::Running, SampleState::Paused)
    }

    /// Paused -> Running. Returns whether the state changed.
    pub fn resume(&self) -> bool {
        self.transition(SampleState::Paused, SampleState::Running)
    }

    pub fn terminate(&self) {
        self.state
            .store(SampleState::Terminated as u8, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.wake.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SampleState::Terminated
    }

    /// Blocks while paused. Returns `false` once terminated.
    fn wait_while_paused(&self) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match self.state() {
                SampleState::Running => return true,
                SampleState::Terminated => return false,
                SampleState::Paused => {
                    guard = self.wake.wait(guard).unwrap_or_else(|p| p.into_inner());
                }
            }
        }
    }
}

/// Capture loop settings
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub sample_timeout: Duration,
    /// Pin the capture thread to this core
    pub pin_core: Option<usize>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            sample_timeout: SAMPLE_TIMEOUT,
            pin_core: None,
        }
    }
}

/// Handle to the running capture thread.
///
/// The thread owns the buffer pool while it runs and hands it back from
/// [`CaptureLoop::join`], so the pool can be detached after the stream is
/// off and before the device is closed.
pub struct CaptureLoop {
    control: Arc<SampleControl>,
    handle: Option<JoinHandle<BufferPool>>,
}

impl CaptureLoop {
    pub fn spawn(
        pool: BufferPool,
        decoder: Arc<Decoder>,
        options: LoopOptions,
    ) -> Result<Self, CaptureError> {
        let control = Arc::new(SampleControl::new());
        let thread_control = Arc::clone(&control);

        let handle = thread::Builder::new()
            .name("iris-capture".into())
            .spawn(move || {
                if let Some(core) = options.pin_core {
                    pin_to_core(core);
                }
                run(&pool, &decoder, &thread_control, options.sample_timeout);
                pool
            })
            .map_err(|source| CaptureError::Thread {
                name: "capture",
                source,
            })?;

        info!("capture loop started");
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> SampleState {
        self.control.state()
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn terminate(&self) {
        self.control.terminate();
    }

    /// Terminates the loop if needed and waits for the thread, returning the
    /// buffer pool it owned. `None` if already joined or the thread panicked.
    pub fn join(&mut self) -> Option<BufferPool> {
        let handle = self.handle.take()?;
        self.control.terminate();
        match handle.join() {
            Ok(pool) => {
                info!("capture loop joined");
                Some(pool)
            }
            Err(_) => {
                error!("capture thread panicked");
                None
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.join();
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        debug!(core, "capture thread pinned");
    } else {
        warn!(core, "could not pin capture thread");
    }
}

fn run(pool: &BufferPool, decoder: &Decoder, control: &SampleControl, timeout: Duration) {
    let Some(driver) = pool.driver() else {
        error!("capture loop started without an attached pool");
        return;
    };

    loop {
        if !control.wait_while_paused() {
            break;
        }

        match driver.wait_readable(timeout) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::TimedOut) => {
                warn!(?timeout, "timed out waiting for a frame");
                continue;
            }
            Ok(Readiness::Interrupted) => continue,
            Err(err) => {
                error!(%err, "poll failed");
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }

        if control.is_terminated() {
            break;
        }

        let buffer = match pool.dequeue() {
            Ok(buffer) => buffer,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                error!(%err, "dequeue failed");
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        if control.state() == SampleState::Running {
            let view = buffer.view();
            trace!(index = view.index, sequence = view.sequence, len = view.data.len(), "sample");
            decoder.sample(view);
        }

        if let Err(err) = buffer.requeue() {
            error!(%err, "requeue failed");
        }
    }

    debug!("capture loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn terminated_is_final() {
        let control = SampleControl::new();
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.resume());
        control.terminate();
        assert!(!control.resume());
        assert!(!control.pause());
        assert_eq!(control.state(), SampleState::Terminated);
    }

    #[test]
    fn terminate_wakes_paused_waiter() {
        let control = Arc::new(SampleControl::new());
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        control.terminate();

        assert!(!waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn resume_wakes_paused_waiter() {
        let control = Arc::new(SampleControl::new());
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        control.resume();

        assert!(waiter.join().unwrap());
    }
}
