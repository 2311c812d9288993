//! PCM substream attachment.
//!
//! The engine does not register a sound card; it moves samples between
//! packets and a [`PcmSubstream`], the ring a PCM front end would map
//! for the user. Samples are stored as 32-bit words (24-bit audio in
//! the upper bits for S32, plain 16-bit values for S16) behind relaxed
//! atomics so the callback domain and the user side can touch disjoint
//! regions without locks.

use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
};

use fwa_core::SharedSlot;

/// PCM sample formats the engine transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit, shifted into the AM824 24-bit field on the wire.
    S16,
    /// Signed 32-bit with 24 significant bits in the upper bytes.
    S32,
}

/// Runtime state of an attached substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Running,
    /// Overrun/underrun; the stream stopped feeding this substream.
    Xrun,
}

/// One direction's PCM ring.
pub struct PcmSubstream {
    format: SampleFormat,
    channels: usize,
    buffer_size: usize,
    period_size: usize,
    samples: Box<[AtomicU32]>,
    state: AtomicU8,
    elapsed: Option<Box<dyn Fn() + Send + Sync>>,
}

impl PcmSubstream {
    /// Allocate a ring of `buffer_size` frames of `channels` samples.
    pub fn new(format: SampleFormat, channels: usize, buffer_size: usize, period_size: usize) -> Arc<Self> {
        Self::build(format, channels, buffer_size, period_size, None)
    }

    /// Like [`PcmSubstream::new`], with a period-elapsed callback the
    /// engine invokes (from its dispatch thread) each time the hardware
    /// pointer crosses a period boundary.
    pub fn with_elapsed(
        format: SampleFormat,
        channels: usize,
        buffer_size: usize,
        period_size: usize,
        elapsed: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(format, channels, buffer_size, period_size, Some(Box::new(elapsed)))
    }

    fn build(
        format: SampleFormat,
        channels: usize,
        buffer_size: usize,
        period_size: usize,
        elapsed: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Arc<Self> {
        let samples = (0..buffer_size * channels).map(|_| AtomicU32::new(0)).collect();
        Arc::new(Self {
            format,
            channels,
            buffer_size,
            period_size,
            samples,
            state: AtomicU8::new(PcmState::Running as u8),
            elapsed,
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Ring capacity in frames.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Period length in frames.
    pub fn period_size(&self) -> usize {
        self.period_size
    }

    pub fn state(&self) -> PcmState {
        if self.state.load(Ordering::Acquire) == PcmState::Running as u8 {
            PcmState::Running
        } else {
            PcmState::Xrun
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PcmState::Running
    }

    /// Drop the substream into the XRUN state.
    ///
    /// The engine stops moving samples for it; a subsequent prepare is
    /// needed before it can run again.
    pub fn abort(&self) {
        self.state.store(PcmState::Xrun as u8, Ordering::Release);
    }

    /// Return to the running state after an XRUN.
    pub fn prepare(&self) {
        self.state.store(PcmState::Running as u8, Ordering::Release);
    }

    /// Store interleaved frames starting at `start_frame`, wrapping at
    /// the ring end. User-side producer for transmit streams.
    pub fn write_frames(&self, start_frame: usize, interleaved: &[i32]) {
        let mut index = (start_frame % self.buffer_size) * self.channels;
        for &sample in interleaved {
            self.samples[index].store(sample as u32, Ordering::Relaxed);
            index += 1;
            if index == self.samples.len() {
                index = 0;
            }
        }
    }

    /// Load interleaved frames starting at `start_frame`, wrapping at
    /// the ring end. User-side consumer for receive streams.
    pub fn read_frames(&self, start_frame: usize, interleaved: &mut [i32]) {
        let mut index = (start_frame % self.buffer_size) * self.channels;
        for slot in interleaved {
            *slot = self.samples[index].load(Ordering::Relaxed) as i32;
            index += 1;
            if index == self.samples.len() {
                index = 0;
            }
        }
    }

    #[inline]
    pub(crate) fn sample(&self, frame: usize, channel: usize) -> i32 {
        self.samples[(frame % self.buffer_size) * self.channels + channel].load(Ordering::Relaxed) as i32
    }

    #[inline]
    pub(crate) fn store_sample(&self, frame: usize, channel: usize, value: i32) {
        self.samples[(frame % self.buffer_size) * self.channels + channel].store(value as u32, Ordering::Relaxed);
    }

    pub(crate) fn notify_elapsed(&self) {
        if let Some(elapsed) = &self.elapsed {
            elapsed();
        }
    }
}

/// Deferred period-elapsed notification.
///
/// The callback domain only flags that a period boundary passed; a
/// dedicated thread delivers the notification so the callback never
/// runs user code. `kill` cancels anything flagged but not yet
/// delivered, which stop and prepare both rely on.
pub(crate) struct PeriodDispatcher {
    inner: Arc<DispatcherInner>,
    worker: Option<JoinHandle<()>>,
}

struct DispatcherInner {
    pcm: Arc<SharedSlot<PcmSubstream>>,
    state: Mutex<DispatcherState>,
    cond: Condvar,
}

#[derive(Default)]
struct DispatcherState {
    pending: bool,
    quit: bool,
}

impl PeriodDispatcher {
    pub(crate) fn new(pcm: Arc<SharedSlot<PcmSubstream>>) -> Self {
        let inner = Arc::new(DispatcherInner {
            pcm,
            state: Mutex::new(DispatcherState::default()),
            cond: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("fwa-period".into())
            .spawn(move || thread_inner.run())
            .ok();

        Self { inner, worker }
    }

    /// Flag a period boundary. Callable from the callback domain.
    pub(crate) fn schedule(&self) {
        let mut state = self.inner.lock();
        state.pending = true;
        self.inner.cond.notify_one();
    }

    /// Cancel any flagged, undelivered notification.
    pub(crate) fn kill(&self) {
        self.inner.lock().pending = false;
    }
}

impl DispatcherInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self) {
        loop {
            {
                let mut state = self.lock();
                while !state.pending && !state.quit {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if state.quit {
                    return;
                }
                state.pending = false;
            }
            if let Some(pcm) = self.pcm.get() {
                pcm.notify_elapsed();
            }
        }
    }
}

impl Drop for PeriodDispatcher {
    fn drop(&mut self) {
        self.inner.lock().quit = true;
        self.inner.cond.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
