//! Transfer buffer ring
//!
//! A fixed pool of GPU pack buffers used to pipeline readback: each transfer consumes the
//! read issued on the previous call and issues a new one, so the render thread never waits
//! on a read it queued in the same frame.
//!
//! Each entry guards the buffer (and with it the mapped memory) and its status with two
//! separate locks. Access goes through [`PboEntry::with_data`] and [`PboEntry::with_state`];
//! the state lock is only reachable from inside the data scope, never the other way round,
//! so the lock order is always data then state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::convert::ConversionPlan;
use crate::error::DeviceError;
use crate::gpu::{FramebufferId, MapOutcome, PackBuffer, ReadbackGpu};
use crate::{loge, logi, logw};

const SLOW_LOCK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PboState {
    /// Mapped for reading; conversion in progress.
    Mapped,
    /// A read into the buffer has been queued and not yet consumed.
    Transferring,
    /// Unmap failed; must be unmapped before the buffer is written or deleted.
    NeedsUnmap,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PboStatus {
    pub state: PboState,
    /// Framebuffer whose readback hold this entry carries. Cleared once the copy is consumed.
    pub fbo: Option<FramebufferId>,
}

fn timed_lock<'a, T>(m: &'a Mutex<T>, what: &str, buffer: PackBuffer) -> MutexGuard<'a, T> {
    match m.try_lock() {
        Ok(g) => return g,
        Err(TryLockError::Poisoned(e)) => return e.into_inner(),
        Err(TryLockError::WouldBlock) => {}
    }
    let t0 = Instant::now();
    let g = m.lock().unwrap_or_else(|e| e.into_inner());
    let waited = t0.elapsed();
    if waited > SLOW_LOCK {
        logw!("RING", "waited {:.2} ms for {what} lock of pbo {}", waited.as_secs_f64() * 1000.0, buffer.0);
    }
    g
}

/// State access handed to a data scope.
pub struct StateAccess<'a> {
    entry: &'a PboEntry,
}

impl StateAccess<'_> {
    pub fn with<R>(&self, f: impl FnOnce(&mut PboStatus) -> R) -> R {
        let mut g = timed_lock(&self.entry.status, "state", self.entry.buffer);
        f(&mut g)
    }
}

#[derive(Debug)]
pub struct PboEntry {
    buffer: PackBuffer,
    data: Mutex<()>,
    status: Mutex<PboStatus>,
}

impl PboEntry {
    fn new(buffer: PackBuffer) -> Self {
        Self {
            buffer,
            data: Mutex::new(()),
            status: Mutex::new(PboStatus { state: PboState::Ready, fbo: None }),
        }
    }

    pub fn buffer(&self) -> PackBuffer {
        self.buffer
    }

    /// Exclusive access to the buffer and its mapped memory.
    pub fn with_data<R>(&self, f: impl FnOnce(PackBuffer, &StateAccess<'_>) -> R) -> R {
        let _g = timed_lock(&self.data, "data", self.buffer);
        f(self.buffer, &StateAccess { entry: self })
    }

    /// State-only access. Does not wait for a conversion holding the data lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut PboStatus) -> R) -> R {
        let mut g = timed_lock(&self.status, "state", self.buffer);
        f(&mut g)
    }

    pub fn status(&self) -> PboStatus {
        self.with_state(|s| *s)
    }

    /// Map the completed read, convert it into `out`, unmap and release the framebuffer hold.
    fn consume<G: ReadbackGpu>(&self, gpu: &mut G, plan: &ConversionPlan, out: &mut [u8]) -> bool {
        self.with_data(|buffer, state| {
            let fbo = state.with(|s| {
                s.state = PboState::Mapped;
                s.fbo
            });

            let mut visit = |src: &[u8]| plan.apply(src, out);
            let outcome = gpu.map_pack_buffer(buffer, plan.readback_bytes(), &mut visit);

            state.with(|s| {
                s.state = if outcome == MapOutcome::UnmapFailed { PboState::NeedsUnmap } else { PboState::Ready };
                s.fbo = None;
            });
            if let Some(fbo) = fbo {
                gpu.end_readback(fbo);
            }

            match outcome {
                MapOutcome::Unmapped => true,
                MapOutcome::UnmapFailed => {
                    logw!("RING", "unmap of pbo {} failed; will retry before reuse", buffer.0);
                    true
                }
                MapOutcome::MapFailed => {
                    logw!("RING", "map of pbo {} failed; frame contribution dropped", buffer.0);
                    false
                }
            }
        })
    }

    /// Queue an asynchronous read of `fbo` into this buffer.
    fn issue<G: ReadbackGpu>(&self, gpu: &mut G, fbo: FramebufferId, plan: &ConversionPlan) -> bool {
        self.with_data(|buffer, state| {
            let current = state.with(|s| s.state);
            if matches!(current, PboState::NeedsUnmap | PboState::Mapped) {
                if !gpu.unmap_pack_buffer(buffer) {
                    loge!("RING", "pbo {} is still mapped; read skipped", buffer.0);
                    return false;
                }
                state.with(|s| s.state = PboState::Ready);
            }

            match gpu.read_to_pack_buffer(buffer, plan.width, plan.height, plan.readback) {
                Ok(()) => {
                    state.with(|s| {
                        s.state = PboState::Transferring;
                        s.fbo = Some(fbo);
                    });
                    true
                }
                Err(e) => {
                    loge!("RING", "{e}");
                    false
                }
            }
        })
    }
}

/// What one pipelined transfer produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The previous read was converted into the output slot.
    Converted,
    /// First call after `bind`: nothing was pending, a first read was queued.
    Primed,
    /// Nothing usable this call. A read may still have been queued for the next one.
    Skipped,
}

#[derive(Debug, Default)]
pub struct PboRing {
    entries: Vec<Arc<PboEntry>>,
    order: VecDeque<usize>,
    // Shared by every channel: the read queued by the most recent call, whichever channel
    // issued it.
    pending: Option<usize>,
    // Set by `bind`, cleared by the first transfer. Only that transfer may prime.
    fresh: bool,
    verbose: bool,
}

impl PboRing {
    pub fn new(verbose: bool) -> Self {
        Self { verbose, ..Self::default() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate `count` buffers of `bytes` each, all `Ready`.
    ///
    /// A buffer that fails to allocate ends the loop; the ones already created stay in the
    /// ring and the error is returned.
    pub fn bind<G: ReadbackGpu>(&mut self, gpu: &mut G, count: usize, bytes: usize) -> Result<(), DeviceError> {
        if !self.is_empty() {
            self.unbind(gpu);
        }
        for _ in 0..count {
            let buffer = gpu.create_pack_buffer(bytes)?;
            self.order.push_back(self.entries.len());
            self.entries.push(Arc::new(PboEntry::new(buffer)));
        }
        self.fresh = true;
        if self.verbose {
            logi!("RING", "bound {} pbos of {} bytes", self.entries.len(), bytes);
        }
        Ok(())
    }

    /// Unmap what is still mapped, drop outstanding framebuffer holds, delete every buffer.
    /// Does nothing on a ring that was never bound.
    pub fn unbind<G: ReadbackGpu>(&mut self, gpu: &mut G) {
        for entry in self.entries.drain(..) {
            entry.with_data(|buffer, state| {
                let status = state.with(|s| *s);
                if matches!(status.state, PboState::NeedsUnmap | PboState::Mapped) && !gpu.unmap_pack_buffer(buffer) {
                    logw!("RING", "pbo {} could not be unmapped before delete", buffer.0);
                }
                if let Some(fbo) = status.fbo {
                    gpu.end_readback(fbo);
                }
                gpu.delete_pack_buffer(buffer);
                state.with(|s| *s = PboStatus { state: PboState::Ready, fbo: None });
            });
        }
        self.order.clear();
        self.pending = None;
        self.fresh = false;
    }

    /// Steps after the source framebuffer has been bound for readback (and its hold taken):
    /// convert the pending read into `out`, then queue a read of `fbo` into the next buffer.
    ///
    /// The hold on `fbo` moves to the buffer that read it and is released when that read is
    /// consumed, or right away if no read could be queued.
    ///
    /// Only the first call after `bind` reports `Primed`. A later call with nothing pending
    /// (the previous read failed to queue) reports `Skipped`, so the caller never resends an
    /// older frame; it still queues a read so the next call converts again.
    pub fn transfer<G: ReadbackGpu>(
        &mut self,
        gpu: &mut G,
        fbo: FramebufferId,
        plan: &ConversionPlan,
        out: &mut [u8],
    ) -> TransferOutcome {
        let fresh = std::mem::take(&mut self.fresh);
        let mut outcome = match self.pending.take() {
            Some(prev) => {
                if self.entries[prev].consume(gpu, plan, out) {
                    TransferOutcome::Converted
                } else {
                    TransferOutcome::Skipped
                }
            }
            None if fresh => TransferOutcome::Primed,
            None => {
                logw!("RING", "no read in flight; frame skipped");
                TransferOutcome::Skipped
            }
        };

        let Some(next) = self.order.pop_front() else {
            loge!("RING", "transfer buffer ring is empty; frame skipped");
            gpu.end_readback(fbo);
            return TransferOutcome::Skipped;
        };
        self.order.push_back(next);

        if self.entries[next].issue(gpu, fbo, plan) {
            self.pending = Some(next);
            if self.verbose {
                logi!("RING", "queued read of fbo {} into pbo {}", fbo.0, self.entries[next].buffer().0);
            }
        } else {
            gpu.end_readback(fbo);
            if outcome == TransferOutcome::Primed {
                outcome = TransferOutcome::Skipped;
            }
        }
        outcome
    }

    pub fn states(&self) -> Vec<PboStatus> {
        self.entries.iter().map(|e| e.status()).collect()
    }

    /// Entry indices, front first.
    pub fn order(&self) -> Vec<usize> {
        self.order.iter().copied().collect()
    }

    pub fn pending(&self) -> Option<usize> {
        self.pending
    }

    /// Shared handles to the entries, for status queries from other threads.
    pub fn entries(&self) -> Vec<Arc<PboEntry>> {
        self.entries.clone()
    }
}

/// One CPU-side frame buffer.
#[derive(Debug)]
pub struct FrameSlot {
    pub id: usize,
    pub data: Vec<u8>,
}

/// Fixed-capacity FIFO of frame slots; `rotate` moves the front slot to the back.
#[derive(Debug, Default)]
pub struct FrameQueue {
    slots: VecDeque<FrameSlot>,
}

impl FrameQueue {
    pub fn allocate(count: usize, bytes: usize) -> Self {
        Self { slots: (0..count).map(|id| FrameSlot { id, data: vec![0; bytes] }).collect() }
    }

    /// `count` slots, each starting as a copy of `blank`.
    pub fn filled(count: usize, blank: &[u8]) -> Self {
        Self { slots: (0..count).map(|id| FrameSlot { id, data: blank.to_vec() }).collect() }
    }

    /// Rotate once and return the slot now at the back.
    pub fn rotate(&mut self) -> Option<&mut FrameSlot> {
        let slot = self.slots.pop_front()?;
        self.slots.push_back(slot);
        self.slots.back_mut()
    }

    /// Undo one `rotate`: the back slot goes to the front again.
    pub fn unrotate(&mut self) {
        if let Some(slot) = self.slots.pop_back() {
            self.slots.push_front(slot);
        }
    }

    pub fn back(&self) -> Option<&FrameSlot> {
        self.slots.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut FrameSlot> {
        self.slots.back_mut()
    }

    pub fn ids(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
