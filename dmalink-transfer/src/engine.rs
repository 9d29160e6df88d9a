//! The copy offload engine boundary: a bounded work queue drained by a
//! dedicated worker, with completions retrieved through non-blocking
//! polls. Retrieving an event and the job succeeding are separate
//! outcomes; callers check both, in that order.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::device::Device;
use crate::error::{Result, TransferError};
use crate::region::MemoryRegion;

/// Depth of the engine's work queue.
pub const WORKQ_DEPTH: usize = 32;

/// Number of buffer handles the inventory hands out.
const INVENTORY_ELEMENTS: usize = 2;

/// Offload-visible view of a region's operative range, acquired once
/// per session and reused across all jobs in it.
#[derive(Debug)]
pub struct BufferHandle {
    addr: usize,
    len: usize,
}

impl BufferHandle {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-size inventory of buffer handles; the engine addresses
/// buffers through handles, never through raw regions.
pub struct BufferPool {
    available: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            available: INVENTORY_ELEMENTS,
        }
    }

    pub fn acquire(&mut self, region: &MemoryRegion) -> Result<BufferHandle> {
        if self.available == 0 {
            return Err(TransferError::InventoryExhausted);
        }
        let (addr, len) = region.operative()?;
        self.available -= 1;
        Ok(BufferHandle { addr, len })
    }

    pub fn release(&mut self, handle: BufferHandle) {
        debug_assert!(self.available < INVENTORY_ELEMENTS);
        self.available += 1;
        drop(handle);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Result code carried by a completion event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed(String),
}

/// Terminal outcome of exactly one submitted job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionEvent {
    pub job_id: u64,
    pub status: JobStatus,
}

impl CompletionEvent {
    /// Classify the event's own result code.
    pub fn into_result(self) -> Result<u64> {
        match self.status {
            JobStatus::Success => Ok(self.job_id),
            JobStatus::Failed(reason) => Err(TransferError::Engine(reason)),
        }
    }
}

struct CopyJob {
    job_id: u64,
    src: usize,
    dst: usize,
    len: usize,
}

pub struct CopyEngine {
    _device: Arc<Device>,
    submit_tx: Option<SyncSender<CopyJob>>,
    done_rx: Receiver<CompletionEvent>,
    worker: Option<JoinHandle<()>>,
    next_job_id: u64,
}

impl CopyEngine {
    /// Create the engine on an opened device and start its worker.
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let (submit_tx, submit_rx) = mpsc::sync_channel::<CopyJob>(WORKQ_DEPTH);
        let (done_tx, done_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("dmalink-copyq".to_string())
            .spawn(move || {
                for job in submit_rx {
                    let status = execute(&job);
                    let event = CompletionEvent {
                        job_id: job.job_id,
                        status,
                    };
                    if done_tx.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|error| TransferError::Engine(format!("failed to start worker: {error}")))?;
        debug!("copy engine started on {}", device.address());
        Ok(Self {
            _device: device,
            submit_tx: Some(submit_tx),
            done_rx,
            worker: Some(worker),
            next_job_id: 0,
        })
    }

    /// Enqueue one copy job of `len` bytes and return its id. Returns
    /// immediately; a full queue is surfaced to the caller rather than
    /// retried here.
    pub fn submit(&mut self, src: &BufferHandle, dst: &BufferHandle, len: usize) -> Result<u64> {
        if len == 0 {
            return Err(TransferError::InvalidArgument(
                "copy length must be non-zero",
            ));
        }
        if len > src.len || len > dst.len {
            return Err(TransferError::InvalidArgument(
                "copy length exceeds a buffer handle",
            ));
        }
        let tx = self
            .submit_tx
            .as_ref()
            .ok_or_else(|| TransferError::Engine("engine is shut down".to_string()))?;
        let job_id = self.next_job_id + 1;
        let job = CopyJob {
            job_id,
            src: src.addr,
            dst: dst.addr,
            len,
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.next_job_id = job_id;
                Ok(job_id)
            }
            Err(TrySendError::Full(_)) => Err(TransferError::QueueFull),
            Err(TrySendError::Disconnected(_)) => {
                Err(TransferError::Engine("copy worker exited".to_string()))
            }
        }
    }

    /// Non-blocking completion retrieval. `None` means nothing is
    /// ready yet, a transient condition the caller retries.
    pub fn try_retrieve(&mut self) -> Result<Option<CompletionEvent>> {
        match self.done_rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(TransferError::Engine("copy worker exited".to_string()))
            }
        }
    }
}

impl Drop for CopyEngine {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain and exit.
        self.submit_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn execute(job: &CopyJob) -> JobStatus {
    if job.src == 0 || job.dst == 0 {
        return JobStatus::Failed("job references a null buffer".to_string());
    }
    // SAFETY: handles come from live regions whose mappings outlive the
    // session, and the length was checked against both handles at
    // submission. Ranges may overlap when a region copies onto itself.
    unsafe {
        std::ptr::copy(job.src as *const u8, job.dst as *mut u8, job.len);
    }
    JobStatus::Success
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::{BufferPool, CompletionEvent, CopyEngine, JobStatus};
    use crate::device::{Capability, Device};
    use crate::error::TransferError;
    use crate::region::MemoryRegion;

    fn wait_for_event(engine: &mut CopyEngine) -> CompletionEvent {
        loop {
            if let Some(event) = engine.try_retrieve().expect("retrieve") {
                return event;
            }
            thread::sleep(Duration::from_micros(10));
        }
    }

    #[test]
    fn copies_bytes_between_regions() {
        let device = Device::open_with_capability(Capability::DmaMemcpy).expect("device");
        let mut engine = CopyEngine::new(device).expect("engine");
        let mut pool = BufferPool::new();

        let mut src = MemoryRegion::alloc(256).expect("src");
        let dst = MemoryRegion::alloc(256).expect("dst");
        src.as_mut_slice().fill(7);

        let src_handle = pool.acquire(&src).expect("src handle");
        let dst_handle = pool.acquire(&dst).expect("dst handle");

        let job_id = engine.submit(&src_handle, &dst_handle, 256).expect("submit");
        let event = wait_for_event(&mut engine);
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.status, JobStatus::Success);
        assert_eq!(dst.as_slice(), src.as_slice());

        pool.release(src_handle);
        pool.release(dst_handle);
    }

    #[test]
    fn submit_validates_length_against_handles() {
        let device = Device::open_with_capability(Capability::DmaMemcpy).expect("device");
        let mut engine = CopyEngine::new(device).expect("engine");
        let mut pool = BufferPool::new();

        let src = MemoryRegion::alloc(64).expect("src");
        let dst = MemoryRegion::alloc(32).expect("dst");
        let src_handle = pool.acquire(&src).expect("src handle");
        let dst_handle = pool.acquire(&dst).expect("dst handle");

        assert!(matches!(
            engine.submit(&src_handle, &dst_handle, 64),
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.submit(&src_handle, &dst_handle, 0),
            Err(TransferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn inventory_is_bounded() {
        let mut pool = BufferPool::new();
        let first = MemoryRegion::alloc(16).expect("first");
        let second = MemoryRegion::alloc(16).expect("second");
        let third = MemoryRegion::alloc(16).expect("third");

        let a = pool.acquire(&first).expect("a");
        let b = pool.acquire(&second).expect("b");
        assert!(matches!(
            pool.acquire(&third),
            Err(TransferError::InventoryExhausted)
        ));

        pool.release(a);
        let c = pool.acquire(&third).expect("c after release");
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn failed_status_classifies_as_engine_error() {
        let event = CompletionEvent {
            job_id: 9,
            status: JobStatus::Failed("copy fault".to_string()),
        };
        assert!(matches!(
            event.into_result(),
            Err(TransferError::Engine(_))
        ));

        let event = CompletionEvent {
            job_id: 9,
            status: JobStatus::Success,
        };
        assert_eq!(event.into_result().expect("success"), 9);
    }
}
