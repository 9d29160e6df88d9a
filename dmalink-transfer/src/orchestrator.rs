//! Transfer orchestration: submit copy jobs to the engine and
//! busy-poll their completions.

use std::sync::Arc;

use log::debug;

use crate::device::Device;
use crate::engine::{BufferHandle, BufferPool, CompletionEvent, CopyEngine};
use crate::error::{Result, TransferError};
use crate::region::MemoryRegion;
use crate::retry::{busy_poll, Attempt};

/// Lifecycle of one submitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    Completed,
    Failed,
}

/// A submitted job awaiting its terminal event.
#[derive(Debug)]
pub struct PendingJob {
    job_id: u64,
    state: JobState,
}

impl PendingJob {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }
}

/// Buffer handles for one source/destination pairing, acquired once
/// and reused by every job in the session.
pub struct Session {
    src: BufferHandle,
    dst: BufferHandle,
}

pub struct Orchestrator {
    engine: CopyEngine,
    pool: BufferPool,
}

impl Orchestrator {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        Ok(Self {
            engine: CopyEngine::new(device)?,
            pool: BufferPool::new(),
        })
    }

    /// Acquire the two buffer handles for a transfer session. Handles
    /// are never re-acquired inside the copy loop.
    pub fn begin_session(&mut self, src: &MemoryRegion, dst: &MemoryRegion) -> Result<Session> {
        let src = self.pool.acquire(src)?;
        let dst = match self.pool.acquire(dst) {
            Ok(dst) => dst,
            Err(error) => {
                self.pool.release(src);
                return Err(error);
            }
        };
        Ok(Session { src, dst })
    }

    /// Hand one copy job to the engine. Returns without polling; a
    /// submission failure surfaces immediately.
    pub fn submit(&mut self, session: &Session, len: usize) -> Result<PendingJob> {
        let job_id = self.engine.submit(&session.src, &session.dst, len)?;
        Ok(PendingJob {
            job_id,
            state: JobState::Submitted,
        })
    }

    /// Busy-poll the completion queue until the job's terminal event
    /// arrives, then check the event's own result code. Dequeuing an
    /// event and the job succeeding are separate outcomes, checked in
    /// that order.
    pub fn await_completion(&mut self, mut job: PendingJob) -> Result<()> {
        job.state = JobState::Polling;
        let event: CompletionEvent = busy_poll(|| {
            Ok(match self.engine.try_retrieve()? {
                Some(event) => Attempt::Ready(event),
                None => Attempt::Pending,
            })
        })?;
        if event.job_id != job.job_id {
            job.state = JobState::Failed;
            return Err(TransferError::Engine(format!(
                "completion for job {} while awaiting job {}",
                event.job_id, job.job_id
            )));
        }
        match event.into_result() {
            Ok(_) => {
                job.state = JobState::Completed;
                debug!("job {} completed", job.job_id);
                Ok(())
            }
            Err(error) => {
                job.state = JobState::Failed;
                Err(error)
            }
        }
    }

    /// Submit one job and wait for it.
    pub fn copy(&mut self, session: &Session, len: usize) -> Result<()> {
        let job = self.submit(session, len)?;
        self.await_completion(job)
    }

    /// Release the session's buffer handles, exactly once per session.
    pub fn end_session(&mut self, session: Session) {
        self.pool.release(session.src);
        self.pool.release(session.dst);
    }
}

#[cfg(test)]
mod tests {
    use super::{JobState, Orchestrator};
    use crate::device::{Capability, Device};
    use crate::error::TransferError;
    use crate::region::MemoryRegion;

    fn orchestrator() -> Orchestrator {
        let device = Device::open_with_capability(Capability::DmaMemcpy).expect("device");
        Orchestrator::new(device).expect("orchestrator")
    }

    #[test]
    fn copy_moves_bytes_through_the_engine() {
        let mut orchestrator = orchestrator();
        let mut src = MemoryRegion::alloc(1024).expect("src");
        let dst = MemoryRegion::alloc(1024).expect("dst");
        for (i, byte) in src.as_mut_slice().iter_mut().enumerate() {
            *byte = (i % 31) as u8;
        }

        let session = orchestrator.begin_session(&src, &dst).expect("session");
        let job = orchestrator.submit(&session, 1024).expect("submit");
        assert_eq!(job.state(), JobState::Submitted);
        orchestrator.await_completion(job).expect("completion");
        assert_eq!(dst.as_slice(), src.as_slice());
        orchestrator.end_session(session);
    }

    #[test]
    fn session_handles_are_acquired_once_and_released_once() {
        let mut orchestrator = orchestrator();
        let src = MemoryRegion::alloc(64).expect("src");
        let dst = MemoryRegion::alloc(64).expect("dst");

        let session = orchestrator.begin_session(&src, &dst).expect("first session");
        // The inventory is exhausted while the session holds both handles.
        assert!(matches!(
            orchestrator.begin_session(&src, &dst),
            Err(TransferError::InventoryExhausted)
        ));
        orchestrator.end_session(session);
        let session = orchestrator.begin_session(&src, &dst).expect("after release");
        orchestrator.end_session(session);
    }

    #[test]
    fn sequential_jobs_accumulate_monotonic_bytes() {
        let mut orchestrator = orchestrator();
        let mut src = MemoryRegion::alloc(4096).expect("src");
        let dst = MemoryRegion::alloc(4096).expect("dst");
        src.as_mut_slice().fill(42);

        let session = orchestrator.begin_session(&src, &dst).expect("session");
        let mut total_bytes = 0_u64;
        for _ in 0..50 {
            let before = total_bytes;
            orchestrator.copy(&session, 4096).expect("copy");
            total_bytes += 4096;
            assert!(total_bytes > before);
        }
        assert_eq!(total_bytes, 50 * 4096);
        assert_eq!(dst.as_slice(), src.as_slice());
        orchestrator.end_session(session);
    }
}
