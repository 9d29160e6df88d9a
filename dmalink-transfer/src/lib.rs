mod channel;
mod device;
mod engine;
mod error;
mod exchange;
mod handshake;
mod logging;
mod orchestrator;
mod region;
mod retry;

pub use channel::{Endpoint, PeerAddress, MAX_MSG_SIZE};
pub use device::{Capability, Device, DeviceRep, PciAddress};
pub use engine::{BufferHandle, BufferPool, CompletionEvent, CopyEngine, JobStatus, WORKQ_DEPTH};
pub use error::{Result, TransferError};
pub use exchange::{publish_region, receive_region, recv_range, send_range};
pub use handshake::{send_failure, send_success, wait_for_success};
pub use orchestrator::{JobState, Orchestrator, PendingJob, Session};
pub use region::{ExportDescriptor, MemoryRegion, Ownership};

pub fn init_logging() {
    logging::ensure_initialized();
}
