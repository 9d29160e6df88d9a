//! Descriptor and address/offset exchange protocols.
//!
//! Ordering is the contract here: the export strictly precedes the
//! importer's receive, and the importer's acknowledgment strictly
//! precedes any reuse of the descriptor by the exporter. The address
//! and the length travel in separate round trips so each half can be
//! validated and acknowledged on its own.

use log::{debug, info};

use crate::channel::{Endpoint, MAX_MSG_SIZE};
use crate::device::Device;
use crate::error::{Result, TransferError};
use crate::handshake;
use crate::region::{ExportDescriptor, MemoryRegion};

/// Exporter side of the descriptor exchange: export `region`, ship the
/// descriptor and wait for the importer's acknowledgment. The region
/// counts as published only once this returns.
pub fn publish_region(ch: &mut Endpoint, region: &MemoryRegion, device: &Device) -> Result<()> {
    let desc = region.export(device)?;
    ch.send_to(&desc.to_bytes())?;
    handshake::wait_for_success(ch)?;
    debug!("descriptor acknowledged by importer");
    Ok(())
}

/// Importer side: receive a descriptor and reconstruct a remote region
/// from it. Failures are acknowledged to the exporter before this
/// returns so both sides abort at the same step.
pub fn receive_region(ch: &mut Endpoint, device: &Device) -> Result<MemoryRegion> {
    let mut buf = [0_u8; MAX_MSG_SIZE];
    let len = ch.recv_from(&mut buf)?;
    let Some(desc) = ExportDescriptor::from_bytes(&buf[..len]) else {
        return fail_and_return(ch, TransferError::Decode("malformed export descriptor"));
    };
    match MemoryRegion::import(device, &desc) {
        Ok(region) => {
            handshake::send_success(ch)?;
            Ok(region)
        }
        Err(error) => fail_and_return(ch, error),
    }
}

/// Exporter side of the address/offset exchange: the 64-bit base
/// address of the range to operate on, then its 64-bit length, each
/// acknowledged before the next step proceeds.
pub fn send_range(ch: &mut Endpoint, region: &MemoryRegion) -> Result<()> {
    ch.send_to(&region.base_addr().to_le_bytes())?;
    handshake::wait_for_success(ch)?;
    ch.send_to(&(region.len() as u64).to_le_bytes())?;
    handshake::wait_for_success(ch)?;
    info!("address and length sent, waiting for the transfer to finish");
    Ok(())
}

/// Importer side: receive and validate the two values, acknowledging
/// each. An out-of-range value is a hard error, rejected with a
/// failure acknowledgment before any transfer is attempted.
pub fn recv_range(ch: &mut Endpoint, region: &mut MemoryRegion) -> Result<()> {
    info!("waiting for peer to send address and length");
    let addr = match recv_u64(ch) {
        Ok(addr) => addr,
        Err(error) => return fail_and_return(ch, error),
    };
    if usize::try_from(addr).is_err() {
        return fail_and_return(ch, TransferError::AddressOutOfRange { value: addr });
    }
    handshake::send_success(ch)?;

    let len = match recv_u64(ch) {
        Ok(len) => len,
        Err(error) => return fail_and_return(ch, error),
    };
    if usize::try_from(len).is_err() {
        return fail_and_return(ch, TransferError::AddressOutOfRange { value: len });
    }
    if let Err(error) = region.set_range(addr, len) {
        return fail_and_return(ch, error);
    }
    debug!("operative range set: addr={addr:#x}, len={len}");
    handshake::send_success(ch)?;
    Ok(())
}

fn recv_u64(ch: &mut Endpoint) -> Result<u64> {
    let mut buf = [0_u8; 8];
    let len = ch.recv_from(&mut buf)?;
    if len != buf.len() {
        return Err(TransferError::Decode("expected an 8-byte value"));
    }
    Ok(u64::from_le_bytes(buf))
}

fn fail_and_return<T>(ch: &mut Endpoint, error: TransferError) -> Result<T> {
    // Best effort: the peer may already be gone on this path.
    let _ = handshake::send_failure(ch);
    Err(error)
}
