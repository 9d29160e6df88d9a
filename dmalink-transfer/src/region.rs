//! Memory regions and their export descriptors.
//!
//! A region pairs a buffer with its offload-visible mapping. Local
//! regions allocate and own the backing bytes; remote regions are
//! reconstructed from an imported descriptor and never free the peer's
//! bytes, only the local view. A remote region's operative pointer and
//! length stay unset until the address/offset exchange completes.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use shared_memory::{Shmem, ShmemConf};

use crate::channel::MAX_MSG_SIZE;
use crate::device::Device;
use crate::error::{Result, TransferError};

/// Who owns the backing bytes of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Local,
    Remote,
}

const DESC_TAG: u8 = 1;
const DESC_FIXED: usize = 1 + 8 + 8 + 2;
const MAX_TOKEN_LEN: usize = 128;

/// Opaque token allowing a peer to reconstruct a mapping to the same
/// memory. Consumed exactly once; must not outlive the region it was
/// exported from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportDescriptor {
    base_addr: u64,
    total_len: u64,
    token: String,
}

impl ExportDescriptor {
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(DESC_FIXED + self.token.len());
        bytes.put_u8(DESC_TAG);
        bytes.put_u64_le(self.base_addr);
        bytes.put_u64_le(self.total_len);
        bytes.put_u16_le(self.token.len() as u16);
        bytes.put_slice(self.token.as_bytes());
        bytes.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DESC_FIXED || bytes[0] != DESC_TAG {
            return None;
        }
        let base_addr = u64::from_le_bytes(bytes[1..9].try_into().ok()?);
        let total_len = u64::from_le_bytes(bytes[9..17].try_into().ok()?);
        let token_len = u16::from_le_bytes(bytes[17..19].try_into().ok()?) as usize;
        if total_len == 0 || token_len == 0 || token_len > MAX_TOKEN_LEN {
            return None;
        }
        if bytes.len() != DESC_FIXED + token_len {
            return None;
        }
        let token = std::str::from_utf8(&bytes[DESC_FIXED..]).ok()?.to_string();
        Some(Self {
            base_addr,
            total_len,
            token,
        })
    }

    pub fn wire_len(&self) -> usize {
        DESC_FIXED + self.token.len()
    }
}

static NEXT_MAPPING_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_token() -> String {
    let seq = NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed);
    format!("dmalink-{}-{}", process::id(), seq)
}

pub struct MemoryRegion {
    shm: Shmem,
    /// Exporter-side virtual address of the start of the mapping.
    base_addr: u64,
    total_len: usize,
    ptr: *mut u8,
    len: usize,
    ownership: Ownership,
    token: String,
}

impl MemoryRegion {
    /// Allocate a local region of `len` bytes and populate its
    /// offload-visible mapping. The backing bytes are owned by this
    /// region and freed with it.
    pub fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(TransferError::InvalidArgument(
                "region length must be non-zero",
            ));
        }
        let token = fresh_token();
        let shm = ShmemConf::new()
            .size(len)
            .os_id(&token)
            .create()
            .map_err(|error| TransferError::Map(error.to_string()))?;
        let ptr = shm.as_ptr();
        Ok(Self {
            base_addr: ptr as u64,
            total_len: len,
            ptr,
            len,
            ownership: Ownership::Local,
            token,
            shm,
        })
    }

    /// Export the mapping for remote access through `device`. Local
    /// regions only. The returned descriptor must be consumed before
    /// this region is destroyed.
    pub fn export(&self, device: &Device) -> Result<ExportDescriptor> {
        if self.ownership != Ownership::Local {
            return Err(TransferError::InvalidArgument(
                "only local regions can be exported",
            ));
        }
        debug!("exporting {} bytes via {}", self.total_len, device.address());
        let desc = ExportDescriptor {
            base_addr: self.base_addr,
            total_len: self.total_len as u64,
            token: self.token.clone(),
        };
        if desc.wire_len() > MAX_MSG_SIZE {
            return Err(TransferError::MessageTooLarge {
                len: desc.wire_len(),
                max: MAX_MSG_SIZE,
            });
        }
        Ok(desc)
    }

    /// Reconstruct a remote region from an imported descriptor using
    /// the local device handle. The peer keeps ownership of the
    /// backing bytes; dropping this region only tears down the local
    /// view.
    pub fn import(device: &Device, desc: &ExportDescriptor) -> Result<Self> {
        let shm = ShmemConf::new()
            .os_id(&desc.token)
            .open()
            .map_err(|error| TransferError::Map(error.to_string()))?;
        let total_len = usize::try_from(desc.total_len)
            .map_err(|_| TransferError::AddressOutOfRange {
                value: desc.total_len,
            })?;
        if shm.len() < total_len {
            return Err(TransferError::Map(format!(
                "mapping is {} bytes, descriptor claims {}",
                shm.len(),
                total_len
            )));
        }
        debug!("imported {} bytes via {}", total_len, device.address());
        Ok(Self {
            base_addr: desc.base_addr,
            total_len,
            ptr: std::ptr::null_mut(),
            len: 0,
            ownership: Ownership::Remote,
            token: desc.token.clone(),
            shm,
        })
    }

    /// Fix the operative range of an imported region from the peer's
    /// address and length, translating the exporter's address into the
    /// local view. The range must lie inside the imported mapping.
    pub(crate) fn set_range(&mut self, addr: u64, len: u64) -> Result<()> {
        if self.ownership != Ownership::Remote {
            return Err(TransferError::InvalidArgument(
                "range is fixed for local regions",
            ));
        }
        let len_native =
            usize::try_from(len).map_err(|_| TransferError::AddressOutOfRange { value: len })?;
        usize::try_from(addr).map_err(|_| TransferError::AddressOutOfRange { value: addr })?;
        if len_native == 0 {
            return Err(TransferError::InvalidArgument(
                "range length must be non-zero",
            ));
        }
        let offset = addr
            .checked_sub(self.base_addr)
            .ok_or(TransferError::RangeOutOfBounds { addr, len })?;
        let end = offset
            .checked_add(len)
            .ok_or(TransferError::RangeOutOfBounds { addr, len })?;
        if end > self.total_len as u64 {
            return Err(TransferError::RangeOutOfBounds { addr, len });
        }
        // SAFETY: offset + len was just bounds-checked against the mapping.
        self.ptr = unsafe { self.shm.as_ptr().add(offset as usize) };
        self.len = len_native;
        Ok(())
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Exporter-side virtual address of the mapping start.
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Operative length. Zero for a remote region whose range has not
    /// been exchanged yet.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Operative range as an address/length pair for the copy engine.
    pub(crate) fn operative(&self) -> Result<(usize, usize)> {
        if self.ptr.is_null() || self.len == 0 {
            return Err(TransferError::InvalidArgument(
                "region has no operative range",
            ));
        }
        Ok((self.ptr as usize, self.len))
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr/len describe a live sub-range of the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: ptr/len describe a live sub-range of the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
