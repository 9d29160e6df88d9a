//! Device boundary: opening the local device by address or by
//! capability. The handle is the only thing the rest of the crate sees;
//! components that share a device hold an `Arc` to it.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::error::{Result, TransferError};

/// Longest accepted textual device address (`dddd:bb:dd.f`).
pub const MAX_ADDR_LEN: usize = 12;

const MAX_CHANNEL_NAME: usize = 64;

/// Address of the built-in copy-offload engine function.
const COPY_ENGINE_ADDR: &str = "00:01.0";

/// Validated PCI-style device address, `[dddd:]bb:dd.f` in hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PciAddress(String);

impl PciAddress {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || TransferError::InvalidDeviceAddress(text.to_string());
        if text.is_empty() || text.len() > MAX_ADDR_LEN {
            return Err(invalid());
        }
        let (rest, func) = text.rsplit_once('.').ok_or_else(invalid)?;
        if func.len() != 1 || !func.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let mut fields: Vec<&str> = rest.split(':').collect();
        if fields.len() == 2 {
            fields.insert(0, "0000");
        }
        if fields.len() != 3 {
            return Err(invalid());
        }
        for (field, max_width) in fields.iter().zip([4_usize, 2, 2]) {
            if field.is_empty()
                || field.len() > max_width
                || !field.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(invalid());
            }
        }
        Ok(Self(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities understood by [`Device::open_with_capability`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// The device can execute memory-to-memory copy jobs.
    DmaMemcpy,
}

/// An opened local device. Owns the device's channel namespace, the
/// per-address directory under which named control channels are bound.
pub struct Device {
    address: PciAddress,
    channel_root: PathBuf,
}

impl Device {
    /// Open the device with the given address.
    pub fn open(address: &PciAddress) -> Result<Arc<Self>> {
        let mut dir_name = String::from("dmalink-");
        for byte in address.as_str().bytes() {
            dir_name.push(match byte {
                b':' | b'.' => '_',
                other => other as char,
            });
        }
        let channel_root = std::env::temp_dir().join(dir_name);
        std::fs::create_dir_all(&channel_root)?;
        debug!("opened device {}", address);
        Ok(Arc::new(Self {
            address: address.clone(),
            channel_root,
        }))
    }

    /// Open a device by capability instead of address. `DmaMemcpy`
    /// resolves to the platform copy engine.
    pub fn open_with_capability(capability: Capability) -> Result<Arc<Self>> {
        match capability {
            Capability::DmaMemcpy => Self::open(&PciAddress::parse(COPY_ENGINE_ADDR)?),
        }
    }

    pub fn address(&self) -> &PciAddress {
        &self.address
    }

    pub(crate) fn channel_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.len() > MAX_CHANNEL_NAME
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(TransferError::InvalidArgument("invalid channel name"));
        }
        Ok(self.channel_root.join(format!("{name}.sock")))
    }
}

/// Device representor, visible only on the accelerator side.
pub struct DeviceRep {
    address: PciAddress,
}

impl DeviceRep {
    pub fn open(device: &Device, address: &PciAddress) -> Result<Self> {
        debug!("opened representor {} via {}", address, device.address());
        Ok(Self {
            address: address.clone(),
        })
    }

    pub fn address(&self) -> &PciAddress {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, Device, PciAddress};
    use crate::error::TransferError;

    #[test]
    fn parses_short_and_full_addresses() {
        assert_eq!(PciAddress::parse("03:00.0").expect("short").as_str(), "03:00.0");
        assert_eq!(
            PciAddress::parse("0000:AF:00.1").expect("full").as_str(),
            "0000:af:00.1"
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for text in ["", "03:00", "zz:00.0", "03.00.0", "0000:03:00.0.1", "030000"] {
            assert!(
                matches!(
                    PciAddress::parse(text),
                    Err(TransferError::InvalidDeviceAddress(_))
                ),
                "{text} must be rejected"
            );
        }
    }

    #[test]
    fn capability_open_resolves_to_copy_engine() {
        let device = Device::open_with_capability(Capability::DmaMemcpy).expect("open");
        assert_eq!(device.address().as_str(), "00:01.0");
    }

    #[test]
    fn channel_path_rejects_bad_names() {
        let device = Device::open(&PciAddress::parse("01:00.0").expect("address")).expect("open");
        assert!(device.channel_path("dma_copy").is_ok());
        assert!(device.channel_path("").is_err());
        assert!(device.channel_path("../escape").is_err());
    }
}
