//! Control channel endpoint: a connection-oriented, message-based
//! channel between the host and the accelerator process.
//!
//! Messages are framed with a 4-byte little-endian length over a Unix
//! socket bound inside the device's channel namespace. Every transient
//! condition (connection still in progress, send/receive backpressure)
//! is retried internally with the fixed poll interval; non-transient
//! errors abort the retry loop and surface to the caller. The endpoint
//! never reconnects on its own.

use std::fmt::{Display, Formatter};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};

use crate::device::{Device, DeviceRep};
use crate::error::{Result, TransferError};
use crate::retry::{busy_poll, Attempt};

/// Maximum size of a single control message.
pub const MAX_MSG_SIZE: usize = 4080;

const FRAME_HEADER: usize = 4;

/// Identity of the connected peer, valid between a successful
/// connect/accept and disconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress(String);

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Peer {
    stream: UnixStream,
    address: PeerAddress,
}

struct Listener {
    inner: UnixListener,
    path: PathBuf,
    name: String,
}

pub struct Endpoint {
    device: Arc<Device>,
    rep: Option<DeviceRep>,
    listener: Option<Listener>,
    peer: Option<Peer>,
}

impl Endpoint {
    /// Create an endpoint on an opened device. The representor is
    /// required only on the accelerator side.
    pub fn new(device: Arc<Device>, rep: Option<DeviceRep>) -> Self {
        Self {
            device,
            rep,
            listener: None,
            peer: None,
        }
    }

    /// Initiate a connection to the peer listening under `name`.
    /// Blocks, retrying while the connection is still in progress (the
    /// peer has not finished binding), until it resolves to success or
    /// a terminal error.
    pub fn connect(&mut self, name: &str) -> Result<()> {
        let path = self.device.channel_path(name)?;
        let stream = busy_poll(|| match UnixStream::connect(&path) {
            Ok(stream) => Ok(Attempt::Ready(stream)),
            Err(error) if connect_in_progress(&error) => Ok(Attempt::Pending),
            Err(error) => Err(error.into()),
        })?;
        stream.set_nonblocking(true)?;
        self.peer = Some(Peer {
            stream,
            address: PeerAddress(name.to_string()),
        });
        info!("connection to {name} established");
        Ok(())
    }

    /// Register this endpoint under `name` so a peer may connect. Does
    /// not wait for the peer: the pending connection is accepted by
    /// the first receive.
    pub fn listen(&mut self, name: &str) -> Result<()> {
        let path = self.device.channel_path(name)?;
        if path.exists() {
            // stale socket from a previous run
            std::fs::remove_file(&path)?;
        }
        let inner = UnixListener::bind(&path)?;
        inner.set_nonblocking(true)?;
        self.listener = Some(Listener {
            inner,
            path,
            name: name.to_string(),
        });
        if let Some(rep) = &self.rep {
            debug!("listening via representor {}", rep.address());
        }
        info!("listening as {name}, waiting for connections");
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn peer_address(&self) -> Option<&PeerAddress> {
        self.peer.as_ref().map(|peer| &peer.address)
    }

    /// Send one message of at most [`MAX_MSG_SIZE`] bytes. Transient
    /// backpressure is retried internally; the message is never
    /// partially sent.
    pub fn send_to(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() > MAX_MSG_SIZE {
            return Err(TransferError::MessageTooLarge {
                len: msg.len(),
                max: MAX_MSG_SIZE,
            });
        }
        let header = (msg.len() as u32).to_le_bytes();
        let peer = self.ensure_peer()?;
        write_all_polling(&mut peer.stream, &header)?;
        write_all_polling(&mut peer.stream, msg)?;
        Ok(())
    }

    /// Receive one message into `buf`, returning the received length.
    /// A message larger than `buf` or [`MAX_MSG_SIZE`] is a hard
    /// error.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<usize> {
        let capacity = buf.len();
        let peer = self.ensure_peer()?;
        let mut header = [0_u8; FRAME_HEADER];
        read_exact_polling(&mut peer.stream, &mut header)?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_MSG_SIZE || len > capacity {
            return Err(TransferError::MessageTooLarge {
                len,
                max: capacity.min(MAX_MSG_SIZE),
            });
        }
        read_exact_polling(&mut peer.stream, &mut buf[..len])?;
        Ok(len)
    }

    /// Drop the connection. Idempotent: disconnecting an endpoint that
    /// is not connected is a no-op reporting success.
    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(peer) = self.peer.take() {
            if let Err(error) = peer.stream.shutdown(Shutdown::Both) {
                if error.kind() != io::ErrorKind::NotConnected {
                    return Err(error.into());
                }
            }
            debug!("disconnected from {}", peer.address);
        }
        Ok(())
    }

    fn ensure_peer(&mut self) -> Result<&mut Peer> {
        if self.peer.is_none() {
            let accepted = {
                let Some(listener) = self.listener.as_ref() else {
                    return Err(TransferError::NotConnected);
                };
                let (stream, _) = busy_poll(|| match listener.inner.accept() {
                    Ok(pair) => Ok(Attempt::Ready(pair)),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                        Ok(Attempt::Pending)
                    }
                    Err(error) => Err(error.into()),
                })?;
                stream.set_nonblocking(true)?;
                Peer {
                    stream,
                    address: PeerAddress(listener.name.clone()),
                }
            };
            debug!("accepted connection on {}", accepted.address);
            self.peer = Some(accepted);
        }
        Ok(self.peer.as_mut().expect("connection just established"))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.disconnect();
        if let Some(listener) = self.listener.take() {
            let _ = std::fs::remove_file(&listener.path);
        }
    }
}

fn connect_in_progress(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

fn write_all_polling(stream: &mut UnixStream, bytes: &[u8]) -> Result<()> {
    let mut written = 0;
    busy_poll(|| {
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Attempt::Pending)
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(Attempt::Ready(()))
    })
}

fn read_exact_polling(stream: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    busy_poll(|| {
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Attempt::Pending)
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(Attempt::Ready(()))
    })
}

#[cfg(test)]
mod tests {
    use super::{Endpoint, MAX_MSG_SIZE};
    use crate::device::{Device, PciAddress};
    use crate::error::TransferError;

    fn endpoint() -> Endpoint {
        let device = Device::open(&PciAddress::parse("7f:00.0").expect("address")).expect("open");
        Endpoint::new(device, None)
    }

    #[test]
    fn oversized_message_is_rejected_up_front() {
        let mut ch = endpoint();
        let msg = vec![0_u8; MAX_MSG_SIZE + 1];
        assert!(matches!(
            ch.send_to(&msg),
            Err(TransferError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn send_without_connection_fails() {
        let mut ch = endpoint();
        assert!(matches!(
            ch.send_to(&[1]),
            Err(TransferError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_without_connection_is_a_noop() {
        let mut ch = endpoint();
        ch.disconnect().expect("first");
        ch.disconnect().expect("second");
        assert!(!ch.connected());
    }
}
