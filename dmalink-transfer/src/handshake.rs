//! Status acknowledgment layered on the control endpoint. Every
//! multi-step exchange brackets each step with a success/failure
//! status so both sides observe the same point of failure instead of
//! diverging silently.

use log::error;

use crate::channel::Endpoint;
use crate::error::{Result, TransferError};

const STATUS_LEN: usize = 1;
const STATUS_FAILURE: u8 = 0;
const STATUS_SUCCESS: u8 = 1;

pub fn send_success(ch: &mut Endpoint) -> Result<()> {
    ch.send_to(&[STATUS_SUCCESS])
}

pub fn send_failure(ch: &mut Endpoint) -> Result<()> {
    ch.send_to(&[STATUS_FAILURE])
}

/// Receive one status message. A failure status decodes to
/// [`TransferError::PeerFailure`] even though the transport call
/// itself succeeded.
pub fn wait_for_success(ch: &mut Endpoint) -> Result<()> {
    let mut buf = [0_u8; STATUS_LEN];
    let len = ch.recv_from(&mut buf)?;
    if len != STATUS_LEN {
        return Err(TransferError::Decode("status message has wrong length"));
    }
    match buf[0] {
        STATUS_SUCCESS => Ok(()),
        STATUS_FAILURE => {
            error!("peer reported failure");
            Err(TransferError::PeerFailure)
        }
        _ => Err(TransferError::Decode("status message has invalid value")),
    }
}
