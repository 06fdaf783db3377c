//! Stream framing on top of raw pipe reads.
//!
//! * D2XX: every bulk-in transfer starts with a 2-byte status header. Header-only
//!   transfers are the device saying "nothing yet" and are skipped.
//! * D3XX: the device only produces data after a 20-byte trigger on the command
//!   pipe announcing how many bytes the host wants.
//! * HID (FT260): input reports are delivered as-is.

use crate::cancel::CancellationToken;
use crate::consts::d2xx;
use crate::consts::d3xx;
use crate::error::{Error, Result};
use crate::transport::Transport;
use log::trace;

/// Grows (never shrinks) the per-device scratch buffer and returns the first
/// `size` bytes of it.
pub(crate) fn scratch_slice(scratch: &mut Vec<u8>, size: usize) -> &mut [u8] {
    if scratch.len() < size {
        trace!("Growing scratch buffer {} -> {} bytes", scratch.len(), size);
        scratch.resize(size, 0);
    }
    &mut scratch[..size]
}

/// Reads until a transfer carries payload, strips the status header and copies
/// the payload into `buf`. The token is checked between transfers.
pub(crate) fn read_d2xx<T: Transport + ?Sized>(
    transport: &T,
    token: &dyn CancellationToken,
    scratch: &mut Vec<u8>,
    buf: &mut [u8],
) -> Result<usize> {
    let headered = scratch_slice(scratch, buf.len() + d2xx::HEADER_SIZE);
    loop {
        let received = transport.read_pipe(d2xx::EP_IN, headered)?;
        if received > d2xx::HEADER_SIZE {
            let payload = &headered[d2xx::HEADER_SIZE..received];
            trace!(
                "D2XX transfer: status {:02X?}, {} payload bytes",
                &headered[..d2xx::HEADER_SIZE],
                payload.len()
            );
            buf[..payload.len()].copy_from_slice(payload);
            return Ok(payload.len());
        }
        if token.is_armed() {
            return Err(Error::Interrupted);
        }
    }
}

/// Builds the vendor command that makes a D3XX device return `size` bytes.
pub(crate) fn d3xx_trigger(size: u32) -> [u8; d3xx::TRIGGER_SIZE] {
    let mut command = d3xx::TRIGGER_TEMPLATE;
    command[d3xx::TRIGGER_LENGTH_OFFSET..d3xx::TRIGGER_LENGTH_OFFSET + 4]
        .copy_from_slice(&size.to_le_bytes());
    command
}

/// Sends the read trigger, then performs the bulk-in transfer.
pub(crate) fn read_d3xx<T: Transport + ?Sized>(
    transport: &T,
    scratch: &mut Vec<u8>,
    buf: &mut [u8],
) -> Result<usize> {
    let size = u32::try_from(buf.len()).map_err(|_| {
        Error::InvalidArgument(format!(
            "D3XX read of {} bytes exceeds the 32-bit length field",
            buf.len()
        ))
    })?;
    let trigger = d3xx_trigger(size);
    trace!("D3XX read trigger: {:02X?}", &trigger[..]);
    transport.write_pipe(d3xx::EP_COMMAND, &trigger)?;

    let staging = scratch_slice(scratch, buf.len());
    let received = transport.read_pipe(d3xx::EP_IN, staging)?;
    buf[..received].copy_from_slice(&staging[..received]);
    Ok(received)
}
