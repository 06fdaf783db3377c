//! Raw per-platform I/O primitives.
//!
//! A [`Transport`] owns the OS handle(s) of one opened device. It knows nothing
//! about D2XX headers, D3XX triggers or FT260 reports; [`crate::Device`] layers
//! those on top. Platform backends live in `crate::platform`; tests plug in
//! their own.

use crate::cancel::CancellationToken;
use crate::error::Result;
use std::sync::Arc;

/// Setup stage of a control transfer on endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// OS-level access to one opened device.
///
/// Implementations must be usable from two threads at once: one blocked in
/// [`Transport::read_pipe`] and one issuing writes, control transfers, or
/// arming the cancellation token.
pub trait Transport: Send + Sync {
    /// Performs one raw IN transfer on `endpoint` into `buf`, blocking until
    /// the device answers, the call fails, or the token is armed.
    ///
    /// When cancelled while a kernel transfer is pending, the transfer must be
    /// retired (discarded and reaped) before returning. A transfer that turns
    /// out to have completed with data is reported as data, otherwise the
    /// result is `Error::Interrupted`.
    fn read_pipe(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize>;

    /// Performs one synchronous OUT transfer. Not cancellable.
    fn write_pipe(&self, endpoint: u8, data: &[u8]) -> Result<usize>;

    /// Device-to-host control transfer; returns the number of bytes received.
    fn control_in(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize>;

    /// Host-to-device control transfer.
    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize>;

    /// The token interrupting this transport's reads. Every call returns the
    /// same underlying token.
    fn cancellation(&self) -> Arc<dyn CancellationToken>;

    /// Releases the OS resources in reverse order of acquisition. Called at
    /// most once, after any in-flight read has been interrupted.
    fn close(&mut self) -> Result<()>;
}
