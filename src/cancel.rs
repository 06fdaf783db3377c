//! Cancellation of blocked reads.
//!
//! A read parks the calling thread inside the kernel. The only way out short of
//! data arriving is a side channel another thread can poke: a flag checked
//! between raw transfers, plus whatever wakes a transfer that is already
//! pending (a self-signalling pipe on usbfs). The framing layer only sees the
//! [`CancellationToken`] capability, never the mechanism.

use crate::error::Result;
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capability that lets any thread unblock a thread parked in a read.
///
/// `arm` may be called from any thread at any time. `reset` is only called by
/// the reading thread at the start of a new read.
pub trait CancellationToken: Send + Sync {
    /// Requests cancellation of the current (or next) read.
    fn arm(&self) -> Result<()>;
    /// Whether `arm` was called since the last `reset`.
    fn is_armed(&self) -> bool;
    /// Clears the request, including any pending wake-up signal.
    fn reset(&self);
}

/// Flag-only token for transports whose raw reads return on their own
/// (e.g. periodic status packets) and only need a check between iterations.
#[derive(Debug, Default)]
pub struct FlagToken {
    armed: AtomicBool,
}

impl FlagToken {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CancellationToken for FlagToken {
    fn arm(&self) -> Result<()> {
        self.armed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

/// Cloneable handle that interrupts reads on one device from any thread.
///
/// The handle shares the device's token, so it remains safe to use after the
/// device has been closed; interrupting a closed device is a no-op.
#[derive(Clone)]
pub struct Interrupter {
    token: Arc<dyn CancellationToken>,
}

impl Interrupter {
    pub(crate) fn new(token: Arc<dyn CancellationToken>) -> Self {
        Self { token }
    }

    /// Makes a read blocked on the device return `Error::Interrupted`.
    pub fn interrupt(&self) -> Result<()> {
        debug!("Interrupt requested");
        self.token.arm()
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("armed", &self.token.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_token_arm_and_reset() {
        let token = FlagToken::new();
        assert!(!token.is_armed());
        token.arm().unwrap();
        token.arm().unwrap();
        assert!(token.is_armed());
        token.reset();
        assert!(!token.is_armed());
    }

    #[test]
    fn interrupter_is_visible_across_threads() {
        let token: Arc<dyn CancellationToken> = Arc::new(FlagToken::new());
        let interrupter = Interrupter::new(Arc::clone(&token));
        std::thread::spawn(move || interrupter.interrupt().unwrap())
            .join()
            .unwrap();
        assert!(token.is_armed());
    }
}
