use num_enum::IntoPrimitive;
use thiserror::Error;

/// Errors that can occur when talking to a device.
///
/// Every variant corresponds to one status kind: OS/driver failures, malformed
/// device responses, cancelled reads, and contract violations caught before
/// any I/O was issued.
#[derive(Error, Debug)]
pub enum Error {
    /// An OS or driver call failed (open, claim, ioctl, transfer submission).
    /// Never retried internally.
    #[error("system error: {0}")]
    Sys(#[from] std::io::Error),
    /// The device answered with something that cannot be decoded.
    #[error("malformed device response: {0}")]
    Io(String),
    /// A blocked read was cancelled through [`crate::Interrupter`] or
    /// [`crate::Device::interrupt`]. This is an expected outcome, not a fault.
    #[error("read interrupted")]
    Interrupted,
    /// A caller contract was violated; no transfer was issued.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Status kind of an [`Error`], with the numeric codes used across the crate.
/// Success is implicitly `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorKind {
    Sys = 1,
    Io = 2,
    Interrupted = 3,
    InvalidArgument = 4,
}

impl Error {
    /// Status kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Sys(_) => ErrorKind::Sys,
            Error::Io(_) => ErrorKind::Io,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Numeric status code (`SUCCESS` is 0 and never appears here).
    pub fn code(&self) -> u8 {
        self.kind().into()
    }

    /// True if this is the cancellation outcome rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

#[cfg(target_os = "linux")]
impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Sys(std::io::Error::from_raw_os_error(errno as i32))
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for Error {
    fn from(err: windows::core::Error) -> Self {
        Error::Sys(std::io::Error::from(err))
    }
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, Error>;

// Helpers for the recurring contract violations
pub(crate) fn invalid_address(addr: u8) -> Error {
    Error::InvalidArgument(format!(
        "I2C address 0x{:02X} is not a 7-bit address (0x00-0x7F)",
        addr
    ))
}

pub(crate) fn unsupported_on_device(what: &str) -> Error {
    Error::InvalidArgument(format!("not available on this device type: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_codes() {
        let sys = Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(sys.kind(), ErrorKind::Sys);
        assert_eq!(sys.code(), 1);
        assert_eq!(Error::Io("short".into()).code(), 2);
        assert!(Error::Interrupted.is_interrupted());
        assert_eq!(Error::Interrupted.code(), 3);
        assert_eq!(invalid_address(0x80).kind(), ErrorKind::InvalidArgument);
    }
}
