//! OS backends. Exactly one is compiled in and exported as `NativeTransport`.

#[cfg(target_os = "linux")]
mod usbfs;
#[cfg(target_os = "linux")]
pub use usbfs::{find, open, open_unclaimed, PipeToken, UsbfsTransport as NativeTransport};

#[cfg(windows)]
mod winusb;
#[cfg(windows)]
pub use winusb::{find, open, open_unclaimed, AbortToken, WinUsbTransport as NativeTransport};

#[cfg(not(any(target_os = "linux", windows)))]
mod unsupported;
#[cfg(not(any(target_os = "linux", windows)))]
pub use unsupported::{find, open, open_unclaimed, UnsupportedTransport as NativeTransport};
