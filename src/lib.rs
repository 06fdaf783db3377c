//! # ftdirect
//!
//! Talks to FTDI bulk devices (D2XX and D3XX wire conventions) and to the
//! FT260 USB-HID-to-I2C/GPIO bridge straight through the kernel's USB
//! interface, without libusb, hidapi or the vendor drivers.
//!
//! ## Features
//!
//! *   Device discovery against caller-supplied vendor/product filters
//!     (`find_devices`).
//! *   Opening a found device, claiming its interfaces (`FoundDevice::open`).
//! *   Blocking reads that another thread can interrupt at any time
//!     (`Device::read`, `Device::interrupt`, `Device::interrupter`), and a
//!     timed variant (`Device::read_timeout`).
//! *   Stream framing per device type:
//!     *   D2XX: the 2-byte status header of every IN transfer is stripped and
//!         header-only transfers are skipped.
//!     *   D3XX: the read trigger is sent on the command pipe before each read.
//!     *   FT260: input reports are returned as-is.
//! *   Serial number from the USB string descriptor (`Device::serial`,
//!     `FoundDevice::serial`).
//! *   FT260 I²C:
//!     *   Chunked writes with START/STOP framing (`i2c_write`).
//!     *   Register-style reads (`i2c_read`), or the raw request and report
//!         halves for custom loops (`i2c_read_request`, `read_i2c_report`).
//! *   FT260 feature reports: I²C clock, system clock, GPIO function select,
//!     GPIO read/write.
//!
//! ## Platform Support & Limitations
//!
//! *   **Linux:** usbfs backend (`/dev/bus/usb`). Reads are asynchronous URBs
//!     woken by a self-pipe on interrupt; a cancelled URB is always reaped
//!     before the read returns. Kernel drivers bound to claimed interfaces are
//!     detached on open and reattached on close.
//! *   **Windows:** WinUSB backend. The device must have WinUSB bound as its
//!     driver; the vendor D2XX/D3XX drivers and the HID class driver are not
//!     used. Reads are overlapped transfers; an interrupt aborts the pipe and
//!     the read waits for the aborted transfer to complete before returning.
//!     `Location` holds the hub number and port.
//! *   **Other targets (macOS included):** compile, but every entry point
//!     fails with `Error::Sys` (`io::ErrorKind::Unsupported`).
//! *   **Serial numbers** keep only the low byte of each UTF-16 unit. Non-ASCII
//!     serials come out mangled rather than rejected.
//!
//! Devices are exclusively owned: one `Device` per open. Reads on one device
//! are serialized; writes, control transfers and `interrupt` may run
//! concurrently with a blocked read.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use ftdirect::{find_devices, DeviceFilter, Endpoint, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let found = find_devices(&[DeviceFilter::ft260()])?;
//!     let Some(first) = found.first() else {
//!         eprintln!("No FT260 attached");
//!         return Ok(());
//!     };
//!     let device = first.open()?;
//!     println!("Serial: {}", device.serial()?);
//!
//!     // Read the first 256 bytes of an SFP module's MSA table.
//!     device.set_i2c_clock_speed(100)?;
//!     let mut msa = [0u8; 256];
//!     device.i2c_read(0x50, Some(&[0x00]), &mut msa)?;
//!
//!     // Bounded wait for an unsolicited input report.
//!     let mut report = [0u8; 64];
//!     match device.read_timeout(Endpoint::Io, &mut report, Duration::from_millis(500)) {
//!         Ok(n) => println!("Report: {:02X?}", &report[..n]),
//!         Err(e) if e.is_interrupted() => println!("Nothing within 500 ms"),
//!         Err(e) => return Err(e),
//!     }
//!
//!     device.close()
//! }
//! ```

mod cancel;
mod consts;
mod device;
mod error;
mod framing;
pub mod gpio;
pub mod i2c;
mod platform;
mod transport;

pub use cancel::{CancellationToken, FlagToken, Interrupter};
pub use consts::{FT260_PID, FTDI_VID};
pub use device::{
    find_devices, Device, DeviceFilter, DeviceId, DeviceType, Endpoint, FoundDevice, Location,
    Serial,
};
pub use error::{Error, ErrorKind, Result};
pub use gpio::{GpioGroup, GpioPins, GpioPinsEx, GpioState, SystemClock};
pub use i2c::{I2cFlags, I2cInputReport, I2cReadAccumulator, WriteChunks};
pub use platform::NativeTransport;
pub use transport::{ControlRequest, Transport};

#[cfg(target_os = "linux")]
pub use platform::PipeToken;
#[cfg(windows)]
pub use platform::AbortToken;
