//! Device discovery, the opened-device handle and its interruptible I/O.

use crate::cancel::{CancellationToken, Interrupter};
use crate::consts::{self, d2xx, d3xx, ft260, usb};
use crate::error::{unsupported_on_device, Error, Result};
use crate::framing;
use crate::platform::{self, NativeTransport};
use crate::transport::{ControlRequest, Transport};
use log::{debug, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Wire convention spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceType {
    /// Bulk pipes with a 2-byte status header on every IN transfer.
    D2xx = 0,
    /// Bulk pipes that need a read trigger before every IN transfer.
    D3xx = 1,
    /// FT260 HID-to-I2C/GPIO bridge.
    Ft260 = 2,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::D2xx => "D2XX",
            DeviceType::D3xx => "D3XX",
            DeviceType::Ft260 => "FT260",
        };
        f.write_str(name)
    }
}

/// USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vid: u16,
    pub pid: u16,
}

impl DeviceId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

/// Enumeration filter: devices matching `id` are reported as `device_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub device_type: DeviceType,
    pub id: DeviceId,
}

impl DeviceFilter {
    pub const fn new(device_type: DeviceType, vid: u16, pid: u16) -> Self {
        Self {
            device_type,
            id: DeviceId::new(vid, pid),
        }
    }

    /// Filter for an FT260 with the factory vendor/product ids.
    pub const fn ft260() -> Self {
        Self::new(DeviceType::Ft260, consts::FTDI_VID, consts::FT260_PID)
    }

    pub fn matches(&self, id: DeviceId) -> bool {
        self.id == id
    }
}

/// Where a device sits on the bus. Enough to find the same physical device
/// again while it stays plugged in; not stable across replug.
///
/// On Windows `bus` is the hub number and `address` the hub port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub bus: u16,
    pub address: u16,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.bus, self.address)
    }
}

/// A matched device that has not been opened yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    id: DeviceId,
    device_type: DeviceType,
    location: Location,
}

impl FoundDevice {
    pub fn new(device_type: DeviceType, id: DeviceId, location: Location) -> Self {
        Self {
            id,
            device_type,
            location,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Opens the device with the platform backend.
    pub fn open(&self) -> Result<Device> {
        Device::open(self)
    }

    /// Reads the serial number without claiming any interface or keeping the
    /// device open.
    pub fn serial(&self) -> Result<Serial> {
        let mut transport = platform::open_unclaimed(self)?;
        let serial = read_serial(&transport);
        if let Err(e) = transport.close() {
            warn!("Failed to close {} after serial query: {}", self.location, e);
        }
        serial
    }
}

/// Finds all attached devices matching any of `filters`.
///
/// A device matching several filters is reported once, typed by the first
/// matching filter. No filters means no devices; the OS inventory is not
/// touched in that case.
pub fn find_devices(filters: &[DeviceFilter]) -> Result<Vec<FoundDevice>> {
    if filters.is_empty() {
        debug!("No enumeration filters given");
        return Ok(Vec::new());
    }
    let found = platform::find(filters)?;
    debug!("Enumeration matched {} device(s)", found.len());
    Ok(found)
}

/// Report channel a read or write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Bulk data pipes (D2XX/D3XX) or HID input/output reports (FT260).
    Io,
    /// HID feature reports over endpoint 0. FT260 only; the first byte of the
    /// buffer is the report id.
    Feature,
}

/// Serial number decoded from the USB serial string descriptor.
///
/// Only the low byte of each UTF-16 code unit is kept, so serials outside the
/// ASCII range come out mangled rather than rejected.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Serial {
    bytes: heapless::Vec<u8, { consts::SERIAL_CAPACITY }>,
}

impl Serial {
    /// Decodes a raw string descriptor (length byte, type byte, UTF-16LE units).
    pub fn from_descriptor(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::Io(format!(
                "string descriptor too short: {} byte(s)",
                raw.len()
            )));
        }
        if raw[1] != usb::DT_STRING {
            return Err(Error::Io(format!(
                "expected string descriptor (type 0x{:02X}), got type 0x{:02X}",
                usb::DT_STRING,
                raw[1]
            )));
        }
        let mut bytes = heapless::Vec::new();
        for unit in raw[2..].chunks(2) {
            bytes.push(unit[0]).map_err(|_| {
                Error::Io(format!(
                    "serial longer than {} characters",
                    consts::SERIAL_CAPACITY
                ))
            })?;
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

pub(crate) fn read_serial<T: Transport + ?Sized>(transport: &T) -> Result<Serial> {
    let mut raw = [0u8; usb::MAX_DESCRIPTOR_SIZE];
    let request = ControlRequest {
        request_type: usb::DIR_IN,
        request: usb::REQ_GET_DESCRIPTOR,
        value: (u16::from(usb::DT_STRING) << 8) | u16::from(usb::SERIAL_STRING_INDEX),
        index: usb::LANGID_EN_US,
    };
    let received = transport.control_in(request, &mut raw)?;
    trace!("Serial descriptor: {:02X?}", &raw[..received]);
    Serial::from_descriptor(&raw[..received])
}

/// An opened device.
///
/// All I/O methods take `&self`: one thread may sit in [`Device::read`] while
/// another writes, issues control transfers or calls [`Device::interrupt`].
/// Concurrent reads are serialized. Dropping the device closes it.
pub struct Device<T: Transport = NativeTransport> {
    found: FoundDevice,
    transport: T,
    token: Arc<dyn CancellationToken>,
    // Read-side scratch buffer; the lock also serializes readers.
    reader: Mutex<Vec<u8>>,
    closed: bool,
}

impl Device<NativeTransport> {
    /// Opens `found`, claiming the interfaces its device type uses.
    ///
    /// Fails atomically: nothing stays claimed on error.
    pub fn open(found: &FoundDevice) -> Result<Self> {
        let transport = platform::open(found)?;
        debug!(
            "Opened {} device {} at {}",
            found.device_type, found.id, found.location
        );
        Ok(Self::with_transport(found.clone(), transport))
    }
}

impl<T: Transport> Device<T> {
    /// Wraps an already opened transport.
    pub fn with_transport(found: FoundDevice, transport: T) -> Self {
        let token = transport.cancellation();
        Self {
            found,
            transport,
            token,
            reader: Mutex::new(Vec::new()),
            closed: false,
        }
    }

    pub fn found(&self) -> &FoundDevice {
        &self.found
    }

    pub fn device_type(&self) -> DeviceType {
        self.found.device_type
    }

    // --- Reads ---

    /// Blocks until data arrives, an error occurs, or the read is interrupted.
    ///
    /// Returns the number of payload bytes written to `buf`. For D2XX the
    /// status header is stripped; for FT260 input reports the report id is
    /// kept as the first byte. [`Endpoint::Feature`] reads (FT260 only) issue
    /// a GET_REPORT for the id in `buf[0]` and are not interruptible.
    pub fn read(&self, endpoint: Endpoint, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument(
                "read buffer must not be empty".to_string(),
            ));
        }
        if endpoint == Endpoint::Feature {
            return self.get_feature_report(buf);
        }

        let mut scratch = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        self.token.reset();
        let result = match self.found.device_type {
            DeviceType::D2xx => {
                framing::read_d2xx(&self.transport, self.token.as_ref(), &mut scratch, buf)
            }
            DeviceType::D3xx => framing::read_d3xx(&self.transport, &mut scratch, buf),
            DeviceType::Ft260 => self.transport.read_pipe(ft260::EP_IN, buf),
        };
        match &result {
            Ok(received) => trace!("Read {} bytes: {:02X?}", received, &buf[..*received]),
            Err(Error::Interrupted) => debug!("Read on {} interrupted", self.found.location),
            Err(e) => debug!("Read on {} failed: {}", self.found.location, e),
        }
        result
    }

    /// [`Device::read`] bounded by `timeout`.
    ///
    /// A watchdog thread interrupts the read once `timeout` elapses, and keeps
    /// interrupting until the read returns. Expiry surfaces as
    /// [`Error::Interrupted`].
    pub fn read_timeout(
        &self,
        endpoint: Endpoint,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let interrupter = self.interrupter();
        thread::scope(|scope| {
            scope.spawn(move || {
                let mut wait = timeout;
                while let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(wait) {
                    if let Err(e) = interrupter.interrupt() {
                        warn!("Read watchdog failed to interrupt: {}", e);
                    }
                    wait = Duration::from_millis(consts::INTERRUPT_RETRY_MS);
                }
            });
            let result = self.read(endpoint, buf);
            drop(done_tx);
            result
        })
    }

    // --- Writes ---

    /// Synchronous write; not cancellable. Returns the number of bytes sent.
    ///
    /// [`Endpoint::Feature`] writes (FT260 only) issue a SET_REPORT whose id is
    /// `data[0]`.
    pub fn write(&self, endpoint: Endpoint, data: &[u8]) -> Result<usize> {
        if endpoint == Endpoint::Feature {
            return self.set_feature_report(data);
        }
        let ep = match self.found.device_type {
            DeviceType::D2xx => d2xx::EP_OUT,
            DeviceType::D3xx => d3xx::EP_OUT,
            DeviceType::Ft260 => ft260::EP_OUT,
        };
        trace!("Writing {} bytes to EP 0x{:02X}: {:02X?}", data.len(), ep, data);
        self.transport.write_pipe(ep, data)
    }

    // --- Cancellation ---

    /// Makes a read currently blocked on this device return
    /// [`Error::Interrupted`]. Safe to call from any thread. With no read in
    /// flight it has no lasting effect, since every read starts by clearing
    /// the token.
    pub fn interrupt(&self) -> Result<()> {
        debug!("Interrupting reads on {}", self.found.location);
        self.token.arm()
    }

    /// Cloneable handle for interrupting reads from other threads. It stays
    /// valid after the device is closed.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter::new(Arc::clone(&self.token))
    }

    // --- Descriptors ---

    /// Reads the serial string descriptor (index 3, US English).
    pub fn serial(&self) -> Result<Serial> {
        read_serial(&self.transport)
    }

    // --- Feature reports ---

    pub(crate) fn require_ft260(&self, what: &str) -> Result<()> {
        if self.found.device_type != DeviceType::Ft260 {
            return Err(unsupported_on_device(&format!(
                "{} on a {} device",
                what, self.found.device_type
            )));
        }
        Ok(())
    }

    fn feature_request(
        &self,
        request_type: u8,
        request: u8,
        report_id: u8,
    ) -> Result<ControlRequest> {
        self.require_ft260("feature reports")?;
        Ok(ControlRequest {
            request_type,
            request,
            value: (ft260::HID_REPORT_TYPE_FEATURE << 8) | u16::from(report_id),
            index: u16::from(ft260::INTERFACE),
        })
    }

    fn set_feature_report(&self, data: &[u8]) -> Result<usize> {
        let report_id = *data.first().ok_or_else(|| {
            Error::InvalidArgument("feature report must start with its report id".to_string())
        })?;
        let request = self.feature_request(
            ft260::HID_REQUEST_TYPE_OUT,
            ft260::HID_SET_REPORT,
            report_id,
        )?;
        trace!("Writing Feature Report 0x{:02X}: {:02X?}", report_id, data);
        self.transport.control_out(request, data)
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        let report_id = buf[0];
        let request = self.feature_request(
            ft260::HID_REQUEST_TYPE_IN,
            ft260::HID_GET_REPORT,
            report_id,
        )?;
        let received = self.transport.control_in(request, buf)?;
        trace!(
            "Read Feature Report 0x{:02X}: {:02X?}",
            report_id,
            &buf[..received]
        );
        Ok(received)
    }

    // --- Lifecycle ---

    /// Interrupts any pending read, then releases the OS resources.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.token.arm() {
            warn!(
                "Failed to interrupt {} before closing: {}",
                self.found.location, e
            );
        }
        debug!(
            "Closing {} device at {}",
            self.found.device_type, self.found.location
        );
        self.transport.close()
    }
}

impl<T: Transport> Drop for Device<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Error closing {} on drop: {}", self.found.location, e);
        }
    }
}

impl<T: Transport> fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("found", &self.found)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_takes_low_bytes() {
        let raw = [0x09, 0x03, b'A', 0, b'B', 0, b'C', 0];
        let serial = Serial::from_descriptor(&raw).unwrap();
        assert_eq!(serial.as_bytes(), b"ABC");
        assert_eq!(serial.to_string(), "ABC");
    }

    #[test]
    fn serial_keeps_trailing_odd_byte() {
        let serial = Serial::from_descriptor(&[0x05, 0x03, b'F', 0, b'T']).unwrap();
        assert_eq!(serial.as_bytes(), b"FT");
    }

    #[test]
    fn serial_rejects_malformed_descriptors() {
        assert!(matches!(Serial::from_descriptor(&[0x02]), Err(Error::Io(_))));
        assert!(matches!(
            Serial::from_descriptor(&[0x04, 0x01, b'A', 0]),
            Err(Error::Io(_))
        ));
        let empty = Serial::from_descriptor(&[0x02, 0x03]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn non_ascii_serial_is_mangled_not_rejected() {
        // U+00E9 then U+0416: high bytes are dropped
        let serial = Serial::from_descriptor(&[0x06, 0x03, 0xE9, 0x00, 0x16, 0x04]).unwrap();
        assert_eq!(serial.as_bytes(), &[0xE9, 0x16]);
    }

    #[test]
    fn device_type_codes() {
        assert_eq!(u8::from(DeviceType::Ft260), 2);
        assert_eq!(DeviceType::try_from(1u8).unwrap(), DeviceType::D3xx);
        assert!(DeviceType::try_from(7u8).is_err());
    }

    #[test]
    fn empty_filter_list_finds_nothing() {
        assert!(find_devices(&[]).unwrap().is_empty());
    }
}
