//! Windows backend over WinUSB.
//!
//! The device needs WinUSB bound as its function driver (for example through
//! an INF or Zadig). The vendor D2XX/D3XX drivers and the in-box HID driver do
//! not expose raw pipes.
//!
//! Reads are overlapped pipe transfers that the reading thread waits on to
//! completion. An interrupt aborts the pipe from the interrupting thread,
//! which completes the pending transfer with `ERROR_OPERATION_ABORTED`.

use crate::cancel::CancellationToken;
use crate::consts::{self, d2xx, d3xx, ft260};
use crate::device::{DeviceFilter, DeviceId, DeviceType, FoundDevice, Location};
use crate::error::{Error, Result};
use crate::transport::{ControlRequest, Transport};
use log::{debug, trace, warn};
use std::ffi::c_void;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use windows::core::PCWSTR;
use windows::Win32::Devices::DeviceAndDriverInstallation::*;
use windows::Win32::Devices::Usb::*;
use windows::Win32::Foundation::*;
use windows::Win32::Storage::FileSystem::*;
use windows::Win32::System::Threading::CreateEventW;
use windows::Win32::System::IO::OVERLAPPED;

#[derive(Debug, Clone, Copy)]
struct Interface(WINUSB_INTERFACE_HANDLE);

// SAFETY: WinUSB interface handles are plain kernel handles; WinUSB allows
// calls on one handle from several threads, which is what abort relies on.
unsafe impl Send for Interface {}
unsafe impl Sync for Interface {}

// --- Cancellation ---

/// Flag plus pipe abort. The reading thread registers the pipe it is waiting
/// on; arming aborts that pipe so the transfer completes right away.
#[derive(Debug, Default)]
pub struct AbortToken {
    armed: AtomicBool,
    pending: Mutex<Option<(Interface, u8)>>,
}

impl AbortToken {
    fn new() -> Self {
        Self::default()
    }

    /// Submits a transfer on `pipe` unless the token is already armed. The
    /// check and the registration share the lock `arm` takes, so an interrupt
    /// either prevents the submission or finds the pipe to abort.
    fn submit(
        &self,
        interface: Interface,
        pipe: u8,
        submit: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_armed() {
            return Err(Error::Interrupted);
        }
        submit()?;
        *pending = Some((interface, pipe));
        Ok(())
    }

    fn finish(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl CancellationToken for AbortToken {
    fn arm(&self) -> Result<()> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.armed.store(true, Ordering::Release);
        if let Some((interface, pipe)) = *pending {
            debug!("Aborting pipe 0x{:02X}", pipe);
            // SAFETY: the handle stays open while a transfer on it is pending
            unsafe { WinUsb_AbortPipe(interface.0, pipe) }?;
        }
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

// --- Enumeration ---

/// Pulls vendor/product out of a device interface path such as
/// `\\?\usb#vid_0403&pid_6030#serial#{guid}`.
fn parse_interface_path(path: &str) -> Option<DeviceId> {
    let lower = path.to_ascii_lowercase();
    let hex_after = |tag: &str| {
        let start = lower.find(tag)? + tag.len();
        u16::from_str_radix(lower.get(start..start + 4)?, 16).ok()
    };
    Some(DeviceId::new(hex_after("vid_")?, hex_after("pid_")?))
}

/// Parses the `Port_#0004.Hub_#0001` location string. The hub number stands in
/// for the bus and the port for the address.
fn parse_location_info(info: &str) -> Option<Location> {
    let (port, hub) = info.split_once('.')?;
    Some(Location {
        bus: hub.strip_prefix("Hub_#")?.parse().ok()?,
        address: port.strip_prefix("Port_#")?.parse().ok()?,
    })
}

fn utf16_until_nul(units: impl IntoIterator<Item = u16>) -> String {
    let units: Vec<u16> = units.into_iter().take_while(|&u| u != 0).collect();
    String::from_utf16_lossy(&units)
}

struct Candidate {
    id: DeviceId,
    location: Location,
    path: String,
}

struct DeviceInfoSet(HDEVINFO);

impl DeviceInfoSet {
    fn usb_devices() -> Result<Self> {
        // SAFETY: plain query, the returned set is freed in Drop
        let set = unsafe {
            SetupDiGetClassDevsW(
                Some(&GUID_DEVINTERFACE_USB_DEVICE),
                PCWSTR::null(),
                None,
                DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
            )
        }?;
        Ok(Self(set))
    }

    fn location(&self, info: &SP_DEVINFO_DATA) -> Option<Location> {
        let mut raw = [0u8; 256];
        // SAFETY: info came from this set; raw is large enough for the string
        unsafe {
            SetupDiGetDeviceRegistryPropertyW(
                self.0,
                info,
                SPDRP_LOCATION_INFORMATION,
                None,
                Some(&mut raw),
                None,
            )
        }
        .ok()?;
        let text = utf16_until_nul(
            raw.chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
        );
        parse_location_info(&text)
    }

    /// Device path and device info of interface `index`, or `None` past the
    /// last one.
    fn interface(&self, index: u32) -> Result<Option<(String, SP_DEVINFO_DATA)>> {
        let mut iface = SP_DEVICE_INTERFACE_DATA {
            cbSize: mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            ..Default::default()
        };
        // SAFETY: iface is sized and initialized
        if let Err(e) = unsafe {
            SetupDiEnumDeviceInterfaces(
                self.0,
                None,
                &GUID_DEVINTERFACE_USB_DEVICE,
                index,
                &mut iface,
            )
        } {
            if e.code() == ERROR_NO_MORE_ITEMS.to_hresult() {
                return Ok(None);
            }
            return Err(e.into());
        }

        let mut required = 0u32;
        // SAFETY: size query with no buffer; fails with ERROR_INSUFFICIENT_BUFFER
        let _ = unsafe {
            SetupDiGetDeviceInterfaceDetailW(self.0, &iface, None, 0, Some(&mut required), None)
        };
        if (required as usize) < mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() {
            return Err(Error::Sys(io::Error::other("empty device interface detail")));
        }
        // u32 storage keeps the detail struct aligned
        let mut storage = vec![0u32; (required as usize).div_ceil(4)];
        let detail = storage.as_mut_ptr().cast::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>();
        let mut info = SP_DEVINFO_DATA {
            cbSize: mem::size_of::<SP_DEVINFO_DATA>() as u32,
            ..Default::default()
        };
        // SAFETY: storage holds `required` bytes and outlives every use of
        // detail; cbSize is the fixed header size as the API expects
        let path = unsafe {
            (*detail).cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
            SetupDiGetDeviceInterfaceDetailW(
                self.0,
                &iface,
                Some(detail),
                required,
                None,
                Some(&mut info),
            )?;
            let start = std::ptr::addr_of!((*detail).DevicePath).cast::<u16>();
            let max = (required as usize
                - mem::offset_of!(SP_DEVICE_INTERFACE_DETAIL_DATA_W, DevicePath))
                / 2;
            utf16_until_nul(std::slice::from_raw_parts(start, max).iter().copied())
        };
        Ok(Some((path, info)))
    }
}

impl Drop for DeviceInfoSet {
    fn drop(&mut self) {
        // SAFETY: the set came from SetupDiGetClassDevsW
        let _ = unsafe { SetupDiDestroyDeviceInfoList(self.0) };
    }
}

fn candidates() -> Result<Vec<Candidate>> {
    let set = DeviceInfoSet::usb_devices()?;
    let mut found = Vec::new();
    let mut index = 0;
    while let Some((path, info)) = set.interface(index)? {
        index += 1;
        let Some(id) = parse_interface_path(&path) else {
            debug!("Skipping {}: no vid/pid in path", path);
            continue;
        };
        let Some(location) = set.location(&info) else {
            debug!("Skipping {}: no location information", path);
            continue;
        };
        found.push(Candidate { id, location, path });
    }
    Ok(found)
}

pub fn find(filters: &[DeviceFilter]) -> Result<Vec<FoundDevice>> {
    let mut found = Vec::new();
    for candidate in candidates()? {
        if let Some(filter) = filters.iter().find(|f| f.matches(candidate.id)) {
            debug!(
                "Found {} device {} at {}",
                filter.device_type, candidate.id, candidate.location
            );
            found.push(FoundDevice::new(
                filter.device_type,
                candidate.id,
                candidate.location,
            ));
        }
    }
    Ok(found)
}

// --- Opened device ---

fn interfaces(device_type: DeviceType) -> &'static [u8] {
    match device_type {
        DeviceType::D2xx => d2xx::INTERFACES,
        DeviceType::D3xx => d3xx::INTERFACES,
        DeviceType::Ft260 => ft260::INTERFACES,
    }
}

/// Opens `found` and initializes WinUSB on the interfaces its device type
/// uses.
pub fn open(found: &FoundDevice) -> Result<WinUsbTransport> {
    WinUsbTransport::open(found, interfaces(found.device_type()))
}

/// Opens `found` with only the first interface initialized, which WinUSB
/// needs for any control transfer.
pub fn open_unclaimed(found: &FoundDevice) -> Result<WinUsbTransport> {
    WinUsbTransport::open(found, &[0])
}

struct Event(HANDLE);

impl Event {
    fn new() -> Result<Self> {
        // SAFETY: manual-reset, unnamed, closed in Drop
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }?;
        Ok(Self(handle))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: owned handle from CreateEventW
        let _ = unsafe { CloseHandle(self.0) };
    }
}

/// WinUSB handles on one device.
///
/// `interfaces` holds the initialized interfaces in acquisition order, the
/// first one being the handle `WinUsb_Initialize` returned.
#[derive(Debug)]
pub struct WinUsbTransport {
    token: Arc<AbortToken>,
    file: HANDLE,
    location: Location,
    interfaces: Vec<(u8, Interface)>,
    pipes: Vec<(u8, Interface)>,
    closed: bool,
}

// SAFETY: the file handle is only used to initialize and close; WinUSB calls
// on the interface handles are thread-safe.
unsafe impl Send for WinUsbTransport {}
unsafe impl Sync for WinUsbTransport {}

impl WinUsbTransport {
    fn open(found: &FoundDevice, wanted: &[u8]) -> Result<Self> {
        let candidate = candidates()?
            .into_iter()
            .find(|c| c.id == found.id() && c.location == found.location())
            .ok_or_else(|| {
                Error::Sys(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("device {} is gone from {}", found.id(), found.location()),
                ))
            })?;
        let wide: Vec<u16> = candidate.path.encode_utf16().chain(Some(0)).collect();
        // SAFETY: wide is NUL-terminated and outlives the call
        let file = unsafe {
            CreateFileW(
                PCWSTR(wide.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                None,
            )
        }?;
        let mut transport = Self {
            token: Arc::new(AbortToken::new()),
            file,
            location: found.location(),
            interfaces: Vec::with_capacity(wanted.len()),
            pipes: Vec::new(),
            closed: false,
        };
        // On failure, Drop frees whatever was initialized so far.
        for &number in wanted {
            transport.initialize(number)?;
        }
        transport.set_timeout(0, consts::CONTROL_TIMEOUT_MS);
        let out_pipes: Vec<u8> = transport
            .pipes
            .iter()
            .map(|&(pipe, _)| pipe)
            .filter(|pipe| pipe & 0x80 == 0)
            .collect();
        for pipe in out_pipes {
            transport.set_timeout(pipe, consts::WRITE_TIMEOUT_MS);
        }
        Ok(transport)
    }

    fn initialize(&mut self, number: u8) -> Result<()> {
        let mut handle = WINUSB_INTERFACE_HANDLE::default();
        match self.interfaces.first() {
            // SAFETY: file is an open device handle; handle is written on success
            None => unsafe { WinUsb_Initialize(self.file, &mut handle) }?,
            Some(&(_, first)) => {
                // Associated interfaces are indexed from the one after the first
                let index = number.checked_sub(1).ok_or_else(|| {
                    Error::InvalidArgument(format!("interface {} initialized twice", number))
                })?;
                // SAFETY: first is a live interface handle
                unsafe { WinUsb_GetAssociatedInterface(first.0, index, &mut handle) }?;
            }
        }
        let interface = Interface(handle);
        self.interfaces.push((number, interface));
        debug!("Initialized interface {} on {}", number, self.location);

        let mut descriptor = USB_INTERFACE_DESCRIPTOR::default();
        // SAFETY: descriptor is written on success
        unsafe { WinUsb_QueryInterfaceSettings(handle, 0, &mut descriptor) }?;
        for index in 0..descriptor.bNumEndpoints {
            let mut pipe = WINUSB_PIPE_INFORMATION::default();
            // SAFETY: index is below the endpoint count just queried
            unsafe { WinUsb_QueryPipe(handle, 0, index, &mut pipe) }?;
            trace!(
                "Interface {} pipe 0x{:02X} ({:?})",
                number,
                pipe.PipeId,
                pipe.PipeType
            );
            self.pipes.push((pipe.PipeId, interface));
        }
        Ok(())
    }

    fn set_timeout(&self, pipe: u8, timeout_ms: u32) {
        let Some(&(_, interface)) = self.interfaces.first() else {
            return;
        };
        let interface = self.pipe_interface(pipe).unwrap_or(interface);
        // SAFETY: the value is a u32 that outlives the call
        let result = unsafe {
            WinUsb_SetPipePolicy(
                interface.0,
                pipe,
                PIPE_TRANSFER_TIMEOUT,
                mem::size_of::<u32>() as u32,
                (&timeout_ms as *const u32).cast::<c_void>(),
            )
        };
        if let Err(e) = result {
            warn!(
                "Failed to set timeout on pipe 0x{:02X} of {}: {}",
                pipe, self.location, e
            );
        }
    }

    fn pipe_interface(&self, pipe: u8) -> Option<Interface> {
        self.pipes
            .iter()
            .find(|&&(id, _)| id == pipe)
            .map(|&(_, interface)| interface)
    }

    fn endpoint(&self, pipe: u8) -> Result<Interface> {
        self.pipe_interface(pipe).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "endpoint 0x{:02X} is not on an open interface of {}",
                pipe, self.location
            ))
        })
    }

    fn control_interface(&self) -> Result<Interface> {
        self.interfaces
            .first()
            .map(|&(_, interface)| interface)
            .ok_or_else(|| Error::Sys(io::Error::other("no interface initialized")))
    }

    fn control(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        let interface = self.control_interface()?;
        let length = u16::try_from(buf.len()).map_err(|_| {
            Error::InvalidArgument(format!("control transfer of {} bytes is too large", buf.len()))
        })?;
        let setup = WINUSB_SETUP_PACKET {
            RequestType: request.request_type,
            Request: request.request,
            Value: request.value,
            Index: request.index,
            Length: length,
        };
        let mut transferred = 0u32;
        // SAFETY: buf outlives the synchronous call
        unsafe {
            WinUsb_ControlTransfer(
                interface.0,
                setup,
                Some(buf),
                Some(&mut transferred),
                None,
            )
        }?;
        Ok(transferred as usize)
    }

    // Frees associated interfaces first, then the primary one, then the file.
    // Returns the first failure.
    fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        self.pipes.clear();
        while let Some((number, interface)) = self.interfaces.pop() {
            // SAFETY: handle came from WinUsb_Initialize/GetAssociatedInterface
            if let Err(e) = unsafe { WinUsb_Free(interface.0) } {
                warn!(
                    "Failed to free interface {} on {}: {}",
                    number, self.location, e
                );
                first_error.get_or_insert(Error::from(e));
                continue;
            }
            debug!("Released interface {} on {}", number, self.location);
        }
        // SAFETY: file came from CreateFileW and is closed exactly once
        if let Err(e) = unsafe { CloseHandle(self.file) } {
            first_error.get_or_insert(Error::from(e));
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Transport for WinUsbTransport {
    fn read_pipe(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let interface = self.endpoint(endpoint)?;
        let event = Event::new()?;
        let overlapped = OVERLAPPED {
            hEvent: event.0,
            ..Default::default()
        };
        let requested = buf.len();
        self.token.submit(interface, endpoint, || {
            // SAFETY: buf and overlapped stay alive and unmoved until the
            // transfer is retired by GetOverlappedResult below
            match unsafe {
                WinUsb_ReadPipe(interface.0, endpoint, Some(&mut *buf), None, Some(&overlapped))
            } {
                Ok(()) => Ok(()),
                Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => Ok(()),
                Err(e) => Err(e.into()),
            }
        })?;
        trace!("Submitted {} byte read on EP 0x{:02X}", requested, endpoint);

        let mut transferred = 0u32;
        // SAFETY: waits for the transfer submitted above; aborting the pipe
        // completes it, so this returns only once the kernel is done with buf
        let result =
            unsafe { WinUsb_GetOverlappedResult(interface.0, &overlapped, &mut transferred, true) };
        self.token.finish();
        match result {
            Ok(()) => Ok(transferred as usize),
            Err(e) if e.code() == ERROR_OPERATION_ABORTED.to_hresult() => {
                if transferred > 0 {
                    // Data that landed before the abort took effect is still data
                    Ok(transferred as usize)
                } else if self.token.is_armed() {
                    Err(Error::Interrupted)
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_pipe(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let interface = self.endpoint(endpoint)?;
        let mut written = 0u32;
        // SAFETY: synchronous call, data outlives it
        unsafe { WinUsb_WritePipe(interface.0, endpoint, data, Some(&mut written), None) }?;
        Ok(written as usize)
    }

    fn control_in(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        self.control(request, buf)
    }

    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize> {
        let mut owned = data.to_vec();
        self.control(request, &mut owned)
    }

    fn cancellation(&self) -> Arc<dyn CancellationToken> {
        self.token.clone()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.release_all()
    }
}

impl Drop for WinUsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error releasing {}: {}", self.location, e);
        }
    }
}
