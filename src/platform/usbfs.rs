//! Linux backend on top of usbfs (`/dev/bus/usb/BBB/DDD`).
//!
//! IN transfers are submitted as asynchronous URBs. The reading thread then
//! polls the device fd together with the read end of a self-pipe; the
//! interrupting thread writes one byte into the pipe. A cancelled URB is
//! discarded and reaped before `read_pipe` returns, so the caller's buffer is
//! never referenced by the kernel afterwards.
//!
//! OUT and control transfers use the synchronous ioctls with a timeout.

use crate::cancel::CancellationToken;
use crate::consts::{self, d2xx, d3xx, ft260, usb};
use crate::device::{DeviceFilter, DeviceId, DeviceType, FoundDevice, Location};
use crate::error::{Error, Result};
use crate::transport::{ControlRequest, Transport};
use libc::{c_int, c_uint, c_void};
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const USBFS_ROOT: &str = "/dev/bus/usb";

/// usbfs ioctl definitions (linux/usbdevice_fs.h)
mod sys {
    use libc::{c_int, c_uint, c_void};
    use nix::{
        ioctl_read, ioctl_read_bad, ioctl_readwrite, ioctl_write_ptr_bad, request_code_none,
        request_code_write,
    };

    pub const URB_TYPE_INTERRUPT: u8 = 1;
    pub const URB_TYPE_BULK: u8 = 3;

    /// `USBDEVFS_CONNECT`, only ever passed through `USBDEVFS_IOCTL`.
    pub const CONNECT: c_int = request_code_none!(b'U', 23) as c_int;

    #[repr(C)]
    pub struct CtrlTransfer {
        pub request_type: u8,
        pub request: u8,
        pub value: u16,
        pub index: u16,
        pub length: u16,
        pub timeout: u32,
        pub data: *mut c_void,
    }

    #[repr(C)]
    pub struct BulkTransfer {
        pub ep: c_uint,
        pub len: c_uint,
        pub timeout: c_uint,
        pub data: *mut c_void,
    }

    #[repr(C)]
    pub struct Urb {
        pub urb_type: u8,
        pub endpoint: u8,
        pub status: c_int,
        pub flags: c_uint,
        pub buffer: *mut c_void,
        pub buffer_length: c_int,
        pub actual_length: c_int,
        pub start_frame: c_int,
        pub number_of_packets: c_int,
        pub error_count: c_int,
        pub signr: c_uint,
        pub usercontext: *mut c_void,
    }

    #[repr(C)]
    pub struct IoctlRequest {
        pub ifno: c_int,
        pub ioctl_code: c_int,
        pub data: *mut c_void,
    }

    #[repr(C)]
    pub struct DisconnectClaim {
        pub interface: c_uint,
        pub flags: c_uint,
        pub driver: [u8; 256],
    }

    ioctl_readwrite!(control, b'U', 0, CtrlTransfer);
    ioctl_readwrite!(bulk, b'U', 2, BulkTransfer);
    ioctl_read!(submit_urb, b'U', 10, Urb);
    // DISCARDURB is _IO but takes the URB address as its argument
    ioctl_write_ptr_bad!(discard_urb, request_code_none!(b'U', 11), Urb);
    ioctl_read_bad!(
        reap_urb,
        request_code_write!(b'U', 12, std::mem::size_of::<*mut c_void>()),
        *mut Urb
    );
    ioctl_read!(claim_interface, b'U', 15, c_uint);
    ioctl_read!(release_interface, b'U', 16, c_uint);
    ioctl_readwrite!(usb_ioctl, b'U', 18, IoctlRequest);
    ioctl_read!(disconnect_claim, b'U', 27, DisconnectClaim);
}

// --- Cancellation ---

/// Flag plus self-pipe. Arming writes one byte so a thread parked in `poll`
/// wakes up; resetting drains whatever is left.
#[derive(Debug)]
pub struct PipeToken {
    armed: AtomicBool,
    rx: File,
    tx: File,
}

impl PipeToken {
    pub fn new() -> Result<Self> {
        let (rx, tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            armed: AtomicBool::new(false),
            rx: File::from(rx),
            tx: File::from(tx),
        })
    }

    fn wake_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

impl CancellationToken for PipeToken {
    fn arm(&self) -> Result<()> {
        self.armed.store(true, Ordering::Release);
        match (&self.tx).write(&[1]) {
            Ok(_) => Ok(()),
            // Pipe already full: a wake-up is pending anyway
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    // Drain before clearing: an `arm` racing with this leaves its byte in the
    // pipe, so an armed token always has a wake-up pending.
    fn reset(&self) {
        let mut sink = [0u8; 64];
        while let Ok(n) = (&self.rx).read(&mut sink) {
            if n == 0 {
                break;
            }
        }
        self.armed.store(false, Ordering::Release);
    }
}

// --- Enumeration ---

fn device_path(location: Location) -> PathBuf {
    Path::new(USBFS_ROOT).join(format!("{:03}/{:03}", location.bus, location.address))
}

fn parse_number(name: &OsStr) -> Option<u16> {
    name.to_str()?.parse().ok()
}

/// Extracts vendor/product from a raw 18-byte device descriptor.
fn parse_device_descriptor(raw: &[u8]) -> Option<DeviceId> {
    if raw.len() < usb::DEVICE_DESCRIPTOR_SIZE || raw[1] != usb::DT_DEVICE {
        return None;
    }
    Some(DeviceId::new(
        u16::from_le_bytes([raw[8], raw[9]]),
        u16::from_le_bytes([raw[10], raw[11]]),
    ))
}

fn read_device_id(path: &Path) -> io::Result<Option<DeviceId>> {
    let mut raw = [0u8; usb::DEVICE_DESCRIPTOR_SIZE];
    File::open(path)?.read_exact(&mut raw)?;
    Ok(parse_device_descriptor(&raw))
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<(u16, PathBuf)>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .flatten()
        .filter_map(|entry| Some((parse_number(&entry.file_name())?, entry.path())))
        .collect();
    entries.sort_by_key(|(number, _)| *number);
    Ok(entries)
}

pub fn find(filters: &[DeviceFilter]) -> Result<Vec<FoundDevice>> {
    find_in(Path::new(USBFS_ROOT), filters)
}

fn find_in(root: &Path, filters: &[DeviceFilter]) -> Result<Vec<FoundDevice>> {
    let mut found = Vec::new();
    for (bus, bus_path) in sorted_entries(root)? {
        let devices = match sorted_entries(&bus_path) {
            Ok(devices) => devices,
            Err(e) => {
                debug!("Skipping bus {}: {}", bus_path.display(), e);
                continue;
            }
        };
        for (address, path) in devices {
            let id = match read_device_id(&path) {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!("Skipping {}: not a device descriptor", path.display());
                    continue;
                }
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Some(filter) = filters.iter().find(|f| f.matches(id)) {
                let location = Location { bus, address };
                debug!(
                    "Found {} device {} at {}",
                    filter.device_type, id, location
                );
                found.push(FoundDevice::new(filter.device_type, id, location));
            }
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

/// Opens `found` and claims the interfaces its device type uses.
pub fn open(found: &FoundDevice) -> Result<UsbfsTransport> {
    UsbfsTransport::open(found, interfaces(found.device_type()))
}

/// Opens `found` without claiming anything; enough for standard control
/// requests such as GET_DESCRIPTOR.
pub fn open_unclaimed(found: &FoundDevice) -> Result<UsbfsTransport> {
    UsbfsTransport::open(found, &[])
}

/// Handle on one usbfs device node.
///
/// Fields drop in declaration order: interfaces are released in `Drop`, then
/// the self-pipe, then the device node.
#[derive(Debug)]
pub struct UsbfsTransport {
    token: Arc<PipeToken>,
    file: File,
    location: Location,
    in_urb_type: u8,
    claimed: Vec<u8>,
    closed: bool,
}

enum Wake {
    Completed,
    Cancelled,
}

impl UsbfsTransport {
    fn open(found: &FoundDevice, interfaces: &[u8]) -> Result<Self> {
        let path = device_path(found.location());
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let in_urb_type = match found.device_type() {
            DeviceType::Ft260 => sys::URB_TYPE_INTERRUPT,
            DeviceType::D2xx | DeviceType::D3xx => sys::URB_TYPE_BULK,
        };
        let token = Arc::new(PipeToken::new()?);
        let mut transport = Self {
            token,
            file,
            location: found.location(),
            in_urb_type,
            claimed: Vec::with_capacity(interfaces.len()),
            closed: false,
        };
        // On failure, Drop releases whatever was claimed so far.
        for &interface in interfaces {
            transport.claim(interface)?;
        }
        Ok(transport)
    }

    fn fd(&self) -> c_int {
        self.file.as_raw_fd()
    }

    fn claim(&mut self, interface: u8) -> Result<()> {
        let mut request = sys::DisconnectClaim {
            interface: c_uint::from(interface),
            flags: 0,
            driver: [0; 256],
        };
        // SAFETY: request outlives the call and matches the kernel layout
        match unsafe { sys::disconnect_claim(self.fd(), &mut request) } {
            Ok(_) => {}
            Err(Errno::ENOTTY) => {
                // Kernel without DISCONNECT_CLAIM: plain claim, no driver detach
                let mut number = c_uint::from(interface);
                // SAFETY: as above
                unsafe { sys::claim_interface(self.fd(), &mut number) }?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!("Claimed interface {} on {}", interface, self.location);
        self.claimed.push(interface);
        Ok(())
    }

    // Releases in reverse claim order and hands each interface back to its
    // kernel driver. Returns the first release failure.
    fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(interface) = self.claimed.pop() {
            let mut number = c_uint::from(interface);
            // SAFETY: number outlives the call
            if let Err(e) = unsafe { sys::release_interface(self.fd(), &mut number) } {
                warn!(
                    "Failed to release interface {} on {}: {}",
                    interface, self.location, e
                );
                first_error.get_or_insert(Error::from(e));
                continue;
            }
            let mut request = sys::IoctlRequest {
                ifno: c_int::from(interface),
                ioctl_code: sys::CONNECT,
                data: ptr::null_mut(),
            };
            // SAFETY: request outlives the call; CONNECT takes no data
            if let Err(e) = unsafe { sys::usb_ioctl(self.fd(), &mut request) } {
                warn!(
                    "Failed to reattach kernel driver to interface {} on {}: {}",
                    interface, self.location, e
                );
            }
            debug!("Released interface {} on {}", interface, self.location);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn wait(&self) -> Result<Wake> {
        let mut fds = [
            PollFd::new(self.file.as_fd(), PollFlags::POLLOUT),
            PollFd::new(self.token.wake_fd(), PollFlags::POLLIN),
        ];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let device_ready = fds[0].revents().is_some_and(|r| {
            r.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP)
        });
        // Completion wins over a simultaneous cancel so no data is dropped.
        Ok(if device_ready {
            Wake::Completed
        } else {
            Wake::Cancelled
        })
    }

    fn reap(&self, urb: *mut sys::Urb) -> Result<()> {
        let mut reaped: *mut sys::Urb = ptr::null_mut();
        loop {
            // SAFETY: the kernel stores the address of a completed URB
            match unsafe { sys::reap_urb(self.fd(), &mut reaped) } {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        check_reaped(reaped, urb, self.location)
    }

    fn discard(&self, urb: *mut sys::Urb) {
        // SAFETY: the URB is still submitted and alive
        match unsafe { sys::discard_urb(self.fd(), urb) } {
            // EINVAL: already completed, reaping will pick it up
            Ok(_) | Err(Errno::EINVAL) => {}
            Err(e) => warn!("Failed to discard URB on {}: {}", self.location, e),
        }
    }
}

impl Transport for UsbfsTransport {
    fn read_pipe(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let buffer_length = c_int::try_from(buf.len()).map_err(|_| {
            Error::InvalidArgument(format!("read of {} bytes is too large", buf.len()))
        })?;
        let mut urb = sys::Urb {
            urb_type: self.in_urb_type,
            endpoint,
            status: 0,
            flags: 0,
            buffer: buf.as_mut_ptr().cast::<c_void>(),
            buffer_length,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: ptr::null_mut(),
        };
        if self.token.is_armed() {
            return Err(Error::Interrupted);
        }
        // The kernel owns the URB from submission until it is reaped; all
        // access goes through this pointer until then.
        let urb_ptr: *mut sys::Urb = &mut urb;
        // SAFETY: urb and buf stay alive and unmoved until the URB is reaped
        // below, on every path.
        unsafe { sys::submit_urb(self.fd(), urb_ptr) }?;
        trace!("Submitted {} byte URB on EP 0x{:02X}", buffer_length, endpoint);

        let wake = self.wait();
        if !matches!(wake, Ok(Wake::Completed)) {
            self.discard(urb_ptr);
        }
        self.reap(urb_ptr)?;

        // SAFETY: reaped, so the kernel is done writing
        let (status, actual_length) = unsafe { ((*urb_ptr).status, (*urb_ptr).actual_length) };
        let received = usize::try_from(actual_length).unwrap_or(0);
        match wake? {
            Wake::Completed if status == 0 => Ok(received),
            Wake::Completed => Err(Error::Sys(io::Error::from_raw_os_error(-status))),
            // Data that landed before the discard took effect is still data
            Wake::Cancelled if received > 0 => Ok(received),
            Wake::Cancelled => Err(Error::Interrupted),
        }
    }

    fn write_pipe(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        let len = c_uint::try_from(data.len()).map_err(|_| {
            Error::InvalidArgument(format!("write of {} bytes is too large", data.len()))
        })?;
        let mut transfer = sys::BulkTransfer {
            ep: c_uint::from(endpoint),
            len,
            timeout: consts::WRITE_TIMEOUT_MS,
            // The kernel only reads from an OUT buffer
            data: data.as_ptr().cast_mut().cast::<c_void>(),
        };
        // SAFETY: transfer and data outlive the synchronous call
        let sent = unsafe { sys::bulk(self.fd(), &mut transfer) }?;
        Ok(sent as usize)
    }

    fn control_in(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        control(self.fd(), request, buf.as_mut_ptr().cast::<c_void>(), buf.len())
    }

    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize> {
        control(
            self.fd(),
            request,
            data.as_ptr().cast_mut().cast::<c_void>(),
            data.len(),
        )
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

impl Drop for UsbfsTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error releasing {}: {}", self.location, e);
        }
    }
}

// Only one URB is ever in flight per transport, so anything else coming back
// is host-side bookkeeping gone wrong.
fn check_reaped(
    reaped: *mut sys::Urb,
    submitted: *mut sys::Urb,
    location: Location,
) -> Result<()> {
    if reaped != submitted {
        return Err(Error::Sys(io::Error::other(format!(
            "reaped unexpected URB {:p} on {}",
            reaped, location
        ))));
    }
    Ok(())
}

fn control(fd: c_int, request: ControlRequest, data: *mut c_void, len: usize) -> Result<usize> {
    let length = u16::try_from(len).map_err(|_| {
        Error::InvalidArgument(format!("control transfer of {} bytes is too large", len))
    })?;
    let mut transfer = sys::CtrlTransfer {
        request_type: request.request_type,
        request: request.request,
        value: request.value,
        index: request.index,
        length,
        timeout: consts::CONTROL_TIMEOUT_MS,
        data,
    };
    // SAFETY: the caller's buffer outlives the synchronous call
    let transferred = unsafe { sys::control(fd, &mut transfer) }?;
    Ok(transferred as usize)
}
