//! Scripted in-memory transport shared by the integration tests.
#![allow(dead_code)]

use ftdirect::{
    CancellationToken, ControlRequest, Device, DeviceId, DeviceType, Error, FoundDevice, Location,
    Result, Transport,
};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Inner {
    armed: bool,
    // Raw transfers handed out by read_pipe, in order
    reads: VecDeque<Vec<u8>>,
    // Returned when `reads` is empty instead of blocking (D2XX status packets)
    idle_transfer: Option<Vec<u8>>,
    read_calls: Vec<(u8, usize)>,
    blocked: bool,
    writes: Vec<(u8, Vec<u8>)>,
    control_replies: VecDeque<Vec<u8>>,
    controls: Vec<(ControlRequest, Vec<u8>)>,
    close_calls: usize,
    // Raw reads that have started but not yet returned
    outstanding: usize,
    outstanding_at_close: Vec<usize>,
}

/// State shared between a [`FakeTransport`] and the test driving it. Doubles
/// as the transport's cancellation token.
#[derive(Default)]
pub struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn push_read(&self, transfer: &[u8]) {
        self.lock().reads.push_back(transfer.to_vec());
        self.wake.notify_all();
    }

    pub fn set_idle_transfer(&self, transfer: &[u8]) {
        self.lock().idle_transfer = Some(transfer.to_vec());
    }

    pub fn push_control_reply(&self, reply: &[u8]) {
        self.lock().control_replies.push_back(reply.to_vec());
    }

    /// (endpoint, buffer length) of every raw read.
    pub fn read_calls(&self) -> Vec<(u8, usize)> {
        self.lock().read_calls.clone()
    }

    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn controls(&self) -> Vec<(ControlRequest, Vec<u8>)> {
        self.lock().controls.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    /// Raw reads still in flight each time the transport was closed.
    pub fn outstanding_at_close(&self) -> Vec<usize> {
        self.lock().outstanding_at_close.clone()
    }

    /// Waits until a reader is parked inside `read_pipe`.
    pub fn wait_until_blocked(&self) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.lock().blocked {
            assert!(Instant::now() < deadline, "reader never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl CancellationToken for Shared {
    fn arm(&self) -> Result<()> {
        self.lock().armed = true;
        self.wake.notify_all();
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.lock().armed
    }

    fn reset(&self) {
        self.lock().armed = false;
    }
}

pub struct FakeTransport {
    shared: Arc<Shared>,
}

fn copy_transfer(transfer: &[u8], buf: &mut [u8]) -> usize {
    let n = transfer.len().min(buf.len());
    buf[..n].copy_from_slice(&transfer[..n]);
    n
}

impl FakeTransport {
    fn raw_read(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.shared.lock();
        inner.read_calls.push((endpoint, buf.len()));
        loop {
            if let Some(transfer) = inner.reads.pop_front() {
                return Ok(copy_transfer(&transfer, buf));
            }
            let idle = inner.idle_transfer.clone();
            if let Some(transfer) = idle {
                // Status packets arrive on the device's latency timer
                drop(inner);
                thread::sleep(Duration::from_millis(1));
                return Ok(copy_transfer(&transfer, buf));
            }
            if inner.armed {
                inner.blocked = false;
                return Err(Error::Interrupted);
            }
            inner.blocked = true;
            inner = self.shared.wake.wait(inner).unwrap();
        }
    }
}

impl Transport for FakeTransport {
    fn read_pipe(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        self.shared.lock().outstanding += 1;
        let result = self.raw_read(endpoint, buf);
        self.shared.lock().outstanding -= 1;
        result
    }

    fn write_pipe(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        self.shared.lock().writes.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn control_in(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.shared.lock();
        inner.controls.push((request, buf.to_vec()));
        let reply = inner
            .control_replies
            .pop_front()
            .ok_or_else(|| Error::Sys(std::io::Error::other("no scripted control reply")))?;
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize> {
        self.shared.lock().controls.push((request, data.to_vec()));
        Ok(data.len())
    }

    fn cancellation(&self) -> Arc<dyn CancellationToken> {
        self.shared.clone()
    }

    fn close(&mut self) -> Result<()> {
        let mut inner = self.shared.lock();
        inner.close_calls += 1;
        let outstanding = inner.outstanding;
        inner.outstanding_at_close.push(outstanding);
        Ok(())
    }
}

/// Opens a device of `device_type` over a fresh fake transport.
pub fn open_fake(device_type: DeviceType) -> (Device<FakeTransport>, Arc<Shared>) {
    init_logging();
    let shared = Arc::new(Shared::default());
    let found = FoundDevice::new(
        device_type,
        DeviceId::new(0x0403, 0x6030),
        Location { bus: 1, address: 2 },
    );
    let transport = FakeTransport {
        shared: Arc::clone(&shared),
    };
    (Device::with_transport(found, transport), shared)
}
