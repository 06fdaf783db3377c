//! Fallback for targets without a USB backend. Every entry point fails with
//! `Error::Sys` carrying `io::ErrorKind::Unsupported`.

use crate::cancel::CancellationToken;
use crate::device::{DeviceFilter, FoundDevice};
use crate::error::{Error, Result};
use crate::transport::{ControlRequest, Transport};
use std::io;
use std::sync::Arc;

fn unsupported() -> Error {
    Error::Sys(io::Error::new(
        io::ErrorKind::Unsupported,
        "no USB backend for this platform",
    ))
}

pub fn find(_filters: &[DeviceFilter]) -> Result<Vec<FoundDevice>> {
    Err(unsupported())
}

pub fn open(_found: &FoundDevice) -> Result<UnsupportedTransport> {
    Err(unsupported())
}

pub fn open_unclaimed(_found: &FoundDevice) -> Result<UnsupportedTransport> {
    Err(unsupported())
}

/// Uninhabited: `open` never succeeds here.
#[derive(Debug)]
pub enum UnsupportedTransport {}

impl Transport for UnsupportedTransport {
    fn read_pipe(&self, _endpoint: u8, _buf: &mut [u8]) -> Result<usize> {
        match *self {}
    }

    fn write_pipe(&self, _endpoint: u8, _data: &[u8]) -> Result<usize> {
        match *self {}
    }

    fn control_in(&self, _request: ControlRequest, _buf: &mut [u8]) -> Result<usize> {
        match *self {}
    }

    fn control_out(&self, _request: ControlRequest, _data: &[u8]) -> Result<usize> {
        match *self {}
    }

    fn cancellation(&self) -> Arc<dyn CancellationToken> {
        match *self {}
    }

    fn close(&mut self) -> Result<()> {
        match *self {}
    }
}
