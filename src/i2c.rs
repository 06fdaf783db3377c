//! FT260 I2C master over HID reports.
//!
//! Writes are split into 64-byte output reports (`0xDE`, address, flags,
//! length, up to 60 payload bytes). Reads are a single read-request report
//! (`0xC2`) answered by a stream of input reports with ids `0xD0..=0xDE`,
//! each carrying up to 62 bytes.

use crate::consts::ft260::{self, i2c};
use crate::device::{Device, Endpoint};
use crate::error::{invalid_address, Error, Result};
use crate::transport::Transport;
use bitflags::bitflags;
use log::{debug, trace};

bitflags! {
    /// Bus conditions requested in an I2C report header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct I2cFlags: u8 {
        const START = 0x02;
        const REPEATED_START = 0x03;
        const STOP = 0x04;
    }
}

fn check_address(addr: u8) -> Result<()> {
    if addr > i2c::MAX_ADDRESS {
        return Err(invalid_address(addr));
    }
    Ok(())
}

fn check_read_len(len: usize) -> Result<u16> {
    match u16::try_from(len) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidArgument(format!(
            "I2C read length {} out of range (1-65535)",
            len
        ))),
    }
}

// --- Write path ---

/// One output report of a chunked I2C write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cWriteChunk {
    report: [u8; ft260::REPORT_SIZE],
}

impl I2cWriteChunk {
    /// The full report as sent on the wire.
    pub fn report(&self) -> &[u8; ft260::REPORT_SIZE] {
        &self.report
    }

    pub fn address(&self) -> u8 {
        self.report[1]
    }

    pub fn flags(&self) -> I2cFlags {
        I2cFlags::from_bits_retain(self.report[2])
    }

    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.report[3]);
        &self.report[i2c::WRITE_HEADER_SIZE..i2c::WRITE_HEADER_SIZE + len]
    }
}

/// Streams a write as report-sized chunks without building them up front.
///
/// The control bytes and the data bytes form one logical stream. The first
/// chunk carries START and, unless disabled with [`WriteChunks::without_stop`],
/// the last chunk carries STOP.
#[derive(Debug, Clone)]
pub struct WriteChunks<'a> {
    addr: u8,
    parts: [&'a [u8]; 2],
    total: usize,
    cursor: usize,
    stop: bool,
}

impl<'a> WriteChunks<'a> {
    /// Fails with `InvalidArgument` for a non-7-bit address or an empty stream.
    pub fn new(addr: u8, ctrl: &'a [u8], data: &'a [u8]) -> Result<Self> {
        check_address(addr)?;
        let total = ctrl.len() + data.len();
        if total == 0 {
            return Err(Error::InvalidArgument(
                "I2C write needs at least one byte".to_string(),
            ));
        }
        Ok(Self {
            addr,
            parts: [ctrl, data],
            total,
            cursor: 0,
            stop: true,
        })
    }

    /// Leaves the bus claimed after the last chunk (no STOP).
    pub fn without_stop(mut self) -> Self {
        self.stop = false;
        self
    }

    // Copies stream bytes starting at `offset` until `out` is full.
    fn fill(&self, mut offset: usize, out: &mut [u8]) {
        let mut written = 0;
        for part in self.parts {
            if offset >= part.len() {
                offset -= part.len();
                continue;
            }
            let n = (part.len() - offset).min(out.len() - written);
            out[written..written + n].copy_from_slice(&part[offset..offset + n]);
            written += n;
            offset = 0;
            if written == out.len() {
                break;
            }
        }
    }
}

impl Iterator for WriteChunks<'_> {
    type Item = I2cWriteChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.total {
            return None;
        }
        let take = (self.total - self.cursor).min(i2c::WRITE_PAYLOAD_SIZE);
        let mut flags = I2cFlags::empty();
        if self.cursor == 0 {
            flags |= I2cFlags::START;
        }
        if self.stop && self.cursor + take == self.total {
            flags |= I2cFlags::STOP;
        }

        // Fresh report per chunk: no byte of a longer previous chunk survives.
        let mut report = [0u8; ft260::REPORT_SIZE];
        report[0] = i2c::REPORT_ID_WRITE;
        report[1] = self.addr;
        report[2] = flags.bits();
        report[3] = take as u8;
        self.fill(
            self.cursor,
            &mut report[i2c::WRITE_HEADER_SIZE..i2c::WRITE_HEADER_SIZE + take],
        );
        self.cursor += take;
        Some(I2cWriteChunk { report })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.cursor).div_ceil(i2c::WRITE_PAYLOAD_SIZE);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WriteChunks<'_> {}

// --- Read path ---

/// Builds the report asking the bridge to read `len` bytes from `addr`.
pub fn read_request(addr: u8, len: u16) -> Result<[u8; ft260::REPORT_SIZE]> {
    check_address(addr)?;
    if len == 0 {
        return Err(Error::InvalidArgument(
            "I2C read length must be non-zero".to_string(),
        ));
    }
    let mut report = [0u8; ft260::REPORT_SIZE];
    report[0] = i2c::REPORT_ID_READ_REQUEST;
    report[1] = addr;
    report[2] = (I2cFlags::START | I2cFlags::STOP).bits();
    report[3..5].copy_from_slice(&len.to_le_bytes());
    Ok(report)
}

/// One I2C input report as returned by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cInputReport {
    report_id: u8,
    data: heapless::Vec<u8, { i2c::INPUT_PAYLOAD_SIZE }>,
}

impl I2cInputReport {
    /// Decodes a raw input report. Reports outside the I2C id range yield
    /// `None`; a report too short to hold its declared length is `Io`.
    pub fn parse(raw: &[u8]) -> Result<Option<Self>> {
        let Some(&report_id) = raw.first() else {
            return Err(Error::Io("empty input report".to_string()));
        };
        if !(i2c::REPORT_ID_INPUT_FIRST..=i2c::REPORT_ID_INPUT_LAST).contains(&report_id) {
            trace!("Skipping non-I2C input report 0x{:02X}", report_id);
            return Ok(None);
        }
        let Some(&declared) = raw.get(1) else {
            return Err(Error::Io(format!(
                "I2C input report 0x{:02X} has no length byte",
                report_id
            )));
        };
        let declared = usize::from(declared);
        let payload = &raw[i2c::INPUT_HEADER_SIZE..];
        if declared > payload.len() || declared > i2c::INPUT_PAYLOAD_SIZE {
            return Err(Error::Io(format!(
                "I2C input report declares {} bytes but carries {}",
                declared,
                payload.len()
            )));
        }
        let data = heapless::Vec::from_slice(&payload[..declared])
            .map_err(|_| Error::Io("I2C input report payload overflow".to_string()))?;
        Ok(Some(Self { report_id, data }))
    }

    pub fn report_id(&self) -> u8 {
        self.report_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Collects I2C input reports into a caller buffer, truncating the final
/// chunk so no more than the buffer's length is ever written.
#[derive(Debug)]
pub struct I2cReadAccumulator<'a> {
    out: &'a mut [u8],
    filled: usize,
}

impl<'a> I2cReadAccumulator<'a> {
    pub fn new(out: &'a mut [u8]) -> Self {
        Self { out, filled: 0 }
    }

    /// Appends a report's data; returns how many bytes were kept.
    pub fn push(&mut self, report: &I2cInputReport) -> usize {
        let take = report.data().len().min(self.out.len() - self.filled);
        self.out[self.filled..self.filled + take].copy_from_slice(&report.data()[..take]);
        self.filled += take;
        take
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.out.len()
    }
}

// --- Device operations ---

impl<T: Transport> Device<T> {
    /// Writes `ctrl` followed by `data` to `addr` as one I2C transaction.
    ///
    /// Either part may be absent but not both. The address is checked before
    /// any report is sent.
    pub fn i2c_write(&self, addr: u8, ctrl: Option<&[u8]>, data: Option<&[u8]>) -> Result<()> {
        self.require_ft260("I2C")?;
        let chunks = WriteChunks::new(addr, ctrl.unwrap_or(&[]), data.unwrap_or(&[]))?;
        self.send_chunks(chunks)
    }

    fn send_chunks(&self, chunks: WriteChunks<'_>) -> Result<()> {
        debug!(
            "I2C write to 0x{:02X}: {} bytes in {} report(s)",
            chunks.addr,
            chunks.total,
            chunks.len()
        );
        for chunk in chunks {
            trace!("I2C write report: {:02X?}", &chunk.report()[..]);
            self.write(Endpoint::Io, chunk.report())?;
        }
        Ok(())
    }

    /// Reads `out.len()` bytes from `addr`, optionally writing `ctrl` first
    /// (START without STOP) to select a register or offset.
    ///
    /// Blocks until every byte has arrived; interruptible like
    /// [`Device::read`]. `out` must hold 1 to 65535 bytes.
    pub fn i2c_read(&self, addr: u8, ctrl: Option<&[u8]>, out: &mut [u8]) -> Result<()> {
        self.require_ft260("I2C")?;
        check_address(addr)?;
        let len = check_read_len(out.len())?;

        if let Some(ctrl) = ctrl.filter(|c| !c.is_empty()) {
            self.send_chunks(WriteChunks::new(addr, ctrl, &[])?.without_stop())?;
        }
        self.i2c_read_request(addr, len)?;

        let mut acc = I2cReadAccumulator::new(out);
        while !acc.is_complete() {
            if let Some(report) = self.read_i2c_report()? {
                acc.push(&report);
            }
        }
        debug!("I2C read from 0x{:02X}: {} bytes", addr, acc.filled());
        Ok(())
    }

    /// Sends only the read-request report; pair with [`Device::read_i2c_report`].
    pub fn i2c_read_request(&self, addr: u8, len: u16) -> Result<()> {
        self.require_ft260("I2C")?;
        let report = read_request(addr, len)?;
        trace!("I2C read request: {:02X?}", &report[..]);
        self.write(Endpoint::Io, &report)?;
        Ok(())
    }

    /// Blocks for one input report. Returns `None` for reports that are not
    /// I2C data (e.g. GPIO or UART reports).
    pub fn read_i2c_report(&self) -> Result<Option<I2cInputReport>> {
        self.require_ft260("I2C")?;
        let mut raw = [0u8; ft260::REPORT_SIZE];
        let received = self.read(Endpoint::Io, &mut raw)?;
        I2cInputReport::parse(&raw[..received])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_has_start_and_stop() {
        let chunks: Vec<_> = WriteChunks::new(0x50, &[0x00], &[]).unwrap().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].flags(), I2cFlags::START | I2cFlags::STOP);
        assert_eq!(&chunks[0].report()[..5], &[0xDE, 0x50, 0x06, 0x01, 0x00]);
    }

    #[test]
    fn chunk_count_and_flags() {
        let data: Vec<u8> = (0..130).map(|i| i as u8).collect();
        let chunks = WriteChunks::new(0x20, &data[..3], &data[3..]).unwrap();
        assert_eq!(chunks.len(), 3);
        let chunks: Vec<_> = chunks.collect();
        assert_eq!(chunks[0].flags(), I2cFlags::START);
        assert_eq!(chunks[1].flags(), I2cFlags::empty());
        assert_eq!(chunks[2].flags(), I2cFlags::STOP);
        assert_eq!(chunks[2].payload().len(), 10);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.payload().to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn exact_multiples_of_chunk_size() {
        let one: Vec<_> = WriteChunks::new(0x20, &[], &[0x11; 60])
            .unwrap()
            .collect();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].flags(), I2cFlags::START | I2cFlags::STOP);
        assert_eq!(one[0].payload().len(), 60);

        let two = WriteChunks::new(0x20, &[0x01; 20], &[0x22; 100]).unwrap();
        assert_eq!(two.len(), 2);
        let two: Vec<_> = two.collect();
        assert_eq!(two[0].flags(), I2cFlags::START);
        assert_eq!(two[1].flags(), I2cFlags::STOP);
        assert_eq!(two[0].payload().len(), 60);
        assert_eq!(two[1].payload(), &[0x22; 60]);
    }

    #[test]
    fn short_last_chunk_has_no_stale_bytes() {
        let data = [0xAA; 61];
        let chunks: Vec<_> = WriteChunks::new(0x20, &[], &data).unwrap().collect();
        assert_eq!(chunks[1].payload(), &[0xAA]);
        assert!(chunks[1].report()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn without_stop_omits_stop() {
        let chunks: Vec<_> = WriteChunks::new(0x20, &[1, 2], &[])
            .unwrap()
            .without_stop()
            .collect();
        assert_eq!(chunks[0].flags(), I2cFlags::START);
    }

    #[test]
    fn rejects_bad_writes() {
        assert!(matches!(
            WriteChunks::new(0x80, &[1], &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            WriteChunks::new(0x10, &[], &[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_request_layout() {
        let report = read_request(0x50, 256).unwrap();
        assert_eq!(&report[..5], &[0xC2, 0x50, 0x06, 0x00, 0x01]);
        assert!(report[5..].iter().all(|&b| b == 0));
        assert!(read_request(0x50, 0).is_err());
        assert!(read_request(0xFF, 1).is_err());
    }

    #[test]
    fn read_length_bounds() {
        assert!(check_read_len(0).is_err());
        assert_eq!(check_read_len(65535).unwrap(), 65535);
        assert!(check_read_len(65536).is_err());
    }

    #[test]
    fn input_report_parsing() {
        let report = I2cInputReport::parse(&[0xD3, 0x02, 0x11, 0x22, 0x33])
            .unwrap()
            .unwrap();
        assert_eq!(report.report_id(), 0xD3);
        assert_eq!(report.data(), &[0x11, 0x22]);

        assert!(I2cInputReport::parse(&[0xB0, 0x00]).unwrap().is_none());
        assert!(matches!(
            I2cInputReport::parse(&[0xD0, 0x05, 0x01]),
            Err(Error::Io(_))
        ));
        assert!(matches!(I2cInputReport::parse(&[0xD0]), Err(Error::Io(_))));
    }

    #[test]
    fn accumulator_truncates_final_chunk() {
        let mut out = [0u8; 4];
        let mut acc = I2cReadAccumulator::new(&mut out);
        let first = I2cInputReport::parse(&[0xD0, 3, 1, 2, 3]).unwrap().unwrap();
        let second = I2cInputReport::parse(&[0xD0, 3, 4, 5, 6]).unwrap().unwrap();
        assert_eq!(acc.push(&first), 3);
        assert!(!acc.is_complete());
        assert_eq!(acc.push(&second), 1);
        assert!(acc.is_complete());
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
