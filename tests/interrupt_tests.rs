//! Cross-thread cancellation of blocked reads and teardown afterwards.

mod common;

use common::open_fake;
use ftdirect::{DeviceType, Endpoint, Error};
use std::thread;
use std::time::{Duration, Instant};

const BOUND: Duration = Duration::from_secs(2);

#[test]
fn blocked_read_returns_interrupted() {
    for device_type in [DeviceType::D3xx, DeviceType::Ft260] {
        let (device, fake) = open_fake(device_type);
        let start = Instant::now();
        let result = thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut buf = [0u8; 64];
                device.read(Endpoint::Io, &mut buf)
            });
            fake.wait_until_blocked();
            device.interrupt().unwrap();
            reader.join().unwrap()
        });
        assert!(matches!(result, Err(Error::Interrupted)), "{:?}", device_type);
        assert!(start.elapsed() < BOUND);
    }
}

#[test]
fn interrupter_handle_works_from_another_thread() {
    let (device, fake) = open_fake(DeviceType::Ft260);
    let interrupter = device.interrupter();
    let poker = thread::spawn({
        let fake = fake.clone();
        move || {
            fake.wait_until_blocked();
            interrupter.interrupt().unwrap();
        }
    });
    let mut buf = [0u8; 64];
    let err = device.read(Endpoint::Io, &mut buf).unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(err.code(), 3);
    poker.join().unwrap();
}

#[test]
fn next_read_starts_clean_after_interrupt() {
    let (device, fake) = open_fake(DeviceType::Ft260);
    // No read in flight: only arms the flag, which the next read clears
    device.interrupt().unwrap();
    fake.push_read(&[0xD0, 0x01, 0x42]);
    let mut buf = [0u8; 64];
    assert_eq!(device.read(Endpoint::Io, &mut buf).unwrap(), 3);
}

#[test]
fn close_after_interrupted_read_releases_once() {
    let (device, fake) = open_fake(DeviceType::D3xx);
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 8];
            device.read(Endpoint::Io, &mut buf)
        });
        fake.wait_until_blocked();
        device.interrupt().unwrap();
        assert!(reader.join().unwrap().unwrap_err().is_interrupted());
    });
    let interrupter = device.interrupter();
    device.close().unwrap();
    assert_eq!(fake.close_calls(), 1);
    // The interrupted transfer was retired before the handle went away
    assert_eq!(fake.outstanding_at_close(), vec![0]);

    // The handle outlives the device
    interrupter.interrupt().unwrap();
    assert_eq!(fake.close_calls(), 1);
}

#[test]
fn drop_closes_exactly_once() {
    let (device, fake) = open_fake(DeviceType::D2xx);
    drop(device);
    assert_eq!(fake.close_calls(), 1);
    assert_eq!(fake.outstanding_at_close(), vec![0]);
}

#[test]
fn timed_out_read_is_retired_before_close() {
    let (device, fake) = open_fake(DeviceType::Ft260);
    let mut buf = [0u8; 64];
    let result = device.read_timeout(Endpoint::Io, &mut buf, Duration::from_millis(20));
    assert!(matches!(result, Err(Error::Interrupted)));
    device.close().unwrap();
    assert_eq!(fake.outstanding_at_close(), vec![0]);
}

#[test]
fn read_timeout_expires_with_interrupted() {
    let (device, _fake) = open_fake(DeviceType::Ft260);
    let mut buf = [0u8; 64];
    let start = Instant::now();
    let result = device.read_timeout(Endpoint::Io, &mut buf, Duration::from_millis(50));
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(start.elapsed() < BOUND);
}

#[test]
fn read_timeout_returns_data_in_time() {
    let (device, fake) = open_fake(DeviceType::D2xx);
    fake.push_read(&[0x01, 0x60, 0x55]);
    let mut buf = [0u8; 4];
    let n = device
        .read_timeout(Endpoint::Io, &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!(&buf[..n], &[0x55]);
}

#[test]
fn zero_timeout_still_returns() {
    let (device, _fake) = open_fake(DeviceType::D3xx);
    let mut buf = [0u8; 4];
    let start = Instant::now();
    let result = device.read_timeout(Endpoint::Io, &mut buf, Duration::ZERO);
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(start.elapsed() < BOUND);
}
