//! Stream framing per device type, driven through a scripted transport.

mod common;

use common::open_fake;
use ftdirect::{DeviceType, Endpoint, Error};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn d2xx_skips_status_only_transfers() {
    let (device, fake) = open_fake(DeviceType::D2xx);
    fake.push_read(&[0x01, 0x60]);
    fake.push_read(&[0x01, 0x60]);
    fake.push_read(&[0x01, 0x60, 0xAA, 0xBB, 0xCC]);
    fake.push_read(&[0x01, 0x60]);
    fake.push_read(&[0x01, 0x60, 1, 2, 3, 4, 5]);

    let mut buf = [0u8; 64];
    assert_eq!(device.read(Endpoint::Io, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], &[0xAA, 0xBB, 0xCC]);
    assert_eq!(device.read(Endpoint::Io, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);

    // Every raw transfer asks for the payload plus the 2-byte header
    let calls = fake.read_calls();
    assert_eq!(calls.len(), 5);
    assert!(calls.iter().all(|&call| call == (0x81, 66)));
}

#[test]
fn d2xx_interrupt_is_seen_between_status_packets() {
    let (device, fake) = open_fake(DeviceType::D2xx);
    fake.set_idle_transfer(&[0x01, 0x60]);
    let interrupter = device.interrupter();

    let start = Instant::now();
    let result = thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 16];
            device.read(Endpoint::Io, &mut buf)
        });
        // The read resets the token when it starts; keep poking until it ends
        while !reader.is_finished() {
            thread::sleep(Duration::from_millis(10));
            interrupter.interrupt().unwrap();
        }
        reader.join().unwrap()
    });
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(fake.read_calls().len() > 1);
}

#[test]
fn d3xx_triggers_every_read() {
    let (device, fake) = open_fake(DeviceType::D3xx);
    fake.push_read(&[9; 10]);
    fake.push_read(&[7; 300]);

    let mut buf = [0u8; 16];
    assert_eq!(device.read(Endpoint::Io, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], &[9; 10]);
    let mut big = [0u8; 300];
    assert_eq!(device.read(Endpoint::Io, &mut big).unwrap(), 300);

    let writes = fake.writes();
    assert_eq!(writes.len(), 2);
    let (ep, trigger) = &writes[0];
    assert_eq!(*ep, 0x01);
    assert_eq!(
        trigger.as_slice(),
        &[0, 0, 0, 0, 0x82, 0x01, 0, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(&writes[1].1[8..12], &300u32.to_le_bytes());
    assert_eq!(fake.read_calls(), vec![(0x82, 16), (0x82, 300)]);
}

#[test]
fn ft260_reports_pass_through() {
    let (device, fake) = open_fake(DeviceType::Ft260);
    fake.push_read(&[0xD0, 0x02, 0x12, 0x34]);
    let mut buf = [0u8; 64];
    assert_eq!(device.read(Endpoint::Io, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], &[0xD0, 0x02, 0x12, 0x34]);
    assert_eq!(fake.read_calls(), vec![(0x81, 64)]);
}

#[test]
fn writes_go_to_the_out_pipe() {
    for device_type in [DeviceType::D2xx, DeviceType::D3xx, DeviceType::Ft260] {
        let (device, fake) = open_fake(device_type);
        assert_eq!(device.write(Endpoint::Io, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(fake.writes(), vec![(0x02, vec![1, 2, 3])]);
    }
}

#[test]
fn empty_read_buffer_is_rejected_before_io() {
    let (device, fake) = open_fake(DeviceType::D2xx);
    let mut empty = [0u8; 0];
    assert!(matches!(
        device.read(Endpoint::Io, &mut empty),
        Err(Error::InvalidArgument(_))
    ));
    assert!(fake.read_calls().is_empty());
}

#[test]
fn feature_endpoint_is_ft260_only() {
    let (device, fake) = open_fake(DeviceType::D3xx);
    let mut buf = [0xB0, 0, 0, 0];
    assert!(matches!(
        device.read(Endpoint::Feature, &mut buf),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        device.write(Endpoint::Feature, &[0xA1, 0x22]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(fake.controls().is_empty());
}
