//! Internal constants: endpoint maps, report ids and sizes, timeouts.

// Default Vendor/Product IDs
/// FTDI vendor ID.
pub const FTDI_VID: u16 = 0x0403;
/// Default product ID of the FT260 HID-to-I2C bridge.
pub const FT260_PID: u16 = 0x6030;

// --- Transfer timeouts ---
/// Timeout applied to synchronous pipe writes (milliseconds).
pub const WRITE_TIMEOUT_MS: u32 = 5000;
/// Timeout applied to control transfers (serial, feature reports).
pub const CONTROL_TIMEOUT_MS: u32 = 1000;
/// How often a timed-out read is re-interrupted until it returns (milliseconds).
pub const INTERRUPT_RETRY_MS: u64 = 50;

/// Serial characters kept from a string descriptor (a 255-byte descriptor
/// yields at most 127 after the 2-byte header).
pub const SERIAL_CAPACITY: usize = 128;

// --- Standard requests ---
pub mod usb {
    pub const DIR_IN: u8 = 0x80;
    pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
    pub const DT_DEVICE: u8 = 0x01;
    pub const DT_STRING: u8 = 0x03;
    /// String descriptor index the FTDI parts store their serial at.
    pub const SERIAL_STRING_INDEX: u8 = 3;
    /// US English.
    pub const LANGID_EN_US: u16 = 0x0409;
    /// Largest descriptor a single GET_DESCRIPTOR can return.
    pub const MAX_DESCRIPTOR_SIZE: usize = 255;
    pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
}

// --- D2XX ---
pub mod d2xx {
    pub const INTERFACES: &[u8] = &[0];
    pub const EP_IN: u8 = 0x81;
    pub const EP_OUT: u8 = 0x02;
    /// Modem/line status prefixed to every bulk-in transfer.
    pub const HEADER_SIZE: usize = 2;
}

// --- D3XX ---
pub mod d3xx {
    pub const INTERFACES: &[u8] = &[0, 1];
    /// Vendor command pipe on interface 0.
    pub const EP_COMMAND: u8 = 0x01;
    pub const EP_IN: u8 = 0x82;
    pub const EP_OUT: u8 = 0x02;
    pub const TRIGGER_SIZE: usize = 20;
    /// Byte offset of the little-endian requested length in the trigger.
    pub const TRIGGER_LENGTH_OFFSET: usize = 8;
    /// Fixed part of the read trigger; the length field is patched in.
    pub const TRIGGER_TEMPLATE: [u8; TRIGGER_SIZE] = [
        0x00, 0x00, 0x00, 0x00, 0x82, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ];
}

// --- FT260 (HID) ---
pub mod ft260 {
    pub const INTERFACES: &[u8] = &[0];
    pub const INTERFACE: u8 = 0;
    pub const EP_IN: u8 = 0x81;
    pub const EP_OUT: u8 = 0x02;
    pub const REPORT_SIZE: usize = 64;

    // HID class requests (feature reports ride on endpoint 0)
    pub const HID_REQUEST_TYPE_OUT: u8 = 0x21;
    pub const HID_REQUEST_TYPE_IN: u8 = 0xA1;
    pub const HID_GET_REPORT: u8 = 0x01;
    pub const HID_SET_REPORT: u8 = 0x09;
    pub const HID_REPORT_TYPE_FEATURE: u16 = 0x03;

    pub mod i2c {
        pub const REPORT_ID_WRITE: u8 = 0xDE;
        pub const REPORT_ID_READ_REQUEST: u8 = 0xC2;
        /// Input reports carrying I2C data use ids in this range.
        pub const REPORT_ID_INPUT_FIRST: u8 = 0xD0;
        pub const REPORT_ID_INPUT_LAST: u8 = 0xDE;
        /// id, address, flags, length
        pub const WRITE_HEADER_SIZE: usize = 4;
        pub const WRITE_PAYLOAD_SIZE: usize = super::REPORT_SIZE - WRITE_HEADER_SIZE;
        /// id, length
        pub const INPUT_HEADER_SIZE: usize = 2;
        pub const INPUT_PAYLOAD_SIZE: usize = super::REPORT_SIZE - INPUT_HEADER_SIZE;
        pub const MAX_ADDRESS: u8 = 0x7F;
    }

    pub mod feature {
        pub const REPORT_ID_SYSTEM_SETTING: u8 = 0xA1;
        pub const REPORT_ID_GPIO: u8 = 0xB0;
        pub const REQUEST_SET_CLOCK: u8 = 0x01;
        pub const REQUEST_SET_GPIO2_FUNCTION: u8 = 0x06;
        pub const REQUEST_SET_GPIOA_FUNCTION: u8 = 0x08;
        pub const REQUEST_SET_GPIOG_FUNCTION: u8 = 0x09;
        pub const REQUEST_SET_I2C_CLOCK_SPEED: u8 = 0x22;
    }
}
