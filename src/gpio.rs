//! FT260 system-setting and GPIO feature reports.
//!
//! Each helper is a single 64-byte feature report; nothing here blocks beyond
//! the control transfer itself.

use crate::consts::ft260::{self, feature};
use crate::device::{Device, Endpoint};
use crate::error::{Error, Result};
use crate::transport::Transport;
use bitflags::bitflags;
use log::{debug, trace};
use num_enum::IntoPrimitive;

/// Chip clock selected with the system-clock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum SystemClock {
    Mhz12 = 0,
    Mhz24 = 1,
    Mhz48 = 2,
}

/// Multi-function pin groups; the discriminant is the system-setting request
/// that selects the group's function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum GpioGroup {
    Gpio2 = feature::REQUEST_SET_GPIO2_FUNCTION,
    GpioA = feature::REQUEST_SET_GPIOA_FUNCTION,
    GpioG = feature::REQUEST_SET_GPIOG_FUNCTION,
}

/// Function code that turns a multi-function pin into a plain GPIO.
pub const GPIO_FUNCTION_GPIO: u8 = 0x00;

bitflags! {
    /// GPIO0..GPIO5, carried in the `value`/`direction` bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GpioPins: u8 {
        const GPIO0 = 1 << 0;
        const GPIO1 = 1 << 1;
        const GPIO2 = 1 << 2;
        const GPIO3 = 1 << 3;
        const GPIO4 = 1 << 4;
        const GPIO5 = 1 << 5;
    }
}

bitflags! {
    /// GPIOA..GPIOH, carried in the `value_ex`/`direction_ex` bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GpioPinsEx: u8 {
        const GPIOA = 1 << 0;
        const GPIOB = 1 << 1;
        const GPIOC = 1 << 2;
        const GPIOD = 1 << 3;
        const GPIOE = 1 << 4;
        const GPIOF = 1 << 5;
        const GPIOG = 1 << 6;
        const GPIOH = 1 << 7;
    }
}

/// Levels and directions of every GPIO. A set direction bit means output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpioState {
    pub value: GpioPins,
    pub direction: GpioPins,
    pub value_ex: GpioPinsEx,
    pub direction_ex: GpioPinsEx,
}

impl GpioState {
    fn to_report(self) -> [u8; ft260::REPORT_SIZE] {
        let mut report = [0u8; ft260::REPORT_SIZE];
        report[0] = feature::REPORT_ID_GPIO;
        report[1] = self.value.bits();
        report[2] = self.direction.bits();
        report[3] = self.value_ex.bits();
        report[4] = self.direction_ex.bits();
        report
    }

    fn from_report(report: &[u8]) -> Result<Self> {
        if report.len() < 5 || report[0] != feature::REPORT_ID_GPIO {
            return Err(Error::Io(format!(
                "malformed GPIO feature report: {:02X?}",
                report
            )));
        }
        Ok(Self {
            value: GpioPins::from_bits_retain(report[1]),
            direction: GpioPins::from_bits_retain(report[2]),
            value_ex: GpioPinsEx::from_bits_retain(report[3]),
            direction_ex: GpioPinsEx::from_bits_retain(report[4]),
        })
    }
}

fn system_setting(request: u8, args: &[u8]) -> [u8; ft260::REPORT_SIZE] {
    let mut report = [0u8; ft260::REPORT_SIZE];
    report[0] = feature::REPORT_ID_SYSTEM_SETTING;
    report[1] = request;
    report[2..2 + args.len()].copy_from_slice(args);
    report
}

impl<T: Transport> Device<T> {
    fn send_feature(&self, report: &[u8; ft260::REPORT_SIZE]) -> Result<()> {
        self.require_ft260("GPIO/system settings")?;
        self.write(Endpoint::Feature, report)?;
        Ok(())
    }

    /// Sets the I2C bus clock in kHz (e.g. 100 or 400).
    pub fn set_i2c_clock_speed(&self, khz: u16) -> Result<()> {
        if khz == 0 {
            return Err(Error::InvalidArgument(
                "I2C clock speed must be non-zero".to_string(),
            ));
        }
        debug!("Setting I2C clock speed to {} kHz", khz);
        self.send_feature(&system_setting(
            feature::REQUEST_SET_I2C_CLOCK_SPEED,
            &khz.to_le_bytes(),
        ))
    }

    pub fn set_system_clock(&self, clock: SystemClock) -> Result<()> {
        debug!("Setting system clock to {:?}", clock);
        self.send_feature(&system_setting(feature::REQUEST_SET_CLOCK, &[clock.into()]))
    }

    /// Selects the function of a multi-function pin group;
    /// [`GPIO_FUNCTION_GPIO`] makes it a plain GPIO.
    pub fn set_gpio_function(&self, group: GpioGroup, function: u8) -> Result<()> {
        debug!("Setting {:?} function to 0x{:02X}", group, function);
        self.send_feature(&system_setting(group.into(), &[function]))
    }

    /// Writes levels and directions of all GPIOs at once.
    pub fn gpio_write(&self, state: GpioState) -> Result<()> {
        let report = state.to_report();
        trace!("GPIO write: {:02X?}", &report[..5]);
        self.send_feature(&report)
    }

    pub fn gpio_read(&self) -> Result<GpioState> {
        self.require_ft260("GPIO/system settings")?;
        let mut report = [0u8; ft260::REPORT_SIZE];
        report[0] = feature::REPORT_ID_GPIO;
        let received = self.read(Endpoint::Feature, &mut report)?;
        GpioState::from_report(&report[..received])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpio_report_layout() {
        let state = GpioState {
            value: GpioPins::GPIO1,
            direction: GpioPins::GPIO1 | GpioPins::GPIO2,
            value_ex: GpioPinsEx::GPIOG,
            direction_ex: GpioPinsEx::GPIOG,
        };
        let report = state.to_report();
        assert_eq!(&report[..5], &[0xB0, 0x02, 0x06, 0x40, 0x40]);
        assert_eq!(GpioState::from_report(&report).unwrap(), state);
    }

    #[test]
    fn gpio_report_rejects_wrong_id() {
        assert!(matches!(
            GpioState::from_report(&[0xA1, 0, 0, 0, 0]),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn system_setting_layout() {
        let report = system_setting(feature::REQUEST_SET_I2C_CLOCK_SPEED, &400u16.to_le_bytes());
        assert_eq!(&report[..4], &[0xA1, 0x22, 0x90, 0x01]);
        assert_eq!(u8::from(GpioGroup::GpioG), 0x09);
    }
}
