//! TWAI (CAN 2.0B) adapter feeding the [`crate::can_bus::orchestrator`]
//! publish loop.
//!
//! - **`target_os = "espidf"`** — wraps `esp_idf_hal::can::CanDriver` in
//!   normal (non-loopback) mode at 250 kbit/s, the Victron CAN-bus BMS
//!   profile's bit rate.
//! - **`not(target_os = "espidf")`** — records frames in memory so host
//!   tests can assert on exactly what the orchestrator tried to send.

use crate::app::ports::CanPort;
use crate::can_bus::orchestrator::CanFrame;
use crate::error::{Error, Result};
use embedded_can::{Frame as _, Id, StandardId};

pub const BITRATE_KBPS: u32 = 250;

/// Turn an orchestrator [`CanFrame`] into a standard-ID `embedded-can`
/// frame type `F`, e.g. `esp_idf_hal::can::Frame`.
pub fn build_frame<F: embedded_can::Frame>(frame: &CanFrame) -> Result<F> {
    let id = StandardId::new(frame.can_id).ok_or(Error::InvalidArgument)?;
    F::new(Id::Standard(id), &frame.payload[..frame.dlc as usize]).ok_or(Error::InvalidArgument)
}

#[cfg(target_os = "espidf")]
pub struct Esp32TwaiAdapter {
    driver: esp_idf_hal::can::CanDriver<'static>,
}

#[cfg(target_os = "espidf")]
impl Esp32TwaiAdapter {
    pub fn new(
        can: esp_idf_hal::can::CAN,
        tx: impl esp_idf_hal::gpio::OutputPin + 'static,
        rx: impl esp_idf_hal::gpio::InputPin + 'static,
    ) -> Result<Self> {
        use esp_idf_hal::can::config::{Config, Timing};
        let config = Config::new().timing(Timing::B250Kbps);
        let driver = esp_idf_hal::can::CanDriver::new(can, tx, rx, &config).map_err(|_| Error::CanFailure)?;
        Ok(Self { driver })
    }
}

#[cfg(target_os = "espidf")]
impl CanPort for Esp32TwaiAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<()> {
        let can_frame: esp_idf_hal::can::Frame = build_frame(&frame)?;
        self.driver.transmit(&can_frame, 50).map_err(|_| Error::CanFailure)
    }
}

/// Host-side stand-in for [`Esp32TwaiAdapter`] — just records what it was
/// asked to send.
#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
pub struct RecordingCan {
    pub sent: Vec<CanFrame>,
    pub fail_next: bool,
}

#[cfg(not(target_os = "espidf"))]
impl RecordingCan {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(not(target_os = "espidf"))]
impl CanPort for RecordingCan {
    fn send(&mut self, frame: CanFrame) -> Result<()> {
        if self.fail_next {
            self.fail_next = false;
            return Err(Error::CanFailure);
        }
        self.sent.push(frame);
        Ok(())
    }
}
