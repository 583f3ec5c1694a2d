//! UART adapter for the TinyBMS RS485/UART link.
//!
//! - **`target_os = "espidf"`** — wraps `esp_idf_hal::uart::UartDriver`
//!   configured for the protocol's fixed 115200 8N1 framing.
//! - **`not(target_os = "espidf"))`** — an in-memory loopback/script used by
//!   host tests to exercise [`crate::serial::engine::SerialEngine`] without
//!   hardware.

use crate::error::{Error, Result};
use crate::serial::SerialPort;
use std::time::Duration;

pub const BAUD_RATE: u32 = 115_200;

#[cfg(target_os = "espidf")]
pub struct Esp32UartAdapter {
    driver: esp_idf_hal::uart::UartDriver<'static>,
}

#[cfg(target_os = "espidf")]
impl Esp32UartAdapter {
    pub fn new(
        uart: esp_idf_hal::uart::UART1,
        tx: impl esp_idf_hal::gpio::OutputPin + 'static,
        rx: impl esp_idf_hal::gpio::InputPin + 'static,
    ) -> Result<Self> {
        use esp_idf_hal::units::Hertz;
        use esp_idf_hal::uart::{config::Config, UartDriver};

        let config = Config::new().baudrate(Hertz(BAUD_RATE));
        let driver = UartDriver::new(
            uart,
            tx,
            rx,
            Option::<esp_idf_hal::gpio::AnyIOPin>::None,
            Option::<esp_idf_hal::gpio::AnyIOPin>::None,
            &config,
        )
        .map_err(|_| Error::Io)?;
        Ok(Self { driver })
    }
}

#[cfg(target_os = "espidf")]
impl SerialPort for Esp32UartAdapter {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.driver.write(frame).map_err(|_| Error::Io)?;
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        self.driver
            .read(buf, timeout_ms)
            .map_err(|_| Error::SerialTimeout)
    }
}

/// Host-side stand-in: a scripted sequence of response frames, one per
/// `read_frame` call, used by integration tests that exercise the engine
/// above the transport seam.
#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
pub struct LoopbackUart {
    pub sent: Vec<Vec<u8>>,
    pub responses: std::collections::VecDeque<Vec<u8>>,
}

#[cfg(not(target_os = "espidf"))]
impl LoopbackUart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&mut self, frame: Vec<u8>) {
        self.responses.push_back(frame);
    }
}

#[cfg(not(target_os = "espidf"))]
impl SerialPort for LoopbackUart {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match self.responses.pop_front() {
            Some(resp) => {
                let n = resp.len().min(buf.len());
                buf[..n].copy_from_slice(&resp[..n]);
                Ok(n)
            }
            None => Err(Error::SerialTimeout),
        }
    }
}
