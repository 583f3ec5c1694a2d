//! Port traits — the hexagonal boundary between domain logic and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ GatewayService (domain)
//! ```
//!
//! Driven adapters (UART, TWAI, NVS) implement these traits; the domain
//! core in [`service`](super::service) consumes them, so it never touches
//! hardware directly. The serial seam lives in
//! [`crate::serial::SerialPort`] rather than here, since it is owned
//! exclusively by [`crate::serial::SerialEngine`].

use crate::can_bus::CanFrame;
use crate::error::Result;

/// Write-side port: the domain hands the orchestrator's encoded frames to
/// whatever bus transport is wired in (real TWAI, or a host recorder).
pub trait CanPort {
    fn send(&mut self, frame: CanFrame) -> Result<()>;
}
