//! Adapters — concrete, hardware-facing implementations of the port traits.
//!
//! | Adapter       | Implements      | Connects to           |
//! |---------------|------------------|-----------------------|
//! | `serial_uart` | `SerialPort`     | ESP32 UART1 (TinyBMS) |
//! | `can_twai`    | `CanPort`        | ESP32 TWAI (Victron)  |
//! | `time`        | —                | ESP32 system timer    |
//!
//! Every adapter is split `#[cfg(target_os = "espidf")]` for the real
//! peripheral driver vs. a host-simulation stand-in used by tests and
//! non-ESP-IDF builds.

pub mod can_twai;
pub mod serial_uart;
pub mod time;
