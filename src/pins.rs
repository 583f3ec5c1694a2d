//! GPIO / peripheral pin assignments for the gateway board.
//!
//! Single source of truth for the board's default wiring. These match
//! [`crate::config::SystemConfig::default`] — if you change a default here,
//! update that constructor too, since the two are not otherwise linked.

// ---------------------------------------------------------------------------
// UART1 — TinyBMS RS485/TTL link
// ---------------------------------------------------------------------------

/// UART1 TX, wired to the BMS RS485 transceiver's RO/DI pair.
pub const BMS_UART_TX_GPIO: i32 = 17;
/// UART1 RX.
pub const BMS_UART_RX_GPIO: i32 = 16;

// ---------------------------------------------------------------------------
// TWAI — Victron CAN bus (250 kbit/s, VE.Can)
// ---------------------------------------------------------------------------

/// TWAI TX, routed through an SN65HVD230 transceiver onto the CAN bus.
pub const CAN_TWAI_TX_GPIO: i32 = 4;
/// TWAI RX.
pub const CAN_TWAI_RX_GPIO: i32 = 5;

// ---------------------------------------------------------------------------
// Status LED
// ---------------------------------------------------------------------------

/// Single status LED: solid once CAN publishing is healthy, blinking while
/// waiting on the BMS handshake, fast-blinking on a persisted fault.
pub const STATUS_LED_GPIO: i32 = 8;
