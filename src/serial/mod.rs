//! The serial protocol engine: frame codec, opcodes, and the
//! request/response state machine with sleep-wake retry.

pub mod engine;
pub mod frame;
pub mod opcodes;

pub use engine::{ExchangeState, SerialEngine, SerialPort};
pub use frame::ParsedResponse;
