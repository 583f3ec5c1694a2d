//! Serial protocol opcodes and frame-shape constants.

/// Frame start byte for every command and response.
pub const START_BYTE: u8 = 0xAA;

/// Generic register read.
pub const FN_READ: u8 = 0x03;
/// Generic write-multiple-registers.
pub const FN_WRITE_MULTIPLE: u8 = 0x10;

/// Proprietary reset/clear command; takes a one-byte sub-option.
pub const OP_RESET: u8 = 0x02;
pub const OP_READ_NEWEST_EVENTS: u8 = 0x11;
pub const OP_READ_ALL_EVENTS: u8 = 0x12;
pub const OP_PACK_VOLTAGE: u8 = 0x14;
pub const OP_PACK_CURRENT: u8 = 0x15;
pub const OP_MAX_CELL_MV: u8 = 0x16;
pub const OP_MIN_CELL_MV: u8 = 0x17;
pub const OP_ONLINE_STATUS: u8 = 0x18;
pub const OP_LIFETIME_COUNTER: u8 = 0x19;
pub const OP_SOC: u8 = 0x1A;
pub const OP_TEMPERATURES: u8 = 0x1B;
pub const OP_CELL_VOLTAGES: u8 = 0x1C;
pub const OP_SETTINGS: u8 = 0x1D;
pub const OP_VERSION: u8 = 0x1E;
pub const OP_EXTENDED_VERSION: u8 = 0x1F;
pub const OP_SPEED_DISTANCE_TIME: u8 = 0x20;

/// Sub-options for [`OP_RESET`].
pub const RESET_CLEAR_EVENTS: u8 = 0x01;
pub const RESET_CLEAR_STATS: u8 = 0x02;
pub const RESET_RESET: u8 = 0x05;

/// NACK marker: the second byte of a response when the BMS rejects a
/// command.
pub const NACK_MARKER: u8 = 0x00;

/// NACK error codes (fourth byte of a NACK response).
pub const NACK_CMD_ERROR: u8 = 0x00;
pub const NACK_CRC_ERROR: u8 = 0x01;

/// Maximum word count for a single read (`count` is one byte, and the
/// protocol reserves one count value).
pub const MAX_READ_WORDS: u16 = 127;
