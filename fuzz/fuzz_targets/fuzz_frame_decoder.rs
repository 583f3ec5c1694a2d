//! Fuzz target: `serial::frame::parse_response`
//!
//! Drives arbitrary byte sequences (and arbitrary expected-command bytes)
//! through the BMS response parser and asserts it never panics on
//! malformed input — CRC failures, truncated frames and garbage opcodes
//! must all surface as `Err`, never a panic or an out-of-bounds payload.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use gateway::serial::frame::parse_response;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let (cmd_byte, frame) = data.split_at(1);
    let expected_cmd = cmd_byte[0];

    if let Ok(resp) = parse_response(expected_cmd, frame) {
        match resp {
            gateway::serial::ParsedResponse::Read { payload } | gateway::serial::ParsedResponse::Proprietary { payload, .. } => {
                assert!(payload.len() <= 254, "payload exceeds the fixed response cap");
            }
            gateway::serial::ParsedResponse::WriteAck | gateway::serial::ParsedResponse::Nack { .. } => {}
        }
    }
});
