//! Serial protocol engine: per-exchange state machine, sleep-wake retry,
//! and the `SerialPort` transport seam.

use super::frame::{build_proprietary_frame, build_read_frame, build_write_frame, parse_response, ParsedResponse};
use super::opcodes::{FN_READ, FN_WRITE_MULTIPLE};
use crate::error::{Error, Result};
use std::time::Duration;

/// The transport a [`SerialEngine`] drives. Implementations own the
/// physical UART exclusively; every other component talks to the BMS
/// through the engine's request queue, never this trait directly.
pub trait SerialPort {
    /// Write the whole frame, or fail.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Block for up to `timeout` reading a complete response frame into
    /// `buf`, returning the number of bytes read. Returns
    /// `Err(Error::SerialTimeout)` if no complete frame arrives in time.
    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// State of a single request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    TxIssued,
    AwaitResponse,
    Ok,
    Nack,
    CrcMismatch,
    Timeout,
    MaybeWakeRetry,
}

/// Drives request/response exchanges over a [`SerialPort`], implementing
/// CRC/NACK failure handling and the one-shot sleep-wake retry.
pub struct SerialEngine<P: SerialPort> {
    port: P,
    timeout: Duration,
    state: ExchangeState,
}

impl<P: SerialPort> SerialEngine<P> {
    pub fn new(port: P, timeout: Duration) -> Self {
        Self { port, timeout, state: ExchangeState::Idle }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Run a single read exchange: `read(start_addr, count) -> raw payload
    /// bytes`.
    pub fn read(&mut self, start_addr: u16, count: u16) -> Result<heapless::Vec<u8, 254>> {
        let frame = build_read_frame(start_addr, count)?;
        match self.exchange(&frame, FN_READ)? {
            ParsedResponse::Read { payload } => Ok(payload),
            _ => Err(Error::InvalidState),
        }
    }

    /// Run a write-multiple exchange. Caller is responsible for the
    /// read-back verification the cache's write path requires.
    pub fn write(&mut self, start_addr: u16, values: &[u16]) -> Result<()> {
        let frame = build_write_frame(start_addr, values)?;
        match self.exchange(&frame, FN_WRITE_MULTIPLE)? {
            ParsedResponse::WriteAck => Ok(()),
            _ => Err(Error::InvalidState),
        }
    }

    /// Run a proprietary command exchange, returning its payload bytes.
    pub fn proprietary(&mut self, opcode: u8, payload: &[u8]) -> Result<heapless::Vec<u8, 254>> {
        let frame = build_proprietary_frame(opcode, payload)?;
        match self.exchange(&frame, opcode)? {
            ParsedResponse::Proprietary { payload, .. } => Ok(payload),
            _ => Err(Error::InvalidState),
        }
    }

    /// Drive the `Idle -> TxIssued -> AwaitResponse -> ... ` state machine
    /// for a single command. A timeout gets one wake-retry before declaring
    /// `BmsAsleep`; a CRC mismatch or malformed frame shape also gets one
    /// retry at this layer (the BMS occasionally garbles a reply under
    /// load) before the error surfaces. A NACK is never retried — it's a
    /// definite answer, not noise. A successful reply at any attempt resets
    /// the sequence; the next exchange starts fresh.
    fn exchange(&mut self, frame: &[u8], expected_cmd: u8) -> Result<ParsedResponse> {
        self.state = ExchangeState::TxIssued;
        match self.try_once(frame, expected_cmd) {
            Ok(resp) => {
                self.state = ExchangeState::Ok;
                Ok(resp)
            }
            Err(Error::SerialTimeout) => {
                self.state = ExchangeState::MaybeWakeRetry;
                match self.try_once(frame, expected_cmd) {
                    Ok(resp) => {
                        self.state = ExchangeState::Ok;
                        Ok(resp)
                    }
                    Err(Error::SerialTimeout) => {
                        self.state = ExchangeState::Timeout;
                        Err(Error::BmsAsleep)
                    }
                    Err(e) => {
                        self.classify_failure(e);
                        Err(e)
                    }
                }
            }
            Err(e @ (Error::SerialCrcMismatch { .. } | Error::InvalidSize | Error::InvalidState)) => {
                self.classify_failure(e);
                match self.try_once(frame, expected_cmd) {
                    Ok(resp) => {
                        self.state = ExchangeState::Ok;
                        Ok(resp)
                    }
                    Err(retry_err) => {
                        self.classify_failure(retry_err);
                        Err(retry_err)
                    }
                }
            }
            Err(e) => {
                self.classify_failure(e);
                Err(e)
            }
        }
    }

    fn classify_failure(&mut self, e: Error) {
        self.state = match e {
            Error::SerialNack { .. } => ExchangeState::Nack,
            Error::SerialCrcMismatch { .. } => ExchangeState::CrcMismatch,
            Error::SerialTimeout => ExchangeState::Timeout,
            _ => ExchangeState::Timeout,
        };
    }

    fn try_once(&mut self, frame: &[u8], expected_cmd: u8) -> Result<ParsedResponse> {
        self.state = ExchangeState::AwaitResponse;
        self.port.write_frame(frame)?;
        let mut buf = [0u8; super::frame::MAX_FRAME_LEN];
        let n = self.port.read_frame(&mut buf, self.timeout)?;
        parse_response(expected_cmd, &buf[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted transport: each call to `read_frame` pops the next
    /// scripted outcome (a frame, or a timeout).
    struct ScriptedPort {
        sent: Vec<Vec<u8>>,
        responses: VecDeque<Option<Vec<u8>>>,
    }

    impl SerialPort for ScriptedPort {
        fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn read_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            match self.responses.pop_front() {
                Some(Some(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(None) | None => Err(Error::SerialTimeout),
            }
        }
    }

    fn ok_read_response(addr_payload: &[u8]) -> Vec<u8> {
        use crate::crc16::{crc16, to_wire_bytes};
        let mut frame = vec![0xAA, 0x03, addr_payload.len() as u8];
        frame.extend_from_slice(addr_payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&to_wire_bytes(crc));
        frame
    }

    #[test]
    fn successful_read_transitions_to_ok() {
        let port = ScriptedPort { sent: vec![], responses: VecDeque::from([Some(ok_read_response(&[0x8C, 0x05]))]) };
        let mut engine = SerialEngine::new(port, Duration::from_millis(50));
        let payload = engine.read(50, 1).unwrap();
        assert_eq!(&payload[..], &[0x8C, 0x05]);
        assert_eq!(engine.state(), ExchangeState::Ok);
    }

    #[test]
    fn scenario_4_sleep_wake_retry_sends_command_twice() {
        let port = ScriptedPort {
            sent: vec![],
            responses: VecDeque::from([None, Some(ok_read_response(&[0x8C, 0x05]))]),
        };
        let mut engine = SerialEngine::new(port, Duration::from_millis(10));
        let payload = engine.read(50, 1).unwrap();
        assert_eq!(&payload[..], &[0x8C, 0x05]);
        assert_eq!(engine.port.sent.len(), 2);
        assert_eq!(engine.port.sent[0], engine.port.sent[1]);
    }

    #[test]
    fn double_timeout_surfaces_bms_asleep() {
        let port = ScriptedPort { sent: vec![], responses: VecDeque::from([None, None]) };
        let mut engine = SerialEngine::new(port, Duration::from_millis(10));
        let err = engine.read(50, 1).unwrap_err();
        assert_eq!(err, Error::BmsAsleep);
        assert_eq!(engine.state(), ExchangeState::Timeout);
    }

    #[test]
    fn nack_is_not_retried() {
        use crate::crc16::{crc16, to_wire_bytes};
        let mut nack = vec![0xAA, 0x00, 0x03, 0x01];
        let crc = crc16(&nack);
        nack.extend_from_slice(&to_wire_bytes(crc));
        let port = ScriptedPort { sent: vec![], responses: VecDeque::from([Some(nack)]) };
        let mut engine = SerialEngine::new(port, Duration::from_millis(10));
        let err = engine.read(50, 1).unwrap_err();
        assert_eq!(err, Error::SerialNack { cmd: 0x03, code: 0x01 });
        assert_eq!(engine.port.sent.len(), 1);
    }

    #[test]
    fn crc_mismatch_is_retried_once_then_succeeds() {
        let mut corrupted = ok_read_response(&[0x8C, 0x05]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF; // flip a CRC byte
        let port = ScriptedPort {
            sent: vec![],
            responses: VecDeque::from([Some(corrupted), Some(ok_read_response(&[0x8C, 0x05]))]),
        };
        let mut engine = SerialEngine::new(port, Duration::from_millis(10));
        let payload = engine.read(50, 1).unwrap();
        assert_eq!(&payload[..], &[0x8C, 0x05]);
        assert_eq!(engine.port.sent.len(), 2);
        assert_eq!(engine.state(), ExchangeState::Ok);
    }

    #[test]
    fn quiet_timer_resets_after_success_so_next_timeout_retries_again() {
        let port = ScriptedPort {
            sent: vec![],
            responses: VecDeque::from([
                Some(ok_read_response(&[0x00, 0x01])),
                None,
                Some(ok_read_response(&[0x00, 0x02])),
            ]),
        };
        let mut engine = SerialEngine::new(port, Duration::from_millis(10));
        engine.read(50, 1).unwrap();
        let payload = engine.read(50, 1).unwrap();
        assert_eq!(&payload[..], &[0x00, 0x02]);
        assert_eq!(engine.port.sent.len(), 3);
    }
}
