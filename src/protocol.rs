// Request/response records exchanged over a peripheral's mailbox.
// Both sides are fixed-size values: a request carries at most PAYLOAD_CAPACITY bytes
// and the response echoes the register it answered for.

use std::fmt;
use std::time::Duration;

// Import thiserror for the closed protocol/bus error sets
use thiserror::Error;

use crate::mailbox::Mailbox;

/// Largest payload a single request or response can carry.
pub const PAYLOAD_CAPACITY: usize = 32;

/// Channel a client owns and hands to the peripheral inside each request.
pub type ResponseChannel = Mailbox<Response>;

/// Native driver status codes, truncated to the single byte carried in an error response.
pub mod status {
    pub const OK: u8 = 0x00;
    pub const INVALID_ARG: u8 = 0x02; // ESP_ERR_INVALID_ARG
    pub const INVALID_STATE: u8 = 0x03; // ESP_ERR_INVALID_STATE
    pub const INVALID_SIZE: u8 = 0x04; // ESP_ERR_INVALID_SIZE, used for rejected requests
    pub const NOT_FOUND: u8 = 0x05; // ESP_ERR_NOT_FOUND, device did not ack
    pub const TIMEOUT: u8 = 0x07; // ESP_ERR_TIMEOUT
    pub const FAIL: u8 = 0xFF; // ESP_FAIL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the 32 byte capacity")]
    PayloadTooLarge(usize),
    #[error("opcode requires a payload but none was supplied")]
    EmptyPayload,
}

/// Failure reported by a bus driver; translated into a response, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("device did not acknowledge")]
    Nak,
    #[error("bus transaction timed out")]
    Timeout,
    #[error("invalid argument")]
    InvalidArg,
    #[error("bus not ready")]
    InvalidState,
    #[error("driver error {0}")]
    Driver(i32),
}

impl BusError {
    /// Single-byte status code placed in payload[0] of the error response.
    pub fn code(&self) -> u8 {
        match self {
            BusError::Nak => status::NOT_FOUND,
            BusError::Timeout => status::TIMEOUT,
            BusError::InvalidArg => status::INVALID_ARG,
            BusError::InvalidState => status::INVALID_STATE,
            BusError::Driver(code) => (*code & 0xFF) as u8,
        }
    }
}

/// Fixed-capacity byte buffer with an explicit length.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    bytes: [u8; PAYLOAD_CAPACITY],
    len: u8,
}

impl Payload {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; PAYLOAD_CAPACITY],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut payload = Self::with_len(data.len())?;
        payload.bytes[..data.len()].copy_from_slice(data);
        Ok(payload)
    }

    /// Zero-filled payload of `len` bytes, used to express the length of a read.
    pub fn with_len(len: usize) -> Result<Self, ProtocolError> {
        if len > PAYLOAD_CAPACITY {
            return Err(ProtocolError::PayloadTooLarge(len));
        }
        Ok(Self {
            bytes: [0; PAYLOAD_CAPACITY],
            len: len as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.as_slice())
    }
}

/// Per-subsystem operation selector carried in a request.
pub trait Opcode: Copy + fmt::Debug + Send + 'static {
    /// Addressed read/write operations must carry data (or a read length).
    fn requires_payload(self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Request<Op> {
    pub opcode: Op,
    pub device: u8,
    pub sub_address: u8,
    pub payload: Payload,
    pub reply_to: Option<ResponseChannel>,
    pub debug: bool,
    pub timeout: Option<Duration>,
}

impl<Op: Opcode> Request<Op> {
    pub fn new(opcode: Op) -> Self {
        Self {
            opcode,
            device: 0,
            sub_address: 0,
            payload: Payload::empty(),
            reply_to: None,
            debug: false,
            timeout: None,
        }
    }

    pub fn device(mut self, address: u8) -> Self {
        self.device = address;
        self
    }

    pub fn register(mut self, sub_address: u8) -> Self {
        self.sub_address = sub_address;
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Result<Self, ProtocolError> {
        self.payload = Payload::from_slice(data)?;
        Ok(self)
    }

    /// Number of bytes a read should return.
    pub fn read_len(mut self, len: usize) -> Result<Self, ProtocolError> {
        self.payload = Payload::with_len(len)?;
        Ok(self)
    }

    pub fn reply_to(mut self, channel: &ResponseChannel) -> Self {
        self.reply_to = Some(channel.clone());
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Local check done before any hardware call.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.opcode.requires_payload() && self.payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Data,
    Ack,
    Nak,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub result: ResultCode,
    pub sub_address: u8,
    pub payload: Payload,
}

impl Response {
    pub fn data(sub_address: u8, payload: Payload) -> Self {
        Self {
            result: ResultCode::Data,
            sub_address,
            payload,
        }
    }

    /// Write acknowledged; payload[0] carries the driver status.
    pub fn ack(sub_address: u8) -> Self {
        Self::with_code(ResultCode::Ack, sub_address, status::OK)
    }

    pub fn nak(sub_address: u8, code: u8) -> Self {
        Self::with_code(ResultCode::Nak, sub_address, code)
    }

    /// Error result: length forced to 1, payload[0] is the numeric error code.
    pub fn error(sub_address: u8, code: u8) -> Self {
        Self::with_code(ResultCode::Error, sub_address, code)
    }

    pub fn from_bus_error(sub_address: u8, err: &BusError) -> Self {
        match err {
            BusError::Nak => Self::nak(sub_address, err.code()),
            _ => Self::error(sub_address, err.code()),
        }
    }

    /// Status byte of an Ack/Nak/Error response.
    pub fn code(&self) -> Option<u8> {
        match self.result {
            ResultCode::Data => None,
            _ => self.payload.as_slice().first().copied(),
        }
    }

    fn with_code(result: ResultCode, sub_address: u8, code: u8) -> Self {
        let mut payload = Payload::empty();
        payload.bytes[0] = code;
        payload.len = 1;
        Self {
            result,
            sub_address,
            payload,
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::data(0, Payload::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum TestOp {
        Read,
        Status,
    }

    impl Opcode for TestOp {
        fn requires_payload(self) -> bool {
            matches!(self, TestOp::Read)
        }
    }

    #[test]
    fn payload_rejects_oversize() {
        assert_eq!(
            Payload::from_slice(&[0u8; 33]),
            Err(ProtocolError::PayloadTooLarge(33))
        );
        assert_eq!(Payload::with_len(32).map(|p| p.len()), Ok(32));
    }

    #[test]
    fn error_response_forces_single_byte() {
        let r = Response::error(0x10, status::TIMEOUT);
        assert_eq!(r.payload.len(), 1);
        assert_eq!(r.code(), Some(status::TIMEOUT));
        assert_eq!(r.sub_address, 0x10);
    }

    #[test]
    fn validate_requires_payload_only_when_addressed() {
        assert_eq!(
            Request::new(TestOp::Read).validate(),
            Err(ProtocolError::EmptyPayload)
        );
        assert!(Request::new(TestOp::Status).validate().is_ok());
        assert!(Request::new(TestOp::Read).read_len(2).unwrap().validate().is_ok());
    }

    #[test]
    fn nak_maps_to_nak_result() {
        let r = Response::from_bus_error(1, &BusError::Nak);
        assert_eq!(r.result, ResultCode::Nak);
        let r = Response::from_bus_error(1, &BusError::Driver(0x107));
        assert_eq!(r.result, ResultCode::Error);
        assert_eq!(r.code(), Some(0x07));
    }
}
