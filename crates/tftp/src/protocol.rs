//! TFTP Wire Codec
//!
//! This module turns datagrams into typed [`Message`]s and back. It performs
//! no I/O and keeps no state, so it is safe to point directly at network input.
//!
//! # Packet Formats
//!
//! Every packet starts with a big-endian `u16` opcode:
//!
//! ```text
//!  RRQ/WRQ | 01/02 | Filename | 0 | Mode | 0 |
//!  DATA    | 03    | Block #  | Data (0..=512 bytes)  |
//!  ACK     | 04    | Block #  |
//!  ERROR   | 05    | ErrorCode | ErrMsg | 0 |
//! ```
//!
//! A DATA payload shorter than [`BLOCK_SIZE`] ends the transfer; there is no
//! other end-of-file marker.
//!
//! # Safety Against Hostile Input
//!
//! Every read goes through a bounds-checked cursor. Sizes are derived from the
//! datagram length only, text fields must be terminated inside the datagram,
//! and [`decode`] returns an error rather than panicking for any input.

use std::fmt;

use thiserror::Error;

/// Size of a full DATA block. A shorter block terminates a transfer.
pub const BLOCK_SIZE: usize = 512;

/// Opcode plus block number.
pub const HEADER_SIZE: usize = 4;

/// Largest datagram the protocol ever produces or accepts.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + BLOCK_SIZE;

/// Transfer mode sent in write requests. Peers do not validate it.
pub const DEFAULT_MODE: &str = "netascii";

/// Fixed-size buffer large enough for any packet.
pub type Packet = [u8; MAX_PACKET_SIZE];

/// TFTP Protocol Opcodes
///
/// Each opcode corresponds to a specific packet format as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Opens an upload. The receiver answers with ACK 0 or an ERROR.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries a block number and up to 512 bytes of file data. The payload
    /// length is not transmitted; it is whatever follows the block number.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges a data block. Block 0 acknowledges the write request.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer. Never
    /// acknowledged or retransmitted.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(2), Some(TftpOpcode::WriteRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see the error message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Raised when a filename would escape the server's storage root.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    ///
    /// Raised when the destination cannot be created or a write fails.
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    ///
    /// Raised for packets that are malformed or unexpected in the current state.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    ///
    /// Sent to datagrams arriving from a source other than the transfer peer.
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(3), Some(TftpErrorCode::DiskFull));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::DiskFull.default_message(), "Disk full or allocation exceeded");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: TftpErrorCode, message: String },
}

impl Message {
    /// Create a write request
    ///
    /// # Examples
    /// ```
    /// use tftp::{Message, TftpOpcode};
    ///
    /// let wrq = Message::write_request("a.bin", "netascii");
    /// assert_eq!(wrq.opcode(), TftpOpcode::WriteRequest);
    /// ```
    pub fn write_request(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::WriteRequest {
            filename: filename.into(),
            mode: mode.into(),
        }
    }

    pub fn data(block: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            block,
            payload: payload.into(),
        }
    }

    pub fn ack(block: u16) -> Self {
        Self::Ack { block }
    }

    pub fn error(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Create an error packet with the default message for the error code
    pub fn error_with_default_message(code: TftpErrorCode) -> Self {
        Self::error(code, code.default_message())
    }

    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::ReadRequest { .. } => TftpOpcode::ReadRequest,
            Self::WriteRequest { .. } => TftpOpcode::WriteRequest,
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack { .. } => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
        }
    }

    /// Check if this is the last data block of a transfer
    ///
    /// # Examples
    /// ```
    /// use tftp::Message;
    ///
    /// assert!(Message::data(3, vec![0; 300]).is_terminal());
    /// assert!(Message::data(4, Vec::new()).is_terminal());
    /// assert!(!Message::data(1, vec![0; 512]).is_terminal());
    /// assert!(!Message::ack(1).is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Data { payload, .. } if payload.len() < BLOCK_SIZE)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest { filename, mode } | Self::WriteRequest { filename, mode } => {
                write!(f, "{} '{}' ({})", self.opcode(), filename, mode)
            }
            Self::Data { block, payload } => write!(f, "DATA #{} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK #{}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
        }
    }
}

/// Reasons a datagram could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unknown opcode, a datagram too short to carry one, or an illegal field value
    #[error("bad message: {0}")]
    BadMessage(String),

    /// A text field without its NUL terminator, or a fixed field cut short
    #[error("truncated {0}")]
    Truncated(&'static str),
}

/// Reasons a message could not be encoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("{0} contains an interior NUL byte")]
    InteriorNul(&'static str),
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Bounds-checked read cursor over a received datagram
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(DecodeError::Truncated(field))?;
        self.pos += 2;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_text(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let end = find_zero(self.buf, self.pos).ok_or(DecodeError::Truncated(field))?;
        let text = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| DecodeError::BadMessage(format!("{field} is not valid UTF-8")))?;
        self.pos = end + 1;
        Ok(text.to_string())
    }

    fn rest(&self) -> &'a [u8] {
        self.buf.get(self.pos..).unwrap_or_default()
    }
}

/// Bounds-checked write cursor over an outgoing buffer
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_slice(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let needed = self.pos.saturating_add(bytes.len());
        let capacity = self.buf.len();
        let dest = self
            .buf
            .get_mut(self.pos..needed)
            .ok_or(EncodeError::BufferTooSmall { needed, capacity })?;
        dest.copy_from_slice(bytes);
        self.pos = needed;
        Ok(())
    }

    fn put_u16(&mut self, value: u16) -> Result<(), EncodeError> {
        self.put_slice(&value.to_be_bytes())
    }

    fn put_text(&mut self, field: &'static str, text: &str) -> Result<(), EncodeError> {
        if text.as_bytes().contains(&0) {
            return Err(EncodeError::InteriorNul(field));
        }
        self.put_slice(text.as_bytes())?;
        self.put_slice(&[0])
    }
}

/// Decode one datagram. The slice length is the datagram length.
///
/// Fields following a complete request (RFC 2347 options) are ignored.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    let mut reader = Reader::new(buf);

    let raw = reader
        .read_u16("opcode")
        .map_err(|_| DecodeError::BadMessage("header too short".to_string()))?;
    let opcode =
        TftpOpcode::from_u16(raw).ok_or_else(|| DecodeError::BadMessage(format!("unknown opcode {raw}")))?;

    match opcode {
        TftpOpcode::ReadRequest => Ok(Message::ReadRequest {
            filename: reader.read_text("filename")?,
            mode: reader.read_text("mode")?,
        }),
        TftpOpcode::WriteRequest => Ok(Message::WriteRequest {
            filename: reader.read_text("filename")?,
            mode: reader.read_text("mode")?,
        }),
        TftpOpcode::Data => {
            let block = reader.read_u16("block number")?;
            let payload = reader.rest();
            if payload.len() > BLOCK_SIZE {
                return Err(DecodeError::BadMessage(format!(
                    "data payload of {} bytes exceeds {BLOCK_SIZE}",
                    payload.len()
                )));
            }
            Ok(Message::Data {
                block,
                payload: payload.to_vec(),
            })
        }
        TftpOpcode::Acknowledgment => Ok(Message::Ack {
            block: reader.read_u16("block number")?,
        }),
        TftpOpcode::Error => {
            let code = reader.read_u16("error code")?;
            let message = reader.read_text("error message")?;
            Ok(Message::Error {
                code: TftpErrorCode::from_u16(code).unwrap_or(TftpErrorCode::NotDefined),
                message,
            })
        }
    }
}

/// Encode `message` into `buf`, returning the number of bytes to transmit.
pub fn encode(message: &Message, buf: &mut [u8]) -> Result<usize, EncodeError> {
    let mut writer = Writer::new(buf);
    writer.put_u16(message.opcode().as_u16())?;

    match message {
        Message::ReadRequest { filename, mode } | Message::WriteRequest { filename, mode } => {
            writer.put_text("filename", filename)?;
            writer.put_text("mode", mode)?;
        }
        Message::Data { block, payload } => {
            writer.put_u16(*block)?;
            writer.put_slice(payload)?;
        }
        Message::Ack { block } => writer.put_u16(*block)?,
        Message::Error { code, message } => {
            writer.put_u16(code.as_u16())?;
            writer.put_text("error message", message)?;
        }
    }

    Ok(writer.pos)
}
