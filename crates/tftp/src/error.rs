//! Transfer errors
//!
//! Every way a single transfer can end badly. None of these affect other
//! transfers or the supervisor that spawned the failed one.

use std::io;

use thiserror::Error;

use crate::protocol::{DecodeError, EncodeError, Message, TftpErrorCode};

#[derive(Debug, Error)]
pub enum TransferError {
    /// The datagram endpoint failed
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The local file could not be read or removed
    #[error("storage error: {0}")]
    Storage(#[source] io::Error),

    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("cannot encode packet: {0}")]
    Encode(#[from] EncodeError),

    /// The peer sent a well-formed packet that is illegal at this point
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer ended the transfer with an ERROR packet
    #[error("peer reported {code}: {message}")]
    Remote { code: TftpErrorCode, message: String },

    /// This side refused the transfer, e.g. because the destination cannot be created
    #[error("refused with {code}: {message}")]
    Rejected { code: TftpErrorCode, message: String },

    #[error("no response after {attempts} attempts")]
    Timeout { attempts: usize },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer task panicked: {0}")]
    Panicked(String),
}

impl TransferError {
    /// The protocol error code that best describes this failure
    pub fn code(&self) -> TftpErrorCode {
        match self {
            Self::Decode(_) | Self::Protocol(_) => TftpErrorCode::IllegalOperation,
            Self::Remote { code, .. } | Self::Rejected { code, .. } => *code,
            Self::Transport(_)
            | Self::Storage(_)
            | Self::Encode(_)
            | Self::Timeout { .. }
            | Self::Cancelled
            | Self::Panicked(_) => TftpErrorCode::NotDefined,
        }
    }

    /// The ERROR packet to send the peer before tearing the transfer down.
    ///
    /// Nothing is sent for errors the peer reported itself, for a dead
    /// endpoint, or for a peer that stopped answering.
    pub fn reply(&self) -> Option<Message> {
        match self {
            Self::Decode(err) => Some(Message::error(TftpErrorCode::IllegalOperation, err.to_string())),
            Self::Protocol(message) => Some(Message::error(TftpErrorCode::IllegalOperation, message.as_str())),
            Self::Rejected { code, message } => Some(Message::error(*code, message.as_str())),
            Self::Storage(err) => Some(Message::error(TftpErrorCode::NotDefined, err.to_string())),
            Self::Cancelled => Some(Message::error(TftpErrorCode::NotDefined, "transfer cancelled")),
            Self::Transport(_) | Self::Encode(_) | Self::Remote { .. } | Self::Timeout { .. } | Self::Panicked(_) => None,
        }
    }
}
