//! Membership error types.
//!
//! Steady-state failures (transport, codec, protocol) are logged and absorbed by
//! the coordinator. Join failures and configuration errors are the only ones a
//! caller ever sees.

use std::net::SocketAddr;

use thiserror::Error;

use crate::message::RejectReason;

pub type Result<T> = std::result::Result<T, MembershipError>;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Join failed: {0}")]
    Join(#[from] JoinError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Terminal startup failures of the join protocol.
#[derive(Debug, Error)]
pub enum JoinError {
    /// A contact node refused admission. No retry is attempted.
    #[error("Join rejected by {contact}: {reason}")]
    Rejected {
        contact: SocketAddr,
        reason: RejectReason,
    },

    /// Every seed was tried the configured number of times without a reply.
    #[error("No seed answered after {attempts} attempts")]
    SeedsExhausted { attempts: u32 },

    /// The node was shut down before the join completed.
    #[error("Join aborted by shutdown")]
    Aborted,

    /// The inbound queue closed while waiting for a reply.
    #[error("Inbound channel closed while joining")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(SocketAddr),

    #[error("Inbound queue of {0} is full")]
    QueueFull(SocketAddr),

    #[error("Frame of {size} bytes exceeds datagram limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
