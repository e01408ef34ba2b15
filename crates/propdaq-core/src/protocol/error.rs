//! Protocol errors

use thiserror::Error;

use super::Message;

/// Errors that can occur during device communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("link is not open")]
    LinkNotOpen,

    #[error("link is already open")]
    AlreadyOpen,

    #[error("unknown message name: '{0}'")]
    UnknownMessageName(String),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("bad checksum: sent {sent}, calculated {calculated}")]
    BadChecksum { sent: u8, calculated: u8 },

    #[error("frame has no payload bytes")]
    EmptyFrame,

    #[error("stream id out of range: {0}")]
    BadStreamId(u8),

    #[error("no registration {id} for message '{message}'")]
    RegistrationNotFound { message: Message, id: u64 },

    #[error("listener not registered on stream {0}")]
    ListenerNotFound(u8),

    #[error("handler for '{0}' panicked")]
    HandlerFailure(Message),

    #[error("clock anomaly: {0}")]
    ClockAnomaly(String),

    #[error("probe failed on {port}: {reason}")]
    PortProbeFailure { port: String, reason: String },

    #[error("serial port error: {0}")]
    SerialError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
