use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport closed")]
    TransportClosed,
    #[error("Buffer allocation failed ({0} bytes)")]
    AllocationFailed(usize),
    #[error("No pending request for correlation id {0}")]
    CorrelationNotFound(u16),
    #[error("Packet signature verification failed")]
    SignatureInvalid,
    #[error("Region exceeds declared total: declared {declared}, received {received}")]
    BufferTooSmall { declared: u32, received: u32 },
    #[error("Out of bounds read: offset {offset} + length {length} exceeds {limit}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        limit: usize,
    },
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Operation canceled by server")]
    OperationCanceled,
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Binrw Error: {0}")]
    BinRWError(#[from] binrw::Error),
    #[error("Unexpected Message, {0}")]
    InvalidMessage(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Unexpected command: {0:#04x}")]
    UnexpectedCommand(u8),
    #[error("Server returned error status {}", crate::packets::header::Status::try_display_as_status(*.0))]
    ErrorStatus(u32),
}
