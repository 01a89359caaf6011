// ABOUTME: Error types for segment decoding, durable storage, broadcast dispatch and intake
// ABOUTME: Provides structured error reporting with automatic conversion between layers

use crate::segment::Transport;
use thiserror::Error;

/// Errors raised while validating or decoding a single segment record
///
/// Every variant is local to one record: the caller rejects the record,
/// logs it, and carries on with the rest of its work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Sequence number falls outside `[0, segment_count)` once the transport offset is removed
    #[error("corrupt record: sequence {sequence} (offset {offset}) out of range for {count} segments")]
    CorruptIndex { sequence: i32, offset: i32, count: u32 },

    /// Segment count of zero or less
    #[error("corrupt record: invalid segment count {0}")]
    InvalidCount(i64),

    /// The `pdu` column is not valid hex
    #[error("invalid hex in pdu column: {0}")]
    InvalidHex(String),

    /// Packed destination port carries neither or both transport format flags
    #[error("unknown format flags in destination_port: {0:#x}")]
    UnknownFormat(u32),

    /// A group handed to assembly is missing one or more segments
    #[error("incomplete group: {received} of {expected} segments present")]
    IncompleteGroup { received: usize, expected: u32 },
}

/// Errors raised by a [`SegmentStore`](crate::store::SegmentStore) implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage is not accessible yet (for example before credential unlock)
    #[error("segment store unavailable: {0}")]
    Unavailable(String),

    /// Underlying I/O failure
    #[error("segment store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded
    #[error("undecodable row: {0}")]
    Record(#[from] RecordError),

    /// No row with this id exists
    #[error("no row with id {0}")]
    UnknownRow(i64),

    /// A lock guarding the store was poisoned by a panicking writer
    #[error("segment store lock poisoned")]
    Poisoned,
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised when handing a reassembled message downstream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No receiver is registered for this transport leg
    #[error("no broadcast receiver registered for {0}")]
    NoReceiver(Transport),

    /// The receiver went away before accepting the message
    #[error("broadcast receiver closed")]
    ReceiverClosed,
}

/// Errors raised when posting to a delivery state machine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The machine has been shut down and no longer accepts events
    #[error("delivery state machine '{0}' has shut down")]
    ShutDown(String),
}

/// Errors surfaced by the live intake path
#[derive(Debug, Error)]
pub enum IntakeError {
    /// Persisting or reading back segments failed
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The delivery queue for this transport is gone
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Result type alias for intake operations
pub type IntakeResult<T> = Result<T, IntakeError>;
