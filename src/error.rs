use std::num::ParseIntError;
use thiserror::Error;

/// Errors returned by the demux device core.
#[derive(Error, Debug)]
pub enum DmxError {
    /// I/O failure while loading configuration
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed numeric configuration value
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),

    /// Configuration rejected by validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Data did not fit in the output ring buffer
    #[error("buffer overflow")]
    BufferOverflow,

    /// The event queue had no free slot
    #[error("event queue overflow")]
    EventOverflow,

    /// The raw-input command ring had no free slot
    #[error("command queue overflow")]
    CommandOverflow,

    /// A section filter deadline expired
    #[error("section filter timed out")]
    Timeout,

    /// Operation is not valid in the current filter state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation conflicts with a running filter or in-flight input
    #[error("device busy: {0}")]
    Busy(String),

    /// Parameter rejected by validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The demux engine does not implement the operation
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Operation not permitted with the current source, mode or capabilities
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Every filter slot is in use
    #[error("no free filter slot")]
    NoFreeFilter,

    /// Storage could not be provided for a buffer
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Output has no room for the requested amount and waiting was not allowed
    #[error("no space left in output")]
    NoSpace,

    /// No event is pending
    #[error("no data available")]
    NoData,

    /// Non-blocking operation could not make progress
    #[error("operation would block")]
    WouldBlock,

    /// The filter left the runnable set while a consumer was waiting
    #[error("filter is not running")]
    NotRunning,

    /// The collaborator needed for the operation is missing
    #[error("no device: {0}")]
    NoDevice(String),

    /// The device or its raw-input path is being torn down
    #[error("device is shutting down")]
    Teardown,

    /// Failure reported by the demux engine
    #[error("engine error: {0}")]
    Engine(String),
}

/// Coarse failure taxonomy used when deciding how an error surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Ring, event or command overflow; latched and reported once
    Capacity,
    /// Invalid state or parameters; no state change
    Configuration,
    /// Allocation failure or no free slot
    Resource,
    /// Section deadline expiry
    Timing,
    /// Device or raw-input teardown
    Teardown,
    /// Everything else, including collaborator failures
    Other,
}

impl DmxError {
    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DmxError::BufferOverflow | DmxError::EventOverflow | DmxError::CommandOverflow => {
                ErrorClass::Capacity
            }
            DmxError::InvalidState(_)
            | DmxError::Busy(_)
            | DmxError::InvalidArgument(_)
            | DmxError::PermissionDenied(_)
            | DmxError::Config(_)
            | DmxError::ParseInt(_) => ErrorClass::Configuration,
            DmxError::NoFreeFilter | DmxError::OutOfMemory(_) => ErrorClass::Resource,
            DmxError::Timeout => ErrorClass::Timing,
            DmxError::Teardown => ErrorClass::Teardown,
            _ => ErrorClass::Other,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DmxError::InvalidArgument(msg.into())
    }

    pub(crate) fn busy(msg: impl Into<String>) -> Self {
        DmxError::Busy(msg.into())
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        DmxError::PermissionDenied(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        DmxError::NotSupported(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DmxError>;
