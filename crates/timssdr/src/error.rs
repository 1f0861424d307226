//! Driver error types

use crate::transport::TransportError;
use thiserror::Error;

/// Errors returned by every fallible driver operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Caller passed an out-of-range index or an invalid configuration
    #[error("invalid parameter(s)")]
    InvalidParam,

    /// No matching board on the bus
    #[error("TimsSDR not found")]
    NotFound,

    /// Operation requested while the resource is already active
    #[error("TimsSDR busy")]
    Busy,

    /// Buffer or transfer descriptor allocation failed
    #[error("insufficient memory")]
    NoMem,

    /// Failure reported by the USB host library
    #[error("USB error: {0}")]
    Usb(#[from] TransportError),

    /// Event thread could not be spawned or joined
    #[error("transfer thread error")]
    Thread,

    /// Context teardown attempted while devices remain open
    #[error("one or more TimsSDRs still in use")]
    NotLastDevice,

    /// The event thread is not running
    #[error("streaming thread encountered an error")]
    StreamingThreadFailed,

    /// No session is streaming (never started, stopped, or a transfer failed)
    #[error("streaming stopped")]
    StreamingStopped,

    /// The event thread was asked to exit
    #[error("streaming terminated")]
    StreamingHalted,

    /// Stop requested but no transfers are configured
    #[error("transfers not configured")]
    NotConfigured,

    #[error("unspecified error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
