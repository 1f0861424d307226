//! USB host-access boundary
//!
//! The streaming engine never talks to libusb directly. Everything it needs
//! from the host stack (enumeration, configuration, interface claims and
//! asynchronous bulk transfers) goes through the traits in this module.
//! [`crate::usb::LibusbTransport`] implements them on top of rusb, and
//! `test_utils::MockBus` (feature `test-utils`) simulates a bus for tests.
//!
//! Completion delivery rules every implementation must follow:
//! - completions only fire from inside [`Transport::handle_events`]
//! - [`BulkTransfer::submit`] and [`BulkTransfer::cancel`] never invoke the
//!   completion synchronously (the engine calls both with its device lock held)
//! - a cancelled transfer still completes, with [`TransferStatus::Cancelled`]

use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;

/// Error reported by the USB host library
///
/// `code` follows libusb's numbering so logs line up with libusb's own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub const IO: i32 = -1;
    pub const INVALID_PARAM: i32 = -2;
    pub const ACCESS: i32 = -3;
    pub const NO_DEVICE: i32 = -4;
    pub const NOT_FOUND: i32 = -5;
    pub const BUSY: i32 = -6;
    pub const TIMEOUT: i32 = -7;
    pub const OVERFLOW: i32 = -8;
    pub const PIPE: i32 = -9;
    pub const INTERRUPTED: i32 = -10;
    pub const NO_MEM: i32 = -11;
    pub const NOT_SUPPORTED: i32 = -12;
    pub const OTHER: i32 = -99;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn interrupted() -> Self {
        Self::new(Self::INTERRUPTED, "System call interrupted")
    }

    pub fn is_interrupted(&self) -> bool {
        self.code == Self::INTERRUPTED
    }

    pub fn is_not_supported(&self) -> bool {
        self.code == Self::NOT_SUPPORTED
    }
}

/// Final status of one physical transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// A finished transfer, handing its buffer back to the owner
#[derive(Debug)]
pub struct Completion {
    pub status: TransferStatus,
    /// Bytes actually moved over the bus
    pub actual_length: usize,
    pub buffer: BytesMut,
}

/// Invoked on the event thread once per finished transfer
pub type CompletionFn = Box<dyn Fn(Completion) + Send + Sync + 'static>;

/// Shared USB context
pub trait Transport: Send + Sync + 'static {
    type Device: UsbDevice<Handle = Self::Handle>;
    type Handle: UsbHandle;

    /// Every device currently on the bus, in bus enumeration order
    fn devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    /// Run one bounded event-processing step
    ///
    /// Returns the `INTERRUPTED` error when woken by
    /// [`interrupt_events`](Transport::interrupt_events).
    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Wake all threads blocked in [`handle_events`](Transport::handle_events)
    fn interrupt_events(&self);
}

/// An enumerated, not yet opened device
pub trait UsbDevice {
    type Handle: UsbHandle;

    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
    /// Whether the device descriptor names a serial number string
    fn has_serial_number(&self) -> bool;
    fn open(&self) -> Result<Self::Handle, TransportError>;
}

/// An opened device
pub trait UsbHandle: Send + 'static {
    type Transfer: BulkTransfer;

    /// The serial number string descriptor, `None` when the device has none
    fn read_serial_number(&self) -> Result<Option<String>, TransportError>;
    fn active_configuration(&self) -> Result<u8, TransportError>;
    fn set_active_configuration(&mut self, config: u8) -> Result<(), TransportError>;
    /// Number of interfaces in the active configuration
    fn interface_count(&self) -> Result<u8, TransportError>;
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError>;
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError>;
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;
    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;
    /// Allocate a bulk transfer descriptor bound to this handle
    fn alloc_transfer(&self, on_complete: CompletionFn) -> Result<Self::Transfer, TransportError>;
}

/// One reusable asynchronous bulk transfer descriptor
pub trait BulkTransfer: Send + 'static {
    /// Submit `length` bytes of `buffer` on `endpoint`
    ///
    /// The transfer owns the buffer until its completion fires. On failure
    /// the buffer is handed straight back.
    fn submit(
        &mut self,
        endpoint: u8,
        buffer: BytesMut,
        length: usize,
    ) -> Result<(), (BytesMut, TransportError)>;

    /// Request asynchronous cancellation; a no-op when nothing is in flight
    fn cancel(&self);
}
