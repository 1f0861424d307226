//! libusb-backed transport
//!
//! Enumeration, configuration and interface handling go through rusb's safe
//! API. Asynchronous bulk transfers live in [`transfer`], on top of the raw
//! libusb bindings rusb re-exports.

mod transfer;

pub use transfer::LibusbTransfer;

use crate::transport::{CompletionFn, Transport, TransportError, UsbDevice, UsbHandle};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        let code = match err {
            rusb::Error::Io => TransportError::IO,
            rusb::Error::InvalidParam => TransportError::INVALID_PARAM,
            rusb::Error::Access => TransportError::ACCESS,
            rusb::Error::NoDevice => TransportError::NO_DEVICE,
            rusb::Error::NotFound => TransportError::NOT_FOUND,
            rusb::Error::Busy => TransportError::BUSY,
            rusb::Error::Timeout => TransportError::TIMEOUT,
            rusb::Error::Overflow => TransportError::OVERFLOW,
            rusb::Error::Pipe => TransportError::PIPE,
            rusb::Error::Interrupted => TransportError::INTERRUPTED,
            rusb::Error::NoMem => TransportError::NO_MEM,
            rusb::Error::NotSupported => TransportError::NOT_SUPPORTED,
            _ => TransportError::OTHER,
        };
        TransportError::new(code, err.to_string())
    }
}

/// libusb context shared by every device opened through it
pub struct LibusbTransport {
    context: Context,
}

impl LibusbTransport {
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::new()?;
        debug!("libusb context initialized");
        Ok(Self { context })
    }
}

impl Transport for LibusbTransport {
    type Device = LibusbDevice;
    type Handle = LibusbHandle;

    fn devices(&self) -> Result<Vec<LibusbDevice>, TransportError> {
        let list = self.context.devices()?;

        let mut devices = Vec::with_capacity(list.len());
        for device in list.iter() {
            match device.device_descriptor() {
                Ok(descriptor) => devices.push(LibusbDevice { device, descriptor }),
                Err(e) => warn!(
                    "Skipping device {:03}:{:03}, unreadable descriptor: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(devices)
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        self.context.handle_events(Some(timeout))?;
        Ok(())
    }

    fn interrupt_events(&self) {
        // SAFETY: the context pointer stays valid for as long as `self.context` lives.
        unsafe { rusb::ffi::libusb_interrupt_event_handler(self.context.as_raw()) };
    }
}

/// Enumerated device with its cached descriptor
pub struct LibusbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
}

impl UsbDevice for LibusbDevice {
    type Handle = LibusbHandle;

    fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    fn has_serial_number(&self) -> bool {
        self.descriptor.serial_number_string_index().is_some()
    }

    fn open(&self) -> Result<LibusbHandle, TransportError> {
        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            TransportError::from(e)
        })?;

        Ok(LibusbHandle {
            handle,
            serial_index: self.descriptor.serial_number_string_index(),
        })
    }
}

pub struct LibusbHandle {
    handle: DeviceHandle<Context>,
    serial_index: Option<u8>,
}

impl UsbHandle for LibusbHandle {
    type Transfer = LibusbTransfer;

    fn read_serial_number(&self) -> Result<Option<String>, TransportError> {
        let Some(index) = self.serial_index else {
            return Ok(None);
        };
        Ok(Some(self.handle.read_string_descriptor_ascii(index)?))
    }

    fn active_configuration(&self) -> Result<u8, TransportError> {
        Ok(self.handle.active_configuration()?)
    }

    fn set_active_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        Ok(self.handle.set_active_configuration(config)?)
    }

    fn interface_count(&self) -> Result<u8, TransportError> {
        let config = self.handle.device().active_config_descriptor()?;
        Ok(config.num_interfaces())
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(active) => Ok(active),
            Err(rusb::Error::NotSupported) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.detach_kernel_driver(interface)?)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.claim_interface(interface)?)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.release_interface(interface)?)
    }

    fn alloc_transfer(&self, on_complete: CompletionFn) -> Result<LibusbTransfer, TransportError> {
        LibusbTransfer::new(&self.handle, on_complete)
    }
}
