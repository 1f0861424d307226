//! Library context
//!
//! [`Timssdr`] owns the USB transport and counts the devices opened through
//! it; it can only be torn down once every device is closed.

use crate::config::EngineConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::list::{self, DeviceList, USB_MAX_SERIAL_LENGTH};
use crate::transport::Transport;
use crate::usb::LibusbTransport;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

pub(crate) struct ContextInner<T> {
    pub(crate) transport: Arc<T>,
    pub(crate) config: EngineConfig,
    pub(crate) open_devices: AtomicUsize,
}

/// TimsSDR library context
pub struct Timssdr<T: Transport = LibusbTransport> {
    inner: Arc<ContextInner<T>>,
}

impl Timssdr<LibusbTransport> {
    /// Initialize libusb with the default engine configuration
    pub fn init() -> Result<Self> {
        Self::with_transport(LibusbTransport::new()?, EngineConfig::default())
    }
}

impl<T: Transport> Timssdr<T> {
    pub fn with_transport(transport: T, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            "TimsSDR context ready: {} x {} byte transfers",
            config.transfer_count, config.transfer_buffer_size
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                transport: Arc::new(transport),
                config,
                open_devices: AtomicUsize::new(0),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn open_device_count(&self) -> usize {
        self.inner.open_devices.load(Ordering::SeqCst)
    }

    pub fn library_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Scan the bus for boards
    pub fn device_list(&self) -> Result<DeviceList<T::Device>> {
        list::scan(self.inner.transport.as_ref())
    }

    /// Open the first board found
    pub fn open(&self) -> Result<Device<T>> {
        self.open_by_serial(None)
    }

    /// Open the first board whose serial number ends with `serial_suffix`
    ///
    /// `None` opens the first board found. A suffix longer than any serial
    /// number never matches.
    pub fn open_by_serial(&self, serial_suffix: Option<&str>) -> Result<Device<T>> {
        let Some(suffix) = serial_suffix else {
            let list = self.device_list()?;
            return self.open_from_list(&list, 0).map_err(|e| match e {
                Error::InvalidParam => Error::NotFound,
                e => e,
            });
        };

        if suffix.chars().count() > USB_MAX_SERIAL_LENGTH {
            return Err(Error::NotFound);
        }

        let list = self.device_list()?;
        let index = list
            .entries()
            .iter()
            .position(|entry| {
                entry
                    .serial_number
                    .as_deref()
                    .is_some_and(|serial| serial.ends_with(suffix))
            })
            .ok_or(Error::NotFound)?;
        self.open_from_list(&list, index)
    }

    /// Open entry `index` of a list returned by [`device_list`](Self::device_list)
    pub fn open_from_list(&self, list: &DeviceList<T::Device>, index: usize) -> Result<Device<T>> {
        let device = list.device(index).ok_or(Error::InvalidParam)?;
        Device::open(self.inner.clone(), device)
    }

    /// Tear down the context
    ///
    /// Refuses with [`Error::NotLastDevice`] while any device is open, handing
    /// the context back.
    pub fn exit(self) -> std::result::Result<(), (Self, Error)> {
        if self.open_device_count() > 0 {
            return Err((self, Error::NotLastDevice));
        }
        debug!("TimsSDR context closed");
        Ok(())
    }
}

impl<T: Transport> std::fmt::Debug for Timssdr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timssdr")
            .field("config", &self.inner.config)
            .field("open_devices", &self.open_device_count())
            .finish()
    }
}
