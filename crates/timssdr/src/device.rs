//! Opened board: setup, streaming control, and teardown

use crate::context::ContextInner;
use crate::engine::{
    BlockCompleteCallback, BlockReport, Direction, FlushCallback, SampleBlock, Shared,
    StreamControl, dispatch, event_thread, flush, pool, stream,
};
use crate::error::{Error, Result};
use crate::list::truncate_serial;
use crate::transport::{Transport, TransportError, UsbDevice, UsbHandle};
use crate::usb::LibusbTransport;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

type TransferOf<T> = <<T as Transport>::Handle as UsbHandle>::Transfer;

/// Board part ID and serial number words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartIdSerialNo {
    pub part_id: [u32; 2],
    pub serial_no: [u32; 4],
}

/// An open TimsSDR board
///
/// Owns the USB handle, the transfer pool, and the event thread that
/// delivers transfer completions. Dropping it closes the board.
pub struct Device<T: Transport = LibusbTransport> {
    context: Arc<ContextInner<T>>,
    handle: Option<T::Handle>,
    shared: Arc<Shared<TransferOf<T>>>,
    event_thread: Option<JoinHandle<()>>,
    serial_number: Option<String>,
    closed: bool,
}

impl<T: Transport> Device<T> {
    /// Open `usb_device` and bring it up for streaming
    pub(crate) fn open(context: Arc<ContextInner<T>>, usb_device: &T::Device) -> Result<Self> {
        let config = &context.config;
        let mut handle = usb_device.open()?;

        let serial_number = match handle.read_serial_number() {
            Ok(serial) => serial.map(truncate_serial),
            Err(e) => {
                debug!("Could not read serial number: {}", e);
                None
            }
        };

        set_configuration(&mut handle, config.usb_configuration)?;

        handle.claim_interface(config.interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", config.interface, e);
            e
        })?;

        let shared = Arc::new(Shared::new(config.clone()));
        let weak = Arc::downgrade(&shared);
        let allocated = pool::install(&shared, |index| {
            handle.alloc_transfer(dispatch::completion_fn(weak.clone(), index))
        });
        if let Err(e) = allocated {
            release(&mut handle, config.interface);
            return Err(e);
        }

        let event_thread = match event_thread::spawn(context.transport.clone(), shared.clone()) {
            Ok(thread) => thread,
            Err(e) => {
                shared.lock().pool = None;
                release(&mut handle, config.interface);
                return Err(e);
            }
        };

        context.open_devices.fetch_add(1, Ordering::SeqCst);
        info!(
            "Opened TimsSDR {}",
            serial_number.as_deref().unwrap_or("(no serial)")
        );

        Ok(Self {
            context,
            handle: Some(handle),
            shared,
            event_thread: Some(event_thread),
            serial_number,
            closed: false,
        })
    }

    /// Start receiving; `callback` consumes each filled buffer
    pub fn start_rx<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&mut SampleBlock<'_>) -> StreamControl + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if !state.transfers_configured {
                state.flush_armed = false;
            }
        }
        stream::start(&self.shared, Direction::Receive, Box::new(callback))
    }

    pub fn stop_rx(&mut self) -> Result<()> {
        stream::cancel(&self.shared)
    }

    /// Start transmitting; `callback` fills each buffer before it is sent
    ///
    /// With a flush callback registered, a flush transfer follows the last
    /// buffer once the callback stops producing.
    pub fn start_tx<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&mut SampleBlock<'_>) -> StreamControl + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if !state.transfers_configured {
                state.flush_armed = state.flush.is_some();
            }
        }
        stream::start(&self.shared, Direction::Transmit, Box::new(callback))
    }

    pub fn stop_tx(&mut self) -> Result<()> {
        stream::cancel(&self.shared)
    }

    /// Observe every finished transfer, successful or not
    pub fn set_tx_block_complete_callback<F>(&mut self, callback: F)
    where
        F: Fn(&BlockReport<'_>) + Send + Sync + 'static,
    {
        self.shared
            .set_block_complete_callback(Some(Arc::new(callback) as BlockCompleteCallback));
    }

    pub fn clear_tx_block_complete_callback(&mut self) {
        self.shared.set_block_complete_callback(None);
    }

    /// Send one zero-filled flush transfer after the last TX buffer and report its outcome
    pub fn enable_tx_flush<F>(&mut self, callback: F) -> Result<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let Some(handle) = self.handle.as_ref() else {
            return Err(Error::NotConfigured);
        };
        let weak = Arc::downgrade(&self.shared);
        flush::enable(&self.shared, Arc::new(callback) as FlushCallback, || {
            handle.alloc_transfer(flush::completion_fn(weak))
        })
    }

    pub fn disable_tx_flush(&mut self) -> Result<()> {
        flush::disable(&self.shared)
    }

    /// Whether a session is actively streaming
    pub fn is_streaming(&self) -> bool {
        self.streaming_status().is_ok()
    }

    /// `Ok` while streaming, otherwise the reason it is not
    pub fn streaming_status(&self) -> Result<()> {
        if !self.shared.thread_running.load(Ordering::Acquire) {
            return Err(Error::StreamingThreadFailed);
        }
        if !self.shared.is_streaming() {
            return Err(Error::StreamingStopped);
        }
        if self.shared.do_exit.load(Ordering::Acquire) {
            return Err(Error::StreamingHalted);
        }
        Ok(())
    }

    /// Pool transfers currently submitted
    pub fn active_transfers(&self) -> usize {
        self.shared.lock().active_transfers
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// The board firmware has no part ID request yet; returns the fixed
    /// FT232R identity.
    pub fn board_partid_serialno_read(&self) -> Result<PartIdSerialNo> {
        Ok(PartIdSerialNo {
            part_id: [0x60, 0x14],
            serial_no: [0; 4],
        })
    }

    /// Stop streaming, shut down the event thread, and release the board
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error: Option<Error> = None;

        let configured = self.shared.lock().transfers_configured;
        if configured && let Err(e) = stream::cancel(&self.shared) {
            first_error.get_or_insert(e);
        }

        if let Some(thread) = self.event_thread.take() {
            let transport = self.context.transport.as_ref();
            if let Err(e) = event_thread::shutdown(transport, &self.shared, thread) {
                first_error.get_or_insert(e);
            }
        }

        // Nothing delivers completions any more; free descriptors only if
        // libusb no longer owns them.
        let (pool, flush) = {
            let mut state = self.shared.lock();
            state.sample_callback = None;
            state.flush_callback = None;
            (state.pool.take(), state.flush.take())
        };
        if let Some(pool) = pool
            && pool.in_flight() > 0
        {
            warn!("{} transfers still in flight at close, leaking them", pool.in_flight());
            std::mem::forget(pool);
        }
        if let Some(flush) = flush
            && flush.is_in_flight()
        {
            warn!("Flush transfer still in flight at close, leaking it");
            std::mem::forget(flush);
        }

        if let Some(mut handle) = self.handle.take() {
            release(&mut handle, self.context.config.interface);
        }

        self.context.open_devices.fetch_sub(1, Ordering::SeqCst);
        info!(
            "Closed TimsSDR {}",
            self.serial_number.as_deref().unwrap_or("(no serial)")
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T: Transport> Drop for Device<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Error closing device: {}", e);
        }
    }
}

impl<T: Transport> std::fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial_number", &self.serial_number)
            .field("closed", &self.closed)
            .finish()
    }
}

fn release<H: UsbHandle>(handle: &mut H, interface: u8) {
    if let Err(e) = handle.release_interface(interface) {
        warn!("Failed to release interface {}: {}", interface, e);
    }
}

/// Select `configuration`, detaching kernel drivers that would block it
fn set_configuration<H: UsbHandle>(handle: &mut H, configuration: u8) -> Result<()> {
    let current = handle.active_configuration()?;
    if current != configuration {
        detach_kernel_drivers(handle)?;
        handle.set_active_configuration(configuration).map_err(|e| {
            warn!("Failed to set configuration {}: {}", configuration, e);
            e
        })?;
        debug!("Configuration changed from {} to {}", current, configuration);
    }

    detach_kernel_drivers(handle)
}

fn detach_kernel_drivers<H: UsbHandle>(handle: &mut H) -> Result<()> {
    let interfaces = handle.interface_count()?;
    for interface in 0..interfaces {
        match handle.kernel_driver_active(interface) {
            Ok(false) => continue,
            Ok(true) => {}
            // Platforms without kernel drivers to detach
            Err(e) if e.is_not_supported() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        handle
            .detach_kernel_driver(interface)
            .map_err(|e: TransportError| {
                warn!("Failed to detach kernel driver from interface {}: {}", interface, e);
                e
            })?;
        debug!("Detached kernel driver from interface {}", interface);
    }
    Ok(())
}
