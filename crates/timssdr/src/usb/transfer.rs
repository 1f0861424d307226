//! Reusable asynchronous bulk transfer on raw libusb

use crate::transport::{BulkTransfer, Completion, CompletionFn, TransferStatus, TransportError};
use bytes::BytesMut;
use rusb::constants::*;
use rusb::ffi::*;
use rusb::{Context, DeviceHandle};
use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, warn};

fn check_transfer_error(status: c_int) -> Result<(), TransportError> {
    if status >= 0 {
        return Ok(());
    }
    let message = match status {
        LIBUSB_ERROR_NO_DEVICE => "No such device (it may have been disconnected)",
        LIBUSB_ERROR_BUSY => "Resource busy",
        LIBUSB_ERROR_NOT_SUPPORTED => "Operation not supported or unimplemented on this platform",
        LIBUSB_ERROR_INVALID_PARAM => "Invalid parameter",
        LIBUSB_ERROR_NO_MEM => "Insufficient memory",
        _ => "Other error",
    };
    Err(TransportError::new(status, message))
}

fn map_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// State the completion callback reaches through `user_data`
struct TransferState {
    /// The submitted buffer; `Some` exactly while the transfer is in flight
    buffer: Mutex<Option<BytesMut>>,
    on_complete: CompletionFn,
}

/// One libusb transfer descriptor, reused across submissions
///
/// The device handle it was allocated on must outlive it; the device frees
/// its transfers before closing the handle.
pub struct LibusbTransfer {
    raw: NonNull<libusb_transfer>,
    handle: NonNull<libusb_device_handle>,
    state: Arc<TransferState>,
    _context: Context,
}

// SAFETY: the raw pointers are only dereferenced by libusb; the buffer is
// guarded by the state mutex.
unsafe impl Send for LibusbTransfer {}

impl LibusbTransfer {
    pub(crate) fn new(
        handle: &DeviceHandle<Context>,
        on_complete: CompletionFn,
    ) -> Result<Self, TransportError> {
        // SAFETY: plain allocation, checked for NULL below.
        let raw = unsafe { libusb_alloc_transfer(0) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| TransportError::new(TransportError::NO_MEM, "Insufficient memory"))?;
        let handle_ptr = NonNull::new(handle.as_raw())
            .ok_or_else(|| TransportError::new(TransportError::INVALID_PARAM, "Invalid parameter"))?;

        Ok(Self {
            raw,
            handle: handle_ptr,
            state: Arc::new(TransferState {
                buffer: Mutex::new(None),
                on_complete,
            }),
            _context: handle.context().clone(),
        })
    }

    fn in_flight(&self) -> bool {
        self.state
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut libusb_transfer) {
    // SAFETY: libusb passes the transfer that completed, which stays allocated
    // while in flight.
    let Some(transfer) = (unsafe { transfer_ptr.as_ref() }) else {
        return;
    };
    // SAFETY: user_data was set to the `TransferState` of the owning
    // `LibusbTransfer`, which is never freed while a submission is pending.
    let Some(state) = (unsafe { (transfer.user_data as *const TransferState).as_ref() }) else {
        return;
    };

    let buffer = state
        .buffer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(buffer) = buffer else {
        return;
    };

    let completion = Completion {
        status: map_status(transfer.status),
        actual_length: usize::try_from(transfer.actual_length).unwrap_or(0),
        buffer,
    };
    // Unwinding across the libusb callback would abort the process.
    if panic::catch_unwind(AssertUnwindSafe(|| (state.on_complete)(completion))).is_err() {
        error!("Panic in transfer completion handler");
    }
}

impl BulkTransfer for LibusbTransfer {
    fn submit(
        &mut self,
        endpoint: u8,
        buffer: BytesMut,
        length: usize,
    ) -> Result<(), (BytesMut, TransportError)> {
        let Some(length) = c_int::try_from(length).ok().filter(|_| length <= buffer.len()) else {
            return Err((
                buffer,
                TransportError::new(TransportError::INVALID_PARAM, "Invalid parameter"),
            ));
        };

        let mut slot = self
            .state
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err((
                buffer,
                TransportError::new(TransportError::BUSY, "Resource busy"),
            ));
        }

        // Park the buffer before submitting: the heap data does not move, and
        // the callback finds it once it can take the lock.
        let buffer = slot.insert(buffer);
        let data = buffer.as_mut_ptr();
        let user_data = Arc::as_ptr(&self.state) as *mut c_void;

        // SAFETY: `raw` and `handle` are valid, `data` points at `length`
        // bytes owned by the parked buffer until the completion takes it, and
        // `user_data` outlives the submission.
        let result = unsafe {
            libusb_fill_bulk_transfer(
                self.raw.as_ptr(),
                self.handle.as_ptr(),
                endpoint,
                data,
                length,
                transfer_finished as _,
                user_data,
                0,
            );
            libusb_submit_transfer(self.raw.as_ptr())
        };

        match check_transfer_error(result) {
            Ok(()) => Ok(()),
            Err(e) => match slot.take() {
                Some(buffer) => Err((buffer, e)),
                None => Err((BytesMut::new(), e)),
            },
        }
    }

    fn cancel(&self) {
        let slot = self
            .state
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            // SAFETY: the transfer is in flight; cancelling only queues a
            // CANCELLED completion.
            unsafe {
                libusb_cancel_transfer(self.raw.as_ptr());
            }
        }
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        if self.in_flight() {
            // libusb still references the descriptor and our state; leaking is
            // the only sound option.
            warn!("Dropping an in-flight transfer, leaking it");
            std::mem::forget(self.state.clone());
            return;
        }
        // SAFETY: not in flight, so libusb holds no reference to it.
        unsafe { libusb_free_transfer(self.raw.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(map_status(LIBUSB_TRANSFER_COMPLETED), TransferStatus::Completed);
        assert_eq!(map_status(LIBUSB_TRANSFER_CANCELLED), TransferStatus::Cancelled);
        assert_eq!(map_status(LIBUSB_TRANSFER_NO_DEVICE), TransferStatus::NoDevice);
        assert_eq!(map_status(LIBUSB_TRANSFER_ERROR), TransferStatus::Error);
    }

    #[test]
    fn test_check_transfer_error() {
        assert!(check_transfer_error(0).is_ok());
        let err = check_transfer_error(LIBUSB_ERROR_NO_DEVICE).unwrap_err();
        assert_eq!(err.code, TransportError::NO_DEVICE);
    }
}
