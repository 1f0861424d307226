//! TX flush controller
//!
//! A transmit session that runs out of samples must not be cut off with a
//! cancel while the device still holds buffered samples. Instead one extra
//! zero-filled transfer is queued behind the data on the OUT endpoint; its
//! completion is the real end of the session.

use super::{FlushCallback, Shared, TX_ENDPOINT_ADDRESS, catch_callback_panic};
use crate::error::{Error, Result};
use crate::transport::{BulkTransfer, Completion, CompletionFn, TransportError};
use bytes::BytesMut;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

pub(crate) struct FlushTransfer<X> {
    transfer: X,
    /// `None` while the transfer is in flight
    buffer: Option<BytesMut>,
}

impl<X: BulkTransfer> FlushTransfer<X> {
    pub(crate) fn new(transfer: X, size: usize) -> Self {
        Self {
            transfer,
            buffer: Some(BytesMut::zeroed(size)),
        }
    }

    pub(crate) fn submit(&mut self) -> std::result::Result<(), TransportError> {
        let buffer = self.buffer.take().ok_or_else(|| {
            TransportError::new(TransportError::BUSY, "flush transfer already submitted")
        })?;
        let length = buffer.len();
        self.transfer
            .submit(TX_ENDPOINT_ADDRESS, buffer, length)
            .map_err(|(buffer, e)| {
                self.buffer = Some(buffer);
                e
            })
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.buffer.is_none()
    }

    pub(crate) fn cancel(&self) {
        if self.is_in_flight() {
            self.transfer.cancel();
        }
    }

    fn restore(&mut self, buffer: BytesMut) {
        self.buffer = Some(buffer);
    }
}

/// Completion closure for the flush transfer
pub(crate) fn completion_fn<X: BulkTransfer>(shared: Weak<Shared<X>>) -> CompletionFn {
    Box::new(move |completion| {
        if let Some(shared) = shared.upgrade() {
            on_flush_complete(&shared, completion);
        }
    })
}

/// Register the flush callback, allocating the flush transfer on first use
///
/// `alloc` creates the descriptor; it is only called when no flush transfer
/// exists yet, so re-enabling just swaps the callback.
pub(crate) fn enable<X, F>(shared: &Shared<X>, callback: FlushCallback, alloc: F) -> Result<()>
where
    X: BulkTransfer,
    F: FnOnce() -> std::result::Result<X, TransportError>,
{
    let mut state = shared.lock();
    state.flush_callback = Some(callback);

    if state.flush.is_some() {
        return Ok(());
    }

    let transfer = alloc()?;
    state.flush = Some(FlushTransfer::new(transfer, shared.config.flush_buffer_size));
    debug!(
        "TX flush enabled ({} byte flush transfer)",
        shared.config.flush_buffer_size
    );
    Ok(())
}

/// Free the flush transfer and forget the callback
pub(crate) fn disable<X: BulkTransfer>(shared: &Shared<X>) -> Result<()> {
    let mut state = shared.lock();
    if state.flush_in_flight {
        return Err(Error::Busy);
    }

    state.flush = None;
    state.flush_callback = None;
    state.flush_armed = false;
    debug!("TX flush disabled");
    Ok(())
}

/// Submit the flush transfer; on failure the session ends without one
///
/// Must be called with the lock held.
pub(crate) fn submit<X: BulkTransfer>(
    shared: &Shared<X>,
    state: &mut super::EngineState<X>,
) -> std::result::Result<(), TransportError> {
    let result = match state.flush.as_mut() {
        Some(flush) => flush.submit(),
        None => Err(TransportError::new(
            TransportError::NOT_FOUND,
            "no flush transfer allocated",
        )),
    };

    match result {
        Ok(()) => {
            state.flush_in_flight = true;
            trace!("Flush transfer submitted");
        }
        Err(_) => {
            shared.set_streaming(false);
            state.flush_armed = false;
        }
    }
    result
}

fn on_flush_complete<X: BulkTransfer>(shared: &Arc<Shared<X>>, completion: Completion) {
    let success = completion.status.is_success();

    let callback = {
        let mut state = shared.lock();
        if let Some(flush) = state.flush.as_mut() {
            flush.restore(completion.buffer);
        }
        state.flush_in_flight = false;
        state.flush_armed = false;

        if state.all_finished() {
            shared.all_finished.notify_all();
        }
        state.flush_callback.clone()
    };

    debug!(
        "Flush transfer finished: {:?} ({} bytes)",
        completion.status, completion.actual_length
    );

    if let Some(callback) = callback {
        catch_callback_panic("flush", || callback(success));
    }
}
