//! Starting and stopping a streaming session

use super::dispatch::pad_to_packet;
use super::{
    Direction, SampleBlock, SampleCallback, Shared, StreamControl, catch_callback_panic, flush,
};
use crate::error::{Error, Result};
use crate::transport::{BulkTransfer, TransportError};
use std::sync::PoisonError;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Prime (TX only) and submit the whole pool on `direction`'s endpoint
///
/// Everything happens under the device lock, so no completion can resubmit
/// a slot before every initial slot is in flight.
pub(crate) fn start<X: BulkTransfer>(
    shared: &Shared<X>,
    direction: Direction,
    mut callback: SampleCallback,
) -> Result<()> {
    let mut guard = shared.lock();
    let state = &mut *guard;

    if state.transfers_configured {
        return Err(Error::Busy);
    }

    let Some(pool) = state.pool.as_mut() else {
        return Err(Error::Other("transfer pool not allocated".to_string()));
    };
    let count = pool.len();
    let capacity = pool.buffer_size();

    // TX: every buffer is filled before any is submitted, otherwise an early
    // completion could call the sample callback concurrently with priming.
    let mut lengths = Vec::with_capacity(count);
    match direction {
        Direction::Transmit => {
            for index in 0..count {
                let Some(buffer) = pool.slot_mut(index).and_then(|slot| slot.buffer_mut()) else {
                    break;
                };
                let mut block = SampleBlock::new(buffer, capacity, direction);
                let Some(control) = catch_callback_panic("sample", || callback(&mut block)) else {
                    break;
                };
                let valid_length = block.valid_length();

                if control != StreamControl::Continue || valid_length == 0 {
                    break;
                }
                if valid_length > capacity {
                    warn!(
                        "Sample callback reported {} valid bytes in a {} byte buffer, stopping",
                        valid_length, capacity
                    );
                    break;
                }
                lengths.push(pad_to_packet(buffer, valid_length));
            }
        }
        Direction::Receive => lengths.resize(count, capacity),
    }

    let ready = lengths.len();
    let endpoint = direction.endpoint();
    let mut error: Option<TransportError> = None;

    for (index, length) in lengths.into_iter().enumerate() {
        let Some(slot) = pool.slot_mut(index) else {
            break;
        };
        if let Err(e) = slot.submit(endpoint, length) {
            error = Some(e);
            break;
        }
        state.active_transfers += 1;
    }

    state.direction = direction;
    state.sample_callback = Some(callback);
    state.transfers_configured = true;

    if let Some(e) = error {
        warn!("Failed to submit {:?} transfers: {}", direction, e);
        // Drain whatever did get submitted before reporting the failure.
        drop(guard);
        if let Err(cancel_err) = cancel(shared) {
            warn!("Cleanup after failed start also failed: {}", cancel_err);
        }
        return Err(Error::Usb(e));
    }

    // Keep streaming only if the whole pool went out; otherwise completions
    // must not ask for more samples.
    let streaming = ready == count;
    shared.set_streaming(streaming);

    // Nothing more will be produced, so the flush can follow right away.
    if !streaming
        && state.flush_armed
        && !state.flush_in_flight
        && let Err(e) = flush::submit(shared, state)
    {
        warn!("Failed to submit flush transfer: {}", e);
        drop(guard);
        if let Err(cancel_err) = cancel(shared) {
            warn!("Cleanup after failed start also failed: {}", cancel_err);
        }
        return Err(Error::Usb(e));
    }

    debug!(
        "{:?} started: {} of {} transfers in flight, streaming={}",
        direction, state.active_transfers, count, streaming
    );
    Ok(())
}

/// Cancel every in-flight transfer and wait until all of them completed
///
/// Cancellation is asynchronous: each cancelled transfer still completes on
/// the event thread, which is what finally drains the active count.
pub(crate) fn cancel<X: BulkTransfer>(shared: &Shared<X>) -> Result<()> {
    // Shutting down, whatever else happens.
    shared.set_streaming(false);

    let mut state = shared.lock();
    if !state.transfers_configured {
        return Err(Error::NotConfigured);
    }
    let Some(pool) = state.pool.as_ref() else {
        return Err(Error::NotConfigured);
    };

    // Holding the lock keeps the dispatcher from resubmitting anything
    // between these cancels.
    pool.cancel_all();
    if let Some(flush) = state.flush.as_ref() {
        flush.cancel();
    }

    state.transfers_configured = false;
    state.flush_armed = false;

    while !state.all_finished() {
        if !shared.thread_running.load(Ordering::Acquire) {
            warn!(
                "Event thread is gone, {} transfers will never complete",
                state.active_transfers
            );
            return Err(Error::StreamingThreadFailed);
        }
        state = shared
            .all_finished
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }

    debug!("All transfers finished");
    Ok(())
}
