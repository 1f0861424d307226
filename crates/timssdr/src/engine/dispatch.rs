//! Per-transfer completion handling
//!
//! Runs on the event thread for every finished pool transfer and decides
//! whether the slot goes straight back on the bus, hands over to the flush
//! transfer, or retires.

use super::{
    BlockReport, Direction, SampleBlock, Shared, StreamControl, catch_callback_panic, flush,
};
use crate::config::USB_PACKET_SIZE;
use crate::transport::{BulkTransfer, Completion, CompletionFn, TransferStatus};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Zero-fill `buffer` from `valid_length` up to the next packet boundary
///
/// Returns the padded length. The caller guarantees `valid_length` does not
/// exceed the buffer and that the buffer is a whole number of packets.
pub(crate) fn pad_to_packet(buffer: &mut [u8], valid_length: usize) -> usize {
    let padded = valid_length.next_multiple_of(USB_PACKET_SIZE);
    buffer[valid_length..padded].fill(0);
    padded
}

/// Completion closure for pool slot `index`
pub(crate) fn completion_fn<X: BulkTransfer>(shared: Weak<Shared<X>>, index: usize) -> CompletionFn {
    Box::new(move |completion| {
        if let Some(shared) = shared.upgrade() {
            on_transfer_complete(&shared, index, completion);
        }
    })
}

enum Outcome {
    Resubmit(usize),
    Retire,
}

pub(crate) fn on_transfer_complete<X: BulkTransfer>(
    shared: &Arc<Shared<X>>,
    index: usize,
    completion: Completion,
) {
    let Completion {
        status,
        actual_length,
        mut buffer,
    } = completion;
    let success = status.is_success();
    let capacity = buffer.len();

    let mut state = shared.lock();
    let direction = state.direction;

    // Observers run outside the lock; they only read the buffer.
    if let Some(callback) = shared.block_complete_callback() {
        drop(state);
        catch_callback_panic("block complete", || {
            callback(&BlockReport {
                data: &buffer[..actual_length.min(capacity)],
                direction,
                success,
            })
        });
        state = shared.lock();
    }

    let outcome = if !success {
        if status == TransferStatus::Cancelled {
            trace!("Transfer {} cancelled", index);
        } else {
            warn!("Transfer {} failed: {:?}", index, status);
        }
        shared.set_streaming(false);
        state.flush_armed = false;
        Outcome::Retire
    } else if shared.is_streaming() {
        let (control, valid_length) = match state.sample_callback.as_mut() {
            Some(callback) => {
                let mut block = SampleBlock::new(&mut buffer, actual_length, direction);
                match catch_callback_panic("sample", || callback(&mut block)) {
                    Some(control) => (control, block.valid_length()),
                    None => (StreamControl::Stop, 0),
                }
            }
            None => (StreamControl::Stop, 0),
        };

        if control != StreamControl::Continue || valid_length == 0 {
            Outcome::Retire
        } else if valid_length > capacity {
            warn!(
                "Sample callback reported {} valid bytes in a {} byte buffer, stopping",
                valid_length, capacity
            );
            Outcome::Retire
        } else if !state.transfers_configured {
            Outcome::Retire
        } else {
            match direction {
                Direction::Transmit => Outcome::Resubmit(pad_to_packet(&mut buffer, valid_length)),
                Direction::Receive => Outcome::Resubmit(capacity),
            }
        }
    } else {
        Outcome::Retire
    };

    let endpoint = direction.endpoint();
    let resubmitted = match (outcome, state.pool.as_mut().and_then(|p| p.slot_mut(index))) {
        (Outcome::Resubmit(length), Some(slot)) => match slot.resubmit(endpoint, buffer, length) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to resubmit transfer {}: {}", index, e);
                false
            }
        },
        (Outcome::Retire, Some(slot)) => {
            slot.retire(buffer);
            false
        }
        (_, None) => {
            warn!("Completion for unknown transfer slot {}", index);
            false
        }
    };

    if !resubmitted {
        // No further sample callbacks for this session.
        shared.set_streaming(false);

        if success
            && state.flush_armed
            && !state.flush_in_flight
            && let Err(e) = flush::submit(shared, &mut state)
        {
            warn!("Failed to submit flush transfer: {}", e);
        }

        state.active_transfers = state.active_transfers.saturating_sub(1);
        trace!(
            "Transfer {} retired, {} still active",
            index, state.active_transfers
        );

        if state.all_finished() {
            shared.all_finished.notify_all();
        }
    }
}
