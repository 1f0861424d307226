//! Transfer pool
//!
//! A fixed set of slots, each pairing a transfer descriptor with one window
//! of a single zeroed arena. A slot's buffer is only reachable while the slot
//! is idle; while it is in flight the transport owns the buffer and hands it
//! back with the completion.

use super::Shared;
use crate::error::{Error, Result};
use crate::transport::{BulkTransfer, TransportError};
use bytes::BytesMut;
use tracing::debug;

pub(crate) enum SlotState {
    Idle(BytesMut),
    InFlight,
}

pub(crate) struct TransferSlot<X> {
    transfer: X,
    state: SlotState,
}

impl<X: BulkTransfer> TransferSlot<X> {
    pub(crate) fn is_in_flight(&self) -> bool {
        matches!(self.state, SlotState::InFlight)
    }

    /// The buffer, if the slot is idle
    pub(crate) fn buffer_mut(&mut self) -> Option<&mut BytesMut> {
        match &mut self.state {
            SlotState::Idle(buffer) => Some(buffer),
            SlotState::InFlight => None,
        }
    }

    /// Submit the idle buffer
    pub(crate) fn submit(&mut self, endpoint: u8, length: usize) -> std::result::Result<(), TransportError> {
        match std::mem::replace(&mut self.state, SlotState::InFlight) {
            SlotState::Idle(buffer) => self.resubmit(endpoint, buffer, length),
            SlotState::InFlight => Err(TransportError::new(
                TransportError::BUSY,
                "transfer already submitted",
            )),
        }
    }

    /// Submit a buffer handed back by this slot's completion
    pub(crate) fn resubmit(
        &mut self,
        endpoint: u8,
        buffer: BytesMut,
        length: usize,
    ) -> std::result::Result<(), TransportError> {
        match self.transfer.submit(endpoint, buffer, length) {
            Ok(()) => {
                self.state = SlotState::InFlight;
                Ok(())
            }
            Err((buffer, e)) => {
                self.state = SlotState::Idle(buffer);
                Err(e)
            }
        }
    }

    /// Return a completed buffer to the slot without resubmitting
    pub(crate) fn retire(&mut self, buffer: BytesMut) {
        self.state = SlotState::Idle(buffer);
    }

    pub(crate) fn cancel(&self) {
        if self.is_in_flight() {
            self.transfer.cancel();
        }
    }
}

pub(crate) struct TransferPool<X> {
    slots: Vec<TransferSlot<X>>,
    buffer_size: usize,
}

impl<X: BulkTransfer> TransferPool<X> {
    /// Allocate `count` slots of `buffer_size` bytes
    ///
    /// `alloc` creates the transfer descriptor for each slot index.
    pub(crate) fn allocate<F>(count: usize, buffer_size: usize, mut alloc: F) -> Result<Self>
    where
        F: FnMut(usize) -> std::result::Result<X, TransportError>,
    {
        let total = count.checked_mul(buffer_size).ok_or(Error::NoMem)?;
        let mut arena = BytesMut::zeroed(total);

        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            let transfer = alloc(index).map_err(|e| {
                if e.code == TransportError::NO_MEM {
                    Error::NoMem
                } else {
                    Error::Usb(e)
                }
            })?;
            slots.push(TransferSlot {
                transfer,
                state: SlotState::Idle(arena.split_to(buffer_size)),
            });
        }

        debug!(
            "Allocated {} transfers of {} bytes ({} bytes total)",
            count, buffer_size, total
        );

        Ok(Self { slots, buffer_size })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut TransferSlot<X>> {
        self.slots.get_mut(index)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_in_flight()).count()
    }

    pub(crate) fn cancel_all(&self) {
        for slot in &self.slots {
            slot.cancel();
        }
    }
}

/// Allocate the device's pool as sized by its engine config
///
/// A device gets exactly one pool; a second call fails with `Busy`.
pub(crate) fn install<X, F>(shared: &Shared<X>, alloc: F) -> Result<()>
where
    X: BulkTransfer,
    F: FnMut(usize) -> std::result::Result<X, TransportError>,
{
    let mut state = shared.lock();
    if state.pool.is_some() {
        return Err(Error::Busy);
    }

    let pool = TransferPool::allocate(
        shared.config.transfer_count,
        shared.config.transfer_buffer_size,
        alloc,
    )?;
    state.pool = Some(pool);
    Ok(())
}
