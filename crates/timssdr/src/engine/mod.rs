//! Streaming transfer engine
//!
//! Keeps a fixed ring of bulk transfers in flight, drives their completion
//! from a dedicated event thread, and coordinates that thread with control
//! calls made from the caller's thread.
//!
//! # Locking
//!
//! One mutex per device guards [`EngineState`]: the pool, the active-transfer
//! count, the configured and flush flags, and the sample callback. The
//! `streaming` flag is an atomic so it can be polled without blocking, but
//! every write that feeds a control decision happens with the lock held.
//!
//! ```text
//! caller thread                       event thread
//! ─────────────                       ────────────
//! start(): prime → lock → submit all
//!                                     handle_events()
//!                                       └─ dispatch(): lock → callback →
//!                                          resubmit | flush | retire
//! stop():  lock → cancel all →
//!          wait(all_finished) ◄───────── notify when nothing is in flight
//! ```

pub(crate) mod dispatch;
pub(crate) mod event_thread;
pub(crate) mod flush;
pub(crate) mod pool;
pub(crate) mod stream;

use crate::config::EngineConfig;
use pool::TransferPool;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::error;

use flush::FlushTransfer;

/// Bulk IN endpoint carrying received samples
pub const RX_ENDPOINT_ADDRESS: u8 = 0x81;

/// Bulk OUT endpoint carrying samples to transmit
pub const TX_ENDPOINT_ADDRESS: u8 = 0x02;

/// Run a user callback on an engine thread; a panic is logged and yields `None`
pub(crate) fn catch_callback_panic<R>(name: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!("Panic in {} callback: {}", name, panic_message(payload.as_ref()));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

/// Streaming direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Transmit,
}

impl Direction {
    pub const fn endpoint(self) -> u8 {
        match self {
            Direction::Receive => RX_ENDPOINT_ADDRESS,
            Direction::Transmit => TX_ENDPOINT_ADDRESS,
        }
    }
}

/// Returned by a sample callback to keep or end the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// One transfer buffer handed to the sample callback
///
/// For RX the valid length is the number of bytes received. For TX the
/// callback writes samples into [`buffer_mut`](SampleBlock::buffer_mut) and
/// sets the valid length to the number of bytes written; zero ends the
/// session.
pub struct SampleBlock<'a> {
    buffer: &'a mut [u8],
    valid_length: usize,
    direction: Direction,
}

impl<'a> SampleBlock<'a> {
    pub(crate) fn new(buffer: &'a mut [u8], valid_length: usize, direction: Direction) -> Self {
        Self {
            buffer,
            valid_length,
            direction,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Physical size of the buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn valid_length(&self) -> usize {
        self.valid_length
    }

    /// Values above [`capacity`](SampleBlock::capacity) end the session.
    pub fn set_valid_length(&mut self, valid_length: usize) {
        self.valid_length = valid_length;
    }

    /// The valid part of the buffer
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.valid_length.min(self.buffer.len())]
    }

    /// The whole buffer, for filling TX samples
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer
    }

    /// Copy as much of `samples` as fits and mark it valid
    pub fn fill(&mut self, samples: &[u8]) -> usize {
        let n = samples.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&samples[..n]);
        self.valid_length = n;
        n
    }
}

/// What the block-complete callback sees of a finished transfer
#[derive(Debug, Clone, Copy)]
pub struct BlockReport<'a> {
    pub(crate) data: &'a [u8],
    pub(crate) direction: Direction,
    pub(crate) success: bool,
}

impl BlockReport<'_> {
    /// Bytes actually moved by the transfer
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn success(&self) -> bool {
        self.success
    }
}

/// Fills (TX) or consumes (RX) one buffer; runs on the event thread
pub type SampleCallback = Box<dyn FnMut(&mut SampleBlock<'_>) -> StreamControl + Send + 'static>;

/// Observes every finished transfer; runs on the event thread outside the lock
pub type BlockCompleteCallback = Arc<dyn Fn(&BlockReport<'_>) + Send + Sync + 'static>;

/// Told once per flush cycle whether transmission drained successfully
pub type FlushCallback = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// Lock-guarded engine state
pub(crate) struct EngineState<X> {
    pub(crate) pool: Option<TransferPool<X>>,
    /// True between a successful start and the matching cancel
    pub(crate) transfers_configured: bool,
    /// Pool slots currently submitted
    pub(crate) active_transfers: usize,
    pub(crate) direction: Direction,
    pub(crate) sample_callback: Option<SampleCallback>,
    pub(crate) flush: Option<FlushTransfer<X>>,
    /// A flush should follow once production stops
    pub(crate) flush_armed: bool,
    pub(crate) flush_in_flight: bool,
    pub(crate) flush_callback: Option<FlushCallback>,
}

impl<X> EngineState<X> {
    /// Nothing submitted that could still complete
    pub(crate) fn all_finished(&self) -> bool {
        self.active_transfers == 0 && !self.flush_in_flight
    }
}

/// State shared between a device, its event thread, and transfer completions
pub(crate) struct Shared<X> {
    state: Mutex<EngineState<X>>,
    pub(crate) all_finished: Condvar,
    pub(crate) streaming: AtomicBool,
    pub(crate) thread_running: AtomicBool,
    pub(crate) do_exit: AtomicBool,
    block_complete: Mutex<Option<BlockCompleteCallback>>,
    pub(crate) config: EngineConfig,
}

impl<X> Shared<X> {
    pub(crate) fn new(config: EngineConfig) -> Self {
        Self {
            state: Mutex::new(EngineState {
                pool: None,
                transfers_configured: false,
                active_transfers: 0,
                direction: Direction::Receive,
                sample_callback: None,
                flush: None,
                flush_armed: false,
                flush_in_flight: false,
                flush_callback: None,
            }),
            all_finished: Condvar::new(),
            streaming: AtomicBool::new(false),
            thread_running: AtomicBool::new(false),
            do_exit: AtomicBool::new(false),
            block_complete: Mutex::new(None),
            config,
        }
    }

    /// Lock the engine state
    ///
    /// A panic in user code cannot leave the state half-updated across an
    /// unlock, so a poisoned lock is still usable.
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState<X>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    pub(crate) fn block_complete_callback(&self) -> Option<BlockCompleteCallback> {
        self.block_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_block_complete_callback(&self, callback: Option<BlockCompleteCallback>) {
        *self
            .block_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_addresses() {
        assert_eq!(Direction::Receive.endpoint(), 0x81);
        assert_eq!(Direction::Transmit.endpoint(), 0x02);
        // Bit 7 = 1 means IN
        assert!((Direction::Receive.endpoint() & 0x80) != 0);
        assert!((Direction::Transmit.endpoint() & 0x80) == 0);
    }

    #[test]
    fn test_sample_block_fill() {
        let mut buffer = vec![0u8; 8];
        let mut block = SampleBlock::new(&mut buffer, 8, Direction::Transmit);
        assert_eq!(block.fill(&[1, 2, 3]), 3);
        assert_eq!(block.valid_length(), 3);
        assert_eq!(block.data(), &[1, 2, 3]);
        assert_eq!(block.capacity(), 8);
    }

    #[test]
    fn test_sample_block_fill_truncates() {
        let mut buffer = vec![0u8; 2];
        let mut block = SampleBlock::new(&mut buffer, 0, Direction::Transmit);
        assert_eq!(block.fill(&[9, 9, 9, 9]), 2);
        assert_eq!(block.data(), &[9, 9]);
    }

    #[test]
    fn test_sample_block_data_clamps_oversized_length() {
        let mut buffer = vec![7u8; 4];
        let mut block = SampleBlock::new(&mut buffer, 4, Direction::Receive);
        block.set_valid_length(100);
        assert_eq!(block.data().len(), 4);
    }

    #[test]
    fn test_all_finished_accounts_for_flush() {
        let shared: Shared<()> = Shared::new(EngineConfig::default());
        let mut state = shared.lock();
        assert!(state.all_finished());
        state.flush_in_flight = true;
        assert!(!state.all_finished());
        state.flush_in_flight = false;
        state.active_transfers = 1;
        assert!(!state.all_finished());
    }
}
