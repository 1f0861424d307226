//! Per-device event thread
//!
//! Drives the transport's event processing so transfer completions run off
//! the caller's thread. Runs until the device sets `do_exit` and wakes it.

use super::Shared;
use crate::error::{Error, Result};
use crate::transport::{BulkTransfer, Transport};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const THREAD_NAME: &str = "timssdr-events";

/// Pause after a failed event step before polling again
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) fn spawn<T, X>(transport: Arc<T>, shared: Arc<Shared<X>>) -> Result<JoinHandle<()>>
where
    T: Transport,
    X: BulkTransfer,
{
    shared.do_exit.store(false, Ordering::Release);
    shared.thread_running.store(true, Ordering::Release);

    let thread_shared = shared.clone();
    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || run(transport.as_ref(), &thread_shared))
        .map_err(|e| {
            warn!("Failed to spawn event thread: {}", e);
            shared.thread_running.store(false, Ordering::Release);
            Error::Thread
        })
}

/// Marks the thread gone however `run` exits, so nobody waits on it
struct ExitGuard<'a, X> {
    shared: &'a Shared<X>,
}

impl<X> Drop for ExitGuard<'_, X> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Event thread panicked");
        }
        self.shared.set_streaming(false);
        // Under the lock, so a stop between its check and its wait still
        // gets the wakeup.
        let _state = self.shared.lock();
        self.shared.thread_running.store(false, Ordering::Release);
        self.shared.all_finished.notify_all();
    }
}

fn run<T: Transport, X>(transport: &T, shared: &Shared<X>) {
    let _guard = ExitGuard { shared };
    debug!("Event thread started");
    let timeout = shared.config.event_timeout();

    while !shared.do_exit.load(Ordering::Acquire) {
        match transport.handle_events(timeout) {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => {
                trace!("Event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                shared.set_streaming(false);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    debug!("Event thread stopped");
}

/// Ask the event thread to exit and wait for it
pub(crate) fn shutdown<T: Transport, X>(
    transport: &T,
    shared: &Shared<X>,
    handle: JoinHandle<()>,
) -> Result<()> {
    shared.do_exit.store(true, Ordering::Release);
    transport.interrupt_events();

    let joined = handle.join();
    shared.thread_running.store(false, Ordering::Release);
    joined.map_err(|_| {
        warn!("Event thread panicked");
        Error::Thread
    })
}
