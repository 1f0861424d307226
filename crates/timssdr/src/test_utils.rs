//! Simulated USB bus for testing
//!
//! [`MockBus`] implements [`Transport`] without hardware. Tests decide when
//! and how each submitted transfer completes; completions are delivered by
//! whichever thread calls [`Transport::handle_events`], exactly like libusb.
//!
//! # Example
//!
//! ```
//! use timssdr::test_utils::{MockBus, MockDeviceSpec};
//! use timssdr::{EngineConfig, Timssdr};
//!
//! let bus = MockBus::new(vec![MockDeviceSpec::timssdr("SN001")]);
//! let timssdr = Timssdr::with_transport(bus.clone(), EngineConfig::default()).unwrap();
//! let list = timssdr.device_list().unwrap();
//! assert_eq!(list.len(), 1);
//! ```

use crate::list::{TIMSSDR_PRODUCT_ID, TIMSSDR_VENDOR_ID};
use crate::transport::{
    BulkTransfer, Completion, CompletionFn, TransferStatus, Transport, TransportError, UsbDevice,
    UsbHandle,
};
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A simulated device and the failures it injects
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    /// Configuration active before anyone opens the device
    pub active_configuration: u8,
    pub kernel_driver: bool,
    pub fail_open: bool,
    pub fail_serial: bool,
    pub fail_configure: bool,
    pub fail_claim: bool,
}

impl MockDeviceSpec {
    /// A TimsSDR board with the given serial number
    pub fn timssdr(serial: &str) -> Self {
        Self {
            serial: Some(serial.to_string()),
            ..Self::other(TIMSSDR_VENDOR_ID, TIMSSDR_PRODUCT_ID)
        }
    }

    /// Some unrelated device
    pub fn other(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial: None,
            active_configuration: 1,
            kernel_driver: false,
            fail_open: false,
            fail_serial: false,
            fail_configure: false,
            fail_claim: false,
        }
    }

    pub fn without_serial(mut self) -> Self {
        self.serial = None;
        self
    }

    /// Start unconfigured with a kernel driver bound, like a fresh FTDI bridge
    pub fn with_kernel_driver(mut self) -> Self {
        self.active_configuration = 0;
        self.kernel_driver = true;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_serial(mut self) -> Self {
        self.fail_serial = true;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn failing_claim(mut self) -> Self {
        self.fail_claim = true;
        self
    }
}

/// One recorded submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub transfer_id: usize,
    pub endpoint: u8,
    pub length: usize,
    /// The first `length` bytes of the submitted buffer
    pub data: Vec<u8>,
}

struct Pending {
    seq: u64,
    endpoint: u8,
    length: usize,
    buffer: BytesMut,
}

struct TransferEntry {
    on_complete: Arc<CompletionFn>,
    pending: Option<Pending>,
}

#[derive(Default)]
struct BusState {
    next_transfer_id: usize,
    next_seq: u64,
    transfers: HashMap<usize, TransferEntry>,
    ready: VecDeque<(Arc<CompletionFn>, Completion)>,
    delivering: usize,
    interrupt_pending: bool,
    interrupts: u64,
    panic_events: bool,
    submissions: Vec<Submission>,
    fail_skip: usize,
    fail_submissions: usize,
    open_handles: usize,
    claimed_interfaces: usize,
    freed_in_flight: usize,
}

struct BusInner {
    devices: Vec<MockDeviceSpec>,
    state: Mutex<BusState>,
    changed: Condvar,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated USB bus
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<BusInner>,
}

impl MockBus {
    pub fn new(devices: Vec<MockDeviceSpec>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                devices,
                state: Mutex::new(BusState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Complete every transfer in flight on `endpoint` right now, oldest first
    ///
    /// Resubmissions made while these completions are delivered are left
    /// alone. Successful completions report the full submitted length.
    /// Returns how many transfers were completed.
    pub fn complete_in_flight(&self, endpoint: u8, status: TransferStatus) -> usize {
        let before = self.inner.lock().next_seq;
        let mut completed = 0;
        while self.complete_oldest(endpoint, status, None, before) {
            completed += 1;
        }
        completed
    }

    /// Complete the oldest in-flight transfer on `endpoint`
    pub fn complete_one(&self, endpoint: u8, status: TransferStatus) -> bool {
        self.complete_oldest(endpoint, status, None, u64::MAX)
    }

    /// Complete the oldest in-flight transfer on `endpoint` as if `data` was received
    pub fn complete_one_with_data(&self, endpoint: u8, data: &[u8]) -> bool {
        self.complete_oldest(endpoint, TransferStatus::Completed, Some(data), u64::MAX)
    }

    fn complete_oldest(
        &self,
        endpoint: u8,
        status: TransferStatus,
        data: Option<&[u8]>,
        before_seq: u64,
    ) -> bool {
        let mut state = self.inner.lock();
        let oldest = state
            .transfers
            .iter()
            .filter_map(|(id, entry)| entry.pending.as_ref().map(|p| (*id, p)))
            .filter(|(_, pending)| pending.endpoint == endpoint && pending.seq < before_seq)
            .min_by_key(|(_, pending)| pending.seq)
            .map(|(id, _)| id);
        let Some(id) = oldest else {
            return false;
        };
        let Some(entry) = state.transfers.get_mut(&id) else {
            return false;
        };
        let Some(mut pending) = entry.pending.take() else {
            return false;
        };
        let on_complete = entry.on_complete.clone();

        let actual_length = match data {
            Some(data) => {
                let n = data.len().min(pending.buffer.len());
                pending.buffer[..n].copy_from_slice(&data[..n]);
                n
            }
            None if status.is_success() => pending.length,
            None => 0,
        };
        state.ready.push_back((
            on_complete,
            Completion {
                status,
                actual_length,
                buffer: pending.buffer,
            },
        ));
        self.inner.changed.notify_all();
        true
    }

    /// Wait until every queued completion has been delivered
    pub fn settle(&self) -> bool {
        let deadline = Instant::now() + DEFAULT_TEST_TIMEOUT;
        let mut state = self.inner.lock();
        while !state.ready.is_empty() || state.delivering > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            state = self
                .inner
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Every submission so far, in order
    pub fn submissions(&self) -> Vec<Submission> {
        self.inner.lock().submissions.clone()
    }

    pub fn in_flight(&self, endpoint: u8) -> usize {
        self.inner
            .lock()
            .transfers
            .values()
            .filter_map(|entry| entry.pending.as_ref())
            .filter(|pending| pending.endpoint == endpoint)
            .count()
    }

    /// Make the next `count` submissions fail with an I/O error
    pub fn fail_submissions(&self, count: usize) {
        self.fail_submissions_after(0, count);
    }

    /// Let `skip` submissions through, then fail the following `count`
    pub fn fail_submissions_after(&self, skip: usize, count: usize) {
        let mut state = self.inner.lock();
        state.fail_skip = skip;
        state.fail_submissions = count;
    }

    /// Make the next `handle_events` call panic, killing the thread running it
    pub fn panic_event_loop(&self) {
        let mut state = self.inner.lock();
        state.panic_events = true;
        self.inner.changed.notify_all();
    }

    pub fn open_handles(&self) -> usize {
        self.inner.lock().open_handles
    }

    pub fn claimed_interfaces(&self) -> usize {
        self.inner.lock().claimed_interfaces
    }

    /// Transfer descriptors currently allocated
    pub fn allocated_transfers(&self) -> usize {
        self.inner.lock().transfers.len()
    }

    /// Descriptors dropped while still in flight; always zero for a correct engine
    pub fn freed_in_flight(&self) -> usize {
        self.inner.lock().freed_in_flight
    }

    /// Number of `interrupt_events` calls
    pub fn interrupt_count(&self) -> u64 {
        self.inner.lock().interrupts
    }
}

impl Transport for MockBus {
    type Device = MockDevice;
    type Handle = MockHandle;

    fn devices(&self) -> Result<Vec<MockDevice>, TransportError> {
        Ok(self
            .inner
            .devices
            .iter()
            .map(|spec| MockDevice {
                spec: spec.clone(),
                bus: self.inner.clone(),
            })
            .collect())
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();

        loop {
            if state.panic_events {
                state.panic_events = false;
                drop(state);
                panic!("simulated event loop failure");
            }

            if state.interrupt_pending {
                state.interrupt_pending = false;
                return Err(TransportError::interrupted());
            }

            if !state.ready.is_empty() {
                loop {
                    let Some((on_complete, completion)) = state.ready.pop_front() else {
                        break;
                    };
                    state.delivering += 1;
                    drop(state);
                    on_complete(completion);
                    state = self.inner.lock();
                    state.delivering -= 1;
                }
                self.inner.changed.notify_all();
                return Ok(());
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(());
            };
            state = self
                .inner
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn interrupt_events(&self) {
        let mut state = self.inner.lock();
        state.interrupt_pending = true;
        state.interrupts += 1;
        self.inner.changed.notify_all();
    }
}

pub struct MockDevice {
    spec: MockDeviceSpec,
    bus: Arc<BusInner>,
}

impl UsbDevice for MockDevice {
    type Handle = MockHandle;

    fn vendor_id(&self) -> u16 {
        self.spec.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.spec.product_id
    }

    fn has_serial_number(&self) -> bool {
        self.spec.serial.is_some()
    }

    fn open(&self) -> Result<MockHandle, TransportError> {
        if self.spec.fail_open {
            return Err(TransportError::new(TransportError::ACCESS, "Access denied (insufficient permissions)"));
        }
        self.bus.lock().open_handles += 1;
        Ok(MockHandle {
            configuration: self.spec.active_configuration,
            kernel_driver: self.spec.kernel_driver,
            claimed: Vec::new(),
            spec: self.spec.clone(),
            bus: self.bus.clone(),
        })
    }
}

pub struct MockHandle {
    spec: MockDeviceSpec,
    bus: Arc<BusInner>,
    configuration: u8,
    kernel_driver: bool,
    claimed: Vec<u8>,
}

impl UsbHandle for MockHandle {
    type Transfer = MockTransfer;

    fn read_serial_number(&self) -> Result<Option<String>, TransportError> {
        if self.spec.fail_serial {
            return Err(TransportError::new(TransportError::PIPE, "Pipe error"));
        }
        Ok(self.spec.serial.clone())
    }

    fn active_configuration(&self) -> Result<u8, TransportError> {
        Ok(self.configuration)
    }

    fn set_active_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        if self.spec.fail_configure || self.kernel_driver {
            return Err(TransportError::new(TransportError::BUSY, "Resource busy"));
        }
        self.configuration = config;
        Ok(())
    }

    fn interface_count(&self) -> Result<u8, TransportError> {
        Ok(1)
    }

    fn kernel_driver_active(&self, _interface: u8) -> Result<bool, TransportError> {
        Ok(self.kernel_driver)
    }

    fn detach_kernel_driver(&mut self, _interface: u8) -> Result<(), TransportError> {
        self.kernel_driver = false;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if self.spec.fail_claim || self.kernel_driver {
            return Err(TransportError::new(TransportError::BUSY, "Resource busy"));
        }
        if !self.claimed.contains(&interface) {
            self.claimed.push(interface);
            self.bus.lock().claimed_interfaces += 1;
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let Some(position) = self.claimed.iter().position(|i| *i == interface) else {
            return Err(TransportError::new(TransportError::NOT_FOUND, "Entity not found"));
        };
        self.claimed.remove(position);
        self.bus.lock().claimed_interfaces -= 1;
        Ok(())
    }

    fn alloc_transfer(&self, on_complete: CompletionFn) -> Result<MockTransfer, TransportError> {
        let mut state = self.bus.lock();
        let id = state.next_transfer_id;
        state.next_transfer_id += 1;
        state.transfers.insert(
            id,
            TransferEntry {
                on_complete: Arc::new(on_complete),
                pending: None,
            },
        );
        Ok(MockTransfer {
            id,
            bus: self.bus.clone(),
        })
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut state = self.bus.lock();
        state.open_handles -= 1;
        state.claimed_interfaces -= self.claimed.len();
    }
}

pub struct MockTransfer {
    id: usize,
    bus: Arc<BusInner>,
}

impl BulkTransfer for MockTransfer {
    fn submit(
        &mut self,
        endpoint: u8,
        buffer: BytesMut,
        length: usize,
    ) -> Result<(), (BytesMut, TransportError)> {
        let mut state = self.bus.lock();
        if state.fail_skip > 0 {
            state.fail_skip -= 1;
        } else if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err((buffer, TransportError::new(TransportError::IO, "Input/Output Error")));
        }
        if length > buffer.len() {
            return Err((buffer, TransportError::new(TransportError::INVALID_PARAM, "Invalid parameter")));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let submission = Submission {
            transfer_id: self.id,
            endpoint,
            length,
            data: buffer[..length].to_vec(),
        };

        let Some(entry) = state.transfers.get_mut(&self.id) else {
            return Err((buffer, TransportError::new(TransportError::NOT_FOUND, "Entity not found")));
        };
        if entry.pending.is_some() {
            return Err((buffer, TransportError::new(TransportError::BUSY, "Resource busy")));
        }
        entry.pending = Some(Pending {
            seq,
            endpoint,
            length,
            buffer,
        });
        state.submissions.push(submission);
        Ok(())
    }

    fn cancel(&self) {
        let mut state = self.bus.lock();
        let Some(entry) = state.transfers.get_mut(&self.id) else {
            return;
        };
        let Some(pending) = entry.pending.take() else {
            return;
        };
        let on_complete = entry.on_complete.clone();
        state.ready.push_back((
            on_complete,
            Completion {
                status: TransferStatus::Cancelled,
                actual_length: 0,
                buffer: pending.buffer,
            },
        ));
        self.bus.changed.notify_all();
    }
}

impl Drop for MockTransfer {
    fn drop(&mut self) {
        let mut state = self.bus.lock();
        let in_flight = state
            .transfers
            .remove(&self.id)
            .is_some_and(|entry| entry.pending.is_some());
        if in_flight {
            state.freed_in_flight += 1;
        }
    }
}
