//! Host-side driver for TimsSDR USB software-defined radios
//!
//! Streams samples between the host and the board over USB bulk transfers.
//! A fixed ring of transfers stays in flight while streaming; an event thread
//! per device delivers their completions to a user sample callback, which
//! consumes received buffers or fills buffers to transmit.
//!
//! ```no_run
//! use timssdr::{StreamControl, Timssdr};
//!
//! # fn main() -> timssdr::Result<()> {
//! let timssdr = Timssdr::init()?;
//! let mut device = timssdr.open()?;
//! device.start_rx(|block| {
//!     println!("{} bytes", block.valid_length());
//!     StreamControl::Continue
//! })?;
//! device.stop_rx()?;
//! device.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod device;
mod engine;
pub mod error;
pub mod list;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod usb;

pub use config::{EngineConfig, USB_PACKET_SIZE};
pub use context::Timssdr;
pub use device::{Device, PartIdSerialNo};
pub use engine::{
    BlockCompleteCallback, BlockReport, Direction, FlushCallback, RX_ENDPOINT_ADDRESS,
    SampleBlock, SampleCallback, StreamControl, TX_ENDPOINT_ADDRESS,
};
pub use error::{Error, Result};
pub use list::{DeviceList, DeviceListEntry, TIMSSDR_PRODUCT_ID, TIMSSDR_VENDOR_ID, UsbBoardId};
