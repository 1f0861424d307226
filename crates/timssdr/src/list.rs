//! Board enumeration

use crate::transport::{Transport, UsbDevice, UsbHandle};
use tracing::{debug, warn};

/// USB vendor ID of the board's FTDI bridge
pub const TIMSSDR_VENDOR_ID: u16 = 0x0403;

/// USB product ID of the board's FTDI bridge
pub const TIMSSDR_PRODUCT_ID: u16 = 0x6014;

/// Serial numbers longer than this are truncated; longer search suffixes never match
pub const USB_MAX_SERIAL_LENGTH: usize = 32;

/// Board identity derived from the USB product ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbBoardId {
    F232R,
}

impl UsbBoardId {
    /// The board behind a vendor/product pair, if it is a supported one
    pub fn from_usb_ids(vendor_id: u16, product_id: u16) -> Option<Self> {
        match (vendor_id, product_id) {
            (TIMSSDR_VENDOR_ID, TIMSSDR_PRODUCT_ID) => Some(UsbBoardId::F232R),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            UsbBoardId::F232R => "TimsSDR (FT232R)",
        }
    }
}

/// Truncate to [`USB_MAX_SERIAL_LENGTH`] characters
pub(crate) fn truncate_serial(mut serial: String) -> String {
    if let Some((cut, _)) = serial.char_indices().nth(USB_MAX_SERIAL_LENGTH) {
        serial.truncate(cut);
    }
    serial
}

/// One matching board found on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    /// `None` when the device has no serial or it could not be read
    pub serial_number: Option<String>,
    pub board_id: UsbBoardId,
    /// Position in the full bus enumeration
    pub usb_device_index: usize,
}

/// Snapshot of the boards on the bus
///
/// Keeps the enumerated devices so a board can be opened straight from the
/// list without enumerating again.
pub struct DeviceList<D> {
    pub(crate) entries: Vec<DeviceListEntry>,
    pub(crate) devices: Vec<D>,
    pub(crate) usb_device_count: usize,
}

impl<D> DeviceList<D> {
    pub fn entries(&self) -> &[DeviceListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceListEntry> {
        self.entries.get(index)
    }

    /// Number of devices of any kind seen on the bus
    pub fn usb_device_count(&self) -> usize {
        self.usb_device_count
    }

    pub(crate) fn device(&self, index: usize) -> Option<&D> {
        self.devices.get(index)
    }
}

impl<D> std::fmt::Debug for DeviceList<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceList")
            .field("entries", &self.entries)
            .field("usb_device_count", &self.usb_device_count)
            .finish()
    }
}

/// Scan the bus for supported boards
pub(crate) fn scan<T: Transport>(transport: &T) -> crate::Result<DeviceList<T::Device>> {
    let bus = transport.devices()?;
    let usb_device_count = bus.len();

    let mut entries = Vec::new();
    let mut devices = Vec::new();
    for (usb_device_index, device) in bus.into_iter().enumerate() {
        let Some(board_id) = UsbBoardId::from_usb_ids(device.vendor_id(), device.product_id())
        else {
            continue;
        };

        entries.push(DeviceListEntry {
            serial_number: read_serial(&device),
            board_id,
            usb_device_index,
        });
        devices.push(device);
    }

    debug!(
        "Found {} board(s) among {} USB devices",
        entries.len(),
        usb_device_count
    );

    Ok(DeviceList {
        entries,
        devices,
        usb_device_count,
    })
}

fn read_serial<D: UsbDevice>(device: &D) -> Option<String> {
    if !device.has_serial_number() {
        return None;
    }

    let serial = device
        .open()
        .and_then(|handle| handle.read_serial_number())
        .map_err(|e| warn!("Could not read board serial number: {}", e))
        .ok()
        .flatten()?;
    Some(truncate_serial(serial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_id_needs_both_ids() {
        assert_eq!(UsbBoardId::from_usb_ids(0x0403, 0x6014), Some(UsbBoardId::F232R));
        assert_eq!(UsbBoardId::from_usb_ids(0x1d50, 0x6014), None);
        assert_eq!(UsbBoardId::from_usb_ids(0x0403, 0x6010), None);
    }

    #[test]
    fn test_truncate_serial() {
        let long = "A".repeat(40);
        assert_eq!(truncate_serial(long).len(), USB_MAX_SERIAL_LENGTH);
        assert_eq!(truncate_serial("SN001".to_string()), "SN001");
    }
}
