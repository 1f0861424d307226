//! Device Lifecycle Integration Tests
//!
//! # Test Scenarios
//! - Enumeration: filtering, bus indices, unreadable serials
//! - Opening: first board, serial suffix, list index
//! - Setup failures unwind cleanly
//! - Context teardown refuses while devices are open
//!
//! Run with: `cargo test -p timssdr --test device_tests`

use timssdr::test_utils::{MockBus, MockDeviceSpec};
use timssdr::{EngineConfig, Error, PartIdSerialNo, Timssdr, UsbBoardId};

fn context(devices: Vec<MockDeviceSpec>) -> (MockBus, Timssdr<MockBus>) {
    let bus = MockBus::new(devices);
    let config = EngineConfig {
        transfer_buffer_size: 2048,
        flush_buffer_size: 512,
        event_timeout_ms: 20,
        ..Default::default()
    };
    let timssdr = Timssdr::with_transport(bus.clone(), config).unwrap();
    (bus, timssdr)
}

// ============================================================================
// Enumeration
// ============================================================================

#[test]
fn test_device_list_filters_boards() {
    let (_bus, timssdr) = context(vec![
        MockDeviceSpec::other(0x1d6b, 0x0002),
        MockDeviceSpec::timssdr("SN001"),
        MockDeviceSpec::other(0x046d, 0xc52b),
    ]);

    let list = timssdr.device_list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list.usb_device_count(), 3);

    let entry = list.get(0).unwrap();
    assert_eq!(entry.serial_number.as_deref(), Some("SN001"));
    assert_eq!(entry.board_id, UsbBoardId::F232R);
    assert_eq!(entry.usb_device_index, 1);
}

#[test]
fn test_device_list_ignores_other_ftdi_products() {
    let (_bus, timssdr) = context(vec![MockDeviceSpec::other(0x0403, 0x6001)]);
    let list = timssdr.device_list().unwrap();
    assert!(list.is_empty());
    assert_eq!(list.usb_device_count(), 1);
}

#[test]
fn test_device_list_keeps_unreadable_serials() {
    let (bus, timssdr) = context(vec![
        MockDeviceSpec::timssdr("SN001").failing_serial(),
        MockDeviceSpec::timssdr("SN002").without_serial(),
    ]);

    let list = timssdr.device_list().unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.entries().iter().all(|e| e.serial_number.is_none()));
    assert_eq!(bus.open_handles(), 0);
}

#[test]
fn test_device_list_truncates_long_serials() {
    let serial = "0123456789abcdef0123456789abcdefXYZ";
    let (_bus, timssdr) = context(vec![MockDeviceSpec::timssdr(serial)]);
    let list = timssdr.device_list().unwrap();
    assert_eq!(
        list.get(0).unwrap().serial_number.as_deref(),
        Some(&serial[..32])
    );
}

// ============================================================================
// Opening
// ============================================================================

#[test]
fn test_open_by_serial_suffix() {
    let (_bus, timssdr) = context(vec![
        MockDeviceSpec::timssdr("SN001"),
        MockDeviceSpec::timssdr("SN002"),
    ]);

    let device = timssdr.open_by_serial(Some("02")).unwrap();
    assert_eq!(device.serial_number(), Some("SN002"));
    device.close().unwrap();

    let device = timssdr.open_by_serial(None).unwrap();
    assert_eq!(device.serial_number(), Some("SN001"));
    device.close().unwrap();
}

#[test]
fn test_open_by_serial_not_found() {
    let (_bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001")]);

    assert_eq!(timssdr.open_by_serial(Some("XYZ")).unwrap_err(), Error::NotFound);

    let too_long = "1".repeat(33);
    assert_eq!(timssdr.open_by_serial(Some(&too_long)).unwrap_err(), Error::NotFound);
}

#[test]
fn test_open_without_boards() {
    let (_bus, timssdr) = context(vec![MockDeviceSpec::other(0x1d6b, 0x0003)]);
    assert_eq!(timssdr.open().unwrap_err(), Error::NotFound);
}

#[test]
fn test_open_from_list() {
    let (bus, timssdr) = context(vec![
        MockDeviceSpec::timssdr("SN001"),
        MockDeviceSpec::timssdr("SN002"),
    ]);
    let list = timssdr.device_list().unwrap();

    assert_eq!(timssdr.open_from_list(&list, 2).unwrap_err(), Error::InvalidParam);

    let device = timssdr.open_from_list(&list, 1).unwrap();
    assert_eq!(device.serial_number(), Some("SN002"));
    assert_eq!(bus.claimed_interfaces(), 1);
    device.close().unwrap();
}

#[test]
fn test_open_detaches_kernel_driver() {
    let (bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001").with_kernel_driver()]);

    let device = timssdr.open().unwrap();
    assert_eq!(bus.claimed_interfaces(), 1);
    assert_eq!(bus.allocated_transfers(), 4);
    assert_eq!(device.streaming_status(), Err(Error::StreamingStopped));

    device.close().unwrap();
    assert_eq!(bus.claimed_interfaces(), 0);
    assert_eq!(bus.open_handles(), 0);
    assert_eq!(bus.allocated_transfers(), 0);
    assert!(bus.interrupt_count() >= 1);
}

#[test]
fn test_board_partid_serialno() {
    let (_bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001")]);
    let device = timssdr.open().unwrap();
    assert_eq!(
        device.board_partid_serialno_read().unwrap(),
        PartIdSerialNo {
            part_id: [0x60, 0x14],
            serial_no: [0; 4],
        }
    );
}

// ============================================================================
// Setup Failures
// ============================================================================

#[test]
fn test_failed_claim_unwinds() {
    let (bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001").failing_claim()]);

    assert!(matches!(timssdr.open(), Err(Error::Usb(_))));
    assert_eq!(bus.open_handles(), 0);
    assert_eq!(bus.allocated_transfers(), 0);
    assert_eq!(timssdr.open_device_count(), 0);
}

#[test]
fn test_failed_configuration_unwinds() {
    let (bus, timssdr) = context(vec![
        MockDeviceSpec::timssdr("SN001")
            .with_kernel_driver()
            .failing_configure(),
    ]);

    assert!(matches!(timssdr.open(), Err(Error::Usb(_))));
    assert_eq!(bus.open_handles(), 0);
    assert_eq!(timssdr.open_device_count(), 0);
}

#[test]
fn test_failed_open_is_usb_error() {
    let (_bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001").failing_open()]);
    match timssdr.open() {
        Err(Error::Usb(e)) => assert_eq!(e.code, -3),
        other => panic!("expected access error, got {:?}", other),
    }
}

// ============================================================================
// Context
// ============================================================================

#[test]
fn test_exit_refuses_while_devices_open() {
    let (_bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001")]);
    let device = timssdr.open().unwrap();
    assert_eq!(timssdr.open_device_count(), 1);

    let (timssdr, err) = timssdr.exit().unwrap_err();
    assert_eq!(err, Error::NotLastDevice);

    device.close().unwrap();
    assert_eq!(timssdr.open_device_count(), 0);
    timssdr.exit().unwrap();
}

#[test]
fn test_drop_closes_device() {
    let (bus, timssdr) = context(vec![MockDeviceSpec::timssdr("SN001")]);
    {
        let _device = timssdr.open().unwrap();
        assert_eq!(bus.open_handles(), 1);
    }
    assert_eq!(bus.open_handles(), 0);
    assert_eq!(timssdr.open_device_count(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let bus = MockBus::new(Vec::new());
    let config = EngineConfig {
        transfer_buffer_size: 1000,
        ..Default::default()
    };
    assert_eq!(
        Timssdr::with_transport(bus, config).unwrap_err(),
        Error::InvalidParam
    );
}

#[test]
fn test_library_version() {
    assert_eq!(
        Timssdr::<MockBus>::library_version(),
        env!("CARGO_PKG_VERSION")
    );
}
