//! Integration tests for the usbboot adapter

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use protocol::{DeviceIdentity, FileRequest, ProtocolError, USBBOOT_CAPABLE_DEVICES};
use tokio::sync::broadcast;
use usbboot::adapter::{Adapter, AdapterEvent, UsbbootAdapter, UsbbootOptions};
use usbboot::adapter::{DriveIcon, DriveRecord};
use usbboot::boot::MemoryProvider;
use usbboot::error::BootError;
use usbboot::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockDevice, MockTransport, fast_timing, file_request,
    mock_device, mock_foreign_device, raw_file_request, return_code, wait_until, with_timeout,
};
use usbboot::usb::{DeviceDescriptor, RawDeviceHandle, UsbDevice};

fn firmware() -> Arc<MemoryProvider> {
    Arc::new(
        MemoryProvider::new()
            .with_file("bootcode.bin", vec![0u8; 32])
            .with_file("start.elf", vec![1u8; 64]),
    )
}

fn options() -> UsbbootOptions {
    UsbbootOptions {
        timing: fast_timing(),
        ..UsbbootOptions::default()
    }
}

fn adapter(transport: &MockTransport, options: UsbbootOptions) -> UsbbootAdapter<MockTransport> {
    UsbbootAdapter::new(Arc::new(transport.clone()), firmware(), options)
}

/// A second-stage device that asks for nothing and stalls
fn idle_device(address: u8) -> UsbDevice {
    mock_device(1, address, 0x2764, 2, 1)
}

fn total_opens(transport: &MockTransport, devices: &[UsbDevice]) -> usize {
    devices
        .iter()
        .map(|d| transport.open_count(d.raw_handle()))
        .sum()
}

async fn next_error(rx: &mut broadcast::Receiver<AdapterEvent>) -> Option<AdapterEvent> {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event @ AdapterEvent::Error(_)) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_unsupported_devices_are_ignored() {
    let transport = MockTransport::new();
    transport.add_device(MockDevice::new(mock_foreign_device(1, 2)));
    transport.add_device(MockDevice::new(mock_foreign_device(1, 3)));
    let adapter = adapter(&transport, options());

    let records = adapter.scan().await;

    assert!(records.is_empty());
    assert!(adapter.devices().is_empty());
    assert_eq!(transport.open_count(mock_foreign_device(1, 2).raw_handle()), 0);
    assert_eq!(transport.list_calls(), 1);
}

#[tokio::test]
async fn test_record_fields() {
    let transport = MockTransport::new();
    let device = mock_device(1, 4, 0x2763, 0, 1);
    transport.add_device(MockDevice::new(device.clone()).respond(vec![0u8; 4]));
    let adapter = adapter(&transport, options());

    let records = adapter.scan().await;
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.id, "001:004");
    assert_eq!(record.adapter, "usbboot");
    assert_eq!(record.display_name, "Initializing device");
    // Nothing read from the device yet
    assert_eq!(record.description, "Compute Module");
    assert_eq!(record.size, None);
    assert!(record.disabled);
    assert_eq!(record.icon, DriveIcon::Loading);
    assert!(record.progress.is_some());
    assert_eq!(record.vendor_id, "0x0a5c");
    assert_eq!(record.product_id, "0x2763");
    assert_eq!(adapter.devices(), records);
}

#[tokio::test]
async fn test_record_serializes_camel_case() {
    let record = DriveRecord {
        id: "001:004".into(),
        adapter: "usbboot".into(),
        display_name: "Initializing device".into(),
        description: "Broadcom BCM2710 Boot".into(),
        size: None,
        disabled: true,
        icon: DriveIcon::Loading,
        progress: Some(42),
        vendor_id: "0x0a5c".into(),
        product_id: "0x2764".into(),
    };

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["displayName"], "Initializing device");
    assert_eq!(json["icon"], "loading");
    assert_eq!(json["size"], serde_json::Value::Null);
    assert_eq!(json["progress"], 42);
    assert_eq!(json["vendorId"], "0x0a5c");
}

#[tokio::test]
async fn test_start_limit_defers_extra_devices() {
    let transport = MockTransport::new();
    let devices: Vec<UsbDevice> = (10..17).map(idle_device).collect();
    for device in &devices {
        transport.add_device(MockDevice::new(device.clone()));
    }
    let adapter = adapter(&transport, options());
    let (t, d) = (&transport, &devices);

    let records = adapter.scan().await;
    assert_eq!(records.len(), 7);

    let limit_started = move || async move { total_opens(t, d) == 5 };
    assert!(wait_until(Duration::from_secs(2), limit_started).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(total_opens(&transport, &devices), 5);
    for device in &devices[5..] {
        assert_eq!(transport.open_count(device.raw_handle()), 0);
    }

    adapter.scan().await;
    let all_started = move || async move { total_opens(t, d) == 7 };
    assert!(wait_until(Duration::from_secs(2), all_started).await);
}

#[tokio::test]
async fn test_no_restart_for_same_connection() {
    let transport = MockTransport::new();
    let device = idle_device(20);
    transport.add_device(MockDevice::new(device.clone()));
    let adapter = adapter(&transport, options());
    let handle = device.raw_handle();
    let progress = adapter.progress();

    adapter.scan().await;
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            progress.get(handle).await == Some(100)
        })
        .await
    );

    // In flight (settling)
    adapter.scan().await;

    // Settled and removed from the progress table
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            !progress.contains(handle).await
        })
        .await
    );
    let records = adapter.scan().await;

    assert_eq!(transport.open_count(handle), 1);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].progress, None);
}

#[tokio::test]
async fn test_progress_visible_while_settling() {
    let transport = MockTransport::new();
    let device = idle_device(21);
    transport.add_device(MockDevice::new(device.clone()));
    let adapter = adapter(&transport, options());
    let handle = device.raw_handle();
    let progress = adapter.progress();

    adapter.scan().await;
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            progress.get(handle).await == Some(100)
        })
        .await
    );

    let records = adapter.scan().await;
    assert_eq!(records[0].progress, Some(100));
}

#[tokio::test]
async fn test_failed_run_emits_error_event() {
    let transport = MockTransport::new();
    let device = mock_device(1, 30, 0x2764, 2, 1);
    transport.add_device(
        MockDevice::new(device.clone()).respond(raw_file_request(99, "start.elf")),
    );
    let adapter = adapter(&transport, options());
    let mut events = adapter.events();

    adapter.scan().await;

    match next_error(&mut events).await {
        Some(AdapterEvent::Error(e)) => {
            assert_eq!(e.adapter, "usbboot");
            assert_eq!(e.device, "001:030");
            assert_eq!(
                e.source,
                BootError::ProtocolFault(ProtocolError::UnknownCommand(99))
            );
        }
        other => panic!("expected an error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_interface_emits_error_event() {
    let transport = MockTransport::new();
    let device = mock_device(1, 35, 0x2763, 0, 1);
    transport.add_device(
        MockDevice::new(device).fail_claim(BootError::from(rusb::Error::NotFound)),
    );
    let adapter = adapter(&transport, options());
    let mut events = adapter.events();

    adapter.scan().await;

    match next_error(&mut events).await {
        Some(AdapterEvent::Error(e)) => {
            assert_eq!(e.device, "001:035");
            assert!(matches!(e.source, BootError::Usb(_)));
        }
        other => panic!("expected an error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_vanished_device_is_silent() {
    let transport = MockTransport::new();
    let vanished = mock_device(1, 40, 0x2763, 0, 1);
    let failing = mock_device(1, 41, 0x2764, 2, 1);
    transport.add_device(MockDevice::new(vanished.clone()).fail_open(BootError::NoDevice));
    transport.add_device(MockDevice::new(failing).respond(raw_file_request(7, "x")));
    let adapter = adapter(&transport, options());
    let mut events = adapter.events();

    adapter.scan().await;

    // Only the protocol fault surfaces
    match next_error(&mut events).await {
        Some(AdapterEvent::Error(e)) => assert_eq!(e.device, "001:041"),
        other => panic!("expected an error event, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, AdapterEvent::Error(_)), "unexpected {:?}", event);
    }
}

#[tokio::test]
async fn test_scan_emits_devices_event() {
    let transport = MockTransport::new();
    let device = idle_device(50);
    transport.add_device(
        MockDevice::new(device.clone()).respond(file_request(&FileRequest::Done)),
    );
    let adapter = adapter(&transport, options());
    let mut events = adapter.events();

    let records = adapter.scan().await;

    match events.recv().await {
        Ok(AdapterEvent::Devices(snapshot)) => assert_eq!(snapshot, records),
        other => panic!("expected a devices event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_extra_identities() {
    let transport = MockTransport::new();
    transport.add_device(MockDevice::new(mock_foreign_device(2, 1)));
    let adapter = adapter(
        &transport,
        UsbbootOptions {
            extra_identities: vec![DeviceIdentity::new(0x1234, 0x5678)],
            ..options()
        },
    );

    let records = adapter.scan().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].description, "Compute Module");
    assert_eq!(records[0].vendor_id, "0x1234");
    assert_eq!(adapter.identities().len(), 3);
}

#[tokio::test]
async fn test_unplugged_device_leaves_snapshot() {
    let transport = MockTransport::new();
    let device = idle_device(60);
    transport.add_device(MockDevice::new(device.clone()));
    let adapter = adapter(&transport, options());

    assert_eq!(adapter.scan().await.len(), 1);

    transport.remove_device(device.raw_handle());
    assert!(adapter.scan().await.is_empty());
    assert!(adapter.devices().is_empty());
}

#[tokio::test]
async fn test_description_comes_from_device_strings() {
    let transport = MockTransport::new();
    let device = mock_device(1, 70, 0x2763, 0, 1);
    transport.add_device(
        MockDevice::new(device.clone())
            .with_name("Broadcom", "BCM2708 Boot")
            .respond(return_code(0)),
    );
    let adapter = adapter(&transport, options());
    let handle = device.raw_handle();
    let names = adapter.names();

    assert_eq!(adapter.scan().await[0].description, "Compute Module");
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            names.get(handle).await.is_some()
        })
        .await
    );

    let records = adapter.scan().await;
    assert_eq!(records[0].description, "Broadcom BCM2708 Boot");

    // Forgotten once the connection goes away
    transport.remove_device(handle);
    adapter.scan().await;
    assert_eq!(names.get(handle).await, None);
}

fn unsupported_device(address: u8, vendor_id: u16, product_id: u16) -> UsbDevice {
    UsbDevice {
        bus_number: 1,
        device_address: address,
        descriptor: DeviceDescriptor {
            vendor_id,
            product_id,
            serial_number_index: 0,
            interface_count: 1,
        },
    }
}

fn unsupported_identity() -> impl Strategy<Value = (u16, u16)> {
    (any::<u16>(), any::<u16>()).prop_filter("boot ROM identity", |(vid, pid)| {
        !USBBOOT_CAPABLE_DEVICES.contains(&DeviceIdentity::new(*vid, *pid))
    })
}

proptest! {
    #[test]
    fn prop_unsupported_identities_yield_no_records(
        identities in proptest::collection::vec(unsupported_identity(), 0..16)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let transport = MockTransport::new();
        for (i, (vid, pid)) in identities.iter().enumerate() {
            let device = unsupported_device(i as u8 + 1, *vid, *pid);
            transport.add_device(MockDevice::new(device));
        }
        let adapter = adapter(&transport, options());

        let records = runtime.block_on(adapter.scan());

        prop_assert!(records.is_empty());
        prop_assert!(adapter.devices().is_empty());
        let opens: usize = (1..=identities.len() as u8)
            .map(|address| transport.open_count(RawDeviceHandle::new(1, address)))
            .sum();
        prop_assert_eq!(opens, 0);
    }
}
