//! Engine behaviour against a simulated target and an in-memory controller
//!
//! Each test wires a [`DeviceManager`] to a `MemStore`-backed driver and a
//! loopback task speaking the USB/IP discovery protocol, then drives whole
//! reconciliation cycles through the public API.

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use agent::catalog::{DeviceFilter, DeviceSpec, MountSpec};
use agent::oracle::FixedUsage;
use agent::reconciler::{AllocationError, DeviceManager, ManagerSettings};
use protocol::codec::{self, OpHeader, USBIP_VERSION};
use protocol::{DeviceDescription, Target, UsbSpeed};
use vhci::VhciDriver;
use vhci::testing::MemStore;

const STATUS_HEADER: &str = "hub port sta spd dev      sockfd local_busid\n";
const CONTROLLER: &str = "bus/platform/devices/vhci_hcd.0";

fn status_text(lines: &[&str]) -> String {
    let mut text = STATUS_HEADER.to_owned();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}

/// Three high-class ports and one super-class port, all vacant.
fn vacant_store() -> Arc<MemStore> {
    let store = MemStore::new();
    store.insert(format!("{CONTROLLER}/nports"), "4\n");
    store.insert(
        format!("{CONTROLLER}/status"),
        status_text(&[
            "hs  0000 004 000 00000000 000000 0-0",
            "hs  0001 004 000 00000000 000000 0-0",
            "hs  0002 004 000 00000000 000000 0-0",
            "ss  0003 004 000 00000000 000000 0-0",
        ]),
    );
    store.insert(format!("{CONTROLLER}/attach"), "");
    store.insert(format!("{CONTROLLER}/detach"), "");
    Arc::new(store)
}

fn seed_usb_device(store: &MemStore, bus_id: &str, vendor: &str, product: &str, dev_name: &str) {
    let base = format!("bus/usb/devices/{bus_id}");
    store.insert(format!("{base}/idVendor"), format!("{vendor}\n"));
    store.insert(format!("{base}/idProduct"), format!("{product}\n"));
    store.insert(format!("{base}/busnum"), "2\n");
    store.insert(format!("{base}/devnum"), "33\n");
    store.insert(
        format!("{base}/uevent"),
        format!("MAJOR=189\nMINOR=160\nDEVNAME={dev_name}\nDEVTYPE=usb_device\n"),
    );
}

fn description(bus_id: &str, vendor: u16, product: u16) -> DeviceDescription {
    DeviceDescription {
        path: format!("/sys/devices/pci0000:00/usb2/{bus_id}"),
        bus_id: bus_id.to_owned(),
        bus_num: 2,
        dev_num: 33,
        speed: UsbSpeed::High.code(),
        vendor,
        product,
        bcd_device: 0x0200,
        configuration_value: 1,
        num_configurations: 1,
        ..Default::default()
    }
}

fn spec(target: &Target, vendor: u16, product: u16) -> DeviceSpec {
    DeviceSpec {
        target: target.clone(),
        filter: DeviceFilter {
            vendor: Some(vendor),
            product: Some(product),
            bus_id: None,
        },
        extra_devices: Vec::new(),
    }
}

fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        attach_wait_attempts: 3,
        attach_wait_step: Duration::from_millis(10),
    }
}

fn unreachable_target() -> Target {
    Target {
        host: "127.0.0.1".into(),
        port: 1,
    }
}

/// Serve the discovery protocol on a loopback port. Devlist responses walk
/// through `listings` one per request, repeating the last; imports answer
/// from any listing and then hold the connection open like a real target
/// switching to the URB transport.
async fn spawn_target(listings: Vec<Vec<DeviceDescription>>) -> Target {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let listings = Arc::new(listings);
    let next = Arc::new(Mutex::new(0usize));

    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(handle_client(sock, listings.clone(), next.clone()));
        }
    });

    Target {
        host: "127.0.0.1".into(),
        port,
    }
}

async fn handle_client(
    mut sock: tokio::net::TcpStream,
    listings: Arc<Vec<Vec<DeviceDescription>>>,
    next: Arc<Mutex<usize>>,
) {
    let mut head = [0u8; codec::HEADER_LEN];
    if sock.read_exact(&mut head).await.is_err() {
        return;
    }
    let header = OpHeader::decode(&mut &head[..]).unwrap();

    match header.code {
        codec::OP_REQ_DEVLIST => {
            let index = {
                let mut next = next.lock().unwrap();
                let index = *next;
                *next = (index + 1).min(listings.len() - 1);
                index
            };
            let devices = &listings[index];
            let mut response = Vec::new();
            OpHeader {
                version: USBIP_VERSION,
                code: 0x0005,
                status: 0,
            }
            .encode(&mut response);
            response.put_u32(devices.len() as u32);
            for desc in devices {
                codec::encode_device_description(desc, &mut response).unwrap();
                response.put_bytes(0, 4 * desc.num_interfaces as usize);
            }
            let _ = sock.write_all(&response).await;
        }
        codec::OP_REQ_IMPORT => {
            let mut raw = [0u8; codec::BUS_ID_LEN];
            if sock.read_exact(&mut raw).await.is_err() {
                return;
            }
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let bus_id = String::from_utf8_lossy(&raw[..end]).into_owned();

            let found = listings
                .iter()
                .flatten()
                .find(|desc| desc.bus_id == bus_id)
                .cloned();
            let mut response = Vec::new();
            match found {
                Some(desc) => {
                    OpHeader {
                        version: USBIP_VERSION,
                        code: 0x0003,
                        status: 0,
                    }
                    .encode(&mut response);
                    codec::encode_device_description(&desc, &mut response).unwrap();
                }
                None => OpHeader {
                    version: USBIP_VERSION,
                    code: 0x0003,
                    status: 1,
                }
                .encode(&mut response),
            }
            let _ = sock.write_all(&response).await;

            // The client hands this socket to the controller; hold it open
            // until the peer goes away.
            let mut sink = [0u8; 64];
            while matches!(sock.read(&mut sink).await, Ok(n) if n > 0) {}
        }
        _ => {}
    }
}

#[tokio::test]
async fn refresh_marks_matching_device_available() {
    let target = spawn_target(vec![vec![description("2-1", 0xdead, 0xbeef)]]).await;
    let store = vacant_store();
    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    let keys = manager
        .register("cameras", [spec(&target, 0xdead, 0xbeef)])
        .await
        .unwrap();
    let key = keys[0].clone();
    let updates = manager.subscribe().await;

    let report = manager.refresh_all().await;
    assert!(report.is_clean());
    assert_eq!(report.changed, vec![key.clone()]);

    let wanted: HashSet<_> = keys.iter().cloned().collect();
    assert_eq!(manager.available_devices(&wanted).await, vec![key.clone()]);
    assert_eq!(updates.try_recv().unwrap(), vec![key.clone()]);

    let known = manager.known_device(&key).await.unwrap();
    assert!(known.available);
    assert_eq!(known.observed.as_ref().map(|d| d.bus_id.as_str()), Some("2-1"));
}

#[tokio::test]
async fn second_refresh_reports_nothing_new() {
    let target = spawn_target(vec![vec![description("2-1", 0xdead, 0xbeef)]]).await;
    let store = vacant_store();
    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    manager
        .register("cameras", [spec(&target, 0xdead, 0xbeef)])
        .await
        .unwrap();
    let updates = manager.subscribe().await;

    assert_eq!(manager.refresh_all().await.changed.len(), 1);
    updates.try_recv().unwrap();

    let report = manager.refresh_all().await;
    assert!(report.is_clean());
    assert!(report.changed.is_empty());
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn device_disappearing_clears_availability() {
    let target = spawn_target(vec![
        vec![description("2-1", 0xdead, 0xbeef)],
        Vec::new(),
    ])
    .await;
    let store = vacant_store();
    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    let keys = manager
        .register("cameras", [spec(&target, 0xdead, 0xbeef)])
        .await
        .unwrap();
    let key = keys[0].clone();

    manager.refresh_all().await;
    let report = manager.refresh_all().await;
    assert_eq!(report.changed, vec![key.clone()]);

    let known = manager.known_device(&key).await.unwrap();
    assert!(!known.available);
    assert!(known.observed.is_none());
    let wanted: HashSet<_> = keys.into_iter().collect();
    assert!(manager.available_devices(&wanted).await.is_empty());
}

#[tokio::test]
async fn unreachable_target_is_skipped_not_fatal() {
    let target = unreachable_target();
    let store = vacant_store();
    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    manager
        .register("cameras", [spec(&target, 0xdead, 0xbeef)])
        .await
        .unwrap();

    let report = manager.refresh_all().await;
    assert!(report.changed.is_empty());
    assert_eq!(report.skipped_targets, vec![target]);
}

#[tokio::test]
async fn adopt_pairs_used_ports_with_catalog_entries() {
    let store = vacant_store();
    store.insert(
        format!("{CONTROLLER}/status"),
        status_text(&[
            "hs  0000 006 002 00020021 000010 2-1",
            "hs  0001 004 000 00000000 000000 0-0",
            "hs  0002 004 000 00000000 000000 0-0",
            "ss  0003 006 002 00020021 000011 2-2",
        ]),
    );
    seed_usb_device(&store, "2-1", "dead", "beef", "bus/usb/002/033");
    seed_usb_device(&store, "2-2", "feed", "face", "bus/usb/002/034");

    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    let target = unreachable_target();
    let keys = manager
        .register(
            "cameras",
            [spec(&target, 0xdead, 0xbeef), spec(&target, 0xfeed, 0xface)],
        )
        .await
        .unwrap();

    manager.adopt_attached().await;

    let attached = manager.attached().await;
    assert_eq!(attached.len(), 2);
    let by_key = |key| attached.iter().find(|(k, _)| k == key).unwrap();
    assert_eq!(by_key(&keys[0]).1.port, 0);
    assert_eq!(by_key(&keys[0]).1.device.vendor, 0xdead);
    assert_eq!(by_key(&keys[1]).1.port, 3);

    // Adopted devices count as allocatable even before any refresh.
    let wanted: HashSet<_> = keys.iter().cloned().collect();
    assert_eq!(manager.available_devices(&wanted).await.len(), 2);
}

#[tokio::test]
async fn refresh_detaches_orphans_but_keeps_held_devices() {
    let store = vacant_store();
    store.insert(
        format!("{CONTROLLER}/status"),
        status_text(&[
            "hs  0000 006 002 00020021 000010 2-1",
            "hs  0001 004 000 00000000 000000 0-0",
            "hs  0002 004 000 00000000 000000 0-0",
            "ss  0003 006 002 00020021 000011 2-2",
        ]),
    );
    seed_usb_device(&store, "2-1", "dead", "beef", "bus/usb/002/033");
    seed_usb_device(&store, "2-2", "feed", "face", "bus/usb/002/034");

    let target = unreachable_target();
    let held_spec = spec(&target, 0xdead, 0xbeef);
    let held_key = held_spec.key("cameras").unwrap();

    let oracle = FixedUsage::new();
    oracle.hold(held_key.clone(), "pod/studio-feed");

    let driver = VhciDriver::new(store.clone(), "/dev").unwrap();
    let manager = DeviceManager::new(driver, Some(oracle), fast_settings());
    let keys = manager
        .register("cameras", [held_spec, spec(&target, 0xfeed, 0xface)])
        .await
        .unwrap();
    assert_eq!(keys[0], held_key);

    manager.adopt_attached().await;
    assert_eq!(manager.attached().await.len(), 2);

    let report = manager.refresh_all().await;
    assert_eq!(report.orphan_failures, 0);

    let attached = manager.attached().await;
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].0, held_key);
    assert_eq!(
        store.writes(),
        vec![(format!("{CONTROLLER}/detach"), "3".to_owned())]
    );
}

#[tokio::test]
async fn allocate_attaches_and_returns_device_mounts() {
    let target = spawn_target(vec![vec![description("2-1", 0xdead, 0xbeef)]]).await;
    let dev_root = tempfile::tempdir().unwrap();
    fs::create_dir_all(dev_root.path().join("bus/usb/002")).unwrap();
    fs::write(dev_root.path().join("bus/usb/002/033"), b"").unwrap();
    fs::write(dev_root.path().join("ttyCAM0"), b"").unwrap();

    let store = vacant_store();
    // Kernel reaction to the attach command: port 0 flips to Used and the
    // device's attributes appear.
    store.set_write_hook(|path, _| {
        if !path.ends_with("/attach") {
            return Vec::new();
        }
        let base = "bus/usb/devices/2-1";
        vec![
            (
                format!("{CONTROLLER}/status"),
                status_text(&[
                    "hs  0000 006 002 00020021 000010 2-1",
                    "hs  0001 004 000 00000000 000000 0-0",
                    "hs  0002 004 000 00000000 000000 0-0",
                    "ss  0003 004 000 00000000 000000 0-0",
                ]),
            ),
            (format!("{base}/idVendor"), "dead".into()),
            (format!("{base}/idProduct"), "beef".into()),
            (format!("{base}/busnum"), "2".into()),
            (format!("{base}/devnum"), "33".into()),
            (format!("{base}/uevent"), "DEVNAME=bus/usb/002/033".into()),
        ]
    });

    let driver = VhciDriver::new(store.clone(), dev_root.path()).unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    let mut device = spec(&target, 0xdead, 0xbeef);
    device.extra_devices.push(MountSpec {
        host_path: dev_root.path().join("ttyCAM0"),
        container_path: "/dev/ttyCAM0".into(),
        permissions: "mrw".to_owned(),
    });
    let keys = manager.register("cameras", [device]).await.unwrap();

    manager.refresh_all().await;
    let mounts = manager.allocate(&keys).await.unwrap();

    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].host_path, dev_root.path().join("bus/usb/002/033"));
    assert_eq!(mounts[0].container_path, mounts[0].host_path);
    assert_eq!(mounts[0].permissions, "mrw");
    assert_eq!(mounts[1].host_path, dev_root.path().join("ttyCAM0"));

    let attached = manager.attached().await;
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].1.port, 0);
    assert_eq!(attached[0].1.device.bus_id, "2-1");

    // A second allocation reuses the attachment.
    let again = manager.allocate(&keys).await.unwrap();
    assert_eq!(again, mounts);
    let attach_writes = store
        .writes()
        .into_iter()
        .filter(|(path, _)| path.ends_with("/attach"))
        .count();
    assert_eq!(attach_writes, 1);
}

#[tokio::test]
async fn allocate_rejects_unknown_and_unavailable_devices() {
    let target = unreachable_target();
    let store = vacant_store();
    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    let keys = manager
        .register("cameras", [spec(&target, 0xdead, 0xbeef)])
        .await
        .unwrap();

    let bogus = spec(&target, 0x1234, 0x5678).key("other").unwrap();
    assert!(matches!(
        manager.allocate(std::slice::from_ref(&bogus)).await,
        Err(AllocationError::UnknownDevice(key)) if key == bogus
    ));

    // Registered but never seen in a listing.
    assert!(matches!(
        manager.allocate(&keys).await,
        Err(AllocationError::NotAvailable(_))
    ));
}

#[tokio::test]
async fn allocate_detaches_when_device_node_never_appears() {
    let target = spawn_target(vec![vec![description("2-1", 0xdead, 0xbeef)]]).await;
    // No write hook: the port table never shows the attachment.
    let store = vacant_store();
    let driver = VhciDriver::new(store.clone(), "/dev").unwrap();
    let manager = DeviceManager::new(
        driver,
        None::<FixedUsage>,
        ManagerSettings {
            attach_wait_attempts: 2,
            attach_wait_step: Duration::from_millis(1),
        },
    );

    let keys = manager
        .register("cameras", [spec(&target, 0xdead, 0xbeef)])
        .await
        .unwrap();
    manager.refresh_all().await;

    match manager.allocate(&keys).await {
        Err(AllocationError::AttachTimeout { key, port }) => {
            assert_eq!(key, keys[0]);
            assert_eq!(port, 0);
        }
        other => panic!("expected attach timeout, got {other:?}"),
    }

    assert!(manager.attached().await.is_empty());
    // The half-attached port was released.
    assert!(
        store
            .writes()
            .iter()
            .any(|(path, value)| path.ends_with("/detach") && value == "0")
    );
}

#[tokio::test]
async fn start_refreshes_and_adopts_in_one_pass() {
    let target = spawn_target(vec![vec![description("2-1", 0xdead, 0xbeef)]]).await;
    let store = vacant_store();
    store.insert(
        format!("{CONTROLLER}/status"),
        status_text(&[
            "hs  0000 004 000 00000000 000000 0-0",
            "hs  0001 006 002 00020022 000010 2-3",
            "hs  0002 004 000 00000000 000000 0-0",
            "ss  0003 004 000 00000000 000000 0-0",
        ]),
    );
    seed_usb_device(&store, "2-3", "feed", "face", "bus/usb/002/034");

    let driver = VhciDriver::new(store, "/dev").unwrap();
    let manager = DeviceManager::new(driver, None::<FixedUsage>, fast_settings());

    let keys = manager
        .register(
            "cameras",
            [spec(&target, 0xdead, 0xbeef), spec(&target, 0xfeed, 0xface)],
        )
        .await
        .unwrap();

    manager.start().await.unwrap();

    let wanted: HashSet<_> = keys.iter().cloned().collect();
    let available = manager.available_devices(&wanted).await;
    assert_eq!(available.len(), 2, "one listed, one adopted");

    let attached = manager.attached().await;
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].0, keys[1]);
    assert_eq!(attached[0].1.port, 1);
}
