//! Tests for the sync orchestrator state machine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mockall::predicate::eq;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::{
    AppContext, InMemoryProfileCache, MockProfileCache, ProfileCache, SyncError, SyncOrchestrator,
    SyncProgress, SyncRole, SyncStatus,
};
use crate::storage::{DatabaseSnapshot, StorageConfig, StorageManager};
use crate::transport::{
    DeviceDescriptor, EventHandler, EventSlot, LoopbackHub, PeerTransport, TcpConfig,
    TcpTransport, TransportError, TransportEvent, TransportResult,
};

/// Transport whose outcomes are fixed up front.
struct ScriptedTransport {
    events: EventSlot,
    calls: Mutex<Vec<&'static str>>,
    devices: Vec<DeviceDescriptor>,
    advertise_result: TransportResult<()>,
    connect_result: TransportResult<bool>,
    send_result: TransportResult<bool>,
    payload: TransportResult<DatabaseSnapshot>,
    receive_progress: Vec<u8>,
    hold_receive: Option<Arc<Notify>>,
    sent: Mutex<Option<DatabaseSnapshot>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            events: EventSlot::default(),
            calls: Mutex::new(Vec::new()),
            devices: Vec::new(),
            advertise_result: Ok(()),
            connect_result: Ok(true),
            send_result: Ok(true),
            payload: Ok(DatabaseSnapshot::new()),
            receive_progress: Vec::new(),
            hold_receive: None,
            sent: Mutex::new(None),
        }
    }
}

impl ScriptedTransport {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }
}

impl PeerTransport for ScriptedTransport {
    async fn initialize(&self) -> TransportResult<()> {
        self.record("initialize");
        Ok(())
    }

    async fn start_advertising(&self, _display_name: &str) -> TransportResult<()> {
        self.record("start_advertising");
        self.advertise_result.clone()
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        self.record("stop_advertising");
        Ok(())
    }

    async fn start_scanning(&self) -> TransportResult<()> {
        self.record("start_scanning");
        for device in &self.devices {
            self.emit(TransportEvent::DeviceDiscovered(device.clone()));
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> TransportResult<()> {
        self.record("stop_scanning");
        Ok(())
    }

    fn get_discovered_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }

    async fn connect_to_device(&self, id: &str) -> TransportResult<bool> {
        self.record("connect_to_device");
        if let Ok(true) = self.connect_result {
            self.emit(TransportEvent::ConnectionChanged {
                connected: true,
                device_id: id.to_string(),
            });
        }
        self.connect_result.clone()
    }

    async fn send_data(&self, snapshot: &DatabaseSnapshot) -> TransportResult<bool> {
        self.record("send_data");
        *self.sent.lock().unwrap() = Some(snapshot.clone());
        self.emit(TransportEvent::TransferProgress { percent: 50 });
        self.send_result.clone()
    }

    async fn receive_data(&self) -> TransportResult<DatabaseSnapshot> {
        self.record("receive_data");
        if let Some(hold) = &self.hold_receive {
            hold.notified().await;
        }
        for percent in &self.receive_progress {
            self.emit(TransportEvent::TransferProgress { percent: *percent });
        }
        self.payload.clone()
    }

    fn set_event_handler(&self, handler: EventHandler) {
        self.events.replace(handler);
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.record("disconnect");
        Ok(())
    }
}

fn storage_in(dir: &TempDir, name: &str) -> StorageManager {
    StorageManager::new(StorageConfig::new(dir.path().join(name), "app.db"))
}

fn context(storage: StorageManager, cache: Arc<dyn ProfileCache>) -> AppContext {
    AppContext::new(storage, cache)
}

fn relaxed_cache() -> Arc<dyn ProfileCache> {
    Arc::new(InMemoryProfileCache::new())
}

fn record_progress<T: PeerTransport>(
    orchestrator: &SyncOrchestrator<T>,
) -> Arc<Mutex<Vec<SyncProgress>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orchestrator
        .notifier()
        .subscribe(move |p| sink.lock().unwrap().push(p.clone()));
    seen
}

fn steps(seen: &Arc<Mutex<Vec<SyncProgress>>>) -> Vec<(SyncStatus, u8, String)> {
    seen.lock()
        .unwrap()
        .iter()
        .map(|p| (p.status, p.percent, p.message.clone().unwrap_or_default()))
        .collect()
}

fn step(status: SyncStatus, percent: u8, message: &str) -> (SyncStatus, u8, String) {
    (status, percent, message.to_string())
}

fn entry_snapshot() -> DatabaseSnapshot {
    serde_json::from_value(json!({
        "tables": {
            "entry": [
                {"id": "e1", "category_id": "general", "title": "Rent", "body": null,
                 "amount": 950.0, "attachments": "[]", "created_at": "2024-05-01"},
                {"id": "e2", "category_id": "work", "title": "Laptop", "body": "new one",
                 "amount": 1299.5, "attachments": "[\"receipt.pdf\"]", "created_at": "2024-05-02"}
            ]
        }
    }))
    .unwrap()
}

fn device(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(id, format!("Device {}", id))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receiver_happy_path_sequence() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir, "receiver");

    let mut cache = MockProfileCache::new();
    cache
        .expect_set_profile_exists()
        .with(eq(false))
        .times(1)
        .return_const(());

    let transport = ScriptedTransport {
        devices: vec![device("d1")],
        payload: Ok(entry_snapshot()),
        ..ScriptedTransport::default()
    };
    let orchestrator =
        SyncOrchestrator::new(transport, context(storage.clone(), Arc::new(cache)), "phone");
    let seen = record_progress(&orchestrator);

    orchestrator.start_as_receiver().await.unwrap();
    assert_eq!(orchestrator.get_discovered_devices(), vec![device("d1")]);
    orchestrator.connect_to_device("d1").await.unwrap();
    orchestrator.start_sync().await.unwrap();

    assert_eq!(
        steps(&seen),
        vec![
            step(SyncStatus::Scanning, 0, "Scanning for devices..."),
            step(SyncStatus::Connecting, 0, "Connecting to d1..."),
            step(SyncStatus::Connected, 0, "Connected to d1"),
            step(SyncStatus::Transferring, 10, "Preparing database for sync..."),
            step(SyncStatus::Transferring, 20, "Receiving data..."),
            step(SyncStatus::Transferring, 80, "Importing received data..."),
            step(SyncStatus::Completed, 100, "Sync completed successfully"),
        ]
    );

    let exported = storage.export_snapshot().await.unwrap();
    assert_eq!(exported.table("entry"), entry_snapshot().table("entry"));
    assert_eq!(orchestrator.role(), None);

    let calls = orchestrator.transport().calls();
    assert!(calls.ends_with(&["receive_data", "stop_scanning", "disconnect"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receiver_replaces_existing_data() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir, "receiver");
    let local: DatabaseSnapshot = serde_json::from_value(json!({
        "tables": {
            "entry": [{"id": "old", "title": "Stale", "created_at": "2020-01-01"}],
            "setting": [{"key": "theme", "value": "dark"}]
        }
    }))
    .unwrap();
    storage.import_snapshot(&local).await.unwrap();

    let transport = ScriptedTransport {
        payload: Ok(entry_snapshot()),
        ..ScriptedTransport::default()
    };
    let orchestrator =
        SyncOrchestrator::new(transport, context(storage.clone(), relaxed_cache()), "phone");

    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();
    orchestrator.start_sync().await.unwrap();

    let counts = storage.row_counts().await.unwrap();
    assert_eq!(counts["entry"], 2);
    assert_eq!(counts["setting"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receiver_forwards_transfer_progress_in_band() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport {
        receive_progress: vec![0, 50, 50, 100],
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "receiver"), relaxed_cache()),
        "phone",
    );
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();
    let seen = record_progress(&orchestrator);

    orchestrator.start_sync().await.unwrap();

    let percents: Vec<u8> = steps(&seen).iter().map(|(_, p, _)| *p).collect();
    assert_eq!(percents, vec![10, 20, 50, 79, 80, 100]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sender_happy_path_sequence() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir, "sender");
    storage.import_snapshot(&entry_snapshot()).await.unwrap();

    let orchestrator = SyncOrchestrator::new(
        ScriptedTransport::default(),
        context(storage.clone(), relaxed_cache()),
        "laptop",
    );
    let seen = record_progress(&orchestrator);

    orchestrator.start_as_sender().await.unwrap();
    orchestrator.transport().emit(TransportEvent::ConnectionChanged {
        connected: true,
        device_id: "r1".to_string(),
    });
    assert_eq!(orchestrator.connected_peer().as_deref(), Some("r1"));
    orchestrator.start_sync().await.unwrap();

    assert_eq!(
        steps(&seen),
        vec![
            step(SyncStatus::Idle, 0, "Waiting for receiver..."),
            step(SyncStatus::Connected, 0, "Connected to r1"),
            step(SyncStatus::Transferring, 0, "Sending data..."),
            step(SyncStatus::Transferring, 50, "Sending data..."),
            step(SyncStatus::Completed, 100, "Sync completed successfully"),
        ]
    );

    let sent = orchestrator.transport().sent.lock().unwrap().clone().unwrap();
    assert_eq!(sent, storage.export_snapshot().await.unwrap());
    assert_eq!(sent.table("entry").map(|rows| rows.len()), Some(2));
    assert!(
        orchestrator
            .transport()
            .calls()
            .ends_with(&["send_data", "stop_advertising", "disconnect"])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sender_rejected_send_is_error() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport {
        send_result: Ok(false),
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "sender"), relaxed_cache()),
        "laptop",
    );
    orchestrator.start_as_sender().await.unwrap();

    let err = orchestrator.start_sync().await.unwrap_err();

    assert_eq!(err, SyncError::SendRejected);
    let last = orchestrator.progress();
    assert_eq!(last.status, SyncStatus::Error);
    assert_eq!(
        last.message.as_deref(),
        Some("Failed to send data: Peer did not accept the data")
    );
    assert_eq!(orchestrator.role(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_advertising_failure_is_error() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport {
        advertise_result: Err(TransportError::Advertise("radio off".to_string())),
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "sender"), relaxed_cache()),
        "laptop",
    );

    let err = orchestrator.start_as_sender().await.unwrap_err();

    assert!(matches!(err, SyncError::Transport(TransportError::Advertise(_))));
    let last = orchestrator.progress();
    assert_eq!(last.status, SyncStatus::Error);
    assert!(last.message.unwrap().contains("radio off"));
    assert_eq!(orchestrator.role(), None);
    assert!(orchestrator.transport().calls().contains(&"stop_advertising"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_sync_without_role_is_error() {
    let dir = TempDir::new().unwrap();
    let orchestrator = SyncOrchestrator::new(
        ScriptedTransport::default(),
        context(storage_in(&dir, "any"), relaxed_cache()),
        "laptop",
    );

    let err = orchestrator.start_sync().await.unwrap_err();

    assert_eq!(err, SyncError::NoRole);
    let last = orchestrator.progress();
    assert_eq!(last.status, SyncStatus::Error);
    assert_eq!(
        last.message.as_deref(),
        Some("Failed to start sync: No sync role selected")
    );
    assert!(orchestrator.transport().calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_role_is_refused_without_publishing() {
    let dir = TempDir::new().unwrap();
    let orchestrator = SyncOrchestrator::new(
        ScriptedTransport::default(),
        context(storage_in(&dir, "any"), relaxed_cache()),
        "laptop",
    );
    orchestrator.start_as_receiver().await.unwrap();
    let seen = record_progress(&orchestrator);

    let err = orchestrator.start_as_sender().await.unwrap_err();

    assert_eq!(
        err,
        SyncError::RoleActive {
            role: SyncRole::Receiver
        }
    );
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(orchestrator.role(), Some(SyncRole::Receiver));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_scan_clears_discovered_devices() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport {
        devices: vec![device("d1"), device("d2")],
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "any"), relaxed_cache()),
        "phone",
    );

    orchestrator.start_as_receiver().await.unwrap();
    orchestrator
        .transport()
        .emit(TransportEvent::DeviceDiscovered(device("gone")));
    assert_eq!(orchestrator.get_discovered_devices().len(), 3);

    orchestrator.stop_sync().await;
    orchestrator
        .transport()
        .emit(TransportEvent::DeviceDiscovered(device("ignored")));
    orchestrator.start_as_receiver().await.unwrap();

    assert_eq!(
        orchestrator.get_discovered_devices(),
        vec![device("d1"), device("d2")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_refused_is_error() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport {
        connect_result: Ok(false),
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "any"), relaxed_cache()),
        "phone",
    );
    orchestrator.start_as_receiver().await.unwrap();

    let err = orchestrator.connect_to_device("d9").await.unwrap_err();

    assert_eq!(
        err,
        SyncError::ConnectRefused {
            device_id: "d9".to_string()
        }
    );
    assert_eq!(
        orchestrator.progress().message.as_deref(),
        Some("Failed to connect: Device d9 refused the connection")
    );
    assert_eq!(orchestrator.role(), None);
    assert!(
        orchestrator
            .transport()
            .calls()
            .ends_with(&["stop_scanning", "disconnect"])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receive_failure_after_reset_still_invalidates_profile() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(InMemoryProfileCache::new());
    let transport = ScriptedTransport {
        payload: Err(TransportError::Receive("link dropped".to_string())),
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "receiver"), cache.clone()),
        "phone",
    );
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();

    let err = orchestrator.start_sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Transport(TransportError::Receive(_))));
    assert_eq!(cache.profile_exists(), Some(false));
    let last = orchestrator.progress();
    assert_eq!(last.status, SyncStatus::Error);
    assert!(last.message.unwrap().starts_with("Failed to receive data: "));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_disconnect_while_connected_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    let orchestrator = SyncOrchestrator::new(
        ScriptedTransport::default(),
        context(storage_in(&dir, "any"), relaxed_cache()),
        "phone",
    );
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();

    orchestrator
        .transport()
        .emit(TransportEvent::ConnectionChanged {
            connected: false,
            device_id: "d1".to_string(),
        });

    assert_eq!(
        orchestrator.progress(),
        SyncProgress::new(SyncStatus::Idle, 0, "Peer disconnected")
    );
    assert_eq!(orchestrator.role(), Some(SyncRole::Receiver));
    assert_eq!(orchestrator.connected_peer(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sender_connect_is_refused_without_publishing() {
    let dir = TempDir::new().unwrap();
    let orchestrator = SyncOrchestrator::new(
        ScriptedTransport::default(),
        context(storage_in(&dir, "any"), relaxed_cache()),
        "laptop",
    );
    orchestrator.start_as_sender().await.unwrap();
    let seen = record_progress(&orchestrator);

    let err = orchestrator.connect_to_device("r1").await.unwrap_err();

    assert_eq!(err, SyncError::SenderCannotConnect);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(orchestrator.role(), Some(SyncRole::Sender));
    assert_eq!(orchestrator.progress().status, SyncStatus::Idle);
    assert!(!orchestrator.transport().calls().contains(&"connect_to_device"));
}

async fn assert_stopped<T: PeerTransport>(orchestrator: &SyncOrchestrator<T>) {
    orchestrator.stop_sync().await;
    assert_eq!(
        orchestrator.progress(),
        SyncProgress::new(SyncStatus::Idle, 0, "Sync stopped")
    );
    assert_eq!(orchestrator.role(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_sync_from_every_state() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport {
        payload: Err(TransportError::Receive("boom".to_string())),
        ..ScriptedTransport::default()
    };
    let orchestrator = SyncOrchestrator::new(
        transport,
        context(storage_in(&dir, "any"), relaxed_cache()),
        "phone",
    );

    // IDLE
    assert_stopped(&orchestrator).await;

    // SCANNING
    orchestrator.start_as_receiver().await.unwrap();
    assert_eq!(orchestrator.progress().status, SyncStatus::Scanning);
    assert_stopped(&orchestrator).await;

    // CONNECTED
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();
    assert_eq!(orchestrator.progress().status, SyncStatus::Connected);
    assert_stopped(&orchestrator).await;

    // ERROR
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();
    assert!(orchestrator.start_sync().await.is_err());
    assert_eq!(orchestrator.progress().status, SyncStatus::Error);
    assert_stopped(&orchestrator).await;

    // A new role is accepted afterwards
    orchestrator.start_as_sender().await.unwrap();
    assert_eq!(orchestrator.role(), Some(SyncRole::Sender));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_during_transfer_cancels_remaining_steps() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir, "receiver");
    let hold = Arc::new(Notify::new());
    let transport = ScriptedTransport {
        payload: Ok(entry_snapshot()),
        hold_receive: Some(Arc::clone(&hold)),
        ..ScriptedTransport::default()
    };
    let orchestrator =
        SyncOrchestrator::new(transport, context(storage.clone(), relaxed_cache()), "phone");
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device("d1").await.unwrap();

    let stopper = async {
        while orchestrator.progress().percent != 20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(orchestrator.progress().status, SyncStatus::Transferring);
        orchestrator.stop_sync().await;
        hold.notify_one();
    };
    let (result, ()) = tokio::join!(orchestrator.start_sync(), stopper);

    assert_eq!(result, Err(SyncError::Cancelled));
    assert_eq!(
        orchestrator.progress(),
        SyncProgress::new(SyncStatus::Idle, 0, "Sync stopped")
    );
    assert_eq!(storage.row_counts().await.unwrap()["entry"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_end_to_end_transfer() {
    let dir = TempDir::new().unwrap();
    let source = storage_in(&dir, "sender");
    source.import_snapshot(&entry_snapshot()).await.unwrap();
    let target = storage_in(&dir, "receiver");

    let hub = LoopbackHub::new();
    let sender = SyncOrchestrator::new(
        hub.transport("laptop"),
        context(source.clone(), relaxed_cache()),
        "Laptop",
    );
    let cache = Arc::new(InMemoryProfileCache::new());
    let receiver = SyncOrchestrator::new(
        hub.transport("phone"),
        context(target.clone(), cache.clone()),
        "Phone",
    );
    let sender_seen = record_progress(&sender);
    let receiver_seen = record_progress(&receiver);

    sender.start_as_sender().await.unwrap();
    receiver.start_as_receiver().await.unwrap();
    assert_eq!(
        receiver.get_discovered_devices(),
        vec![DeviceDescriptor::new("laptop", "Laptop")]
    );

    receiver.connect_to_device("laptop").await.unwrap();
    assert_eq!(sender.progress().status, SyncStatus::Connected);

    let (sent, received) = tokio::join!(sender.start_sync(), receiver.start_sync());
    sent.unwrap();
    received.unwrap();

    assert_eq!(
        target.export_snapshot().await.unwrap(),
        source.export_snapshot().await.unwrap()
    );
    assert_eq!(cache.profile_exists(), Some(false));
    assert_eq!(sender.progress().status, SyncStatus::Completed);
    assert_eq!(receiver.progress().status, SyncStatus::Completed);

    for seen in [&sender_seen, &receiver_seen] {
        let percents: Vec<u8> = steps(seen)
            .iter()
            .filter(|(status, _, _)| *status == SyncStatus::Transferring)
            .map(|(_, p, _)| *p)
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    }
}

fn tcp_config(device_id: &str, peers: Vec<std::net::SocketAddr>) -> TcpConfig {
    TcpConfig {
        device_id: device_id.to_string(),
        service_id: "peersync-test".to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        peers,
    }
}

/// Wait until `start_sync` is parked in the transport, then stop.
async fn stop_once_transferring<T: PeerTransport>(orchestrator: &SyncOrchestrator<T>, percent: u8) {
    while orchestrator.progress().status != SyncStatus::Transferring
        || orchestrator.progress().percent != percent
    {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.stop_sync().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_while_tcp_receiver_waits_for_data() {
    let dir = TempDir::new().unwrap();
    let sender = TcpTransport::new(tcp_config("laptop", vec![]));
    sender.start_advertising("Laptop").await.unwrap();
    let addr = sender.local_addr().unwrap();

    let orchestrator = SyncOrchestrator::new(
        TcpTransport::new(tcp_config("phone", vec![addr])),
        context(storage_in(&dir, "receiver"), relaxed_cache()),
        "Phone",
    );
    orchestrator.start_as_receiver().await.unwrap();
    orchestrator.connect_to_device(&addr.to_string()).await.unwrap();

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            orchestrator.start_sync(),
            stop_once_transferring(&orchestrator, 20)
        )
    })
    .await
    .expect("stop_sync did not end the pending receive");

    assert_eq!(result, Err(SyncError::Cancelled));
    assert_eq!(
        orchestrator.progress(),
        SyncProgress::new(SyncStatus::Idle, 0, "Sync stopped")
    );
    assert!(!orchestrator.transport().is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_while_tcp_sender_waits_for_receiver() {
    let dir = TempDir::new().unwrap();
    let orchestrator = SyncOrchestrator::new(
        TcpTransport::new(tcp_config("laptop", vec![])),
        context(storage_in(&dir, "sender"), relaxed_cache()),
        "Laptop",
    );
    orchestrator.start_as_sender().await.unwrap();

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            orchestrator.start_sync(),
            stop_once_transferring(&orchestrator, 0)
        )
    })
    .await
    .expect("start_sync still pending after stop_sync");

    assert_eq!(result, Err(SyncError::Cancelled));
    assert_eq!(
        orchestrator.progress(),
        SyncProgress::new(SyncStatus::Idle, 0, "Sync stopped")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_while_loopback_sender_waits_for_receiver() {
    let dir = TempDir::new().unwrap();
    let hub = LoopbackHub::new();
    let orchestrator = SyncOrchestrator::new(
        hub.transport("laptop"),
        context(storage_in(&dir, "sender"), relaxed_cache()),
        "Laptop",
    );
    orchestrator.start_as_sender().await.unwrap();

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            orchestrator.start_sync(),
            stop_once_transferring(&orchestrator, 0)
        )
    })
    .await
    .expect("start_sync still pending after stop_sync");

    assert_eq!(result, Err(SyncError::Cancelled));
    assert_eq!(orchestrator.role(), None);

    // The transport is usable for the next session
    orchestrator.start_as_sender().await.unwrap();
    assert_eq!(orchestrator.role(), Some(SyncRole::Sender));
}
