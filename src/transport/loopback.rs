//! In-process transport.
//!
//! Transports created from the same [`LoopbackHub`] can discover and link to
//! each other. Payloads cross the link as serialized JSON so the wire shape
//! is exercised exactly as over a real link.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::link::LinkWatch;
use super::{
    DeviceDescriptor, EventHandler, EventSlot, PeerTransport, TransportError, TransportEvent,
    TransportResult,
};
use crate::storage::DatabaseSnapshot;

const LINK_CAPACITY: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct HubState {
    advertisers: BTreeMap<String, Arc<Endpoint>>,
    scanners: BTreeMap<String, Arc<Endpoint>>,
}

/// Shared medium for loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for the device `id` on this hub.
    pub fn transport(&self, id: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            endpoint: Arc::new(Endpoint {
                id: id.into(),
                display_name: Mutex::new(None),
                events: EventSlot::default(),
                discovered: Mutex::new(Vec::new()),
                link: Mutex::new(None),
                inbox: Mutex::new(None),
                state: LinkWatch::default(),
            }),
        }
    }
}

struct Link {
    peer: Weak<Endpoint>,
    outbox: mpsc::Sender<Vec<u8>>,
}

struct Endpoint {
    id: String,
    display_name: Mutex<Option<String>>,
    events: EventSlot,
    discovered: Mutex<Vec<DeviceDescriptor>>,
    link: Mutex<Option<Link>>,
    inbox: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    state: LinkWatch,
}

impl Endpoint {
    fn descriptor(&self) -> Option<DeviceDescriptor> {
        lock(&self.display_name)
            .clone()
            .map(|name| DeviceDescriptor::new(self.id.clone(), name))
    }

    /// Record a discovered device and notify, once per device id.
    fn discover(&self, device: DeviceDescriptor) {
        {
            let mut discovered = lock(&self.discovered);
            if discovered.iter().any(|d| d.id == device.id) {
                return;
            }
            discovered.push(device.clone());
        }
        self.events.emit(TransportEvent::DeviceDiscovered(device));
    }

    fn attach(&self, peer: &Arc<Endpoint>, outbox: mpsc::Sender<Vec<u8>>, inbox: mpsc::Receiver<Vec<u8>>) {
        *lock(&self.link) = Some(Link {
            peer: Arc::downgrade(peer),
            outbox,
        });
        *lock(&self.inbox) = Some(inbox);
        self.state.set_up();
    }

    fn detach(&self) -> Option<Link> {
        let link = lock(&self.link).take();
        self.state.close();
        link
    }
}

/// One device on a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    endpoint: Arc<Endpoint>,
}

impl LoopbackTransport {
    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.state.is_up()
    }
}

impl PeerTransport for LoopbackTransport {
    async fn initialize(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn start_advertising(&self, display_name: &str) -> TransportResult<()> {
        *lock(&self.endpoint.display_name) = Some(display_name.to_string());
        let device = DeviceDescriptor::new(self.endpoint.id.clone(), display_name);

        let scanners: Vec<Arc<Endpoint>> = {
            let mut hub = lock(&self.hub.state);
            hub.advertisers
                .insert(self.endpoint.id.clone(), Arc::clone(&self.endpoint));
            hub.scanners
                .values()
                .filter(|s| s.id != self.endpoint.id)
                .cloned()
                .collect()
        };

        info!(device_id = %self.endpoint.id, display_name, "Advertising on loopback");
        for scanner in scanners {
            scanner.discover(device.clone());
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        lock(&self.hub.state).advertisers.remove(&self.endpoint.id);
        *lock(&self.endpoint.display_name) = None;
        Ok(())
    }

    async fn start_scanning(&self) -> TransportResult<()> {
        lock(&self.endpoint.discovered).clear();

        let visible: Vec<DeviceDescriptor> = {
            let mut hub = lock(&self.hub.state);
            hub.scanners
                .insert(self.endpoint.id.clone(), Arc::clone(&self.endpoint));
            hub.advertisers
                .values()
                .filter(|a| a.id != self.endpoint.id)
                .filter_map(|a| a.descriptor())
                .collect()
        };

        debug!(device_id = %self.endpoint.id, visible = visible.len(), "Scanning on loopback");
        for device in visible {
            self.endpoint.discover(device);
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> TransportResult<()> {
        lock(&self.hub.state).scanners.remove(&self.endpoint.id);
        Ok(())
    }

    fn get_discovered_devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.endpoint.discovered).clone()
    }

    async fn connect_to_device(&self, id: &str) -> TransportResult<bool> {
        if id == self.endpoint.id {
            return Ok(false);
        }
        let Some(peer) = lock(&self.hub.state).advertisers.get(id).cloned() else {
            debug!(device_id = id, "No advertiser with that id");
            return Ok(false);
        };

        let (to_peer, peer_inbox) = mpsc::channel(LINK_CAPACITY);
        let (to_self, self_inbox) = mpsc::channel(LINK_CAPACITY);
        peer.attach(&self.endpoint, to_self, peer_inbox);
        self.endpoint.attach(&peer, to_peer, self_inbox);

        info!(from = %self.endpoint.id, to = %peer.id, "Loopback link established");
        peer.events.emit(TransportEvent::ConnectionChanged {
            connected: true,
            device_id: self.endpoint.id.clone(),
        });
        self.endpoint.events.emit(TransportEvent::ConnectionChanged {
            connected: true,
            device_id: peer.id.clone(),
        });
        Ok(true)
    }

    async fn send_data(&self, snapshot: &DatabaseSnapshot) -> TransportResult<bool> {
        let payload = snapshot
            .to_json_bytes()
            .map_err(|e| TransportError::Send(e.to_string()))?;

        self.endpoint.state.wait_up().await?;
        let outbox = lock(&self.endpoint.link)
            .as_ref()
            .map(|link| link.outbox.clone())
            .ok_or(TransportError::NotConnected)?;

        self.endpoint
            .events
            .emit(TransportEvent::TransferProgress { percent: 0 });
        outbox
            .send(payload)
            .await
            .map_err(|_| TransportError::Send("peer closed the link".to_string()))?;
        self.endpoint
            .events
            .emit(TransportEvent::TransferProgress { percent: 100 });
        Ok(true)
    }

    async fn receive_data(&self) -> TransportResult<DatabaseSnapshot> {
        if lock(&self.endpoint.inbox).is_none() {
            self.endpoint.state.wait_up().await?;
        }
        let mut inbox = lock(&self.endpoint.inbox)
            .take()
            .ok_or(TransportError::NotConnected)?;

        let received = inbox.recv().await;
        *lock(&self.endpoint.inbox) = Some(inbox);

        let payload = received
            .ok_or_else(|| TransportError::Receive("link closed before data arrived".to_string()))?;
        let snapshot = DatabaseSnapshot::from_json_slice(&payload)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.endpoint
            .events
            .emit(TransportEvent::TransferProgress { percent: 100 });
        Ok(snapshot)
    }

    fn set_event_handler(&self, handler: EventHandler) {
        self.endpoint.events.replace(handler);
    }

    async fn disconnect(&self) -> TransportResult<()> {
        let Some(link) = self.endpoint.detach() else {
            return Ok(());
        };

        // The peer keeps its inbox so it can drain data already queued
        if let Some(peer) = link.peer.upgrade() {
            peer.detach();
            peer.events.emit(TransportEvent::ConnectionChanged {
                connected: false,
                device_id: self.endpoint.id.clone(),
            });
        }
        info!(device_id = %self.endpoint.id, "Loopback link closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(transport: &LoopbackTransport) -> Arc<Mutex<Vec<TransportEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        transport.set_event_handler(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scanner_discovers_existing_and_later_advertisers() {
        let hub = LoopbackHub::new();
        let early = hub.transport("early");
        let late = hub.transport("late");
        let scanner = hub.transport("scanner");
        let events = recorder(&scanner);

        early.start_advertising("Early Phone").await.unwrap();
        scanner.start_scanning().await.unwrap();
        late.start_advertising("Late Tablet").await.unwrap();

        assert_eq!(
            scanner.get_discovered_devices(),
            vec![
                DeviceDescriptor::new("early", "Early Phone"),
                DeviceDescriptor::new("late", "Late Tablet"),
            ]
        );
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_scan_clears_discovered_devices() {
        let hub = LoopbackHub::new();
        let advertiser = hub.transport("a");
        let scanner = hub.transport("s");

        advertiser.start_advertising("A").await.unwrap();
        scanner.start_scanning().await.unwrap();
        advertiser.stop_advertising().await.unwrap();
        scanner.stop_scanning().await.unwrap();
        scanner.start_scanning().await.unwrap();

        assert!(scanner.get_discovered_devices().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_to_unknown_device_is_refused() {
        let hub = LoopbackHub::new();
        let scanner = hub.transport("s");

        assert!(!scanner.connect_to_device("ghost").await.unwrap());
        assert!(!scanner.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_notifies_both_sides_before_resolving() {
        let hub = LoopbackHub::new();
        let advertiser = hub.transport("a");
        let scanner = hub.transport("s");
        let advertiser_events = recorder(&advertiser);
        let scanner_events = recorder(&scanner);
        advertiser.start_advertising("A").await.unwrap();

        assert!(scanner.connect_to_device("a").await.unwrap());

        assert!(advertiser_events.lock().unwrap().contains(&TransportEvent::ConnectionChanged {
            connected: true,
            device_id: "s".to_string(),
        }));
        assert!(scanner_events.lock().unwrap().contains(&TransportEvent::ConnectionChanged {
            connected: true,
            device_id: "a".to_string(),
        }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_crosses_the_link() {
        let hub = LoopbackHub::new();
        let sender = hub.transport("sender");
        let receiver = hub.transport("receiver");
        let progress = recorder(&sender);
        sender.start_advertising("Sender").await.unwrap();
        receiver.connect_to_device("sender").await.unwrap();

        let snapshot: DatabaseSnapshot =
            serde_json::from_value(json!({"tables": {"entry": [{"id": "e1", "amount": 2.5}]}}))
                .unwrap();

        let (sent, received) = tokio::join!(sender.send_data(&snapshot), receiver.receive_data());

        assert!(sent.unwrap());
        assert_eq!(received.unwrap(), snapshot);
        let percents: Vec<u8> = progress
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::TransferProgress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 100]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queued_data_survives_sender_disconnect() {
        let hub = LoopbackHub::new();
        let sender = hub.transport("sender");
        let receiver = hub.transport("receiver");
        let receiver_events = recorder(&receiver);
        sender.start_advertising("Sender").await.unwrap();
        receiver.connect_to_device("sender").await.unwrap();

        sender.send_data(&DatabaseSnapshot::new()).await.unwrap();
        sender.disconnect().await.unwrap();

        assert_eq!(receiver.receive_data().await.unwrap(), DatabaseSnapshot::new());
        assert!(receiver_events.lock().unwrap().contains(&TransportEvent::ConnectionChanged {
            connected: false,
            device_id: "sender".to_string(),
        }));

        let closed = receiver.receive_data().await;
        assert!(matches!(closed, Err(TransportError::Receive(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_releases_send_waiting_for_a_peer() {
        let hub = LoopbackHub::new();
        let sender = Arc::new(hub.transport("sender"));
        sender.start_advertising("Sender").await.unwrap();

        let pending = tokio::spawn({
            let sender = Arc::clone(&sender);
            async move { sender.send_data(&DatabaseSnapshot::new()).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        sender.stop_advertising().await.unwrap();
        sender.disconnect().await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .expect("send_data still waiting after disconnect")
            .unwrap();
        assert_eq!(result, Err(TransportError::NotConnected));
    }
}
