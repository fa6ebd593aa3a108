//! LAN transport over TCP.
//!
//! Advertising binds a listener that answers discovery probes and accepts a
//! single link. Scanning periodically probes a static list of peer
//! addresses. The device id of a discovered peer is its socket address, so
//! `connect_to_device` can dial it directly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::{Frame, FrameCodec};
use super::link::LinkWatch;
use super::{
    DeviceDescriptor, EventHandler, EventSlot, PeerTransport, TransportError, TransportEvent,
    TransportResult,
};
use crate::config::SyncConfig;
use crate::storage::DatabaseSnapshot;

type Link = Framed<TcpStream, FrameCodec>;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const RESCAN_INTERVAL: Duration = Duration::from_secs(3);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// TCP transport settings.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub device_id: String,
    /// Stable identifier both sides must share.
    pub service_id: String,
    pub listen_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
}

impl From<&SyncConfig> for TcpConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            device_id: config.device_id(),
            service_id: config.service_id.clone(),
            listen_addr: config.listen_addr,
            peers: config.peers.clone(),
        }
    }
}

struct Shared {
    config: TcpConfig,
    display_name: Mutex<String>,
    events: EventSlot,
    discovered: Mutex<Vec<DeviceDescriptor>>,
    link: tokio::sync::Mutex<Option<Link>>,
    state: LinkWatch,
}

impl Shared {
    fn discover(&self, device: DeviceDescriptor) {
        {
            let mut discovered = lock(&self.discovered);
            if discovered.iter().any(|d| d.id == device.id) {
                return;
            }
            discovered.push(device.clone());
        }
        info!(device_id = %device.id, display_name = %device.display_name, "Discovered peer");
        self.events.emit(TransportEvent::DeviceDiscovered(device));
    }

    async fn install_link(&self, link: Link, peer_id: String) -> bool {
        {
            let mut slot = self.link.lock().await;
            if slot.is_some() {
                return false;
            }
            *slot = Some(link);
        }
        self.events.emit(TransportEvent::ConnectionChanged {
            connected: true,
            device_id: peer_id,
        });
        self.state.set_up();
        true
    }

    /// Serve one inbound connection: answer a probe or accept a link.
    async fn serve(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let first = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(%addr, error = %e, "Dropping connection with bad first frame");
                return;
            }
            None => return,
        };

        let display_name = lock(&self.display_name).clone();
        let reply = match first {
            Frame::Probe { service_id } if service_id == self.config.service_id => Frame::Announce {
                service_id,
                device_id: self.config.device_id.clone(),
                display_name,
            },
            Frame::Hello {
                service_id,
                device_id,
                display_name: peer_name,
            } if service_id == self.config.service_id => {
                let welcome = Frame::Welcome {
                    device_id: self.config.device_id.clone(),
                };
                if let Err(e) = framed.send(welcome).await {
                    warn!(%addr, error = %e, "Failed to accept link");
                    return;
                }
                if self.install_link(framed, device_id.clone()).await {
                    info!(%addr, peer = %peer_name, "Accepted link");
                } else {
                    debug!(%addr, "Link already established, dropping second peer");
                }
                return;
            }
            other => Frame::Reject {
                reason: format!("unexpected {} for this service", other.kind()),
            },
        };

        if let Err(e) = framed.send(reply).await {
            debug!(%addr, error = %e, "Failed to answer probe");
        }
    }

    async fn probe(&self, addr: SocketAddr) -> TransportResult<DeviceDescriptor> {
        let stream = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Scan(format!("{} timed out", addr)))?
            .map_err(|e| TransportError::Scan(format!("{}: {}", addr, e)))?;
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed
            .send(Frame::Probe {
                service_id: self.config.service_id.clone(),
            })
            .await?;

        match tokio::time::timeout(PROBE_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(Frame::Announce { display_name, .. }))) => {
                Ok(DeviceDescriptor::new(addr.to_string(), display_name))
            }
            Ok(Some(Ok(other))) => Err(TransportError::Protocol(format!(
                "unexpected {} in reply to probe",
                other.kind()
            ))),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(TransportError::Scan(format!("{} closed the connection", addr))),
            Err(_) => Err(TransportError::Scan(format!("{} did not answer", addr))),
        }
    }

    async fn scan_loop(self: Arc<Self>) {
        loop {
            for addr in self.config.peers.clone() {
                match self.probe(addr).await {
                    Ok(device) => self.discover(device),
                    Err(e) => debug!(%addr, error = %e, "Probe failed"),
                }
            }
            tokio::time::sleep(RESCAN_INTERVAL).await;
        }
    }
}

/// TCP implementation of [`PeerTransport`].
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                display_name: Mutex::new(String::new()),
                events: EventSlot::default(),
                discovered: Mutex::new(Vec::new()),
                link: tokio::sync::Mutex::new(None),
                state: LinkWatch::default(),
            }),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            scan_task: Mutex::new(None),
        }
    }

    /// Address the listener is bound to while advertising.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.is_up()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for task in [&self.accept_task, &self.scan_task] {
            if let Some(handle) = lock(task).take() {
                handle.abort();
            }
        }
    }
}

impl PeerTransport for TcpTransport {
    async fn initialize(&self) -> TransportResult<()> {
        if self.shared.config.service_id.is_empty() {
            return Err(TransportError::Init("service id must not be empty".to_string()));
        }
        Ok(())
    }

    async fn start_advertising(&self, display_name: &str) -> TransportResult<()> {
        *lock(&self.shared.display_name) = display_name.to_string();

        let listener = TcpListener::bind(self.shared.config.listen_addr)
            .await
            .map_err(|e| TransportError::Advertise(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Advertise(e.to_string()))?;
        *lock(&self.local_addr) = Some(local_addr);
        info!(%local_addr, display_name, "Advertising over TCP");

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(Arc::clone(&shared).serve(stream, addr));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        });

        if let Some(previous) = lock(&self.accept_task).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        if let Some(handle) = lock(&self.accept_task).take() {
            handle.abort();
        }
        *lock(&self.local_addr) = None;
        Ok(())
    }

    async fn start_scanning(&self) -> TransportResult<()> {
        lock(&self.shared.discovered).clear();
        if self.shared.config.peers.is_empty() {
            return Err(TransportError::Scan("no peer addresses configured".to_string()));
        }

        let handle = tokio::spawn(Arc::clone(&self.shared).scan_loop());
        if let Some(previous) = lock(&self.scan_task).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> TransportResult<()> {
        if let Some(handle) = lock(&self.scan_task).take() {
            handle.abort();
        }
        Ok(())
    }

    fn get_discovered_devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.shared.discovered).clone()
    }

    async fn connect_to_device(&self, id: &str) -> TransportResult<bool> {
        let addr: SocketAddr = id
            .parse()
            .map_err(|_| TransportError::Connect(format!("'{}' is not a socket address", id)))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;

        let mut framed = Framed::new(stream, FrameCodec::new());
        let display_name = lock(&self.shared.display_name).clone();
        framed
            .send(Frame::Hello {
                service_id: self.shared.config.service_id.clone(),
                device_id: self.shared.config.device_id.clone(),
                display_name,
            })
            .await?;

        match framed.next().await {
            Some(Ok(Frame::Welcome { .. })) => {
                info!(%addr, "Link established");
                Ok(self.shared.install_link(framed, id.to_string()).await)
            }
            Some(Ok(Frame::Reject { reason })) => {
                warn!(%addr, reason, "Peer refused link");
                Ok(false)
            }
            Some(Ok(other)) => Err(TransportError::Protocol(format!(
                "unexpected {} in reply to hello",
                other.kind()
            ))),
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    async fn send_data(&self, snapshot: &DatabaseSnapshot) -> TransportResult<bool> {
        let mut ticket = self.shared.state.wait_up().await?;
        let mut slot = ticket.or_closed(self.shared.link.lock()).await?;
        let link = slot.as_mut().ok_or(TransportError::NotConnected)?;

        self.shared
            .events
            .emit(TransportEvent::TransferProgress { percent: 0 });
        ticket
            .or_closed(link.send(Frame::Snapshot {
                snapshot: snapshot.clone(),
            }))
            .await?
            .map_err(|e| TransportError::Send(e.to_string()))?;
        self.shared
            .events
            .emit(TransportEvent::TransferProgress { percent: 50 });

        match ticket.or_closed(link.next()).await? {
            Some(Ok(Frame::Ack)) => {
                self.shared
                    .events
                    .emit(TransportEvent::TransferProgress { percent: 100 });
                Ok(true)
            }
            Some(Ok(Frame::Reject { reason })) => {
                warn!(reason, "Peer rejected snapshot");
                Ok(false)
            }
            Some(Ok(other)) => Err(TransportError::Protocol(format!(
                "unexpected {} in reply to snapshot",
                other.kind()
            ))),
            Some(Err(e)) => Err(TransportError::Send(e.to_string())),
            None => Err(TransportError::Send("peer closed the link".to_string())),
        }
    }

    async fn receive_data(&self) -> TransportResult<DatabaseSnapshot> {
        let mut ticket = self.shared.state.wait_up().await?;
        let mut slot = ticket.or_closed(self.shared.link.lock()).await?;
        let link = slot.as_mut().ok_or(TransportError::NotConnected)?;

        let snapshot = match ticket.or_closed(link.next()).await? {
            Some(Ok(Frame::Snapshot { snapshot })) => snapshot,
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!(
                    "expected snapshot, got {}",
                    other.kind()
                )));
            }
            Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
            None => {
                return Err(TransportError::Receive(
                    "link closed before data arrived".to_string(),
                ));
            }
        };

        ticket
            .or_closed(link.send(Frame::Ack))
            .await?
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        self.shared
            .events
            .emit(TransportEvent::TransferProgress { percent: 100 });
        Ok(snapshot)
    }

    fn set_event_handler(&self, handler: EventHandler) {
        self.shared.events.replace(handler);
    }

    async fn disconnect(&self) -> TransportResult<()> {
        // Closing first makes pending reads and writes drop the link lock
        self.shared.state.close();
        let link = self.shared.link.lock().await.take();
        if let Some(mut link) = link {
            if let Err(e) = link.close().await {
                debug!(error = %e, "Error while closing link");
            }
            info!("TCP link closed");
        }
        Ok(())
    }
}
