//! Peer transport abstraction.
//!
//! A transport discovers peers, opens one bidirectional link and moves a
//! whole [`DatabaseSnapshot`] across it. The orchestrator only sees the
//! [`PeerTransport`] trait; the concrete implementation is picked once at
//! startup by [`create_transport`] from a closed set of variants.

mod codec;
mod link;
mod loopback;
mod tcp;

use std::future::Future;
use std::sync::{Arc, Mutex};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SyncConfig;
use crate::storage::DatabaseSnapshot;

pub use codec::{Frame, FrameCodec, MAX_FRAME_LEN};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// A peer found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub display_name: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Events pushed from a transport to its single subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceDiscovered(DeviceDescriptor),
    ConnectionChanged { connected: bool, device_id: String },
    /// Percent of the current transfer, non-decreasing within one transfer.
    TransferProgress { percent: u8 },
}

pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Single-subscriber event slot.
///
/// Setting a handler replaces the previous one; there is never more than
/// one listener. Handlers are invoked outside the slot's lock.
#[derive(Clone, Default)]
pub struct EventSlot {
    handler: Arc<Mutex<Option<EventHandler>>>,
}

impl EventSlot {
    pub fn replace(&self, handler: EventHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn emit(&self, event: TransportEvent) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

/// Transport failures.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to initialize transport: {0}")]
    #[diagnostic(code(peersync::transport::init))]
    Init(String),

    #[error("Failed to start advertising: {0}")]
    #[diagnostic(code(peersync::transport::advertise))]
    Advertise(String),

    #[error("Failed to scan for devices: {0}")]
    #[diagnostic(code(peersync::transport::scan))]
    Scan(String),

    #[error("Failed to connect: {0}")]
    #[diagnostic(code(peersync::transport::connect))]
    Connect(String),

    #[error("Failed to send data: {0}")]
    #[diagnostic(code(peersync::transport::send))]
    Send(String),

    #[error("Failed to receive data: {0}")]
    #[diagnostic(code(peersync::transport::receive))]
    Receive(String),

    #[error("Protocol error: {0}")]
    #[diagnostic(code(peersync::transport::protocol))]
    Protocol(String),

    #[error("No peer is connected")]
    #[diagnostic(code(peersync::transport::not_connected))]
    NotConnected,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Peer discovery and data transport.
///
/// Implementations must fire `ConnectionChanged { connected: true, .. }` no
/// later than a successful `connect_to_device` resolves (or an inbound link
/// is accepted), and `TransferProgress` with non-decreasing percent within
/// one transfer.
pub trait PeerTransport: Send + Sync {
    fn initialize(&self) -> impl Future<Output = TransportResult<()>> + Send;

    fn start_advertising(
        &self,
        display_name: &str,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    fn stop_advertising(&self) -> impl Future<Output = TransportResult<()>> + Send;

    fn start_scanning(&self) -> impl Future<Output = TransportResult<()>> + Send;

    fn stop_scanning(&self) -> impl Future<Output = TransportResult<()>> + Send;

    fn get_discovered_devices(&self) -> Vec<DeviceDescriptor>;

    /// Returns `false` when the peer is unknown or refuses the link.
    fn connect_to_device(&self, id: &str) -> impl Future<Output = TransportResult<bool>> + Send;

    /// Returns `false` when the peer does not accept the snapshot.
    fn send_data(
        &self,
        snapshot: &DatabaseSnapshot,
    ) -> impl Future<Output = TransportResult<bool>> + Send;

    fn receive_data(&self) -> impl Future<Output = TransportResult<DatabaseSnapshot>> + Send;

    /// Install the event subscriber, replacing any previous one.
    fn set_event_handler(&self, handler: EventHandler);

    fn disconnect(&self) -> impl Future<Output = TransportResult<()>> + Send;
}

/// Which transport to build at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Loopback,
}

/// The closed set of transports.
pub enum Transport {
    Loopback(LoopbackTransport),
    Tcp(TcpTransport),
}

/// Build the transport selected by the configuration.
///
/// A loopback transport joins `hub` when given, otherwise a fresh hub.
pub fn create_transport(config: &SyncConfig, hub: Option<LoopbackHub>) -> Transport {
    match config.transport {
        TransportKind::Loopback => {
            let hub = hub.unwrap_or_default();
            Transport::Loopback(hub.transport(config.device_id()))
        }
        TransportKind::Tcp => Transport::Tcp(TcpTransport::new(TcpConfig::from(config))),
    }
}

impl PeerTransport for Transport {
    async fn initialize(&self) -> TransportResult<()> {
        match self {
            Transport::Loopback(t) => t.initialize().await,
            Transport::Tcp(t) => t.initialize().await,
        }
    }

    async fn start_advertising(&self, display_name: &str) -> TransportResult<()> {
        match self {
            Transport::Loopback(t) => t.start_advertising(display_name).await,
            Transport::Tcp(t) => t.start_advertising(display_name).await,
        }
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        match self {
            Transport::Loopback(t) => t.stop_advertising().await,
            Transport::Tcp(t) => t.stop_advertising().await,
        }
    }

    async fn start_scanning(&self) -> TransportResult<()> {
        match self {
            Transport::Loopback(t) => t.start_scanning().await,
            Transport::Tcp(t) => t.start_scanning().await,
        }
    }

    async fn stop_scanning(&self) -> TransportResult<()> {
        match self {
            Transport::Loopback(t) => t.stop_scanning().await,
            Transport::Tcp(t) => t.stop_scanning().await,
        }
    }

    fn get_discovered_devices(&self) -> Vec<DeviceDescriptor> {
        match self {
            Transport::Loopback(t) => t.get_discovered_devices(),
            Transport::Tcp(t) => t.get_discovered_devices(),
        }
    }

    async fn connect_to_device(&self, id: &str) -> TransportResult<bool> {
        match self {
            Transport::Loopback(t) => t.connect_to_device(id).await,
            Transport::Tcp(t) => t.connect_to_device(id).await,
        }
    }

    async fn send_data(&self, snapshot: &DatabaseSnapshot) -> TransportResult<bool> {
        match self {
            Transport::Loopback(t) => t.send_data(snapshot).await,
            Transport::Tcp(t) => t.send_data(snapshot).await,
        }
    }

    async fn receive_data(&self) -> TransportResult<DatabaseSnapshot> {
        match self {
            Transport::Loopback(t) => t.receive_data().await,
            Transport::Tcp(t) => t.receive_data().await,
        }
    }

    fn set_event_handler(&self, handler: EventHandler) {
        match self {
            Transport::Loopback(t) => t.set_event_handler(handler),
            Transport::Tcp(t) => t.set_event_handler(handler),
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        match self {
            Transport::Loopback(t) => t.disconnect().await,
            Transport::Tcp(t) => t.disconnect().await,
        }
    }
}
