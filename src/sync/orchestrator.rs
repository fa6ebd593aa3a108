//! Role-based transfer protocol.
//!
//! A session starts with a role selection (`start_as_sender` or
//! `start_as_receiver`), optionally connects, runs `start_sync` once and
//! ends in COMPLETED, ERROR or, through `stop_sync`, IDLE. Every state
//! transition is published exactly once through the [`ProgressNotifier`].
//!
//! Each role selection and each session end bumps an epoch. Publishing is
//! conditional on the epoch a step started under, so a transfer that is
//! still running when `stop_sync` is called finishes its current step
//! silently and returns [`SyncError::Cancelled`]. Transport I/O is not a
//! step in that sense: a pending send, receive or connect is abandoned as
//! soon as the epoch moves on.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::context::AppContext;
use super::error::{SyncError, SyncResult};
use super::progress::{ProgressNotifier, SyncProgress, SyncRole, SyncStatus};
use crate::transport::{DeviceDescriptor, PeerTransport, TransportEvent};

const SENDER_BAND: Band = Band {
    low: 0,
    high: 100,
    message: "Sending data...",
};

const RECEIVER_BAND: Band = Band {
    low: 20,
    high: 80,
    message: "Receiving data...",
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Percent range transport progress is scaled into while a transfer step
/// runs. Forwarded values stay below `high`.
#[derive(Debug, Clone, Copy)]
struct Band {
    low: u8,
    high: u8,
    message: &'static str,
}

impl Band {
    fn scale(&self, percent: u8) -> u8 {
        let span = u16::from(self.high - self.low);
        let scaled = u16::from(self.low) + span * u16::from(percent.min(100)) / 100;
        (scaled as u8).min(self.high.saturating_sub(1))
    }
}

#[derive(Debug)]
struct Session {
    role: Option<SyncRole>,
    status: SyncStatus,
    percent: u8,
    epoch: u64,
    band: Option<Band>,
    peer: Option<String>,
    discovered: Vec<DeviceDescriptor>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            role: None,
            status: SyncStatus::Idle,
            percent: 0,
            epoch: 0,
            band: None,
            peer: None,
            discovered: Vec::new(),
        }
    }
}

struct Shared {
    session: Mutex<Session>,
    notifier: ProgressNotifier,
    // Serializes epoch check, state update and publish.
    gate: Mutex<()>,
    epochs: watch::Sender<u64>,
}

impl Shared {
    /// Start a new epoch. Callers hold the session lock.
    fn advance(&self, session: &mut Session) -> u64 {
        session.epoch += 1;
        self.epochs.send_replace(session.epoch);
        session.epoch
    }

    /// Publish when `epoch` is still current. Returns false when stale.
    fn publish(&self, epoch: u64, progress: SyncProgress, band: Option<Band>) -> bool {
        let _gate = lock(&self.gate);
        {
            let mut session = lock(&self.session);
            if session.epoch != epoch {
                return false;
            }
            session.status = progress.status;
            session.percent = progress.percent;
            session.band = band;
        }
        debug!(status = %progress.status, percent = progress.percent, "Publishing progress");
        self.notifier.publish(progress);
        true
    }

    fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered(device) => {
                let mut session = lock(&self.session);
                if session.role == Some(SyncRole::Receiver)
                    && !session.discovered.iter().any(|d| d.id == device.id)
                {
                    debug!(device_id = %device.id, "Peer added to discovered set");
                    session.discovered.push(device);
                }
            }
            TransportEvent::ConnectionChanged {
                connected: true,
                device_id,
            } => {
                let _gate = lock(&self.gate);
                let progress = {
                    let mut session = lock(&self.session);
                    session.peer = Some(device_id.clone());
                    if session.role != Some(SyncRole::Sender) || session.status != SyncStatus::Idle
                    {
                        return;
                    }
                    session.status = SyncStatus::Connected;
                    session.percent = 0;
                    SyncProgress::new(
                        SyncStatus::Connected,
                        0,
                        format!("Connected to {}", device_id),
                    )
                };
                info!(peer = %device_id, "Receiver connected");
                self.notifier.publish(progress);
            }
            TransportEvent::ConnectionChanged {
                connected: false,
                device_id,
            } => {
                let _gate = lock(&self.gate);
                {
                    let mut session = lock(&self.session);
                    if session.status != SyncStatus::Connected {
                        return;
                    }
                    session.status = SyncStatus::Idle;
                    session.percent = 0;
                    session.peer = None;
                }
                info!(peer = %device_id, "Peer disconnected");
                self.notifier
                    .publish(SyncProgress::new(SyncStatus::Idle, 0, "Peer disconnected"));
            }
            TransportEvent::TransferProgress { percent } => {
                let _gate = lock(&self.gate);
                let progress = {
                    let mut session = lock(&self.session);
                    let Some(band) = session.band else {
                        return;
                    };
                    let scaled = band.scale(percent);
                    if session.status != SyncStatus::Transferring || scaled <= session.percent {
                        return;
                    }
                    session.percent = scaled;
                    SyncProgress::new(SyncStatus::Transferring, scaled, band.message)
                };
                self.notifier.publish(progress);
            }
        }
    }
}

/// Drives one sync session at a time over a [`PeerTransport`].
pub struct SyncOrchestrator<T: PeerTransport> {
    transport: T,
    context: AppContext,
    device_name: String,
    shared: Arc<Shared>,
}

impl<T: PeerTransport> SyncOrchestrator<T> {
    /// Build an orchestrator and install its transport event handler.
    pub fn new(transport: T, context: AppContext, device_name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::default()),
            notifier: ProgressNotifier::new(),
            gate: Mutex::new(()),
            epochs: watch::channel(0).0,
        });

        let handler_shared = Arc::clone(&shared);
        transport.set_event_handler(Arc::new(move |event| handler_shared.on_event(event)));

        Self {
            transport,
            context,
            device_name: device_name.into(),
            shared,
        }
    }

    pub fn notifier(&self) -> &ProgressNotifier {
        &self.shared.notifier
    }

    /// Last published progress.
    pub fn progress(&self) -> SyncProgress {
        self.shared.notifier.latest()
    }

    pub fn role(&self) -> Option<SyncRole> {
        lock(&self.shared.session).role
    }

    /// Device id of the linked peer, if any.
    pub fn connected_peer(&self) -> Option<String> {
        lock(&self.shared.session).peer.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Advertise this device and wait for a receiver.
    #[instrument(skip(self), fields(device = %self.device_name))]
    pub async fn start_as_sender(&self) -> SyncResult<()> {
        let epoch = self.claim_role(SyncRole::Sender)?;
        info!("Starting as sender");

        let advertised = async {
            self.transport.initialize().await?;
            self.transport.start_advertising(&self.device_name).await
        }
        .await;
        if let Err(e) = advertised {
            return Err(self
                .fail(epoch, e.into(), "Failed to start advertising")
                .await);
        }

        self.publish(
            epoch,
            SyncProgress::new(SyncStatus::Idle, 0, "Waiting for receiver..."),
        )
    }

    /// Start discovering senders.
    #[instrument(skip(self))]
    pub async fn start_as_receiver(&self) -> SyncResult<()> {
        let epoch = self.claim_role(SyncRole::Receiver)?;
        info!("Starting as receiver");

        let scanning = async {
            self.transport.initialize().await?;
            self.transport.start_scanning().await
        }
        .await;
        if let Err(e) = scanning {
            return Err(self.fail(epoch, e.into(), "Failed to start scanning").await);
        }

        self.publish(
            epoch,
            SyncProgress::new(SyncStatus::Scanning, 0, "Scanning for devices..."),
        )
    }

    /// Peers found since the current scan started.
    pub fn get_discovered_devices(&self) -> Vec<DeviceDescriptor> {
        let found = self.transport.get_discovered_devices();
        let mut session = lock(&self.shared.session);
        if session.role == Some(SyncRole::Receiver) {
            for device in found {
                if !session.discovered.iter().any(|d| d.id == device.id) {
                    session.discovered.push(device);
                }
            }
        }
        session.discovered.clone()
    }

    #[instrument(skip(self))]
    pub async fn connect_to_device(&self, device_id: &str) -> SyncResult<()> {
        let (role, epoch) = match self.current() {
            (None, epoch) => return Err(self.reject_without_role(epoch, "Failed to connect")),
            (Some(SyncRole::Sender), _) => {
                warn!(peer = device_id, "Sender asked to connect, ignoring");
                return Err(SyncError::SenderCannotConnect);
            }
            current => current,
        };
        debug!(?role, peer = device_id, "Connecting");

        self.publish(
            epoch,
            SyncProgress::new(
                SyncStatus::Connecting,
                0,
                format!("Connecting to {}...", device_id),
            ),
        )?;

        match self
            .until_stopped(epoch, self.transport.connect_to_device(device_id))
            .await?
        {
            Ok(true) => {}
            Ok(false) => {
                let refused = SyncError::ConnectRefused {
                    device_id: device_id.to_string(),
                };
                return Err(self.fail(epoch, refused, "Failed to connect").await);
            }
            Err(e) => return Err(self.fail(epoch, e.into(), "Failed to connect").await),
        }

        info!(peer = device_id, "Connected");
        lock(&self.shared.session).peer = Some(device_id.to_string());
        self.publish(
            epoch,
            SyncProgress::new(
                SyncStatus::Connected,
                0,
                format!("Connected to {}", device_id),
            ),
        )
    }

    /// Run the transfer for the current role.
    #[instrument(skip(self))]
    pub async fn start_sync(&self) -> SyncResult<()> {
        let (role, epoch) = self.current();
        match role {
            Some(SyncRole::Sender) => self.run_sender(epoch).await,
            Some(SyncRole::Receiver) => self.run_receiver(epoch).await,
            None => Err(self.reject_without_role(epoch, "Failed to start sync")),
        }
    }

    /// End the session from any state.
    ///
    /// Halts discovery, disconnects and clears the role. A storage step
    /// already running is left to finish.
    #[instrument(skip(self))]
    pub async fn stop_sync(&self) {
        let (role, epoch) = {
            let mut session = lock(&self.shared.session);
            let epoch = self.shared.advance(&mut session);
            session.status = SyncStatus::Idle;
            session.band = None;
            session.peer = None;
            (session.role.take(), epoch)
        };
        info!(?role, "Stopping sync");

        self.teardown(role).await;
        self.publish_quiet(epoch, SyncProgress::new(SyncStatus::Idle, 0, "Sync stopped"));
    }

    async fn run_sender(&self, epoch: u64) -> SyncResult<()> {
        let snapshot = match self.context.storage.export_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.fail(epoch, e.into(), "Failed to export data").await),
        };
        info!(rows = snapshot.total_rows(), "Exported snapshot");

        self.publish_step(
            epoch,
            SyncProgress::new(SyncStatus::Transferring, 0, SENDER_BAND.message),
            Some(SENDER_BAND),
        )?;

        match self
            .until_stopped(epoch, self.transport.send_data(&snapshot))
            .await?
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(self
                    .fail(epoch, SyncError::SendRejected, "Failed to send data")
                    .await);
            }
            Err(e) => return Err(self.fail(epoch, e.into(), "Failed to send data").await),
        }

        self.complete(epoch).await
    }

    async fn run_receiver(&self, epoch: u64) -> SyncResult<()> {
        self.publish(
            epoch,
            SyncProgress::new(
                SyncStatus::Transferring,
                10,
                "Preparing database for sync...",
            ),
        )?;
        if let Err(e) = self.context.storage.reset().await {
            return Err(self
                .fail(epoch, e.into(), "Failed to prepare database")
                .await);
        }
        // Reset dropped the profile table
        self.context.profile_cache.set_profile_exists(false);

        self.publish_step(
            epoch,
            SyncProgress::new(SyncStatus::Transferring, 20, RECEIVER_BAND.message),
            Some(RECEIVER_BAND),
        )?;
        let snapshot = match self
            .until_stopped(epoch, self.transport.receive_data())
            .await?
        {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.fail(epoch, e.into(), "Failed to receive data").await),
        };
        info!(rows = snapshot.total_rows(), "Received snapshot");

        self.publish(
            epoch,
            SyncProgress::new(SyncStatus::Transferring, 80, "Importing received data..."),
        )?;
        if let Err(e) = self.context.storage.import_snapshot(&snapshot).await {
            return Err(self.fail(epoch, e.into(), "Failed to import data").await);
        }

        self.complete(epoch).await
    }

    fn claim_role(&self, role: SyncRole) -> SyncResult<u64> {
        let mut session = lock(&self.shared.session);
        if let Some(active) = session.role {
            return Err(SyncError::RoleActive { role: active });
        }
        session.role = Some(role);
        let epoch = self.shared.advance(&mut session);
        session.band = None;
        session.peer = None;
        if role == SyncRole::Receiver {
            session.discovered.clear();
        }
        Ok(epoch)
    }

    fn current(&self) -> (Option<SyncRole>, u64) {
        let session = lock(&self.shared.session);
        (session.role, session.epoch)
    }

    fn publish(&self, epoch: u64, progress: SyncProgress) -> SyncResult<()> {
        self.publish_step(epoch, progress, None)
    }

    fn publish_step(&self, epoch: u64, progress: SyncProgress, band: Option<Band>) -> SyncResult<()> {
        if self.shared.publish(epoch, progress, band) {
            Ok(())
        } else {
            debug!("Session was stopped, dropping progress");
            Err(SyncError::Cancelled)
        }
    }

    fn publish_quiet(&self, epoch: u64, progress: SyncProgress) {
        let _ = self.shared.publish(epoch, progress, None);
    }

    fn reject_without_role(&self, epoch: u64, context: &str) -> SyncError {
        warn!("{}: no role selected", context);
        self.publish_quiet(
            epoch,
            SyncProgress::new(
                SyncStatus::Error,
                0,
                format!("{}: {}", context, SyncError::NoRole),
            ),
        );
        SyncError::NoRole
    }

    /// Close the session under `epoch`, returning the role it held.
    /// `None` when the session was already stopped.
    fn end_session(&self, epoch: u64) -> Option<(Option<SyncRole>, u64)> {
        let mut session = lock(&self.shared.session);
        if session.epoch != epoch {
            return None;
        }
        let epoch = self.shared.advance(&mut session);
        session.band = None;
        session.peer = None;
        Some((session.role.take(), epoch))
    }

    /// Run transport I/O for the session under `epoch`, giving up with
    /// [`SyncError::Cancelled`] once that session ends.
    async fn until_stopped<F: Future>(&self, epoch: u64, io: F) -> SyncResult<F::Output> {
        let mut epochs = self.shared.epochs.subscribe();
        let ended = async move {
            let _ = epochs.wait_for(|current| *current != epoch).await;
        };
        tokio::select! {
            biased;
            out = io => Ok(out),
            () = ended => {
                debug!("Session ended while waiting on the transport");
                Err(SyncError::Cancelled)
            }
        }
    }

    async fn complete(&self, epoch: u64) -> SyncResult<()> {
        let Some((role, epoch)) = self.end_session(epoch) else {
            return Err(SyncError::Cancelled);
        };
        self.teardown(role).await;
        info!("Sync completed");
        self.publish(
            epoch,
            SyncProgress::new(SyncStatus::Completed, 100, "Sync completed successfully"),
        )
    }

    /// Tear the session down and publish ERROR. Returns the error to hand
    /// back to the caller.
    async fn fail(&self, epoch: u64, error: SyncError, context: &str) -> SyncError {
        let Some((role, epoch)) = self.end_session(epoch) else {
            return SyncError::Cancelled;
        };
        warn!(error = %error, "{}", context);
        {
            // Keep the teardown's own disconnect from reading as a peer drop
            lock(&self.shared.session).status = SyncStatus::Error;
        }
        self.teardown(role).await;
        self.publish_quiet(
            epoch,
            SyncProgress::new(SyncStatus::Error, 0, format!("{}: {}", context, error)),
        );
        error
    }

    async fn teardown(&self, role: Option<SyncRole>) {
        let stopped = match role {
            Some(SyncRole::Sender) => self.transport.stop_advertising().await,
            Some(SyncRole::Receiver) => self.transport.stop_scanning().await,
            None => Ok(()),
        };
        if let Err(e) = stopped {
            warn!(error = %e, "Failed to stop discovery");
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Failed to disconnect");
        }
    }
}
