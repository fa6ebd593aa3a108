//! Send and receive commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::cli::error::{CliError, CliResult};
use crate::config::SyncConfig;
use crate::storage::StorageManager;
use crate::sync::{AppContext, InMemoryProfileCache, SyncOrchestrator};
use crate::transport::{DeviceDescriptor, Transport, create_transport};

const DISCOVERY_POLL: Duration = Duration::from_millis(250);

fn orchestrator(config: &SyncConfig) -> SyncOrchestrator<Transport> {
    let context = AppContext::new(
        StorageManager::new(config.storage_config()),
        Arc::new(InMemoryProfileCache::new()),
    );
    let orchestrator =
        SyncOrchestrator::new(create_transport(config, None), context, &config.device_name);
    orchestrator
        .notifier()
        .subscribe(|progress| println!("{}", progress));
    orchestrator
}

/// Advertise and send the local database to the first receiver.
pub async fn send(config: &SyncConfig) -> CliResult<String> {
    let orchestrator = orchestrator(config);
    info!(name = %config.device_name, listen = %config.listen_addr, "Starting sender");

    orchestrator.start_as_sender().await?;
    tokio::select! {
        result = orchestrator.start_sync() => result?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.stop_sync().await;
            return Ok("ℹ Sync stopped".to_string());
        }
    }

    Ok("✓ Database sent".to_string())
}

/// Discover a sender, then replace the local database with its data.
pub async fn receive(
    config: &SyncConfig,
    device_id: Option<&str>,
    scan_seconds: u64,
) -> CliResult<String> {
    let orchestrator = orchestrator(config);
    orchestrator.start_as_receiver().await?;

    let deadline = Instant::now() + Duration::from_secs(scan_seconds);
    let target = loop {
        let devices = orchestrator.get_discovered_devices();
        match pick_device(&devices, device_id) {
            Ok(device) => break device,
            Err(e) if Instant::now() >= deadline => {
                orchestrator.stop_sync().await;
                return Err(match e {
                    CliError::UnknownDevice { .. } if devices.is_empty() => CliError::NoSender {
                        seconds: scan_seconds,
                    },
                    other => other,
                });
            }
            Err(_) => tokio::time::sleep(DISCOVERY_POLL).await,
        }
    };

    println!("Found {} ({})", target.display_name, target.id);
    orchestrator.connect_to_device(&target.id).await?;
    tokio::select! {
        result = orchestrator.start_sync() => result?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.stop_sync().await;
            return Ok("ℹ Sync stopped".to_string());
        }
    }

    Ok(format!("✓ Database received from {}", target.display_name))
}

/// The requested device, or the first one found when none was named.
pub fn pick_device(
    devices: &[DeviceDescriptor],
    device_id: Option<&str>,
) -> CliResult<DeviceDescriptor> {
    let found = match device_id {
        Some(id) => devices.iter().find(|d| d.id == id || d.display_name == id),
        None => devices.first(),
    };
    found.cloned().ok_or_else(|| CliError::UnknownDevice {
        device_id: device_id.unwrap_or("any").to_string(),
    })
}
