use miette::Diagnostic;
use thiserror::Error;

use super::SyncRole;
use crate::storage::StorageError;
use crate::transport::TransportError;

#[derive(Error, Diagnostic, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("No sync role selected")]
    #[diagnostic(
        code(peersync::sync::no_role),
        help("Start as sender or receiver before starting the transfer.")
    )]
    NoRole,

    #[error("A {role:?} session is already active")]
    #[diagnostic(
        code(peersync::sync::role_active),
        help("Stop the current session before choosing a new role.")
    )]
    RoleActive { role: SyncRole },

    #[error("A sender does not connect to devices")]
    #[diagnostic(
        code(peersync::sync::sender_cannot_connect),
        help("The receiver connects; a sender waits for the incoming link.")
    )]
    SenderCannotConnect,

    #[error("Device {device_id} refused the connection")]
    #[diagnostic(code(peersync::sync::connect_refused))]
    ConnectRefused { device_id: String },

    #[error("Peer did not accept the data")]
    #[diagnostic(code(peersync::sync::send_rejected))]
    SendRejected,

    #[error("Sync was stopped")]
    #[diagnostic(code(peersync::sync::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
}

pub type SyncResult<T> = Result<T, SyncError>;
