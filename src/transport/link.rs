//! Connection state shared by the transports.
//!
//! Every close bumps a counter. A waiter remembers the counter it started
//! with, so it returns as soon as that link, or the wait for it, is closed
//! even if a new link comes up right after.

use std::future::Future;

use tokio::sync::watch;

use super::{TransportError, TransportResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LinkState {
    up: bool,
    closes: u64,
}

pub(crate) struct LinkWatch {
    state: watch::Sender<LinkState>,
}

impl Default for LinkWatch {
    fn default() -> Self {
        let (state, _) = watch::channel(LinkState::default());
        Self { state }
    }
}

impl LinkWatch {
    pub(crate) fn is_up(&self) -> bool {
        self.state.borrow().up
    }

    pub(crate) fn set_up(&self) {
        self.state.send_modify(|s| s.up = true);
    }

    /// Mark the link down and release everyone waiting on it.
    pub(crate) fn close(&self) {
        self.state.send_modify(|s| {
            s.up = false;
            s.closes += 1;
        });
    }

    /// Wait for the link to come up.
    ///
    /// Fails with [`TransportError::NotConnected`] when [`close`](Self::close)
    /// is called first.
    pub(crate) async fn wait_up(&self) -> TransportResult<LinkTicket> {
        let mut rx = self.state.subscribe();
        let closes = rx.borrow().closes;
        let up = rx
            .wait_for(|s| s.up || s.closes != closes)
            .await
            .map(|s| s.up && s.closes == closes)
            .map_err(|_| TransportError::NotConnected)?;
        if up {
            Ok(LinkTicket { rx, closes })
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

/// Handle to one link, used to abandon I/O once that link is closed.
pub(crate) struct LinkTicket {
    rx: watch::Receiver<LinkState>,
    closes: u64,
}

impl LinkTicket {
    pub(crate) async fn closed(&mut self) {
        let closes = self.closes;
        let _ = self.rx.wait_for(|s| s.closes != closes).await;
    }

    /// Run `fut` unless the link is closed first.
    pub(crate) async fn or_closed<F: Future>(&mut self, fut: F) -> TransportResult<F::Output> {
        tokio::select! {
            biased;
            out = fut => Ok(out),
            () = self.closed() => Err(TransportError::NotConnected),
        }
    }
}
