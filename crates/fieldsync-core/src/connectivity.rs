//! ============================================================================
//! Connectivity Monitor - Online/offline state machine
//! ============================================================================
//! Platform events and the periodic poll are turned into `ConnectivityEvent`s;
//! `transition` decides what the service must do with each one. The current
//! status is published on a watch channel.
//! ============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Online,
    Offline,
    Unknown,
}

/// Input of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
    /// Periodic fallback poll
    Tick,
}

/// What the service should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Drain the queues, then refresh the visit list
    SyncAndRefresh,
    /// Stop outbound sync; local writes keep queueing
    Suspend,
    None,
}

/// Pure transition function of the monitor
pub fn transition(
    status: NetworkStatus,
    event: ConnectivityEvent,
) -> (NetworkStatus, MonitorAction) {
    use ConnectivityEvent as E;
    use NetworkStatus as S;

    match (status, event) {
        (S::Online, E::Online) => (S::Online, MonitorAction::None),
        (_, E::Online) => (S::Online, MonitorAction::SyncAndRefresh),
        (S::Offline, E::Offline) => (S::Offline, MonitorAction::None),
        (_, E::Offline) => (S::Offline, MonitorAction::Suspend),
        (S::Online, E::Tick) => (S::Online, MonitorAction::SyncAndRefresh),
        (s, E::Tick) => (s, MonitorAction::None),
    }
}

pub struct ConnectivityMonitor {
    status: watch::Sender<NetworkStatus>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self { status }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Feed one event through the state machine
    pub fn apply(&self, event: ConnectivityEvent) -> MonitorAction {
        let mut action = MonitorAction::None;
        let mut previous = NetworkStatus::Unknown;
        let changed = self.status.send_if_modified(|status| {
            previous = *status;
            let (next, act) = transition(*status, event);
            action = act;
            *status = next;
            next != previous
        });

        if changed {
            match self.status() {
                NetworkStatus::Online => info!("Network online (was {:?})", previous),
                NetworkStatus::Offline => warn!("Network offline, sync suspended"),
                NetworkStatus::Unknown => {}
            }
        } else {
            debug!("Connectivity event {:?} -> {:?}", event, action);
        }
        action
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Unknown)
    }
}
