//! Member lease gate
//!
//! Publishes the slot granted to this process. The first successful claim
//! sets a single-assignment latch that unblocks `await_lease`; later events
//! only move the "currently held" view used for readiness.

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, SlotLeaseError};

/// Slot held by this process; its durable identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GrantedSlot {
    pub pool: String,
    pub index: u32,
    pub lease_name: String,
    pub holder: String,
}

impl fmt::Display for GrantedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lease_name)
    }
}

/// What happened to a member slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotEventKind {
    Acquired,
    /// Renewal failed; another process may now hold the slot
    Lost,
    /// Given up on graceful shutdown
    Released,
}

/// Member slot transition observed by the member controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotEvent {
    pub kind: SlotEventKind,
    pub slot: GrantedSlot,
}

/// In-process gate exposing the granted slot to the application
pub struct MemberLeaseCoordinator {
    granted: watch::Sender<Option<GrantedSlot>>,
    current: RwLock<Option<GrantedSlot>>,
    events: broadcast::Sender<SlotEvent>,
}

impl MemberLeaseCoordinator {
    pub fn new() -> Self {
        let (granted, _) = watch::channel(None);
        let (events, _) = broadcast::channel(16);
        Self {
            granted,
            current: RwLock::new(None),
            events,
        }
    }

    /// Record a slot transition
    pub fn on_event(&self, event: SlotEvent) {
        match event.kind {
            SlotEventKind::Acquired => {
                *self.current.write() = Some(event.slot.clone());
                let first = self.granted.send_if_modified(|granted| {
                    if granted.is_none() {
                        *granted = Some(event.slot.clone());
                        true
                    } else {
                        false
                    }
                });
                if first {
                    info!("Member lease '{}' has been acquired", event.slot);
                } else if self.granted().as_ref() != Some(&event.slot) {
                    warn!(
                        "Member lease '{}' acquired but identity stays '{}'",
                        event.slot,
                        self.granted().map(|s| s.to_string()).unwrap_or_default()
                    );
                }
            }
            SlotEventKind::Lost | SlotEventKind::Released => {
                let mut current = self.current.write();
                if current.as_ref() == Some(&event.slot) {
                    *current = None;
                }
                debug!("Member lease '{}' {:?}", event.slot, event.kind);
            }
        }
        let _ = self.events.send(event);
    }

    /// Slot held right now, `None` between a loss and its reacquisition
    pub fn current_lease(&self) -> Option<GrantedSlot> {
        self.current.read().clone()
    }

    /// Identity granted by the first claim, if any
    pub fn granted(&self) -> Option<GrantedSlot> {
        self.granted.borrow().clone()
    }

    /// Stream of slot transitions
    pub fn subscribe(&self) -> broadcast::Receiver<SlotEvent> {
        self.events.subscribe()
    }

    /// Wait for the first granted slot
    ///
    /// Returns immediately once a slot has been granted; otherwise fails
    /// with `SlotAcquisitionTimeout` after `timeout`.
    pub async fn await_lease(&self, timeout: Duration) -> Result<GrantedSlot> {
        let mut receiver = self.granted.subscribe();
        let wait = async move {
            let granted = receiver
                .wait_for(Option::is_some)
                .await
                .map(|granted| (*granted).clone());
            granted
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(Some(slot))) => Ok(slot),
            Ok(Ok(None)) | Ok(Err(_)) => Err(SlotLeaseError::Internal {
                message: "member lease gate closed".into(),
            }),
            Err(_) => Err(SlotLeaseError::SlotAcquisitionTimeout { timeout }),
        }
    }
}

impl Default for MemberLeaseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
