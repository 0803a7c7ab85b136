//! Advisory mutual-exclusion token for coarse, mutually destructive
//! activities (serial I/O, wireless scan, firmware update, ...).
//!
//! The guard is consulted at entry points; it does not intercept raw bus
//! I/O. At most one activity owns it at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    TcpRequestHandling,
    SerialIo,
    LinkProbe,
    NetworkScan,
    FirmwareUpdate,
}

impl ActivityKind {
    /// Whether this activity is compatible with request handling starting
    /// concurrently, per `spec.md` §4.4's policy: the coordinator only
    /// refuses to start when the active kind is neither `TcpRequestHandling`
    /// nor none.
    pub fn blocks_new_requests(self) -> bool {
        !matches!(self, ActivityKind::TcpRequestHandling)
    }
}

struct Owner {
    kind: ActivityKind,
    reason: String,
}

#[derive(Clone)]
pub struct OperationGuardRegistry {
    owner: Arc<Mutex<Option<Owner>>>,
}

impl Default for OperationGuardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGuardRegistry {
    pub fn new() -> Self {
        Self { owner: Arc::new(Mutex::new(None)) }
    }

    /// Returns the currently-owning activity kind, if any.
    pub fn active_kind(&self) -> Option<ActivityKind> {
        self.owner.lock().as_ref().map(|o| o.kind)
    }

    /// Attempts to acquire the guard for `kind`. Non-blocking: returns
    /// `None` immediately if another activity already owns it.
    pub fn try_acquire(&self, kind: ActivityKind, reason: impl Into<String>) -> Option<Guard> {
        let mut slot = self.owner.lock();
        if slot.is_some() {
            return None;
        }
        let reason = reason.into();
        debug!(target: "inverter_bridge::guard", ?kind, %reason, "guard acquired");
        *slot = Some(Owner { kind, reason });
        Some(Guard { registry: self.clone() })
    }
}

/// RAII handle: releases the guard when dropped.
pub struct Guard {
    registry: OperationGuardRegistry,
}

impl Drop for Guard {
    fn drop(&mut self) {
        let mut slot = self.registry.owner.lock();
        if let Some(owner) = slot.take() {
            debug!(target: "inverter_bridge::guard", kind = ?owner.kind, "guard released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_while_held() {
        let reg = OperationGuardRegistry::new();
        let g1 = reg.try_acquire(ActivityKind::SerialIo, "bus transaction").unwrap();
        assert!(reg.try_acquire(ActivityKind::NetworkScan, "scan").is_none());
        assert_eq!(reg.active_kind(), Some(ActivityKind::SerialIo));
        drop(g1);
        assert!(reg.active_kind().is_none());
    }

    #[test]
    fn release_on_drop_allows_next_acquire() {
        let reg = OperationGuardRegistry::new();
        {
            let _g = reg.try_acquire(ActivityKind::FirmwareUpdate, "ota").unwrap();
            assert!(reg.try_acquire(ActivityKind::TcpRequestHandling, "req").is_none());
        }
        assert!(reg.try_acquire(ActivityKind::TcpRequestHandling, "req").is_some());
    }

    #[test]
    fn blocks_new_requests_policy() {
        assert!(!ActivityKind::TcpRequestHandling.blocks_new_requests());
        assert!(ActivityKind::NetworkScan.blocks_new_requests());
        assert!(ActivityKind::FirmwareUpdate.blocks_new_requests());
        assert!(ActivityKind::SerialIo.blocks_new_requests());
        assert!(ActivityKind::LinkProbe.blocks_new_requests());
    }
}
