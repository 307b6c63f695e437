//! Hooks into the host environment: runtime permissions and keeping the
//! process alive while assisting in the background.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::Instant;
use tracing::info;

pub trait PermissionOracle: Send + Sync {
    fn has_required_permission(&self) -> bool;
}

/// Desktop platforms grant Bluetooth access up front. The flag exists so
/// embedders (and tests) can model a revoked permission.
#[derive(Debug)]
pub struct GrantedPermission {
    granted: AtomicBool,
}

impl Default for GrantedPermission {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GrantedPermission {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
        }
    }

    /// Callers must follow up with `WorkerHandle::notify_permission_changed`.
    pub fn set(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl PermissionOracle for GrantedPermission {
    fn has_required_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

/// Keeps the session running when nobody is watching.
pub trait KeepAlive: Send + Sync {
    fn request_keep_alive(&self, assist_start: Instant);
    fn release_keep_alive(&self);
}

#[derive(Debug, Default)]
pub struct LoggingKeepAlive {
    held: AtomicBool,
}

impl LoggingKeepAlive {
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl KeepAlive for LoggingKeepAlive {
    fn request_keep_alive(&self, assist_start: Instant) {
        if !self.held.swap(true, Ordering::SeqCst) {
            info!(
                "Keeping session alive in the background (assisting for {}s)",
                assist_start.elapsed().as_secs()
            );
        }
    }

    fn release_keep_alive(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            info!("Background keep-alive released");
        }
    }
}
