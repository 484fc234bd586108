/*!
 * Capability services and the per-device service registry.
 *
 * A connected device offers a subset of the capabilities below. Looking up
 * a capability the device lacks yields `None`; that is not an error.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use inkdev_core::types::{Id, Value};
use inkdev_core::utils::with_cancel;

use crate::error::{DeviceError, Result};
use crate::link::{Command, FileUnit, ServiceProfile, SharedLink};

pub mod display;
pub mod encryption;
pub mod file_transfer;
pub mod realtime;

pub use display::{DesktopDisplayService, DiscreteDisplayService};
pub use encryption::EncryptionService;
pub use file_transfer::FileTransferService;
pub use realtime::RealTimeInkService;

/// Capability key of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Real-time ink streaming
    RealTimeInk,
    /// Batch transfer of completed pages
    FileTransfer,
    /// Signature tablet display
    DiscreteDisplay,
    /// Pen display mapped onto the desktop
    DesktopDisplay,
    /// Link encryption
    Encryption,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A service handle, tagged by capability
#[derive(Debug, Clone)]
pub enum Service {
    /// Real-time ink
    RealTimeInk(RealTimeInkService),
    /// File transfer
    FileTransfer(FileTransferService),
    /// Discrete display
    DiscreteDisplay(DiscreteDisplayService),
    /// Desktop display
    DesktopDisplay(DesktopDisplayService),
    /// Encryption
    Encryption(EncryptionService),
}

impl Service {
    /// Build the service for a profile
    pub(crate) fn from_profile(profile: ServiceProfile, ctx: ServiceContext) -> Self {
        match profile {
            ServiceProfile::RealTimeInk => Service::RealTimeInk(RealTimeInkService::new(ctx)),
            ServiceProfile::FileTransfer => Service::FileTransfer(FileTransferService::new(ctx)),
            ServiceProfile::DiscreteDisplay(info) => {
                Service::DiscreteDisplay(DiscreteDisplayService::new(ctx, info))
            }
            ServiceProfile::DesktopDisplay(info) => {
                Service::DesktopDisplay(DesktopDisplayService::new(ctx, info))
            }
            ServiceProfile::Encryption => Service::Encryption(EncryptionService::new(ctx)),
        }
    }

    /// The capability this service provides
    pub fn capability(&self) -> Capability {
        match self {
            Service::RealTimeInk(_) => Capability::RealTimeInk,
            Service::FileTransfer(_) => Capability::FileTransfer,
            Service::DiscreteDisplay(_) => Capability::DiscreteDisplay,
            Service::DesktopDisplay(_) => Capability::DesktopDisplay,
            Service::Encryption(_) => Capability::Encryption,
        }
    }

    /// Whether a startable service is running; display services are always available
    pub fn is_started(&self) -> bool {
        match self {
            Service::RealTimeInk(s) => s.is_started(),
            Service::FileTransfer(s) => s.is_started(),
            Service::Encryption(s) => s.is_started(),
            Service::DiscreteDisplay(_) | Service::DesktopDisplay(_) => true,
        }
    }

    /// Real-time ink view
    pub fn as_real_time_ink(&self) -> Option<&RealTimeInkService> {
        match self {
            Service::RealTimeInk(s) => Some(s),
            _ => None,
        }
    }

    /// File transfer view
    pub fn as_file_transfer(&self) -> Option<&FileTransferService> {
        match self {
            Service::FileTransfer(s) => Some(s),
            _ => None,
        }
    }

    /// Discrete display view
    pub fn as_discrete_display(&self) -> Option<&DiscreteDisplayService> {
        match self {
            Service::DiscreteDisplay(s) => Some(s),
            _ => None,
        }
    }

    /// Desktop display view
    pub fn as_desktop_display(&self) -> Option<&DesktopDisplayService> {
        match self {
            Service::DesktopDisplay(s) => Some(s),
            _ => None,
        }
    }

    /// Encryption view
    pub fn as_encryption(&self) -> Option<&EncryptionService> {
        match self {
            Service::Encryption(s) => Some(s),
            _ => None,
        }
    }

    /// Stop a running service during device teardown
    pub(crate) async fn shutdown(&self) {
        let result = match self {
            Service::RealTimeInk(s) => s.shutdown().await,
            Service::FileTransfer(s) => s.shutdown().await,
            Service::Encryption(s) => s.shutdown().await,
            Service::DiscreteDisplay(_) | Service::DesktopDisplay(_) => Ok(()),
        };
        if let Err(e) = result {
            debug!("Stopping {} during teardown failed: {}", self.capability(), e);
        }
    }
}

/// What every service needs from its device
#[derive(Debug, Clone)]
pub(crate) struct ServiceContext {
    pub(crate) device_id: Id,
    link: SharedLink,
    op_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl ServiceContext {
    pub(crate) fn new(
        device_id: Id,
        link: SharedLink,
        op_lock: Arc<Mutex<()>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device_id,
            link,
            op_lock,
            closed,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DeviceError::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Execute a command under the device's operation lock
    pub(crate) async fn execute(&self, command: Command, cancel: &CancellationToken) -> Result<Value> {
        self.ensure_open()?;
        let name = command.name();
        with_cancel(cancel, async {
            let _guard = self.op_lock.lock().await;
            debug!("{}: executing {}", self.device_id, name);
            self.link.execute(command).await
        })
        .await
    }

    /// Execute a command during teardown, after the device was marked closed
    pub(crate) async fn execute_on_close(&self, command: Command) -> Result<Value> {
        let _guard = self.op_lock.lock().await;
        self.link.execute(command).await
    }

    pub(crate) async fn pending_files(&self) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.op_lock.lock().await;
        self.link.pending_files().await
    }

    pub(crate) async fn download_file(&self) -> Result<FileUnit> {
        self.ensure_open()?;
        let _guard = self.op_lock.lock().await;
        self.link.download_file().await
    }

    pub(crate) async fn acknowledge_file(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.op_lock.lock().await;
        self.link.acknowledge_file().await
    }
}

/// Service registry
///
/// Holds at most one service per capability.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<BTreeMap<Capability, Service>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; a second service for the same capability is rejected
    pub fn register(&self, service: Service) -> Result<()> {
        let capability = service.capability();
        let mut services = self.services.write().map_err(|_| {
            DeviceError::other("Failed to acquire write lock on service registry")
        })?;
        if services.contains_key(&capability) {
            return Err(DeviceError::invalid_state(format!(
                "{} service already registered",
                capability
            )));
        }
        services.insert(capability, service);
        debug!("Registered {} service", capability);
        Ok(())
    }

    /// Look up a service
    pub fn get(&self, capability: Capability) -> Option<Service> {
        match self.services.read() {
            Ok(services) => services.get(&capability).cloned(),
            Err(_) => {
                warn!("Service registry lock poisoned");
                None
            }
        }
    }

    /// Registered capabilities in key order
    pub fn capabilities(&self) -> Vec<Capability> {
        self.services
            .read()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every service, returning them for teardown
    pub(crate) fn drain(&self) -> Vec<Service> {
        match self.services.write() {
            Ok(mut services) => std::mem::take(&mut *services).into_values().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Start/stop bookkeeping shared by the startable services
#[derive(Debug, Default)]
pub(crate) struct RunState {
    started: AtomicBool,
    transition: Mutex<()>,
}

impl RunState {
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run `start` unless already started
    pub(crate) async fn start<F, Fut, T>(&self, what: &str, start: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.transition.lock().await;
        if self.is_started() {
            return Err(DeviceError::invalid_state(format!("{} already started", what)));
        }
        let value = start().await?;
        self.started.store(true, Ordering::SeqCst);
        Ok(value)
    }

    /// Run `stop` unless already stopped
    pub(crate) async fn stop<F, Fut, T>(&self, what: &str, stop: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.transition.lock().await;
        if !self.is_started() {
            return Err(DeviceError::invalid_state(format!("{} not started", what)));
        }
        let value = stop().await?;
        self.started.store(false, Ordering::SeqCst);
        Ok(value)
    }

    /// Mark stopped without talking to the device
    pub(crate) fn force_stopped(&self) -> bool {
        self.started.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_state_guards() {
        let state = RunState::default();
        assert!(state.stop("Thing", || async { Ok(()) }).await.is_err());

        state.start("Thing", || async { Ok(()) }).await.unwrap();
        assert!(state.is_started());
        let err = state.start("Thing", || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidState(_)));

        state.stop("Thing", || async { Ok(()) }).await.unwrap();
        assert!(!state.is_started());
    }

    #[tokio::test]
    async fn test_failed_start_stays_stopped() {
        let state = RunState::default();
        let err = state
            .start("Thing", || async { Err::<(), _>(DeviceError::transport("radio off")) })
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
        assert!(!state.is_started());
    }
}
