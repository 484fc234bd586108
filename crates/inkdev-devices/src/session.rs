/*!
 * Client session.
 *
 * A [`Session`] ties together the configuration, the device factory, the
 * descriptor store and the currently connected device. Applications create
 * one and pass it where it is needed; there is no process-wide state.
 */
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use inkdev_core::config::{Config, ConfigBuilder, SharedConfig};

use crate::descriptor::{DescriptorStore, DeviceDescriptor};
use crate::device::InkDevice;
use crate::error::Result;
use crate::factory::{ConnectOptions, ConnectOutcome, DeviceFactory};

/// Composition root for one client
#[derive(Debug)]
pub struct Session {
    config: SharedConfig,
    factory: DeviceFactory,
    options: ConnectOptions,
    store: DescriptorStore,
    current: Mutex<Option<InkDevice>>,
}

impl Session {
    /// Create a session; the configuration is validated first
    pub fn new(config: impl Into<SharedConfig>, factory: DeviceFactory) -> Result<Self> {
        let config = config.into();
        config.get().validate()?;
        let options = ConnectOptions::from_config(config.get())?;
        let store = DescriptorStore::from_config(config.get());
        Ok(Self {
            config,
            factory,
            options,
            store,
            current: Mutex::new(None),
        })
    }

    /// Create a session from layered configuration (file, environment)
    pub fn from_builder(builder: ConfigBuilder, factory: DeviceFactory) -> Result<Self> {
        Self::new(builder.build()?, factory)
    }

    /// Replace the connection options, e.g. to add observers
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Session configuration
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    /// Session configuration, shareable with other components
    pub fn shared_config(&self) -> SharedConfig {
        self.config.clone()
    }

    /// Options used for every connection
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Persisted descriptor store
    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    /// The device factory
    pub fn factory(&self) -> &DeviceFactory {
        &self.factory
    }

    fn current(&self) -> MutexGuard<'_, Option<InkDevice>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The connected device, if any
    pub fn current_device(&self) -> Option<InkDevice> {
        self.current().as_ref().filter(|d| !d.is_closed()).cloned()
    }

    /// Connect to `descriptor`, persisting it once connected
    ///
    /// A previously connected device is closed first.
    pub async fn connect(
        &self,
        descriptor: &DeviceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome> {
        self.connect_with(descriptor, &self.options, cancel).await
    }

    /// Reconnect to the persisted device without asking for confirmation
    ///
    /// `None` when nothing was persisted.
    pub async fn restore(&self, cancel: &CancellationToken) -> Result<Option<ConnectOutcome>> {
        let Some(descriptor) = self.store.load().await? else {
            return Ok(None);
        };
        info!("Restoring connection to {}", descriptor);
        let options = self.options.clone().with_user_confirmation(false);
        self.connect_with(&descriptor, &options, cancel).await.map(Some)
    }

    async fn connect_with(
        &self,
        descriptor: &DeviceDescriptor,
        options: &ConnectOptions,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome> {
        let previous = self.current().take();
        if let Some(previous) = previous {
            debug!("Closing previous device {}", previous.descriptor());
            previous.close().await?;
        }
        let outcome = self.factory.create_device(descriptor, options, cancel).await?;
        if let ConnectOutcome::Connected(device) = &outcome {
            self.store.save(device.descriptor()).await?;
            *self.current() = Some(device.clone());
        }
        Ok(outcome)
    }

    /// Close the current device; the persisted descriptor is kept
    pub async fn disconnect(&self) -> Result<()> {
        let device = self.current().take();
        match device {
            Some(device) => device.close().await,
            None => Ok(()),
        }
    }

    /// Close the current device and drop the persisted descriptor
    pub async fn forget(&self) -> Result<()> {
        self.disconnect().await?;
        self.store.clear().await
    }
}

/// A session shared between tasks
pub type SharedSession = Arc<Session>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DeviceModel, TransportKind};
    use crate::device::PairingDecision;
    use crate::transports::sim::{HandshakeStep, SimulatedConnector, SimulatedDevice, SimulatedDiscovery};
    use crate::watcher::{DeviceWatcher, WatcherEvent, WatcherStatus};
    use crate::status::DeviceStatus;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn slate() -> DeviceDescriptor {
        DeviceDescriptor::new("slate-1", "Bamboo Slate", TransportKind::Ble, DeviceModel::SmartPad)
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.general.data_dir = dir.path().to_string_lossy().into_owned();
        config
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.client.app_id = "not-hex".to_string();
        assert!(Session::new(config, DeviceFactory::new()).is_err());
    }

    #[tokio::test]
    async fn test_session_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inkdev.toml");
        let toml = format!(
            "[general]\ndata_dir = {:?}\n\n[client]\ndescriptor_file = \"LastPad\"\nrequire_user_confirmation = false\n",
            dir.path().to_string_lossy()
        );
        std::fs::write(&path, toml).unwrap();

        let connector = SimulatedConnector::new(TransportKind::Ble);
        let ctl = connector.add(SimulatedDevice::new(slate()));
        let session = Session::from_builder(
            ConfigBuilder::new().with_config_file(&path),
            DeviceFactory::new().with_connector(connector),
        )
        .unwrap();
        assert_eq!(session.shared_config().get().client.descriptor_file, "LastPad");
        assert!(!session.options().require_user_confirmation);

        session.connect(&slate(), &CancellationToken::new()).await.unwrap();
        assert!(dir.path().join("LastPad").exists());
        assert!(!ctl.authorizations()[0].require_user_confirmation);
        session.disconnect().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_persists_and_restore_skips_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SimulatedConnector::new(TransportKind::Ble);
        let ctl = connector.add(SimulatedDevice::new(slate()));
        let session = Session::new(config(&dir), DeviceFactory::new().with_connector(connector)).unwrap();
        let cancel = CancellationToken::new();

        assert!(session.restore(&cancel).await.unwrap().is_none());

        let outcome = session.connect(&slate(), &cancel).await.unwrap();
        assert!(!outcome.is_declined());
        assert_eq!(session.store().load().await.unwrap(), Some(slate()));
        assert!(session.current_device().is_some());

        session.disconnect().await.unwrap();
        assert!(session.current_device().is_none());
        assert_eq!(ctl.close_count(), 1);

        let restored = session.restore(&cancel).await.unwrap().unwrap();
        let device = restored.into_device().unwrap();
        assert_eq!(device.descriptor(), &slate());

        let auth = ctl.authorizations();
        assert_eq!(auth.len(), 2);
        assert!(auth[0].require_user_confirmation);
        assert!(!auth[1].require_user_confirmation);

        session.forget().await.unwrap();
        assert_eq!(session.store().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_declined_pairing_persists_nothing_and_watcher_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SimulatedConnector::new(TransportKind::Ble);
        let ctl = connector.add(SimulatedDevice::new(slate()).with_handshake(vec![
            HandshakeStep::PairingMode {
                authorized_in_session: true,
            },
            HandshakeStep::Status(DeviceStatus::Idle),
        ]));
        let options = ConnectOptions::default()
            .with_pairing_mode_handler(|_d: DeviceDescriptor| async { PairingDecision::Forget });
        let session = Session::new(config(&dir), DeviceFactory::new().with_connector(connector))
            .unwrap()
            .with_options(options);

        let watcher = DeviceWatcher::new(SimulatedDiscovery::new(TransportKind::Ble).with_device(slate()));
        let mut events = watcher.subscribe();
        watcher.start();
        let found = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(found, WatcherEvent::DeviceAdded(slate()));
        watcher.stop().await;

        let outcome = session.connect(&slate(), &CancellationToken::new()).await.unwrap();
        assert!(outcome.is_declined());
        assert_eq!(ctl.close_count(), 1);
        assert_eq!(session.store().load().await.unwrap(), None);
        assert!(session.current_device().is_none());

        watcher.start();
        assert_eq!(watcher.status(), WatcherStatus::Started);
        loop {
            let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
            if event == WatcherEvent::DeviceAdded(slate()) {
                break;
            }
        }
        watcher.stop().await;
    }
}
