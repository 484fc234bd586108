/*!
 * Device discovery.
 *
 * A [`DiscoverySource`] scans one transport and reports raw found/lost
 * events. A [`DeviceWatcher`] runs one source, dedupes its reports by
 * descriptor id and republishes them as an ordered [`WatcherEvent`] stream:
 * a device is added once, and only a device that was added can be removed.
 *
 * [`DeviceDiscoverer`] runs one watcher per transport and merges their
 * streams.
 */
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inkdev_core::event::{EventHub, Subscription};
use inkdev_core::types::Id;

use crate::descriptor::{DeviceDescriptor, TransportKind};

/// Why a scan could not run or stopped on its own
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherError {
    /// The radio is off or missing
    #[error("Radio not available")]
    RadioNotAvailable,
    /// Another process holds the adapter
    #[error("Resource in use")]
    ResourceInUse,
    /// The adapter went away during the scan
    #[error("Device not connected")]
    DeviceNotConnected,
    /// Scanning is disabled by system policy
    #[error("Disabled by policy")]
    DisabledByPolicy,
    /// Scanning is disabled by the user
    #[error("Disabled by user")]
    DisabledByUser,
    /// The platform cannot scan this transport
    #[error("Not supported")]
    NotSupported,
    /// The user has not granted access
    #[error("Consent required")]
    ConsentRequired,
    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl WatcherError {
    /// Whether the error reflects the environment (radio off, no permission)
    /// rather than a fault worth reporting as a failure
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            WatcherError::RadioNotAvailable
                | WatcherError::DisabledByPolicy
                | WatcherError::DisabledByUser
                | WatcherError::NotSupported
                | WatcherError::ConsentRequired
        )
    }
}

/// Raw report from a discovery source
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A device was seen
    Found(DeviceDescriptor),
    /// A device went away
    Lost(DeviceDescriptor),
}

/// Scans one transport
#[async_trait]
pub trait DiscoverySource: Send + Sync + Debug {
    /// Transport scanned by this source
    fn transport(&self) -> TransportKind;

    /// Report devices on `events` until `stop` is cancelled
    ///
    /// Returns `Ok` when stopped on request and `Err` when the scan faults.
    async fn scan(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        stop: CancellationToken,
    ) -> Result<(), WatcherError>;
}

/// Watcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatcherStatus {
    /// Never started
    Created,
    /// Scanning
    Started,
    /// Stop requested, scan winding down
    Stopping,
    /// Stopped on request
    Stopped,
    /// Stopped by a fault
    Aborted,
}

impl fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a watcher stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherStopReason {
    /// `stop()` was called
    Requested,
    /// The scan faulted
    Fault(WatcherError),
}

/// Published by a watcher, in order
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEvent {
    /// A new device was found
    DeviceAdded(DeviceDescriptor),
    /// A previously added device went away
    DeviceRemoved(DeviceDescriptor),
    /// The watcher stopped
    Stopped(WatcherStopReason),
}

#[derive(Debug)]
struct WatcherInner {
    source: Arc<dyn DiscoverySource>,
    status: RwLock<WatcherStatus>,
    devices: RwLock<BTreeMap<Id, DeviceDescriptor>>,
    events: EventHub<WatcherEvent>,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WatcherInner {
    fn set_status(&self, status: WatcherStatus) {
        match self.status.write() {
            Ok(mut s) => *s = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }

    fn handle(&self, event: DiscoveryEvent) {
        let mut devices = match self.devices.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match event {
            DiscoveryEvent::Found(descriptor) => {
                if devices.contains_key(descriptor.id()) {
                    debug!("Ignoring repeated report of {}", descriptor.id());
                    return;
                }
                info!("Found {}", descriptor);
                devices.insert(descriptor.id().clone(), descriptor.clone());
                drop(devices);
                self.events.publish(WatcherEvent::DeviceAdded(descriptor));
            }
            DiscoveryEvent::Lost(descriptor) => match devices.remove(descriptor.id()) {
                Some(known) => {
                    info!("Lost {}", known);
                    drop(devices);
                    self.events.publish(WatcherEvent::DeviceRemoved(known));
                }
                None => debug!("Ignoring loss of unknown device {}", descriptor.id()),
            },
        }
    }
}

/// Watches one transport for devices
#[derive(Debug, Clone)]
pub struct DeviceWatcher {
    inner: Arc<WatcherInner>,
}

impl DeviceWatcher {
    /// Create a watcher over `source`
    pub fn new<S: DiscoverySource + 'static>(source: S) -> Self {
        Self::from_shared(Arc::new(source))
    }

    /// Create a watcher over a shared source
    pub fn from_shared(source: Arc<dyn DiscoverySource>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                source,
                status: RwLock::new(WatcherStatus::Created),
                devices: RwLock::new(BTreeMap::new()),
                events: EventHub::new("device-watcher"),
                run: Mutex::new(None),
            }),
        }
    }

    /// Transport being watched
    pub fn transport(&self) -> TransportKind {
        self.inner.source.transport()
    }

    /// Current lifecycle state
    pub fn status(&self) -> WatcherStatus {
        self.inner
            .status
            .read()
            .map(|s| *s)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    /// Receive device events
    pub fn subscribe(&self) -> Subscription<WatcherEvent> {
        self.inner.events.subscribe()
    }

    /// Devices currently known, in id order
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .devices
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Start scanning; does nothing if already started
    ///
    /// Known devices are forgotten, so a restart reports every device again.
    pub fn start(&self) {
        let mut run = self
            .inner
            .run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.status() == WatcherStatus::Started {
            return;
        }

        match self.inner.devices.write() {
            Ok(mut devices) => devices.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        self.inner.set_status(WatcherStatus::Started);
        info!("Watching for {} devices", self.transport());

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_scan(Arc::clone(&self.inner), stop.clone()));
        *run = Some((stop, handle));
    }

    /// Stop scanning and wait for the scan to wind down; idempotent
    pub async fn stop(&self) {
        let run = self
            .inner
            .run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((stop, handle)) = run else {
            return;
        };
        if self.status() == WatcherStatus::Started {
            self.inner.set_status(WatcherStatus::Stopping);
        }
        stop.cancel();
        if let Err(e) = handle.await {
            warn!("{} watcher task failed: {}", self.transport(), e);
            self.inner.set_status(WatcherStatus::Aborted);
        }
    }
}

async fn run_scan(inner: Arc<WatcherInner>, stop: CancellationToken) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let source = Arc::clone(&inner.source);
    let scan = source.scan(tx, stop.clone());
    tokio::pin!(scan);

    let result = loop {
        tokio::select! {
            result = &mut scan => break result,
            Some(event) = rx.recv() => inner.handle(event),
        }
    };
    while let Ok(event) = rx.try_recv() {
        inner.handle(event);
    }

    let transport = inner.source.transport();
    let reason = match result {
        Ok(()) => {
            info!("{} watcher stopped", transport);
            inner.set_status(WatcherStatus::Stopped);
            WatcherStopReason::Requested
        }
        Err(e) => {
            if e.is_expected() {
                info!("{} watcher stopped: {}", transport, e);
            } else {
                warn!("{} watcher aborted: {}", transport, e);
            }
            inner.set_status(WatcherStatus::Aborted);
            WatcherStopReason::Fault(e)
        }
    };
    inner.events.publish(WatcherEvent::Stopped(reason));
}

/// A watcher event tagged with its transport
#[derive(Debug, Clone, PartialEq)]
pub struct DiscovererEvent {
    /// Transport of the watcher that reported it
    pub transport: TransportKind,
    /// The event
    pub event: WatcherEvent,
}

/// Runs one watcher per transport and merges their events
#[derive(Debug)]
pub struct DeviceDiscoverer {
    watchers: Vec<DeviceWatcher>,
    events: EventHub<DiscovererEvent>,
}

impl DeviceDiscoverer {
    /// Create a discoverer with no sources
    pub fn new() -> Self {
        Self {
            watchers: Vec::new(),
            events: EventHub::new("device-discoverer"),
        }
    }

    /// Add a source; must be called within a Tokio runtime
    pub fn register_source<S: DiscoverySource + 'static>(&mut self, source: S) -> DeviceWatcher {
        let watcher = DeviceWatcher::new(source);
        let transport = watcher.transport();
        let hub = self.events.clone();
        watcher.subscribe().forward(move |event| {
            hub.publish(DiscovererEvent { transport, event });
        });
        self.watchers.push(watcher.clone());
        watcher
    }

    /// Registered watchers
    pub fn watchers(&self) -> &[DeviceWatcher] {
        &self.watchers
    }

    /// The watcher for `transport`, if registered
    pub fn watcher_for(&self, transport: TransportKind) -> Option<&DeviceWatcher> {
        self.watchers.iter().find(|w| w.transport() == transport)
    }

    /// Receive events from every watcher
    pub fn subscribe(&self) -> Subscription<DiscovererEvent> {
        self.events.subscribe()
    }

    /// Start every watcher
    pub fn start_all(&self) {
        for watcher in &self.watchers {
            watcher.start();
        }
    }

    /// Stop every watcher
    pub async fn stop_all(&self) {
        join_all(self.watchers.iter().map(DeviceWatcher::stop)).await;
    }

    /// Devices known to any watcher
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.watchers.iter().flat_map(DeviceWatcher::devices).collect()
    }
}

impl Default for DeviceDiscoverer {
    fn default() -> Self {
        Self::new()
    }
}
