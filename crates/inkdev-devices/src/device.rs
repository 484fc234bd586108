/*!
 * Connected device handle.
 *
 * An [`InkDevice`] is created by the device factory once the authorization
 * handshake succeeds. It owns the link to the device and one pump task that
 * routes link events in arrival order to status observers, notification
 * subscribers and the device's services.
 *
 * Commands issued through one handle (property reads and writes, service
 * commands, file downloads) are serialized by a single async lock, so a
 * caller never has two requests in flight on the same link.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use inkdev_core::config::FileTransferConfig;
use inkdev_core::event::{EventHub, Subscription};
use inkdev_core::logging::device_span;
use inkdev_core::types::{Id, Value};
use inkdev_core::utils::{spawn_and_log, with_cancel};

use crate::descriptor::{DeviceDescriptor, TransportKind};
use crate::error::{DeviceError, Result};
use crate::link::{LinkEvent, SharedLink};
use crate::properties::PropertyKey;
use crate::services::{
    Capability, DesktopDisplayService, DiscreteDisplayService, EncryptionService,
    FileTransferService, RealTimeInkService, Service, ServiceContext, ServiceRegistry,
};
use crate::status::{DeviceStatus, StatusChange};

/// What to do when a paired device re-enters pairing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingDecision {
    /// Keep the pairing and stay connected
    Keep,
    /// Drop the pairing and disconnect
    Forget,
}

/// Decides what happens when a device enters pairing mode
#[async_trait]
pub trait PairingModeHandler: Send + Sync {
    /// Called with the device that entered pairing mode
    async fn on_pairing_mode(&self, device: &DeviceDescriptor) -> PairingDecision;
}

#[async_trait]
impl<F, Fut> PairingModeHandler for F
where
    F: Fn(DeviceDescriptor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PairingDecision> + Send + 'static,
{
    async fn on_pairing_mode(&self, device: &DeviceDescriptor) -> PairingDecision {
        (self)(device.clone()).await
    }
}

/// A shared pairing mode handler
pub type SharedPairingHandler = Arc<dyn PairingModeHandler>;

/// Published when the device goes away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnected {
    /// The descriptor id of the device
    pub device_id: Id,
    /// True when the caller closed the device, false when the transport dropped
    pub requested: bool,
}

struct DeviceInner {
    descriptor: DeviceDescriptor,
    link: SharedLink,
    status: RwLock<DeviceStatus>,
    status_events: EventHub<StatusChange>,
    disconnected: EventHub<Disconnected>,
    notifications: BTreeMap<PropertyKey, EventHub<Value>>,
    services: ServiceRegistry,
    op_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    pairing_handler: RwLock<Option<SharedPairingHandler>>,
}

impl fmt::Debug for DeviceInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInner")
            .field("descriptor", &self.descriptor)
            .field("status", &self.status)
            .field("services", &self.services.capabilities())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let link = Arc::clone(&self.link);
        let id = self.descriptor.id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                spawn_and_log(&format!("close dropped device {}", id), async move {
                    link.close().await
                });
            }
            Err(_) => warn!("{}: device dropped outside a runtime, link left open", id),
        }
    }
}

/// A connected device
#[derive(Debug, Clone)]
pub struct InkDevice {
    inner: Arc<DeviceInner>,
}

impl InkDevice {
    /// Wrap a link whose handshake completed with `status`
    ///
    /// Must be called from within a Tokio runtime; spawns the event pump.
    pub(crate) fn attach(
        link: SharedLink,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        status: DeviceStatus,
        file_transfer: &FileTransferConfig,
    ) -> Result<Self> {
        let descriptor = link.descriptor().clone();
        let op_lock = Arc::new(Mutex::new(()));
        let closed = Arc::new(AtomicBool::new(false));

        let services = ServiceRegistry::new();
        for profile in link.services() {
            let ctx = ServiceContext::new(
                descriptor.id().clone(),
                Arc::clone(&link),
                Arc::clone(&op_lock),
                Arc::clone(&closed),
            );
            let service = Service::from_profile(profile, ctx);
            if let Some(ft) = service.as_file_transfer() {
                ft.configure(file_transfer);
            }
            services.register(service)?;
        }

        let notifications = link
            .notifications()
            .into_iter()
            .map(|key| (key, EventHub::new("device-notification")))
            .collect();

        let inner = Arc::new(DeviceInner {
            descriptor,
            link,
            status: RwLock::new(status),
            status_events: EventHub::new("device-status"),
            disconnected: EventHub::new("device-disconnected"),
            notifications,
            services,
            op_lock,
            closed,
            shutdown: CancellationToken::new(),
            pairing_handler: RwLock::new(None),
        });

        let transport = inner.descriptor.transport().to_string();
        let span = device_span(inner.descriptor.id().as_str(), &transport);
        tokio::spawn(
            pump(Arc::downgrade(&inner), events, inner.shutdown.clone()).instrument(span),
        );
        info!(
            "{} attached with status {} and services {:?}",
            inner.descriptor,
            status,
            inner.services.capabilities()
        );
        Ok(Self { inner })
    }

    /// The device this handle talks to
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Descriptor id
    pub fn id(&self) -> &Id {
        self.inner.descriptor.id()
    }

    /// Transport the device is connected over
    pub fn transport(&self) -> TransportKind {
        self.inner.descriptor.transport()
    }

    /// Last status reported by the device
    pub fn status(&self) -> DeviceStatus {
        self.inner
            .status
            .read()
            .map(|s| *s)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    /// Whether [`close`](Self::close) ran or the transport dropped
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Receive status changes in the order the device reported them
    pub fn subscribe_status(&self) -> Subscription<StatusChange> {
        self.inner.status_events.subscribe()
    }

    /// Receive one event when the device goes away
    pub fn subscribe_disconnected(&self) -> Subscription<Disconnected> {
        self.inner.disconnected.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(DeviceError::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Read one property
    ///
    /// Fails with `PropertyNotSupported` for keys the device does not know
    /// and `Transport` when the read itself fails.
    pub async fn get_property(&self, key: &PropertyKey, cancel: &CancellationToken) -> Result<Value> {
        self.ensure_open()?;
        with_cancel(cancel, async {
            let _guard = self.inner.op_lock.lock().await;
            trace!("{}: reading {}", self.id(), key);
            self.inner.link.read_property(key).await
        })
        .await
    }

    /// Read several properties; each key succeeds or fails on its own
    pub async fn get_properties(
        &self,
        keys: &[PropertyKey],
        cancel: &CancellationToken,
    ) -> Vec<(PropertyKey, Result<Value>)> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.get_property(key, cancel).await;
            if let Err(e) = &result {
                if e.is_cancelled() {
                    debug!("{}: reading {} cancelled", self.id(), key);
                } else {
                    debug!("{}: reading {} failed: {}", self.id(), key, e);
                }
            }
            results.push((key.clone(), result));
        }
        results
    }

    /// Write one property
    pub async fn set_property(
        &self,
        key: &PropertyKey,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;
        with_cancel(cancel, async {
            let _guard = self.inner.op_lock.lock().await;
            debug!("{}: writing {}", self.id(), key);
            self.inner.link.write_property(key, value).await
        })
        .await
    }

    /// Keys of the notifications this device can emit
    pub fn notification_keys(&self) -> Vec<PropertyKey> {
        self.inner.notifications.keys().cloned().collect()
    }

    /// Subscribe to a notification; `None` if the device never emits it
    pub fn get_notification(&self, key: &PropertyKey) -> Option<Subscription<Value>> {
        self.inner.notifications.get(key).map(EventHub::subscribe)
    }

    /// Install the handler consulted when the device re-enters pairing mode
    pub fn set_pairing_mode_handler<H: PairingModeHandler + 'static>(&self, handler: H) {
        self.set_shared_pairing_mode_handler(Arc::new(handler));
    }

    pub(crate) fn set_shared_pairing_mode_handler(&self, handler: SharedPairingHandler) {
        match self.inner.pairing_handler.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    /// Remove the pairing mode handler; pairing mode is then ignored
    pub fn clear_pairing_mode_handler(&self) {
        match self.inner.pairing_handler.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn pairing_handler(&self) -> Option<SharedPairingHandler> {
        self.inner
            .pairing_handler
            .read()
            .ok()
            .and_then(|slot| slot.clone())
    }

    /// Capabilities this device offers
    pub fn capabilities(&self) -> Vec<Capability> {
        self.inner.services.capabilities()
    }

    /// Look up a service; `None` if the device lacks it
    pub fn get_service(&self, capability: Capability) -> Option<Service> {
        self.inner.services.get(capability)
    }

    /// Real-time ink service
    pub fn real_time_ink(&self) -> Option<RealTimeInkService> {
        self.get_service(Capability::RealTimeInk)
            .and_then(|s| s.as_real_time_ink().cloned())
    }

    /// File transfer service
    pub fn file_transfer(&self) -> Option<FileTransferService> {
        self.get_service(Capability::FileTransfer)
            .and_then(|s| s.as_file_transfer().cloned())
    }

    /// Discrete display service
    pub fn discrete_display(&self) -> Option<DiscreteDisplayService> {
        self.get_service(Capability::DiscreteDisplay)
            .and_then(|s| s.as_discrete_display().cloned())
    }

    /// Desktop display service
    pub fn desktop_display(&self) -> Option<DesktopDisplayService> {
        self.get_service(Capability::DesktopDisplay)
            .and_then(|s| s.as_desktop_display().cloned())
    }

    /// Encryption service
    pub fn encryption(&self) -> Option<EncryptionService> {
        self.get_service(Capability::Encryption)
            .and_then(|s| s.as_encryption().cloned())
    }

    /// Stop services, release the link and end every subscription
    ///
    /// Safe to call more than once and concurrently with a transport drop;
    /// the link is closed exactly once.
    pub async fn close(&self) -> Result<()> {
        self.close_with(true).await
    }

    async fn close_with(&self, requested: bool) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        for service in self.inner.services.drain() {
            service.shutdown().await;
        }
        let result = self.inner.link.close().await;

        self.inner.disconnected.publish(Disconnected {
            device_id: self.id().clone(),
            requested,
        });
        self.inner.status_events.close();
        self.inner.disconnected.close();
        for hub in self.inner.notifications.values() {
            hub.close();
        }

        match &result {
            Ok(()) => info!("{} closed", self.inner.descriptor),
            Err(e) => warn!("{} closed with error: {}", self.inner.descriptor, e),
        }
        result
    }

    fn update_status(&self, new_status: DeviceStatus) {
        let old_status = {
            let mut status = match self.inner.status.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let old = *status;
            if old == new_status {
                return;
            }
            if !old.can_transition_to(new_status) {
                warn!("{}: ignoring status {} after {}", self.id(), new_status, old);
                return;
            }
            *status = new_status;
            old
        };
        debug!("{}: status {} -> {}", self.id(), old_status, new_status);
        self.inner.status_events.publish(StatusChange {
            device_id: self.id().clone(),
            old_status,
            new_status,
        });
    }

    async fn route(&self, event: LinkEvent) {
        match event {
            LinkEvent::Status(status) => self.update_status(status),
            LinkEvent::Sample(sample) => {
                if let Some(rt) = self.real_time_ink() {
                    rt.dispatch_sample(sample);
                }
            }
            LinkEvent::NewPage => {
                if let Some(rt) = self.real_time_ink() {
                    rt.dispatch_new_page();
                }
            }
            LinkEvent::FilesAvailable(count) => {
                if let Some(ft) = self.file_transfer() {
                    ft.notify_files_available(count);
                }
            }
            LinkEvent::Notification { key, value } => match self.inner.notifications.get(&key) {
                Some(hub) => {
                    hub.publish(value);
                }
                None => trace!("{}: unexpected notification {}", self.id(), key),
            },
            LinkEvent::PairingModeEnabled { .. } => {
                let Some(handler) = self.pairing_handler() else {
                    debug!("{}: pairing mode ignored, no handler", self.id());
                    return;
                };
                // The handler may wait on the user; keep pumping meanwhile
                let device = self.clone();
                tokio::spawn(async move {
                    let decision = handler.on_pairing_mode(device.descriptor()).await;
                    info!("{}: pairing mode decision {:?}", device.id(), decision);
                    if decision == PairingDecision::Forget {
                        if let Err(e) = device.close().await {
                            debug!("{}: close after forget failed: {}", device.id(), e);
                        }
                    }
                });
            }
            LinkEvent::Disconnected => self.transport_dropped().await,
        }
    }

    async fn transport_dropped(&self) {
        if !self.is_closed() {
            warn!("{} disconnected", self.inner.descriptor);
        }
        if let Err(e) = self.close_with(false).await {
            debug!("{}: closing after disconnect failed: {}", self.id(), e);
        }
    }
}

/// Routes link events for one device until shutdown or the link goes away
async fn pump(
    device: Weak<DeviceInner>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(inner) = device.upgrade() else {
            break;
        };
        let handle = InkDevice { inner };
        match event {
            Some(event) => handle.route(event).await,
            None => {
                handle.transport_dropped().await;
                break;
            }
        }
    }
    trace!("event pump ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DeviceModel;
    use crate::ink::{InkPoint, InkSample, PointPhase};
    use crate::link::Command;
    use crate::properties::{device as device_keys, smart_pad};
    use crate::services::realtime::RealTimeEvent;
    use crate::transform::{Matrix, Point};
    use crate::transports::sim::{SimController, SimulatedDevice};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected(sim: SimulatedDevice) -> (InkDevice, SimController) {
        let (link, controller) = sim.open_link();
        let events = link.take_events().unwrap();
        let device = InkDevice::attach(
            link,
            events,
            DeviceStatus::Idle,
            &FileTransferConfig::default(),
        )
        .unwrap();
        (device, controller)
    }

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new("sim-1", "Sim Pad", TransportKind::Ble, DeviceModel::SmartPad)
    }

    fn sample(phase: PointPhase, x: f64, seq: u32) -> InkSample {
        InkSample::new(phase, InkPoint::new(Point::new(x, 0.0), Utc::now()).with_sequence(seq))
    }

    #[test_log::test(tokio::test)]
    async fn test_property_failures_are_per_key() {
        let sim = SimulatedDevice::new(descriptor())
            .with_property(device_keys::NAME, Value::from("Sim Pad"))
            .with_property(smart_pad::BATTERY_LEVEL, Value::from(80u32))
            .with_failing_property(smart_pad::WIDTH);
        let (device, _ctl) = connected(sim).await;
        let cancel = CancellationToken::new();

        let keys = vec![
            device_keys::NAME,
            smart_pad::WIDTH,
            smart_pad::BATTERY_LEVEL,
            smart_pad::HEIGHT,
        ];
        let results = device.get_properties(&keys, &cancel).await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].1.as_ref().unwrap(), &Value::from("Sim Pad"));
        assert!(matches!(results[1].1, Err(DeviceError::Transport(_))));
        assert_eq!(results[2].1.as_ref().unwrap(), &Value::from(80u32));
        assert!(matches!(results[3].1, Err(DeviceError::PropertyNotSupported(_))));
    }

    #[tokio::test]
    async fn test_set_property_then_read() {
        let sim = SimulatedDevice::new(descriptor())
            .with_property(device_keys::NAME, Value::from("Old"));
        let (device, _ctl) = connected(sim).await;
        let cancel = CancellationToken::new();

        device
            .set_property(&device_keys::NAME, Value::from("New"), &cancel)
            .await
            .unwrap();
        assert_eq!(
            device.get_property(&device_keys::NAME, &cancel).await.unwrap(),
            Value::from("New")
        );
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let (device, _ctl) = connected(SimulatedDevice::new(descriptor())).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = device.get_property(&device_keys::NAME, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_status_changes_in_order() {
        let (device, ctl) = connected(SimulatedDevice::new(descriptor())).await;
        let mut changes = device.subscribe_status();

        ctl.set_status(DeviceStatus::Syncing);
        ctl.set_status(DeviceStatus::Idle);
        ctl.set_status(DeviceStatus::CapturingRealTimeInk);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let change = timeout(Duration::from_secs(1), changes.recv()).await.unwrap().unwrap();
            seen.push(change.new_status);
        }
        assert_eq!(
            seen,
            vec![DeviceStatus::Syncing, DeviceStatus::Idle, DeviceStatus::CapturingRealTimeInk]
        );
        assert_eq!(device.status(), DeviceStatus::CapturingRealTimeInk);
    }

    #[tokio::test]
    async fn test_notifications() {
        let sim = SimulatedDevice::new(descriptor()).with_notification(smart_pad::BATTERY_LEVEL);
        let (device, ctl) = connected(sim).await;

        assert!(device.get_notification(&smart_pad::WIDTH).is_none());
        let mut battery = device.get_notification(&smart_pad::BATTERY_LEVEL).unwrap();
        ctl.notify(smart_pad::BATTERY_LEVEL, Value::from(42u32));
        let value = timeout(Duration::from_secs(1), battery.recv()).await.unwrap();
        assert_eq!(value, Some(Value::from(42u32)));
    }

    #[tokio::test]
    async fn test_missing_capability_is_none() {
        let (device, _ctl) = connected(SimulatedDevice::new(descriptor())).await;
        assert!(device.get_service(Capability::DiscreteDisplay).is_none());
        assert!(device.real_time_ink().is_none());
        assert!(device.capabilities().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_realtime_samples_in_order_and_transformed() {
        let sim = SimulatedDevice::new(descriptor()).with_service(crate::link::ServiceProfile::RealTimeInk);
        let (device, ctl) = connected(sim).await;
        let cancel = CancellationToken::new();
        let rt = device.real_time_ink().unwrap();

        // samples before start are dropped; the status change marks when the pump got past it
        let mut changes = device.subscribe_status();
        ctl.send_sample(sample(PointPhase::Begin, 0.0, 0));
        ctl.set_status(DeviceStatus::Syncing);
        timeout(Duration::from_secs(1), changes.recv()).await.unwrap().unwrap();

        rt.set_transform(Matrix::translate(100.0, 0.0));
        let mut events = rt.subscribe();
        rt.start(&cancel).await.unwrap();
        assert!(matches!(rt.start(&cancel).await, Err(DeviceError::InvalidState(_))));

        ctl.send_sample(sample(PointPhase::Begin, 1.0, 1));
        ctl.send_sample(sample(PointPhase::Hover, 2.0, 2));
        ctl.send_sample(sample(PointPhase::Move, 3.0, 3));
        ctl.send_sample(sample(PointPhase::End, 4.0, 4));
        ctl.send_new_page();

        let mut xs = Vec::new();
        loop {
            match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
                RealTimeEvent::Point(s) => xs.push(s.point.position.x),
                RealTimeEvent::Hover(_) => panic!("hover not requested"),
                RealTimeEvent::NewPage => break,
            }
        }
        assert_eq!(xs, vec![101.0, 103.0, 104.0]);

        rt.stop(&cancel).await.unwrap();
        assert!(matches!(rt.stop(&cancel).await, Err(DeviceError::InvalidState(_))));
        assert_eq!(
            ctl.commands(),
            vec![Command::StartRealTime { hover: false }, Command::StopRealTime]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sim = SimulatedDevice::new(descriptor()).with_service(crate::link::ServiceProfile::RealTimeInk);
        let (device, ctl) = connected(sim).await;
        let cancel = CancellationToken::new();
        device.real_time_ink().unwrap().start(&cancel).await.unwrap();
        let mut gone = device.subscribe_disconnected();

        let (a, b) = tokio::join!(device.close(), device.close());
        a.unwrap();
        b.unwrap();
        assert_eq!(ctl.close_count(), 1);
        assert!(ctl.commands().contains(&Command::StopRealTime));
        assert_eq!(gone.recv().await.map(|d| d.requested), Some(true));
        assert!(matches!(
            device.get_property(&device_keys::NAME, &cancel).await,
            Err(DeviceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_transport_drop_closes_once() {
        let (device, ctl) = connected(SimulatedDevice::new(descriptor())).await;
        let mut gone = device.subscribe_disconnected();
        ctl.disconnect();

        let event = timeout(Duration::from_secs(1), gone.recv()).await.unwrap().unwrap();
        assert!(!event.requested);
        assert!(device.is_closed());
        device.close().await.unwrap();
        assert_eq!(ctl.close_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_forget_closes_device() {
        let (device, ctl) = connected(SimulatedDevice::new(descriptor())).await;
        let mut gone = device.subscribe_disconnected();

        device.set_pairing_mode_handler(|_d: DeviceDescriptor| async { PairingDecision::Forget });
        ctl.enter_pairing_mode(true);

        timeout(Duration::from_secs(1), gone.recv()).await.unwrap().unwrap();
        assert_eq!(ctl.close_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_without_handler_is_ignored() {
        let (device, ctl) = connected(SimulatedDevice::new(descriptor())).await;
        let mut changes = device.subscribe_status();
        ctl.enter_pairing_mode(true);
        ctl.set_status(DeviceStatus::Syncing);
        timeout(Duration::from_secs(1), changes.recv()).await.unwrap().unwrap();
        assert!(!device.is_closed());
        assert_eq!(ctl.close_count(), 0);
    }
}
