/*!
 * Simulated transport.
 *
 * A [`SimulatedDevice`] describes a device: its handshake, properties,
 * services, notifications and queued pages. It can be built in code or
 * loaded from a JSON profile. A [`SimController`] drives the device while it
 * is connected (pen samples, status changes, page arrivals, pairing mode,
 * disconnects) and records what the host did to it.
 */
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use inkdev_core::types::Value;
use inkdev_core::utils::{duration_to_millis, millis_to_duration};

use crate::area::Rect;
use crate::descriptor::{DeviceDescriptor, TransportKind};
use crate::error::{DeviceError, Result};
use crate::ink::{InkDocument, InkSample};
use crate::link::{
    AuthorizationRequest, Command, Connector, FileUnit, Link, LinkEvent, ServiceProfile,
    SharedLink,
};
use crate::properties::PropertyKey;
use crate::services::display::Color;
use crate::status::DeviceStatus;
use crate::watcher::{DiscoveryEvent, DiscoverySource, WatcherError};

/// Cipher suite reported when encryption starts
pub const SIM_CIPHER_SUITE: &str = "ECDH-P256-AES128-CCM";

/// One step of the scripted handshake, played after authorization begins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HandshakeStep {
    /// Report a status
    Status(DeviceStatus),
    /// Enter pairing mode
    PairingMode {
        /// Whether the host authorized the device earlier in the session
        authorized_in_session: bool,
    },
    /// Drop the connection
    Disconnect,
}

/// A page waiting on the simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimFile {
    /// Page content
    pub document: InkDocument,
    /// Whether the page downloads in full
    #[serde(default = "default_true")]
    pub complete: bool,
    /// Number of download attempts that fail before one succeeds
    #[serde(default)]
    pub failures: u32,
    /// Every download attempt fails at the transport level
    #[serde(default)]
    pub link_fault: bool,
}

fn default_true() -> bool {
    true
}

fn default_handshake() -> Vec<HandshakeStep> {
    vec![HandshakeStep::Status(DeviceStatus::Idle)]
}

/// Description of a simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    descriptor: DeviceDescriptor,
    #[serde(default = "default_handshake")]
    handshake: Vec<HandshakeStep>,
    #[serde(default)]
    properties: BTreeMap<PropertyKey, Value>,
    #[serde(default)]
    failing_properties: BTreeSet<PropertyKey>,
    #[serde(default)]
    services: Vec<ServiceProfile>,
    #[serde(default)]
    notifications: Vec<PropertyKey>,
    #[serde(default)]
    files: Vec<SimFile>,
    #[serde(default)]
    failing_commands: BTreeSet<String>,
    #[serde(default)]
    open_delay_ms: Option<u64>,
    #[serde(default)]
    open_error: Option<String>,
}

impl SimulatedDevice {
    /// A device that authorizes straight to `Idle` and offers nothing
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            handshake: default_handshake(),
            properties: BTreeMap::new(),
            failing_properties: BTreeSet::new(),
            services: Vec::new(),
            notifications: Vec::new(),
            files: Vec::new(),
            failing_commands: BTreeSet::new(),
            open_delay_ms: None,
            open_error: None,
        }
    }

    /// Load a profile from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a profile from a JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// Serialize the profile to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The device's descriptor
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Replace the handshake script
    pub fn with_handshake(mut self, steps: Vec<HandshakeStep>) -> Self {
        self.handshake = steps;
        self
    }

    /// Add a readable property
    pub fn with_property(mut self, key: PropertyKey, value: Value) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Add a property whose reads fail at the transport level
    pub fn with_failing_property(mut self, key: PropertyKey) -> Self {
        self.failing_properties.insert(key);
        self
    }

    /// Offer a service
    pub fn with_service(mut self, profile: ServiceProfile) -> Self {
        self.services.push(profile);
        self
    }

    /// Emit a notification key
    pub fn with_notification(mut self, key: PropertyKey) -> Self {
        self.notifications.push(key);
        self
    }

    /// Queue a page
    pub fn with_file(mut self, file: SimFile) -> Self {
        self.files.push(file);
        self
    }

    /// Make a command fail at the transport level
    pub fn with_failing_command(mut self, name: &str) -> Self {
        self.failing_commands.insert(name.to_string());
        self
    }

    /// Delay opening the link
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay_ms = Some(duration_to_millis(delay));
        self
    }

    /// Make opening the link fail
    pub fn with_open_error(mut self, message: &str) -> Self {
        self.open_error = Some(message.to_string());
        self
    }

    /// Open a link directly, bypassing any connector
    pub fn open_link(&self) -> (SharedLink, SimController) {
        let controller = SimController::new(self.clone());
        let link = controller.link();
        (link, controller)
    }
}

impl SimFile {
    /// A page that downloads in full on the first attempt
    pub fn new(document: InkDocument) -> Self {
        Self {
            document,
            complete: true,
            failures: 0,
            link_fault: false,
        }
    }

    /// Fail the first `failures` download attempts
    pub fn failing(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    /// Report the download as truncated
    pub fn incomplete(mut self) -> Self {
        self.complete = false;
        self
    }

    /// Break the link on every download attempt
    pub fn with_link_fault(mut self) -> Self {
        self.link_fault = true;
        self
    }
}

#[derive(Debug)]
struct SimState {
    properties: BTreeMap<PropertyKey, Value>,
    failing_properties: BTreeSet<PropertyKey>,
    files: VecDeque<SimFile>,
    failing_commands: BTreeSet<String>,
    sender: Option<mpsc::UnboundedSender<LinkEvent>>,
    commands: Vec<Command>,
    authorizations: Vec<AuthorizationRequest>,
    ink_color: Color,
    mapped_pixels: Rect,
    track_cursor: bool,
    open_count: usize,
    close_count: usize,
}

#[derive(Debug)]
struct SimShared {
    device: SimulatedDevice,
    state: Mutex<SimState>,
}

impl SimShared {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drives a simulated device and observes the host
#[derive(Debug, Clone)]
pub struct SimController {
    shared: Arc<SimShared>,
}

impl SimController {
    /// Controller for `device`; no link is open yet
    pub fn new(device: SimulatedDevice) -> Self {
        let state = SimState {
            properties: device.properties.clone(),
            failing_properties: device.failing_properties.clone(),
            files: device.files.iter().cloned().collect(),
            failing_commands: device.failing_commands.clone(),
            sender: None,
            commands: Vec::new(),
            authorizations: Vec::new(),
            ink_color: Color::BLACK,
            mapped_pixels: Rect::default(),
            track_cursor: false,
            open_count: 0,
            close_count: 0,
        };
        Self {
            shared: Arc::new(SimShared {
                device,
                state: Mutex::new(state),
            }),
        }
    }

    /// The device's descriptor
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.device.descriptor
    }

    /// Open a new link; a previous link stops receiving events
    fn link(&self) -> SharedLink {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state();
            state.sender = Some(tx);
            state.open_count += 1;
        }
        Arc::new(SimLink {
            shared: Arc::clone(&self.shared),
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Send a raw link event; false when no link is open
    pub fn send(&self, event: LinkEvent) -> bool {
        match &self.shared.state().sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Report a status
    pub fn set_status(&self, status: DeviceStatus) -> bool {
        self.send(LinkEvent::Status(status))
    }

    /// Report a pen sample
    pub fn send_sample(&self, sample: InkSample) -> bool {
        self.send(LinkEvent::Sample(sample))
    }

    /// Report a new page
    pub fn send_new_page(&self) -> bool {
        self.send(LinkEvent::NewPage)
    }

    /// Emit a notification
    pub fn notify(&self, key: PropertyKey, value: Value) -> bool {
        self.send(LinkEvent::Notification { key, value })
    }

    /// Enter pairing mode
    pub fn enter_pairing_mode(&self, authorized_in_session: bool) -> bool {
        self.send(LinkEvent::PairingModeEnabled {
            authorized_in_session,
        })
    }

    /// Queue a page and announce it
    pub fn add_file(&self, file: SimFile) -> bool {
        let count = {
            let mut state = self.shared.state();
            state.files.push_back(file);
            state.files.len()
        };
        self.send(LinkEvent::FilesAvailable(count))
    }

    /// Pages still on the device
    pub fn pending_files(&self) -> usize {
        self.shared.state().files.len()
    }

    /// Change a property behind the host's back
    pub fn set_property(&self, key: PropertyKey, value: Value) {
        self.shared.state().properties.insert(key, value);
    }

    /// Drop the connection
    pub fn disconnect(&self) {
        let sender = self.shared.state().sender.take();
        if let Some(tx) = sender {
            // Ignored if the host already dropped the receiver
            let _ = tx.send(LinkEvent::Disconnected);
        }
    }

    /// Commands executed so far
    pub fn commands(&self) -> Vec<Command> {
        self.shared.state().commands.clone()
    }

    /// Authorization requests received so far
    pub fn authorizations(&self) -> Vec<AuthorizationRequest> {
        self.shared.state().authorizations.clone()
    }

    /// Links opened so far
    pub fn open_count(&self) -> usize {
        self.shared.state().open_count
    }

    /// Link closes so far
    pub fn close_count(&self) -> usize {
        self.shared.state().close_count
    }

    /// Current ink color
    pub fn ink_color(&self) -> Color {
        self.shared.state().ink_color
    }
}

#[derive(Debug)]
struct SimLink {
    shared: Arc<SimShared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    closed: AtomicBool,
}

impl SimLink {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DeviceError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Link for SimLink {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.device.descriptor
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn authorize(&self, request: AuthorizationRequest) -> Result<()> {
        self.ensure_open()?;
        debug!("{}: authorizing as {}", self.descriptor().id(), request.app_id);
        let mut state = self.shared.state();
        state.authorizations.push(request);
        for step in &self.shared.device.handshake {
            let event = match step {
                HandshakeStep::Status(status) => LinkEvent::Status(*status),
                HandshakeStep::PairingMode {
                    authorized_in_session,
                } => LinkEvent::PairingModeEnabled {
                    authorized_in_session: *authorized_in_session,
                },
                HandshakeStep::Disconnect => LinkEvent::Disconnected,
            };
            if let Some(tx) = &state.sender {
                // A send only fails once the host dropped the receiver
                let _ = tx.send(event);
            }
        }
        Ok(())
    }

    async fn read_property(&self, key: &PropertyKey) -> Result<Value> {
        self.ensure_open()?;
        let state = self.shared.state();
        if state.failing_properties.contains(key) {
            return Err(DeviceError::transport(format!("simulated read failure on {}", key)));
        }
        state
            .properties
            .get(key)
            .cloned()
            .ok_or_else(|| DeviceError::PropertyNotSupported(key.to_string()))
    }

    async fn write_property(&self, key: &PropertyKey, value: Value) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        if state.failing_properties.contains(key) {
            return Err(DeviceError::transport(format!("simulated write failure on {}", key)));
        }
        match state.properties.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(DeviceError::PropertyNotSupported(key.to_string())),
        }
    }

    fn services(&self) -> Vec<ServiceProfile> {
        self.shared.device.services.clone()
    }

    fn notifications(&self) -> Vec<PropertyKey> {
        self.shared.device.notifications.clone()
    }

    async fn execute(&self, command: Command) -> Result<Value> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        if state.failing_commands.contains(command.name()) {
            return Err(DeviceError::transport(format!(
                "simulated failure of {}",
                command.name()
            )));
        }
        state.commands.push(command.clone());
        let answer = match command {
            Command::StartEncryption => Value::from(SIM_CIPHER_SUITE),
            Command::GetInkColor => Value::from(state.ink_color),
            Command::SetInkColor(color) => {
                state.ink_color = color;
                Value::Null
            }
            Command::GetMappedPixels => Value::from(state.mapped_pixels),
            Command::SetMappedPixels(area) => {
                state.mapped_pixels = area;
                Value::Null
            }
            Command::GetTrackCursor => Value::from(state.track_cursor),
            Command::SetTrackCursor(enabled) => {
                state.track_cursor = enabled;
                Value::Null
            }
            _ => Value::Null,
        };
        Ok(answer)
    }

    async fn pending_files(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.state().files.len())
    }

    async fn download_file(&self) -> Result<FileUnit> {
        self.ensure_open()?;
        let mut state = self.shared.state();
        let file = state
            .files
            .front_mut()
            .ok_or_else(|| DeviceError::protocol("no pending page"))?;
        if file.link_fault {
            return Err(DeviceError::transport("simulated link fault during download"));
        }
        if file.failures > 0 {
            file.failures -= 1;
            return Err(DeviceError::file_transfer("simulated transfer failure"));
        }
        Ok(FileUnit {
            document: file.document.clone(),
            complete: file.complete,
        })
    }

    async fn acknowledge_file(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .state()
            .files
            .pop_front()
            .map(|_| ())
            .ok_or_else(|| DeviceError::protocol("no pending page to acknowledge"))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.shared.state();
        state.close_count += 1;
        state.sender = None;
        debug!("{}: link closed", self.shared.device.descriptor.id());
        Ok(())
    }
}

/// Opens links to registered simulated devices
#[derive(Debug)]
pub struct SimulatedConnector {
    transport: TransportKind,
    devices: Mutex<BTreeMap<String, SimController>>,
}

impl SimulatedConnector {
    /// A connector for `transport`
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Make `device` reachable; returns its controller
    pub fn add(&self, device: SimulatedDevice) -> SimController {
        let controller = SimController::new(device);
        let id = controller.descriptor().id().to_string();
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, controller.clone());
        controller
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    fn transport(&self) -> TransportKind {
        self.transport
    }

    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<SharedLink> {
        let controller = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(descriptor.id().as_str())
            .cloned()
            .ok_or_else(|| DeviceError::transport(format!("{} is out of range", descriptor)))?;

        let device = &controller.shared.device;
        if let Some(delay) = device.open_delay_ms {
            tokio::time::sleep(millis_to_duration(delay)).await;
        }
        if let Some(message) = &device.open_error {
            return Err(DeviceError::transport(message));
        }
        info!("Opened simulated link to {}", descriptor);
        Ok(controller.link())
    }
}

#[derive(Debug)]
enum DiscoveryCommand {
    Event(DiscoveryEvent),
    Fail(WatcherError),
}

/// Feeds reports into a running [`SimulatedDiscovery`]
#[derive(Debug, Clone)]
pub struct SimDiscoveryHandle {
    tx: mpsc::UnboundedSender<DiscoveryCommand>,
}

impl SimDiscoveryHandle {
    /// Report a device as found
    pub fn found(&self, descriptor: DeviceDescriptor) {
        // Ignored once the discovery source is gone
        let _ = self
            .tx
            .send(DiscoveryCommand::Event(DiscoveryEvent::Found(descriptor)));
    }

    /// Report a device as lost
    pub fn lost(&self, descriptor: DeviceDescriptor) {
        let _ = self
            .tx
            .send(DiscoveryCommand::Event(DiscoveryEvent::Lost(descriptor)));
    }

    /// Make the running scan fault
    pub fn fail(&self, error: WatcherError) {
        let _ = self.tx.send(DiscoveryCommand::Fail(error));
    }
}

/// A discovery source for simulated devices
#[derive(Debug)]
pub struct SimulatedDiscovery {
    transport: TransportKind,
    present: Vec<DeviceDescriptor>,
    tx: mpsc::UnboundedSender<DiscoveryCommand>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DiscoveryCommand>>,
}

impl SimulatedDiscovery {
    /// A source that finds nothing until told to
    pub fn new(transport: TransportKind) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport,
            present: Vec::new(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// A device found at the start of every scan
    pub fn with_device(mut self, descriptor: DeviceDescriptor) -> Self {
        self.present.push(descriptor);
        self
    }

    /// A handle to feed reports into the scan
    pub fn handle(&self) -> SimDiscoveryHandle {
        SimDiscoveryHandle {
            tx: self.tx.clone(),
        }
    }
}

#[async_trait]
impl DiscoverySource for SimulatedDiscovery {
    fn transport(&self) -> TransportKind {
        self.transport
    }

    async fn scan(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        stop: CancellationToken,
    ) -> std::result::Result<(), WatcherError> {
        let mut commands = self.rx.lock().await;
        for descriptor in &self.present {
            if events.send(DiscoveryEvent::Found(descriptor.clone())).is_err() {
                return Ok(());
            }
        }
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                command = commands.recv() => match command {
                    Some(DiscoveryCommand::Event(event)) => {
                        if events.send(event).is_err() {
                            return Ok(());
                        }
                    }
                    Some(DiscoveryCommand::Fail(error)) => return Err(error),
                    // unreachable while `self.tx` is alive
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DeviceModel;
    use crate::properties::device as device_keys;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new("stu-7", "STU-540", TransportKind::Usb, DeviceModel::Stu)
    }

    #[test]
    fn test_json_profile() {
        let json = r#"{
            "descriptor": {
                "id": "pad-1",
                "name": "Slate",
                "transport": "Ble",
                "model": "SmartPad",
                "attributes": {}
            },
            "properties": { "Device.Name": "Slate", "BatteryLevel": 77 },
            "services": ["RealTimeInk", "FileTransfer"],
            "notifications": ["BatteryLevel"]
        }"#;
        let device = SimulatedDevice::from_json(json).unwrap();
        assert_eq!(device.descriptor().name(), "Slate");
        assert_eq!(device.handshake, default_handshake());
        assert_eq!(
            device.properties.get(&device_keys::NAME),
            Some(&Value::from("Slate"))
        );
        assert_eq!(device.services.len(), 2);

        let again = SimulatedDevice::from_json(&device.to_json().unwrap()).unwrap();
        assert_eq!(again, device);
    }

    #[tokio::test]
    async fn test_connector_opens_known_devices_only() {
        let connector = SimulatedConnector::new(TransportKind::Usb);
        let ctl = connector.add(SimulatedDevice::new(descriptor()));

        let link = connector.open(&descriptor()).await.unwrap();
        assert_eq!(link.descriptor().id(), descriptor().id());
        assert_eq!(ctl.open_count(), 1);

        let stranger = DeviceDescriptor::new("x", "X", TransportKind::Usb, DeviceModel::Stu);
        assert!(matches!(
            connector.open(&stranger).await,
            Err(DeviceError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_file_failures_then_success() {
        let page = InkDocument::default();
        let sim = SimulatedDevice::new(descriptor()).with_file(SimFile::new(page).failing(1));
        let (link, ctl) = sim.open_link();

        assert_eq!(link.pending_files().await.unwrap(), 1);
        assert!(matches!(link.download_file().await, Err(DeviceError::FileTransfer(_))));
        assert!(link.download_file().await.unwrap().complete);
        link.acknowledge_file().await.unwrap();
        assert_eq!(ctl.pending_files(), 0);
        assert!(link.acknowledge_file().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_link_rejects_calls() {
        let (link, ctl) = SimulatedDevice::new(descriptor()).open_link();
        link.close().await.unwrap();
        assert!(matches!(
            link.execute(Command::StopRealTime).await,
            Err(DeviceError::NotConnected)
        ));
        assert_eq!(ctl.close_count(), 1);
        assert!(!ctl.set_status(DeviceStatus::Idle));
    }
}
