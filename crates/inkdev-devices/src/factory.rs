/*!
 * Device factory and authorization handshake.
 *
 * The factory opens a link through the connector registered for the
 * descriptor's transport, runs the authorization handshake and hands back a
 * connected [`InkDevice`]. The handshake follows the status the device
 * reports:
 *
 * ```text
 * Idle -> Connecting -> (Expecting* ...) -> Idle | Syncing | CapturingRealTimeInk
 *                    \-> NotAuthorized*      (terminal, surfaced as an error)
 * ```
 *
 * Waiting for the user to confirm on the device is bounded by the
 * confirmation timeout. Whatever ends a handshake early (failure, decline,
 * cancellation) closes the link exactly once before returning.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use inkdev_core::config::{Config, FileTransferConfig};
use inkdev_core::logging::operation_span;
use inkdev_core::utils::{with_cancel, with_timeout};

use crate::descriptor::{DeviceDescriptor, TransportKind};
use crate::device::{InkDevice, PairingDecision, PairingModeHandler, SharedPairingHandler};
use crate::error::{DeviceError, Result};
use crate::link::{AppId, AuthorizationRequest, Connector, LinkEvent, SharedLink};
use crate::status::DeviceStatus;

/// Called with every status the device reports, during and after the handshake
pub type StatusObserver = Arc<dyn Fn(DeviceStatus) + Send + Sync>;

/// How to connect to a device
#[derive(Clone)]
pub struct ConnectOptions {
    /// Client identity
    pub app_id: AppId,
    /// Ask the user to confirm on the device
    pub require_user_confirmation: bool,
    /// Accept devices whose identity cannot be verified
    pub allow_untrusted: bool,
    /// Bound on opening the link
    pub connect_timeout: Duration,
    /// Bound on waiting for the user to confirm on the device
    pub confirmation_timeout: Duration,
    /// Settings applied to the file transfer service
    pub file_transfer: FileTransferConfig,
    on_status: Option<StatusObserver>,
    pairing_handler: Option<SharedPairingHandler>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("app_id", &self.app_id)
            .field("require_user_confirmation", &self.require_user_confirmation)
            .field("allow_untrusted", &self.allow_untrusted)
            .field("connect_timeout", &self.connect_timeout)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("has_status_observer", &self.on_status.is_some())
            .field("has_pairing_handler", &self.pairing_handler.is_some())
            .finish()
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        let config = Config::default();
        Self {
            app_id: AppId::DEFAULT,
            require_user_confirmation: config.client.require_user_confirmation,
            allow_untrusted: config.client.allow_untrusted,
            connect_timeout: config.handshake.connect_timeout(),
            confirmation_timeout: config.handshake.confirmation_timeout(),
            file_transfer: config.file_transfer,
            on_status: None,
            pairing_handler: None,
        }
    }
}

impl ConnectOptions {
    /// Options from the `[client]`, `[handshake]` and `[file_transfer]` sections
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            app_id: AppId::from_config(&config.client)?,
            require_user_confirmation: config.client.require_user_confirmation,
            allow_untrusted: config.client.allow_untrusted,
            connect_timeout: config.handshake.connect_timeout(),
            confirmation_timeout: config.handshake.confirmation_timeout(),
            file_transfer: config.file_transfer.clone(),
            on_status: None,
            pairing_handler: None,
        })
    }

    /// Observe every reported status
    pub fn with_status_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(DeviceStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(observer));
        self
    }

    /// Decide what happens when the device enters pairing mode
    pub fn with_pairing_mode_handler<H: PairingModeHandler + 'static>(mut self, handler: H) -> Self {
        self.pairing_handler = Some(Arc::new(handler));
        self
    }

    /// Ask (or not) for confirmation on the device
    pub fn with_user_confirmation(mut self, required: bool) -> Self {
        self.require_user_confirmation = required;
        self
    }

    /// Change the confirmation timeout
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Change the link open timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        AuthorizationRequest {
            app_id: self.app_id,
            require_user_confirmation: self.require_user_confirmation,
            allow_untrusted: self.allow_untrusted,
        }
    }

    fn observe(&self, status: DeviceStatus) {
        if let Some(observer) = &self.on_status {
            observer(status);
        }
    }
}

/// Result of a connection attempt that did not fail
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// The device is connected
    Connected(InkDevice),
    /// The user chose to forget the device during pairing
    Declined,
}

impl ConnectOutcome {
    /// The device, if connected
    pub fn into_device(self) -> Option<InkDevice> {
        match self {
            ConnectOutcome::Connected(device) => Some(device),
            ConnectOutcome::Declined => None,
        }
    }

    /// Whether the user declined
    pub fn is_declined(&self) -> bool {
        matches!(self, ConnectOutcome::Declined)
    }
}

/// How a reported status moves the handshake along
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Keep waiting
    Wait,
    /// The device is waiting for the user; the confirmation clock runs
    AwaitConfirmation,
    /// Connected
    Ready,
}

fn progress(current: DeviceStatus, next: DeviceStatus) -> Result<Progress> {
    if !current.can_transition_to(next) {
        return Err(DeviceError::protocol(format!(
            "invalid status transition {} -> {}",
            current, next
        )));
    }
    if next.is_terminal() {
        Err(DeviceError::NotAuthorized(next))
    } else if next.awaits_confirmation() {
        Ok(Progress::AwaitConfirmation)
    } else if next.is_ready() {
        Ok(Progress::Ready)
    } else {
        Ok(Progress::Wait)
    }
}

enum Handshake {
    Ready(DeviceStatus),
    Declined,
}

/// Creates connected devices
#[derive(Debug, Default)]
pub struct DeviceFactory {
    connectors: BTreeMap<TransportKind, Arc<dyn Connector>>,
}

impl DeviceFactory {
    /// A factory with no connectors
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the connector for its transport, replacing any previous one
    pub fn register_connector<C: Connector + 'static>(&mut self, connector: C) {
        self.register_shared(Arc::new(connector));
    }

    /// Register a shared connector
    pub fn register_shared(&mut self, connector: Arc<dyn Connector>) {
        let transport = connector.transport();
        if self.connectors.insert(transport, connector).is_some() {
            debug!("Replaced {} connector", transport);
        }
    }

    /// Builder form of [`register_connector`](Self::register_connector)
    pub fn with_connector<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.register_connector(connector);
        self
    }

    /// Transports with a registered connector
    pub fn transports(&self) -> Vec<TransportKind> {
        self.connectors.keys().copied().collect()
    }

    /// Connect to `descriptor` and run the authorization handshake
    pub async fn create_device(
        &self,
        descriptor: &DeviceDescriptor,
        options: &ConnectOptions,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome> {
        let connector = self.connectors.get(&descriptor.transport()).ok_or_else(|| {
            DeviceError::transport(format!("no connector for {}", descriptor.transport()))
        })?;
        let span = operation_span("create_device", descriptor.id().as_str());
        connect(Arc::clone(connector), descriptor, options, cancel)
            .instrument(span)
            .await
    }
}

async fn connect(
    connector: Arc<dyn Connector>,
    descriptor: &DeviceDescriptor,
    options: &ConnectOptions,
    cancel: &CancellationToken,
) -> Result<ConnectOutcome> {
    info!("Connecting to {}", descriptor);
    options.observe(DeviceStatus::Connecting);

    let link = with_cancel(
        cancel,
        with_timeout(options.connect_timeout, connector.open(descriptor)),
    )
    .await
    .inspect_err(|e| debug!("Opening {} failed: {}", descriptor, e))?;

    let Some(mut events) = link.take_events() else {
        close_link(&link).await;
        return Err(DeviceError::invalid_state("link events already taken"));
    };

    match handshake(&link, &mut events, options, cancel).await {
        Ok(Handshake::Ready(status)) => {
            let device =
                match InkDevice::attach(Arc::clone(&link), events, status, &options.file_transfer) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!("Attaching {} failed: {}", descriptor, e);
                        close_link(&link).await;
                        return Err(e);
                    }
                };
            if let Some(handler) = &options.pairing_handler {
                device.set_shared_pairing_mode_handler(Arc::clone(handler));
            }
            if let Some(observer) = options.on_status.clone() {
                device
                    .subscribe_status()
                    .forward(move |change| observer(change.new_status));
            }
            info!("Connected to {} ({})", descriptor, status);
            Ok(ConnectOutcome::Connected(device))
        }
        Ok(Handshake::Declined) => {
            info!("Pairing with {} declined", descriptor);
            close_link(&link).await;
            Ok(ConnectOutcome::Declined)
        }
        Err(e) => {
            if e.is_cancelled() {
                debug!("Handshake with {} cancelled", descriptor);
            } else {
                warn!("Handshake with {} failed: {}", descriptor, e);
            }
            close_link(&link).await;
            Err(e)
        }
    }
}

async fn close_link(link: &SharedLink) {
    if let Err(e) = link.close().await {
        debug!("Closing {} failed: {}", link.descriptor().id(), e);
    }
}

async fn handshake(
    link: &SharedLink,
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    options: &ConnectOptions,
    cancel: &CancellationToken,
) -> Result<Handshake> {
    with_cancel(cancel, link.authorize(options.authorization_request())).await?;

    let mut status = DeviceStatus::Connecting;
    let mut deadline: Option<Instant> = None;
    loop {
        let confirmation = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            _ = confirmation => {
                let failed = DeviceStatus::NotAuthorizedConnectionNotConfirmed;
                warn!("{}: not confirmed within {:?}", link.descriptor().id(), options.confirmation_timeout);
                options.observe(failed);
                return Err(DeviceError::NotAuthorized(failed));
            }
            event = events.recv() => event,
        };

        match event {
            Some(LinkEvent::Status(next)) => {
                if next == status {
                    continue;
                }
                let step = progress(status, next);
                if let Err(DeviceError::NotAuthorized(failed)) = &step {
                    options.observe(*failed);
                }
                let step = step?;
                debug!("{}: handshake {} -> {}", link.descriptor().id(), status, next);
                status = next;
                options.observe(next);
                match step {
                    Progress::Ready => return Ok(Handshake::Ready(next)),
                    Progress::AwaitConfirmation => {
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + options.confirmation_timeout);
                        }
                    }
                    Progress::Wait => deadline = None,
                }
            }
            Some(LinkEvent::PairingModeEnabled {
                authorized_in_session,
            }) => {
                if !authorized_in_session {
                    trace!("Pairing mode on a device new to this session, keeping");
                    continue;
                }
                let Some(handler) = &options.pairing_handler else {
                    continue;
                };
                let decision = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
                    decision = handler.on_pairing_mode(link.descriptor()) => decision,
                };
                if decision == PairingDecision::Forget {
                    return Ok(Handshake::Declined);
                }
            }
            Some(LinkEvent::Disconnected) | None => {
                return Err(DeviceError::transport("link dropped during handshake"));
            }
            Some(other) => trace!("Ignoring {:?} during handshake", other),
        }
    }
}
