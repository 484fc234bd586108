/*!
 * Transport link boundary.
 *
 * A [`Connector`] opens a [`Link`] to one discovered device. The link is the
 * only place that knows the wire protocol: it answers property queries,
 * executes service commands and reports everything the device does on its
 * own (status changes, pen samples, new pages, pairing mode) as
 * [`LinkEvent`]s on a channel handed out once through [`Link::take_events`].
 *
 * Everything above this boundary (handshake, dedupe, flow control, clamping,
 * transforms) is transport independent.
 */
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use inkdev_core::config::ClientConfig;
use inkdev_core::types::Value;

use crate::area::Rect;
use crate::descriptor::{DeviceDescriptor, TransportKind};
use crate::error::{DeviceError, Result};
use crate::ink::{InkDocument, InkSample};
use crate::properties::PropertyKey;
use crate::services::display::{Color, DesktopDisplayInfo, DiscreteDisplayInfo, Image};
use crate::services::Capability;
use crate::status::DeviceStatus;

/// Six byte client identity presented to devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId([u8; 6]);

impl AppId {
    /// Identity used when none is configured
    pub const DEFAULT: AppId = AppId([0xFA, 0xAB, 0xC1, 0xE0, 0xF1, 0x77]);

    /// Create from raw bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Identity from the `[client]` configuration section
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.app_id.parse()
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for AppId {
    type Err = DeviceError;

    /// Parse 12 hex digits, optionally separated by `:` or `-`
    fn from_str(s: &str) -> Result<Self> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 12 || !hex.is_ascii() {
            return Err(DeviceError::other(format!("invalid app id {:?}", s)));
        }
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| DeviceError::other(format!("invalid app id {:?}", s)))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        f.write_str(&parts.join(":"))
    }
}

/// Parameters of the authorization handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Client identity
    pub app_id: AppId,
    /// Ask the user to confirm on the device
    pub require_user_confirmation: bool,
    /// Accept devices whose identity cannot be verified
    pub allow_untrusted: bool,
}

/// Something the device did on its own
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The device reports a new status
    Status(DeviceStatus),
    /// A paired device re-entered pairing mode
    PairingModeEnabled {
        /// Whether this host authorized the device earlier in the same session
        authorized_in_session: bool,
    },
    /// A real-time sample in device coordinates
    Sample(InkSample),
    /// The user started a new page
    NewPage,
    /// Completed pages are waiting to be transferred
    FilesAvailable(usize),
    /// A notification the caller may subscribe to
    Notification {
        /// Notification key
        key: PropertyKey,
        /// Payload
        value: Value,
    },
    /// The transport dropped
    Disconnected,
}

/// A service command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start streaming real-time ink
    StartRealTime {
        /// Also report hover samples
        hover: bool,
    },
    /// Stop streaming real-time ink
    StopRealTime,
    /// Start announcing completed pages
    StartFileTransfer,
    /// Stop announcing completed pages
    StopFileTransfer,
    /// Negotiate link encryption; answers the cipher suite
    StartEncryption,
    /// Drop link encryption
    StopEncryption,
    /// Read the discrete display ink color
    GetInkColor,
    /// Set the discrete display ink color
    SetInkColor(Color),
    /// Enable inking in an area
    EnableInking(Rect),
    /// Disable inking
    DisableInking,
    /// Fill an area with a color
    ClearScreen {
        /// Fill color
        color: Color,
        /// Area in display pixels
        area: Rect,
    },
    /// Draw part of an image into an area
    DrawImage {
        /// Source image
        image: Image,
        /// Region of the image to draw
        source: Rect,
        /// Area in display pixels
        destination: Rect,
    },
    /// Read the desktop area mapped to the tablet
    GetMappedPixels,
    /// Set the desktop area mapped to the tablet
    SetMappedPixels(Rect),
    /// Read whether the mapping follows the cursor
    GetTrackCursor,
    /// Set whether the mapping follows the cursor
    SetTrackCursor(bool),
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartRealTime { .. } => "StartRealTime",
            Command::StopRealTime => "StopRealTime",
            Command::StartFileTransfer => "StartFileTransfer",
            Command::StopFileTransfer => "StopFileTransfer",
            Command::StartEncryption => "StartEncryption",
            Command::StopEncryption => "StopEncryption",
            Command::GetInkColor => "GetInkColor",
            Command::SetInkColor(_) => "SetInkColor",
            Command::EnableInking(_) => "EnableInking",
            Command::DisableInking => "DisableInking",
            Command::ClearScreen { .. } => "ClearScreen",
            Command::DrawImage { .. } => "DrawImage",
            Command::GetMappedPixels => "GetMappedPixels",
            Command::SetMappedPixels(_) => "SetMappedPixels",
            Command::GetTrackCursor => "GetTrackCursor",
            Command::SetTrackCursor(_) => "SetTrackCursor",
        }
    }
}

/// A service the device offers, with its static description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceProfile {
    /// Real-time ink streaming
    RealTimeInk,
    /// Batch transfer of completed pages
    FileTransfer,
    /// Signature tablet display
    DiscreteDisplay(DiscreteDisplayInfo),
    /// Pen display mapped onto the desktop
    DesktopDisplay(DesktopDisplayInfo),
    /// Link encryption
    Encryption,
}

impl ServiceProfile {
    /// The capability this profile provides
    pub fn capability(&self) -> Capability {
        match self {
            ServiceProfile::RealTimeInk => Capability::RealTimeInk,
            ServiceProfile::FileTransfer => Capability::FileTransfer,
            ServiceProfile::DiscreteDisplay(_) => Capability::DiscreteDisplay,
            ServiceProfile::DesktopDisplay(_) => Capability::DesktopDisplay,
            ServiceProfile::Encryption => Capability::Encryption,
        }
    }
}

/// One downloaded page
#[derive(Debug, Clone, PartialEq)]
pub struct FileUnit {
    /// The page, in device coordinates
    pub document: InkDocument,
    /// False when the device reported a truncated transfer
    pub complete: bool,
}

/// A live transport connection to one device
#[async_trait]
pub trait Link: Send + Sync + Debug {
    /// The device this link talks to
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Hand out the event channel; `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    /// Begin the authorization handshake; progress arrives as status events
    async fn authorize(&self, request: AuthorizationRequest) -> Result<()>;

    /// Read one property
    async fn read_property(&self, key: &PropertyKey) -> Result<Value>;

    /// Write one property
    async fn write_property(&self, key: &PropertyKey, value: Value) -> Result<()>;

    /// Services offered by the device
    fn services(&self) -> Vec<ServiceProfile>;

    /// Notification keys the device can emit
    fn notifications(&self) -> Vec<PropertyKey>;

    /// Execute a service command
    async fn execute(&self, command: Command) -> Result<Value>;

    /// Number of completed pages waiting on the device
    async fn pending_files(&self) -> Result<usize>;

    /// Download the oldest pending page without removing it
    async fn download_file(&self) -> Result<FileUnit>;

    /// Remove the oldest pending page from the device
    async fn acknowledge_file(&self) -> Result<()>;

    /// Release the transport
    async fn close(&self) -> Result<()>;
}

/// A shared link handle
pub type SharedLink = Arc<dyn Link>;

/// Opens links for one transport
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Transport this connector serves
    fn transport(&self) -> TransportKind;

    /// Open a link to `descriptor`
    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<SharedLink>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkdev_core::config::Config;

    #[test]
    fn test_app_id_parse_and_display() {
        let id: AppId = "FA:AB:C1:E0:F1:77".parse().unwrap();
        assert_eq!(id, AppId::DEFAULT);
        assert_eq!(id.to_string(), "FA:AB:C1:E0:F1:77");

        let id: AppId = "faabc1-e0f177".parse().unwrap();
        assert_eq!(id.bytes(), [0xFA, 0xAB, 0xC1, 0xE0, 0xF1, 0x77]);

        assert!("FA:AB:C1".parse::<AppId>().is_err());
        assert!("GG:AB:C1:E0:F1:77".parse::<AppId>().is_err());
        assert!("ÄA:AB:C1:E0:F1:7".parse::<AppId>().is_err());
    }

    #[test]
    fn test_app_id_from_config() {
        let config = Config::default();
        assert_eq!(AppId::from_config(&config.client).unwrap(), AppId::DEFAULT);
    }

    #[test]
    fn test_profile_capability() {
        assert_eq!(ServiceProfile::RealTimeInk.capability(), Capability::RealTimeInk);
        assert_eq!(ServiceProfile::Encryption.capability(), Capability::Encryption);
        assert_eq!(Command::StartRealTime { hover: true }.name(), "StartRealTime");
    }
}
