/*!
 * inkdev Devices
 *
 * This crate finds ink devices, connects to them through the authorization
 * handshake and exposes what they can do: properties, notifications,
 * real-time ink, page transfer, displays and encryption. It also carries the
 * ink document model, coordinate transforms and CSV export.
 *
 * Radio stacks plug in behind the [`link::Link`] and [`link::Connector`]
 * traits and the [`watcher::DiscoverySource`] trait. The simulated transport
 * in [`transports::sim`] implements all three in process.
 */

#![warn(missing_docs)]

// Re-export core types
pub use inkdev_core::prelude;

pub mod area;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod export;
pub mod factory;
pub mod ink;
pub mod link;
pub mod properties;
pub mod services;
pub mod session;
pub mod status;
pub mod transform;
pub mod transports;
pub mod watcher;

pub use area::{AreaAdjustment, AreaEditor, AreaField, Rect};
pub use descriptor::{DescriptorStore, DeviceDescriptor, DeviceModel, TransportKind};
pub use device::{Disconnected, InkDevice, PairingDecision, PairingModeHandler};
pub use error::{DeviceError, Result};
pub use factory::{ConnectOptions, ConnectOutcome, DeviceFactory};
pub use ink::{InkDocument, InkPoint, InkSample, Layer, PointPhase, Stroke};
pub use link::{AppId, Connector, Link, LinkEvent};
pub use properties::PropertyKey;
pub use services::{
    Capability, DesktopDisplayService, DiscreteDisplayService, EncryptionService,
    FileTransferService, RealTimeInkService, Service,
};
pub use session::Session;
pub use status::{DeviceStatus, StatusChange};
pub use transform::Matrix;
pub use watcher::{DeviceDiscoverer, DeviceWatcher, WatcherError, WatcherEvent};

/// inkdev devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
