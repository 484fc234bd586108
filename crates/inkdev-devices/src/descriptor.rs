/*!
 * Device descriptors and their persistence.
 *
 * A descriptor identifies a discovered device independently of any live
 * connection. It serializes to a compact binary form so the last connected
 * device can be restored across restarts:
 *
 * ```text
 * "IKDD" | version:u8 | transport:u8 | model:u8 | id | name | count:u16 | (key value)*
 * ```
 *
 * Strings are UTF-8 with a big-endian `u16` length prefix. Attributes are
 * written in key order, so equal descriptors encode to identical bytes.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use inkdev_core::config::Config;
use inkdev_core::types::Id;

use crate::error::{DeviceError, Result};

const MAGIC: &[u8; 4] = b"IKDD";
const FORMAT_VERSION: u8 = 1;

/// Transport a device is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Low Energy
    Ble,
    /// USB
    Usb,
    /// Bluetooth Classic
    Btc,
    /// Anything else
    Other,
}

impl TransportKind {
    fn tag(self) -> u8 {
        match self {
            TransportKind::Other => 0,
            TransportKind::Ble => 1,
            TransportKind::Usb => 2,
            TransportKind::Btc => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(TransportKind::Other),
            1 => Ok(TransportKind::Ble),
            2 => Ok(TransportKind::Usb),
            3 => Ok(TransportKind::Btc),
            t => Err(DeviceError::serialization(format!("unknown transport tag {}", t))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Ble => "BLE",
            TransportKind::Usb => "USB",
            TransportKind::Btc => "BTC",
            TransportKind::Other => "Other",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ble" => Ok(TransportKind::Ble),
            "usb" => Ok(TransportKind::Usb),
            "btc" | "bluetooth" => Ok(TransportKind::Btc),
            "other" => Ok(TransportKind::Other),
            _ => Err(DeviceError::other(format!("unknown transport {:?}", s))),
        }
    }
}

/// Device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    /// Smart pad with page storage
    SmartPad,
    /// Signature tablet with a discrete display
    Stu,
    /// Pen tablet or pen display managed by the desktop driver
    WacomDriver,
    /// Unknown family
    Unknown,
}

impl DeviceModel {
    fn tag(self) -> u8 {
        match self {
            DeviceModel::Unknown => 0,
            DeviceModel::SmartPad => 1,
            DeviceModel::Stu => 2,
            DeviceModel::WacomDriver => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(DeviceModel::Unknown),
            1 => Ok(DeviceModel::SmartPad),
            2 => Ok(DeviceModel::Stu),
            3 => Ok(DeviceModel::WacomDriver),
            t => Err(DeviceError::serialization(format!("unknown model tag {}", t))),
        }
    }
}

/// Identity of a discovered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    id: Id,
    name: String,
    transport: TransportKind,
    model: DeviceModel,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    /// Create a new descriptor
    pub fn new<I: Into<Id>, S: Into<String>>(
        id: I,
        name: S,
        transport: TransportKind,
        model: DeviceModel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport,
            model,
            attributes: BTreeMap::new(),
        }
    }

    /// Attach a transport attribute (BLE address, USB path, ...)
    pub fn with_attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Opaque device id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport kind
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Device family
    pub fn model(&self) -> DeviceModel {
        self.model
    }

    /// Transport attributes
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Look up one transport attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Identity comparison; names and attributes may differ between scans
    pub fn same_device(&self, other: &DeviceDescriptor) -> bool {
        self.id == other.id
    }

    /// Encode to the persisted byte form
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(self.transport.tag());
        buf.put_u8(self.model.tag());
        put_str(&mut buf, self.id.as_str())?;
        put_str(&mut buf, &self.name)?;
        let count = u16::try_from(self.attributes.len())
            .map_err(|_| DeviceError::serialization("too many descriptor attributes"))?;
        buf.put_u16(count);
        for (key, value) in &self.attributes {
            put_str(&mut buf, key)?;
            put_str(&mut buf, value)?;
        }
        Ok(buf.freeze())
    }

    /// Decode from the persisted byte form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < MAGIC.len() + 3 || &buf[..MAGIC.len()] != MAGIC {
            return Err(DeviceError::serialization("not a device descriptor"));
        }
        buf.advance(MAGIC.len());

        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(DeviceError::serialization(format!(
                "unsupported descriptor version {}",
                version
            )));
        }
        let transport = TransportKind::from_tag(buf.get_u8())?;
        let model = DeviceModel::from_tag(buf.get_u8())?;
        let id = get_str(&mut buf)?;
        let name = get_str(&mut buf)?;

        if buf.remaining() < 2 {
            return Err(DeviceError::serialization("truncated attribute count"));
        }
        let count = buf.get_u16();
        let mut attributes = BTreeMap::new();
        for _ in 0..count {
            let key = get_str(&mut buf)?;
            let value = get_str(&mut buf)?;
            attributes.insert(key, value);
        }
        if buf.has_remaining() {
            return Err(DeviceError::serialization(format!(
                "{} trailing bytes after descriptor",
                buf.remaining()
            )));
        }

        Ok(Self {
            id: Id::from(id),
            name,
            transport,
            model,
            attributes,
        })
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.name, self.transport, self.id)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| DeviceError::serialization("descriptor field longer than 65535 bytes"))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(DeviceError::serialization("truncated field length"));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(DeviceError::serialization("truncated field"));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| DeviceError::serialization(format!("invalid UTF-8 in descriptor: {}", e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

/// Persists the last connected descriptor in a well-known file
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    path: PathBuf,
}

impl DescriptorStore {
    /// Create a store backed by `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create a store at the configured descriptor path
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.descriptor_path())
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `descriptor`, replacing any previous one
    ///
    /// The bytes go to a sibling temp file first and are renamed into place.
    pub async fn save(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, descriptor.to_bytes()?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!("Saved descriptor for {} to {}", descriptor.id(), self.path.display());
        Ok(())
    }

    /// Read the stored descriptor, `None` if nothing was saved
    pub async fn load(&self) -> Result<Option<DeviceDescriptor>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => DeviceDescriptor::from_bytes(&data).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No saved descriptor at {}", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forget the stored descriptor
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn slate() -> DeviceDescriptor {
        DeviceDescriptor::new("ble:c4:2a:91", "Bamboo Slate", TransportKind::Ble, DeviceModel::SmartPad)
            .with_attribute("address", "C4:2A:91:0E:77:10")
            .with_attribute("rssi", "-61")
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let samples = [
            slate(),
            DeviceDescriptor::new("usb#1", "STU-540", TransportKind::Usb, DeviceModel::Stu),
            DeviceDescriptor::new("", "", TransportKind::Other, DeviceModel::Unknown),
            DeviceDescriptor::new("btc-ü", "Füller ✍", TransportKind::Btc, DeviceModel::WacomDriver),
        ];
        for d in samples {
            let bytes = d.to_bytes()?;
            let decoded = DeviceDescriptor::from_bytes(&bytes)?;
            assert_eq!(decoded, d);
            assert_eq!(decoded.to_bytes()?, bytes);
        }
        Ok(())
    }

    #[test]
    fn test_encoding_is_canonical() -> Result<()> {
        let a = DeviceDescriptor::new("x", "n", TransportKind::Usb, DeviceModel::Stu)
            .with_attribute("b", "2")
            .with_attribute("a", "1");
        let b = DeviceDescriptor::new("x", "n", TransportKind::Usb, DeviceModel::Stu)
            .with_attribute("a", "1")
            .with_attribute("b", "2");
        assert_eq!(a.to_bytes()?, b.to_bytes()?);
        Ok(())
    }

    #[test]
    fn test_rejects_corrupt_input() -> Result<()> {
        let bytes = slate().to_bytes()?;

        assert!(DeviceDescriptor::from_bytes(b"nope").is_err());
        assert!(DeviceDescriptor::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.to_vec();
        trailing.push(0);
        assert!(DeviceDescriptor::from_bytes(&trailing).is_err());

        let mut bad_version = bytes.to_vec();
        bad_version[4] = 9;
        assert!(matches!(
            DeviceDescriptor::from_bytes(&bad_version),
            Err(DeviceError::Serialization(_))
        ));
        Ok(())
    }

    #[test]
    fn test_same_device_by_id() {
        let a = slate();
        let b = DeviceDescriptor::new("ble:c4:2a:91", "Renamed", TransportKind::Ble, DeviceModel::SmartPad);
        assert!(a.same_device(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_transport_parse_and_display() {
        assert_eq!("ble".parse::<TransportKind>().unwrap(), TransportKind::Ble);
        assert_eq!("USB".parse::<TransportKind>().unwrap(), TransportKind::Usb);
        assert!("serial".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Btc.to_string(), "BTC");
    }

    #[tokio::test]
    async fn test_store_save_load_clear() -> Result<()> {
        let dir = tempdir()?;
        let store = DescriptorStore::new(dir.path().join("nested").join("SavedData"));

        assert!(store.load().await?.is_none());

        store.save(&slate()).await?;
        assert_eq!(store.load().await?, Some(slate()));
        assert!(!store.path().with_extension("tmp").exists());

        store.clear().await?;
        assert!(store.load().await?.is_none());
        store.clear().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_store_corrupt_file_is_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("SavedData");
        tokio::fs::write(&path, b"garbage").await?;
        assert!(DescriptorStore::new(&path).load().await.is_err());
        Ok(())
    }
}
