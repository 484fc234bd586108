/*!
 * Property keys and typed property values.
 *
 * Keys are opaque strings understood by device firmware, so the constants
 * below must not change. They are grouped by subsystem namespace; the older
 * smart pad geometry keys predate namespacing and carry no prefix.
 *
 * Structured values travel as [`Value::Object`]s. The typed views in this
 * module convert them with `TryFrom<&Value>` and format them for display.
 */
use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use inkdev_core::types::{object, Value};

use crate::error::DeviceError;

/// Property subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Generic device identity and geometry
    Device,
    /// Pen digitizer
    Digitizer,
    /// Attached screen
    Screen,
    /// Signature tablet settings
    Stu,
    /// Smart pad settings
    SmartPad,
    /// Desktop driver managed tablets
    WacomDriver,
}

impl Namespace {
    /// Key prefix, without the separator
    pub fn prefix(self) -> &'static str {
        match self {
            Namespace::Device => "Device",
            Namespace::Digitizer => "Digitizer",
            Namespace::Screen => "Screen",
            Namespace::Stu => "STU",
            Namespace::SmartPad => "SmartPad",
            Namespace::WacomDriver => "WacomDriver",
        }
    }

    /// All namespaces
    pub fn all() -> [Namespace; 6] {
        [
            Namespace::Device,
            Namespace::Digitizer,
            Namespace::Screen,
            Namespace::Stu,
            Namespace::SmartPad,
            Namespace::WacomDriver,
        ]
    }

    /// Well-known keys of this namespace, in display order
    pub fn keys(self) -> &'static [PropertyKey] {
        match self {
            Namespace::Device => device::ALL,
            Namespace::Digitizer => digitizer::ALL,
            Namespace::Screen => screen::ALL,
            Namespace::Stu => stu::ALL,
            Namespace::SmartPad => smart_pad::ALL,
            Namespace::WacomDriver => wacom_driver::ALL,
        }
    }
}

/// A device property key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyKey(Cow<'static, str>);

impl PropertyKey {
    /// Key from a string constant
    pub const fn from_static(key: &'static str) -> Self {
        Self(Cow::Borrowed(key))
    }

    /// Key from an owned string
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(Cow::Owned(key.into()))
    }

    /// The wire string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace derived from the key prefix, if any
    pub fn namespace(&self) -> Option<Namespace> {
        let (prefix, _) = self.0.split_once('.')?;
        Namespace::all().into_iter().find(|ns| ns.prefix() == prefix)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PropertyKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl AsRef<str> for PropertyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

macro_rules! keys {
    ($($(#[$doc:meta])* $name:ident = $value:literal;)*) => {
        $(
            $(#[$doc])*
            pub const $name: PropertyKey = PropertyKey::from_static($value);
        )*

        /// Every key of this namespace
        pub const ALL: &[PropertyKey] = &[$($name),*];
    };
}

/// Generic device keys
pub mod device {
    use super::PropertyKey;

    keys! {
        /// Device name
        NAME = "Device.Name";
        /// Serial number
        SERIAL_NUMBER = "Device.SerialNumber";
        /// Width in device units
        WIDTH = "Device.Width";
        /// Height in device units
        HEIGHT = "Device.Height";
        /// Orientation
        ORIENTATION = "Device.Orientation";
        /// Firmware version
        FIRMWARE_VERSION = "Device.FirmwareVersion";
        /// HID information
        HID_INFORMATION = "Device.HidInformation";
    }
}

/// Digitizer keys
pub mod digitizer {
    use super::PropertyKey;

    keys! {
        /// Width in device units
        WIDTH = "Digitizer.Width";
        /// Height in device units
        HEIGHT = "Digitizer.Height";
        /// Orientation
        ORIENTATION = "Digitizer.Orientation";
        /// Resolution
        RESOLUTION = "Digitizer.Resolution";
        /// Samples per second
        SAMPLING_RATE = "Digitizer.SamplingRate";
    }
}

/// Screen keys
pub mod screen {
    use super::PropertyKey;

    keys! {
        /// Screen type
        TYPE = "Screen.Type";
        /// Width in pixels
        WIDTH = "Screen.Width";
        /// Height in pixels
        HEIGHT = "Screen.Height";
        /// Orientation
        ORIENTATION = "Screen.Orientation";
        /// Horizontal resolution
        RESOLUTION_X = "Screen.ResolutionX";
        /// Vertical resolution
        RESOLUTION_Y = "Screen.ResolutionY";
    }
}

/// Signature tablet keys
pub mod stu {
    use super::PropertyKey;

    keys! {
        /// Status
        STATUS = "STU.Status";
        /// Unique id
        UID = "STU.Uid";
        /// Second unique id
        UID2 = "STU.Uid2";
        /// Electronic serial
        ESERIAL = "STU.Eserial";
        /// Background color
        BACKGROUND_COLOR = "STU.BackgroundColor";
        /// Backlight brightness
        BACKLIGHT_BRIGHTNESS = "STU.BacklightBrightness";
        /// Boot screen
        BOOT_SCREEN = "STU.BootScreen";
        /// Default mode
        DEFAULT_MODE = "STU.DefaultMode";
        /// Handwriting thickness and color
        HANDWRITING_THICKNESS_COLOR = "STU.HandwritingThicknessColor";
        /// Inking mode
        INKING_MODE = "STU.InkingMode";
        /// Ink threshold
        INK_THRESHOLD = "STU.InkThreshold";
        /// Rendering mode
        RENDERING_MODE = "STU.RenderingMode";
        /// Screen contrast
        SCREEN_CONTRAST = "STU.ScreenContrast";
        /// Handwriting display area
        HANDWRITING_DISPLAY_AREA = "STU.HandwritingDisplayArea";
    }
}

/// Smart pad keys
pub mod smart_pad {
    use super::PropertyKey;

    keys! {
        /// Device name
        DEVICE_NAME = "DeviceName";
        /// Serial number
        SERIAL_NUMBER = "SerialNumber";
        /// Width in device units
        WIDTH = "Width";
        /// Height in device units
        HEIGHT = "Height";
        /// Point size in micrometres
        POINT_SIZE = "PointSize";
        /// Battery level in percent
        BATTERY_LEVEL = "BatteryLevel";
        /// Battery level change reporting
        BATTERY_LEVEL_REPORT_CHANGE = "SmartPad.BatteryLevelReportChange";
        /// Battery state, see [`BatteryState`](super::BatteryState)
        BATTERY_STATE = "SmartPad.BatteryState";
        /// Connection interval
        CONNECTION_INTERVAL = "SmartPad.ConnectionInterval";
        /// Data session accept duration
        DATA_SESSION_ACCEPT_DURATION = "SmartPad.DataSessionAcceptDuration";
        /// Data encryption switch
        ENABLE_DATA_ENCRYPTION = "SmartPad.EnableDataEncryption";
        /// File transfer reporting type
        FILE_TRANSFER_SERVICE_REPORTING_TYPE = "SmartPad.FileTransferServiceReportingType";
        /// Firmware protocol level
        FIRMWARE_PROTOCOL_LEVEL = "SmartPad.FirmwareProtocolLevel";
        /// Hover output
        HOVERING_DATA_OUTPUT = "SmartPad.HoveringDataOutput";
        /// Pen detected LED mode
        PEN_DETECTED_INDICATION_LED_MODE = "SmartPad.PenDetectedIndicationLedMode";
        /// Pen detected sound effect
        PEN_DETECTED_INDICATION_SOUND_EFFECT = "SmartPad.PenDetectedIndicationSoundEffect";
        /// Pen detected sound volume
        PEN_DETECTED_INDICATION_SOUND_VOL = "SmartPad.PenDetectedIndicationSoundVol";
        /// Pen detected notification
        PEN_DETECTED_NOTIFICATION_FLAG = "SmartPad.PenDetectedNotificationFlag";
        /// Real-time reporting type
        REAL_TIME_SERVICE_REPORTING_TYPE = "SmartPad.RealTimeServiceReportingType";
        /// Data session events
        REPORT_DATA_SESSION_EVENTS = "SmartPad.ReportDataSessionEvents";
        /// User confirmation start acknowledge duration
        USER_CONFIRMATION_START_ACK_DURATION = "SmartPad.UserConfirmationStartAckDuration";
        /// User confirmation timeout
        USER_CONFIRMATION_TIMEOUT = "SmartPad.UserConfirmationTimeout";
    }
}

/// Desktop driver keys
pub mod wacom_driver {
    use super::PropertyKey;

    keys! {
        /// System id
        SYSTEM_ID = "WacomDriver.SystemId";
        /// Unique id
        UNIQUE_ID = "WacomDriver.UniqueId";
        /// Friendly name
        FRIENDLY_NAME = "WacomDriver.FriendlyName";
        /// Model number
        MODEL_NUMBER = "WacomDriver.ModelNumber";
        /// USB vendor id
        ID_VENDOR = "WacomDriver.IdVendor";
        /// USB product id
        ID_PRODUCT = "WacomDriver.IdProduct";
        /// BCD version
        BCD_VERSION = "WacomDriver.BcdVersion";
        /// Serial number
        SERIAL_NUMBER = "WacomDriver.SerialNumber";
        /// Pen firmware version, see [`FirmwareVersion`](super::FirmwareVersion)
        PEN_FIRMWARE_VERSION = "WacomDriver.PenFirmwareVersion";
        /// Connection kind
        CONNECTION = "WacomDriver.Connection";
        /// Link encryption flag
        IS_ENCRYPTED = "WacomDriver.IsEncrypted";
        /// Tablet extent, see [`MappingF`](super::MappingF)
        TABLET_EXTENT = "WacomDriver.TabletExtent";
        /// Display extent, see [`MappingF`](super::MappingF)
        DISPLAY_EXTENT = "WacomDriver.DisplayExtent";
        /// Display
        DISPLAY = "WacomDriver.Display";
        /// Screen id
        SCREEN_ID = "WacomDriver.ScreenId";
        /// Pen capabilities, see [`DriverCapability`](super::DriverCapability)
        CAPABILITIES = "WacomDriver.Capabilities";
        /// Report rate
        POINTS_PER_SECOND = "WacomDriver.PointsPerSecond";
    }
}

pub(crate) fn mismatch(expected: &str, value: &Value) -> DeviceError {
    DeviceError::InvalidValueType(
        expected.to_string(),
        "object".to_string(),
        value.kind().to_string(),
    )
}

fn float_field(value: &Value, name: &str, ty: &str) -> Result<f64, DeviceError> {
    value
        .field(name)
        .and_then(Value::as_float)
        .ok_or_else(|| DeviceError::InvalidValueType(format!("{}.{}", ty, name), "number".into(), "missing".into()))
}

/// Smart pad battery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge in percent
    pub percentage: u8,
    /// Whether the pad is on a charger
    pub is_charging: bool,
}

impl TryFrom<&Value> for BatteryState {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        if value.as_object().is_none() {
            return Err(mismatch("BatteryState", value));
        }
        let percentage = value
            .field("Percentage")
            .and_then(Value::as_u32)
            .and_then(|p| u8::try_from(p).ok())
            .ok_or_else(|| mismatch("BatteryState.Percentage", value))?;
        let is_charging = value
            .field("IsCharging")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            percentage,
            is_charging,
        })
    }
}

impl From<BatteryState> for Value {
    fn from(state: BatteryState) -> Self {
        object([
            ("Percentage", Value::from(state.percentage)),
            ("IsCharging", Value::from(state.is_charging)),
        ])
    }
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let charging = if self.is_charging {
            "Charging"
        } else {
            "Not charging"
        };
        write!(f, "{}% {}", self.percentage, charging)
    }
}

/// Pen firmware version as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion(pub String);

impl TryFrom<&Value> for FirmwareVersion {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(Self(s.clone())),
            Value::Object(_) => value
                .field("AsString")
                .and_then(Value::as_str)
                .map(|s| Self(s.to_string()))
                .ok_or_else(|| mismatch("FirmwareVersion", value)),
            _ => Err(mismatch("FirmwareVersion", value)),
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A numeric range with resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeF {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Units per step
    pub resolution: f64,
}

impl TryFrom<&Value> for RangeF {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Ok(Self {
            min: float_field(value, "Min", "RangeF")?,
            max: float_field(value, "Max", "RangeF")?,
            resolution: float_field(value, "Resolution", "RangeF")?,
        })
    }
}

impl From<RangeF> for Value {
    fn from(r: RangeF) -> Self {
        object([
            ("Min", Value::from(r.min)),
            ("Max", Value::from(r.max)),
            ("Resolution", Value::from(r.resolution)),
        ])
    }
}

impl fmt::Display for RangeF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Min={} Max={} Res={}}}", self.min, self.max, self.resolution)
    }
}

/// A floating-point rectangle
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectF {
    /// Left
    pub x: f64,
    /// Top
    pub y: f64,
    /// Width
    pub width: f64,
    /// Height
    pub height: f64,
}

impl TryFrom<&Value> for RectF {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Ok(Self {
            x: float_field(value, "X", "RectF")?,
            y: float_field(value, "Y", "RectF")?,
            width: float_field(value, "Width", "RectF")?,
            height: float_field(value, "Height", "RectF")?,
        })
    }
}

impl From<RectF> for Value {
    fn from(r: RectF) -> Self {
        object([
            ("X", Value::from(r.x)),
            ("Y", Value::from(r.y)),
            ("Width", Value::from(r.width)),
            ("Height", Value::from(r.height)),
        ])
    }
}

impl fmt::Display for RectF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{X={} Y={} W={} H={}}}", self.x, self.y, self.width, self.height)
    }
}

/// Mapping of a tablet or display extent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingF {
    /// Raw sensor extent
    pub raw: RectF,
    /// Active area
    pub active: RectF,
    /// Physical size
    pub physical: RectF,
    /// Orientation name
    pub orientation: String,
}

impl TryFrom<&Value> for MappingF {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let rect = |name: &str| -> Result<RectF, DeviceError> {
            value
                .field(name)
                .ok_or_else(|| mismatch("MappingF", value))
                .and_then(RectF::try_from)
        };
        Ok(Self {
            raw: rect("Raw")?,
            active: rect("Active")?,
            physical: rect("Physical")?,
            orientation: value
                .field("Orientation")
                .map(|o| o.to_string())
                .unwrap_or_default(),
        })
    }
}

impl fmt::Display for MappingF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Raw={} Active={} Physical={} Orientation={}",
            self.raw, self.active, self.physical, self.orientation
        )
    }
}

/// A named pen capability with its range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverCapability {
    /// Capability name (Pressure, TiltX, ...)
    pub name: String,
    /// Reported range
    pub range: RangeF,
}

impl TryFrom<&Value> for DriverCapability {
    type Error = DeviceError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let name = value
            .field("Name")
            .and_then(Value::as_str)
            .ok_or_else(|| mismatch("DriverCapability", value))?;
        let range = value
            .field("Range")
            .ok_or_else(|| mismatch("DriverCapability", value))
            .and_then(RangeF::try_from)?;
        Ok(Self {
            name: name.to_string(),
            range,
        })
    }
}

impl fmt::Display for DriverCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.range)
    }
}

fn format_capabilities(value: &Value) -> Option<String> {
    let items = value.as_array()?;
    let caps = items
        .iter()
        .map(DriverCapability::try_from)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    Some(
        caps.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Render a property value for display
///
/// Keys with a structured type use that type's formatter; anything else,
/// including values that fail to convert, falls back to the plain value.
pub fn format_property(key: &PropertyKey, value: &Value) -> String {
    let typed = if *key == smart_pad::BATTERY_STATE {
        BatteryState::try_from(value).ok().map(|v| v.to_string())
    } else if *key == wacom_driver::PEN_FIRMWARE_VERSION {
        FirmwareVersion::try_from(value).ok().map(|v| v.to_string())
    } else if *key == wacom_driver::TABLET_EXTENT || *key == wacom_driver::DISPLAY_EXTENT {
        MappingF::try_from(value).ok().map(|v| v.to_string())
    } else if *key == wacom_driver::CAPABILITIES {
        format_capabilities(value)
    } else {
        None
    };
    typed.unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces() {
        assert_eq!(device::NAME.namespace(), Some(Namespace::Device));
        assert_eq!(stu::UID.namespace(), Some(Namespace::Stu));
        assert_eq!(smart_pad::WIDTH.namespace(), None);
        assert_eq!(smart_pad::BATTERY_STATE.namespace(), Some(Namespace::SmartPad));
        assert_eq!(PropertyKey::from("Vendor.Thing").namespace(), None);

        for ns in Namespace::all() {
            for key in ns.keys() {
                if key.as_str().contains('.') {
                    assert_eq!(key.namespace(), Some(ns), "{}", key);
                }
            }
        }
        assert_eq!(wacom_driver::ALL.len(), 17);
    }

    #[test]
    fn test_owned_and_static_keys_compare_equal() {
        assert_eq!(PropertyKey::new("PointSize"), smart_pad::POINT_SIZE);
    }

    #[test]
    fn test_battery_state() {
        let value = Value::from(BatteryState {
            percentage: 80,
            is_charging: true,
        });
        let state = BatteryState::try_from(&value).unwrap();
        assert_eq!(state.to_string(), "80% Charging");
        assert_eq!(
            format_property(&smart_pad::BATTERY_STATE, &value),
            "80% Charging"
        );

        assert!(BatteryState::try_from(&Value::from(3u32)).is_err());
    }

    #[test]
    fn test_mapping_format() {
        let rect = |w: f64, h: f64| {
            Value::from(RectF {
                x: 0.0,
                y: 0.0,
                width: w,
                height: h,
            })
        };
        let value = object([
            ("Raw", rect(21600.0, 14800.0)),
            ("Active", rect(21600.0, 14800.0)),
            ("Physical", rect(216.0, 148.0)),
            ("Orientation", Value::from("Landscape")),
        ]);
        assert_eq!(
            format_property(&wacom_driver::TABLET_EXTENT, &value),
            "Raw={X=0 Y=0 W=21600 H=14800} Active={X=0 Y=0 W=21600 H=14800} \
             Physical={X=0 Y=0 W=216 H=148} Orientation=Landscape"
        );
    }

    #[test]
    fn test_capabilities_format() {
        let cap = |name: &str, max: f64| {
            object([
                ("Name", Value::from(name)),
                (
                    "Range",
                    Value::from(RangeF {
                        min: 0.0,
                        max,
                        resolution: 1.0,
                    }),
                ),
            ])
        };
        let value = Value::Array(vec![cap("Pressure", 8191.0), cap("TiltX", 60.0)]);
        assert_eq!(
            format_property(&wacom_driver::CAPABILITIES, &value),
            "Pressure={Min=0 Max=8191 Res=1}, TiltX={Min=0 Max=60 Res=1}"
        );
    }

    #[test]
    fn test_plain_and_fallback_format() {
        assert_eq!(format_property(&device::NAME, &Value::from("Slate")), "Slate");
        assert_eq!(format_property(&device::NAME, &Value::Null), "N/A");
        assert_eq!(
            format_property(&wacom_driver::PEN_FIRMWARE_VERSION, &Value::from("1.2.3")),
            "1.2.3"
        );
        assert_eq!(
            format_property(&smart_pad::BATTERY_STATE, &Value::from(12u32)),
            "12"
        );
    }
}
