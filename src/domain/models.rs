use crate::domain::error::{FrameError, LinkError};
use std::fmt;

/// Sensor reading pushed by the peripheral on the ADS values characteristic.
///
/// Fields keep the peripheral's signed representation so a rejected frame can be
/// reported with sentinel values (`-1`, `false`, `None`), see [`Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsValueFrame {
    /// ADS channel (0 or 1)
    pub channel: i8,
    /// Input multiplexer setting (0..=7)
    pub mux: i8,
    /// Programmable gain amplifier setting (0..=7)
    pub pga: i8,
    /// `raw` carries the bits of an IEEE-754 f32 instead of an integer
    pub is_float: bool,
    pub raw: Option<i32>,
}

impl Default for AdsValueFrame {
    fn default() -> Self {
        Self {
            channel: -1,
            mux: -1,
            pga: -1,
            is_float: false,
            raw: None,
        }
    }
}

impl AdsValueFrame {
    /// Reading as a float, honoring the `is_float` flag.
    pub fn value(&self) -> Option<f64> {
        self.raw.map(|raw| {
            if self.is_float {
                f32::from_bits(raw as u32) as f64
            } else {
                raw as f64
            }
        })
    }
}

/// ADS configuration register echoed by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsConfigFrame {
    pub index: i8,
    pub config: i16,
}

impl Default for AdsConfigFrame {
    fn default() -> Self {
        Self {
            index: -1,
            config: -1,
        }
    }
}

/// Commands understood by the sensor/control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SensorCommand {
    /// Stop any running measurement
    Stop = 0,
    /// Start the heat-flow measurement cycle
    Start = 1,
    /// Trigger one ADC conversion
    SingleAdc = 2,
    /// Continuous ADC conversions
    ContinuousAdc = 3,
    /// Read the on-board temperature sensor
    Temperature = 4,
}

impl SensorCommand {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SensorCommand {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Stop),
            1 => Ok(Self::Start),
            2 => Ok(Self::SingleAdc),
            3 => Ok(Self::ContinuousAdc),
            4 => Ok(Self::Temperature),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertisingMode {
    /// No whitelist
    #[default]
    GeneralDiscovery,
    /// Only devices in the peripheral's whitelist may connect
    LimitedDiscovery,
}

/// Vendor block of the advertisement (company identifier 0x025A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManufacturerData {
    pub model_id: u16,
    pub software_revision: u16,
    pub hardware_revision: u16,
}

impl ManufacturerData {
    pub const COMPANY_ID: u16 = 0x025A;

    /// Parse the little-endian manufacturer block. Missing trailing fields stay zero.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut words = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        Self {
            model_id: words.next().unwrap_or(0),
            software_revision: words.next().unwrap_or(0),
            hardware_revision: words.next().unwrap_or(0),
        }
    }

    /// Parse one manufacturer-specific advertisement entry, ignoring other vendors.
    pub fn from_advertisement(company_id: u16, bytes: &[u8]) -> Option<Self> {
        (company_id == Self::COMPANY_ID).then(|| Self::parse(bytes))
    }
}

/// Peripheral as seen at discovery time. The address is its identity and never changes;
/// RSSI and advertising mode are refreshed on rediscovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertising_mode: AdvertisingMode,
    pub manufacturer_data: Option<ManufacturerData>,
}

impl PeripheralDescriptor {
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name,
            rssi,
            advertising_mode: AdvertisingMode::default(),
            manufacturer_data: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Apply a fresh advertisement for the same peripheral.
    pub fn refresh(&mut self, rssi: i16, advertising_mode: AdvertisingMode) {
        self.rssi = rssi;
        self.advertising_mode = advertising_mode;
    }
}

impl fmt::Display for PeripheralDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device '{}' [{}] - {:?}",
            self.display_name(),
            self.address,
            self.advertising_mode
        )
    }
}

/// Lifecycle of the link to one peripheral.
///
/// Error states are reported once and then collapse to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `status` is 0 for a user-requested disconnect, the link-layer reason otherwise
    Disconnected { status: i32 },
    Connecting,
    /// Link up, services being resolved and notifications being enabled
    Initializing,
    Ready,
    ErrorNotValid,
    ErrorTimeout,
    ErrorDiscoveringServices { status: i32 },
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected { status: 0 }
    }
}

impl ConnectionState {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ErrorNotValid | Self::ErrorTimeout | Self::ErrorDiscoveringServices { .. }
        )
    }

    pub fn status_code(&self) -> i32 {
        match self {
            Self::Disconnected { status } | Self::ErrorDiscoveringServices { status } => *status,
            _ => 0,
        }
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected { .. }) => true,
            (Disconnected { .. }, Connecting) => true,
            (Connecting, Initializing) => true,
            (Initializing, Ready) => true,
            (Connecting | Initializing | Ready, next) if next.is_error() => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Disconnected { .. } => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "CONNECTED_READY",
            Self::ErrorNotValid => "ERROR_DEVICE_NOT_VALID",
            Self::ErrorTimeout => "ERROR_TIMEOUT",
            Self::ErrorDiscoveringServices { .. } => "ERROR_DISCOVERING_SERVICES",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.status_code())
    }
}

/// Battery level as known by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Percent(u8),
    /// No cached value yet; a read has been requested
    Pending,
    /// No battery session (or characteristic) to ask
    Unavailable,
}

/// Device information string characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceInfoField {
    ManufacturerName,
    ModelNumber,
    SerialNumber,
    HardwareRevision,
    SoftwareRevision,
    FirmwareRevision,
}

impl DeviceInfoField {
    /// Read order used when fetching everything.
    pub const ALL: [DeviceInfoField; 6] = [
        Self::ManufacturerName,
        Self::ModelNumber,
        Self::SerialNumber,
        Self::HardwareRevision,
        Self::SoftwareRevision,
        Self::FirmwareRevision,
    ];

    /// Fields whose updates are published. The software revision is read and cached
    /// but its notification is suppressed.
    pub fn is_published(self) -> bool {
        !matches!(self, Self::SoftwareRevision)
    }
}

/// Notifications fanned out to subscribers of a [`HeatFlowDevice`](crate::infrastructure::bluetooth::HeatFlowDevice).
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A transport has been bound and the service sessions exist
    TransportBound,
    StateChanged(ConnectionState),
    /// The GATT cache was cleared after a device was found to be invalid
    RecoveryHint,
    AdapterOff,
    DeviceInformationChanged {
        field: DeviceInfoField,
        value: String,
    },
    BatteryLevelChanged(u8),
    BatteryNotificationChanged(bool),
    SensorValues(AdsValueFrame),
    SensorNotificationChanged(bool),
    ConfigurationChanged(AdsConfigFrame),
    CommandAcknowledged(SensorCommand),
    ProtocolError(LinkError),
}
