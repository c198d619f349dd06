//! Transport Boundary
//!
//! The radio stack is an external collaborator. It accepts or rejects requests
//! synchronously and reports every outcome later as a [`LinkEvent`] on the link's
//! event channel.

use super::timer::TimerToken;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport-assigned reference to one characteristic of a resolved service.
///
/// Handles are only valid for the connection that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    /// ATT attribute handle
    pub handle: u16,
}

/// A service resolved on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicHandle>,
}

impl ServiceHandle {
    pub fn characteristic(&self, uuid: Uuid) -> Option<CharacteristicHandle> {
        self.characteristics.iter().find(|c| c.uuid == uuid).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// ATT status reported with GATT completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Timeout,
    ServiceDiscovery { status: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    ServicesDiscovering,
    ServicesDiscovered,
    Disconnected { status: i32 },
    Failed(ConnectionFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondingEvent {
    Bonding,
    Bonded,
    NotBonded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Completion of a `queue_read`
    CharacteristicRead {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Peripheral-initiated notification
    CharacteristicChanged {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    /// Acknowledgement of a `queue_write`, echoing the written value
    CharacteristicWritten {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Completion of a `write_notification_config`
    DescriptorWritten {
        characteristic: CharacteristicHandle,
        notifications_enabled: bool,
        status: GattStatus,
    },
    Error { status: GattStatus },
}

impl GattEvent {
    pub fn characteristic(&self) -> Option<&CharacteristicHandle> {
        match self {
            Self::CharacteristicRead { characteristic, .. }
            | Self::CharacteristicChanged { characteristic, .. }
            | Self::CharacteristicWritten { characteristic, .. }
            | Self::DescriptorWritten { characteristic, .. } => Some(characteristic),
            Self::Error { .. } => None,
        }
    }
}

/// Everything a [`HeatFlowDevice`](super::HeatFlowDevice) reacts to, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connection(ConnectionEvent),
    Adapter(AdapterEvent),
    Bonding(BondingEvent),
    Gatt(GattEvent),
    /// Raised by the sensor session's response timer
    ResponseTimeout(TimerToken),
    /// Raised by the reconnection backoff timer
    ReconnectDue(TimerToken),
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Radio stack operations consumed by the link engine.
///
/// Every method returns immediately. `true` only means the request was accepted; the
/// outcome arrives as a [`LinkEvent`].
pub trait Transport {
    fn is_adapter_ready(&self) -> bool;

    fn connect(&mut self, address: &str, timeout: Duration) -> bool;

    fn disconnect(&mut self) -> bool;

    fn resolve_service(&self, uuid: Uuid) -> Option<ServiceHandle>;

    fn queue_read(&mut self, characteristic: &CharacteristicHandle) -> bool;

    fn queue_write(
        &mut self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> bool;

    /// Write the client characteristic configuration descriptor.
    fn write_notification_config(
        &mut self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> bool;

    fn create_bond(&mut self) -> bool;

    fn remove_bond(&mut self) -> bool;

    fn clear_gatt_cache(&mut self);
}
