//! Simulated Peripheral
//!
//! An in-process [`Transport`] that behaves like a HeatFlow sensor. It records every
//! request and, when given the link's event sender, answers them the way the radio
//! stack would: connection progress, read results, write acknowledgements and
//! descriptor confirmations.
//!
//! Clones share state, so a test can keep one handle while the device owns another.

use crate::domain::models::AdsValueFrame;
use crate::infrastructure::bluetooth::protocol::{
    CHAR_ADS_CONFIGURATION, CHAR_ADS_VALUES, CHAR_BATTERY_LEVEL, CHAR_COMMAND,
    CHAR_FIRMWARE_REVISION, CHAR_HARDWARE_REVISION, CHAR_MANUFACTURER_NAME, CHAR_MODEL_NUMBER,
    CHAR_SERIAL_NUMBER, CHAR_SOFTWARE_REVISION, GATT_INSUFFICIENT_AUTHORIZATION, SERVICE_BATTERY,
    SERVICE_DEVICE_INFORMATION, SERVICE_SENSOR,
};
use crate::infrastructure::bluetooth::transport::{
    AdapterEvent, BondingEvent, CharacteristicHandle, ConnectionEvent, ConnectionFailure,
    GattEvent, GattStatus, LinkEvent, LinkEventSender, ServiceHandle, Transport, WriteType,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// One request seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect { address: String, timeout: Duration },
    Disconnect,
    Read(Uuid),
    Write { characteristic: Uuid, value: Vec<u8> },
    NotificationConfig { characteristic: Uuid, enable: bool },
    CreateBond,
    RemoveBond,
    ClearGattCache,
}

struct SimulatorState {
    adapter_ready: bool,
    services: Vec<ServiceHandle>,
    values: HashMap<Uuid, Vec<u8>>,
    calls: Vec<TransportCall>,
    events: Option<LinkEventSender>,
    ack_writes: bool,
    requires_bond: bool,
    bond_succeeds: bool,
    bonded: bool,
    connected: bool,
    in_range: bool,
}

#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatorState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::heatflow()
    }
}

impl SimulatedTransport {
    /// A peripheral exposing the three mandatory services with plausible contents.
    pub fn heatflow() -> Self {
        let services = vec![
            build_service(SERVICE_BATTERY, 0x0010, &[CHAR_BATTERY_LEVEL]),
            build_service(
                SERVICE_DEVICE_INFORMATION,
                0x0020,
                &[
                    CHAR_MANUFACTURER_NAME,
                    CHAR_MODEL_NUMBER,
                    CHAR_SERIAL_NUMBER,
                    CHAR_HARDWARE_REVISION,
                    CHAR_SOFTWARE_REVISION,
                    CHAR_FIRMWARE_REVISION,
                ],
            ),
            build_service(
                SERVICE_SENSOR,
                0x0030,
                &[CHAR_ADS_VALUES, CHAR_ADS_CONFIGURATION, CHAR_COMMAND],
            ),
        ];

        let values = HashMap::from([
            (CHAR_BATTERY_LEVEL, vec![87]),
            (CHAR_MANUFACTURER_NAME, b"HES-SO Valais".to_vec()),
            (CHAR_MODEL_NUMBER, b"HeatFlow".to_vec()),
            (CHAR_SERIAL_NUMBER, b"HF-000042".to_vec()),
            (CHAR_HARDWARE_REVISION, b"B\0".to_vec()),
            (CHAR_SOFTWARE_REVISION, b"1.0.3".to_vec()),
            (CHAR_FIRMWARE_REVISION, b"2.1.0".to_vec()),
        ]);

        Self {
            state: Arc::new(Mutex::new(SimulatorState {
                adapter_ready: true,
                services,
                values,
                calls: Vec::new(),
                events: None,
                ack_writes: true,
                requires_bond: false,
                bond_succeeds: true,
                bonded: false,
                connected: false,
                in_range: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer requests by sending events to `sender`. Without it the simulator only
    /// records calls and the caller injects events by hand.
    pub fn respond_to(self, sender: LinkEventSender) -> Self {
        self.lock().events = Some(sender);
        self
    }

    pub fn without_service(self, uuid: Uuid) -> Self {
        self.lock().services.retain(|s| s.uuid != uuid);
        self
    }

    pub fn without_characteristic(self, uuid: Uuid) -> Self {
        for service in self.lock().services.iter_mut() {
            service.characteristics.retain(|c| c.uuid != uuid);
        }
        self
    }

    /// Leave writes unacknowledged, to exercise response timeouts.
    pub fn set_ack_writes(&self, ack: bool) {
        self.lock().ack_writes = ack;
    }

    /// Reads and descriptor writes fail with insufficient authorization until bonded.
    pub fn set_requires_bond(&self, required: bool) {
        self.lock().requires_bond = required;
    }

    pub fn set_bond_succeeds(&self, succeeds: bool) {
        self.lock().bond_succeeds = succeeds;
    }

    /// Out of range, connection attempts report a timeout instead of connecting.
    pub fn set_in_range(&self, in_range: bool) {
        self.lock().in_range = in_range;
    }

    pub fn set_adapter_ready(&self, ready: bool) {
        self.lock().adapter_ready = ready;
    }

    pub fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.lock().values.insert(characteristic, value);
    }

    pub fn is_bonded(&self) -> bool {
        self.lock().bonded
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Handle of a characteristic as the simulator exposes it.
    pub fn handle(&self, characteristic: Uuid) -> Option<CharacteristicHandle> {
        self.lock()
            .services
            .iter()
            .find_map(|s| s.characteristic(characteristic))
    }

    /// Push a raw notification on the ADS values characteristic.
    pub fn notify_values_raw(&self, bytes: &[u8]) {
        if let Some(characteristic) = self.handle(CHAR_ADS_VALUES) {
            self.emit(LinkEvent::Gatt(GattEvent::CharacteristicChanged {
                characteristic,
                value: bytes.to_vec(),
            }));
        }
    }

    pub fn notify_values(&self, frame: &AdsValueFrame) {
        self.notify_values_raw(&encode_values(frame));
    }

    pub fn notify_battery(&self, level: u8) {
        self.set_value(CHAR_BATTERY_LEVEL, vec![level]);
        if let Some(characteristic) = self.handle(CHAR_BATTERY_LEVEL) {
            self.emit(LinkEvent::Gatt(GattEvent::CharacteristicChanged {
                characteristic,
                value: vec![level],
            }));
        }
    }

    /// The peripheral drops the link with `status`.
    pub fn drop_link(&self, status: i32) {
        self.lock().connected = false;
        self.emit(LinkEvent::Connection(ConnectionEvent::Disconnected { status }));
    }

    pub fn power_off(&self) {
        {
            let mut state = self.lock();
            state.adapter_ready = false;
            state.connected = false;
        }
        self.emit(LinkEvent::Adapter(AdapterEvent::Off));
    }

    fn emit(&self, event: LinkEvent) {
        let sender = self.lock().events.clone();
        if let Some(sender) = sender {
            trace!("Simulator -> {:?}", event);
            let _ = sender.send(event);
        }
    }

    /// Attribute access is refused until the link is bonded.
    fn is_locked(&self) -> bool {
        let state = self.lock();
        state.requires_bond && !state.bonded
    }

    fn record(&self, call: TransportCall) {
        debug!("Simulator <- {:?}", call);
        self.lock().calls.push(call);
    }
}

/// Encode a values frame the way the peripheral firmware does.
pub fn encode_values(frame: &AdsValueFrame) -> [u8; 5] {
    let header = (frame.channel as u8 & 0x01)
        | ((frame.mux as u8 & 0x07) << 1)
        | ((frame.pga as u8 & 0x07) << 4)
        | ((frame.is_float as u8) << 7);
    let raw = frame.raw.unwrap_or(0).to_le_bytes();
    [header, raw[0], raw[1], raw[2], raw[3]]
}

fn build_service(uuid: Uuid, first_handle: u16, characteristics: &[Uuid]) -> ServiceHandle {
    ServiceHandle {
        uuid,
        characteristics: characteristics
            .iter()
            .zip(first_handle + 1..)
            .map(|(c, handle)| CharacteristicHandle {
                service: uuid,
                uuid: *c,
                handle,
            })
            .collect(),
    }
}

impl Transport for SimulatedTransport {
    fn is_adapter_ready(&self) -> bool {
        self.lock().adapter_ready
    }

    fn connect(&mut self, address: &str, timeout: Duration) -> bool {
        self.record(TransportCall::Connect {
            address: address.to_string(),
            timeout,
        });
        if !self.is_adapter_ready() {
            return false;
        }
        if !self.lock().in_range {
            // The radio stack's timeout is reported straight away
            for event in [
                ConnectionEvent::Connecting,
                ConnectionEvent::Failed(ConnectionFailure::Timeout),
            ] {
                self.emit(LinkEvent::Connection(event));
            }
            return true;
        }
        self.lock().connected = true;
        for event in [
            ConnectionEvent::Connecting,
            ConnectionEvent::Connected,
            ConnectionEvent::ServicesDiscovering,
            ConnectionEvent::ServicesDiscovered,
        ] {
            self.emit(LinkEvent::Connection(event));
        }
        true
    }

    fn disconnect(&mut self) -> bool {
        self.record(TransportCall::Disconnect);
        let was_connected = std::mem::replace(&mut self.lock().connected, false);
        if was_connected {
            self.emit(LinkEvent::Connection(ConnectionEvent::Disconnected {
                status: 0,
            }));
        }
        true
    }

    fn resolve_service(&self, uuid: Uuid) -> Option<ServiceHandle> {
        self.lock().services.iter().find(|s| s.uuid == uuid).cloned()
    }

    fn queue_read(&mut self, characteristic: &CharacteristicHandle) -> bool {
        self.record(TransportCall::Read(characteristic.uuid));
        let locked = self.is_locked();
        let value = self.lock().values.get(&characteristic.uuid).cloned();

        let event = if locked {
            GattEvent::Error {
                status: GattStatus(GATT_INSUFFICIENT_AUTHORIZATION),
            }
        } else {
            GattEvent::CharacteristicRead {
                characteristic: *characteristic,
                value: value.unwrap_or_default(),
                status: GattStatus::SUCCESS,
            }
        };
        self.emit(LinkEvent::Gatt(event));
        true
    }

    fn queue_write(
        &mut self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        self.record(TransportCall::Write {
            characteristic: characteristic.uuid,
            value: value.to_vec(),
        });
        let ack = self.lock().ack_writes;
        if ack && write_type == WriteType::WithResponse {
            self.emit(LinkEvent::Gatt(GattEvent::CharacteristicWritten {
                characteristic: *characteristic,
                value: value.to_vec(),
                status: GattStatus::SUCCESS,
            }));
        }
        true
    }

    fn write_notification_config(
        &mut self,
        characteristic: &CharacteristicHandle,
        enable: bool,
    ) -> bool {
        self.record(TransportCall::NotificationConfig {
            characteristic: characteristic.uuid,
            enable,
        });
        let event = if self.is_locked() {
            GattEvent::Error {
                status: GattStatus(GATT_INSUFFICIENT_AUTHORIZATION),
            }
        } else {
            GattEvent::DescriptorWritten {
                characteristic: *characteristic,
                notifications_enabled: enable,
                status: GattStatus::SUCCESS,
            }
        };
        self.emit(LinkEvent::Gatt(event));
        true
    }

    fn create_bond(&mut self) -> bool {
        self.record(TransportCall::CreateBond);
        let succeeds = self.lock().bond_succeeds;
        self.emit(LinkEvent::Bonding(BondingEvent::Bonding));
        if succeeds {
            self.lock().bonded = true;
            self.emit(LinkEvent::Bonding(BondingEvent::Bonded));
        } else {
            self.emit(LinkEvent::Bonding(BondingEvent::NotBonded));
        }
        true
    }

    fn remove_bond(&mut self) -> bool {
        self.record(TransportCall::RemoveBond);
        self.lock().bonded = false;
        true
    }

    fn clear_gatt_cache(&mut self) {
        self.record(TransportCall::ClearGattCache);
    }
}
