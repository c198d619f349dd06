use super::{bind_characteristic, ServiceSession, SessionState};
use crate::domain::models::DeviceInfoField;
use crate::infrastructure::bluetooth::event_bus::{EventBus, SubscriberId};
use crate::infrastructure::bluetooth::protocol::{
    CHAR_FIRMWARE_REVISION, CHAR_HARDWARE_REVISION, CHAR_MANUFACTURER_NAME, CHAR_MODEL_NUMBER,
    CHAR_SERIAL_NUMBER, CHAR_SOFTWARE_REVISION, SERVICE_DEVICE_INFORMATION,
};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, GattEvent, ServiceHandle, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Placeholder returned while a field has not been read yet.
pub const UNKNOWN_VALUE: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInformationEvent {
    pub field: DeviceInfoField,
    pub value: String,
}

pub fn characteristic_uuid(field: DeviceInfoField) -> Uuid {
    match field {
        DeviceInfoField::ManufacturerName => CHAR_MANUFACTURER_NAME,
        DeviceInfoField::ModelNumber => CHAR_MODEL_NUMBER,
        DeviceInfoField::SerialNumber => CHAR_SERIAL_NUMBER,
        DeviceInfoField::HardwareRevision => CHAR_HARDWARE_REVISION,
        DeviceInfoField::SoftwareRevision => CHAR_SOFTWARE_REVISION,
        DeviceInfoField::FirmwareRevision => CHAR_FIRMWARE_REVISION,
    }
}

#[derive(Debug, Default)]
struct FieldSlot {
    handle: Option<CharacteristicHandle>,
    value: Option<String>,
    requested: bool,
}

/// Adopted device information service. Every field is a read-only UTF-8 string that
/// never changes during a connection, so each one is fetched at most once.
pub struct DeviceInformationSession {
    state: SessionState,
    slots: [(DeviceInfoField, FieldSlot); 6],
    bus: EventBus<DeviceInformationEvent>,
}

impl Default for DeviceInformationSession {
    fn default() -> Self {
        Self {
            state: SessionState::Invalid,
            slots: DeviceInfoField::ALL.map(|field| (field, FieldSlot::default())),
            bus: EventBus::new(),
        }
    }
}

impl DeviceInformationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<DeviceInformationEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    fn slot_mut(&mut self, field: DeviceInfoField) -> &mut FieldSlot {
        // ALL covers every variant
        let index = DeviceInfoField::ALL
            .iter()
            .position(|f| *f == field)
            .unwrap_or_default();
        &mut self.slots[index].1
    }

    pub fn cached(&self, field: DeviceInfoField) -> Option<&str> {
        self.slots
            .iter()
            .find(|(f, _)| *f == field)
            .and_then(|(_, slot)| slot.value.as_deref())
    }

    /// Cached value of `field`, or [`UNKNOWN_VALUE`] after requesting a read.
    pub fn value(&mut self, transport: &mut dyn Transport, field: DeviceInfoField) -> String {
        if let Some(value) = self.cached(field) {
            return value.to_string();
        }
        self.read_field(transport, field);
        UNKNOWN_VALUE.to_string()
    }

    /// Fetch every field not cached yet and re-announce the cached ones.
    ///
    /// Stops at the first field whose characteristic is missing (or whose read the
    /// transport refuses) and returns `false`; later fields are left for the next call.
    pub fn read_all(&mut self, transport: &mut dyn Transport) -> bool {
        for field in DeviceInfoField::ALL {
            let cached = self.cached(field).map(str::to_string);
            match cached {
                Some(value) => self.announce(field, value),
                None => {
                    if !self.read_field(transport, field) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn read_field(&mut self, transport: &mut dyn Transport, field: DeviceInfoField) -> bool {
        let slot = self.slot_mut(field);
        let Some(handle) = slot.handle else {
            warn!("Device information field {:?} has no characteristic", field);
            return false;
        };

        if !slot.requested {
            if !transport.queue_read(&handle) {
                warn!("Read of {:?} rejected by transport", field);
                return false;
            }
            slot.requested = true;
        }
        true
    }

    fn announce(&mut self, field: DeviceInfoField, value: String) {
        if field.is_published() {
            self.bus.publish(DeviceInformationEvent { field, value });
        } else {
            debug!("{:?} = {} (not published)", field, value);
        }
    }
}

/// Decode a string characteristic: lossy UTF-8 with trailing NUL padding removed.
pub fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .to_string()
}

impl ServiceSession for DeviceInformationSession {
    fn service_uuid(&self) -> Uuid {
        SERVICE_DEVICE_INFORMATION
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn mark_discovering(&mut self) {
        if self.state == SessionState::Invalid {
            self.state = SessionState::Discovering;
        }
    }

    fn discover_service(&mut self, service: &ServiceHandle) {
        if self.state == SessionState::Ready {
            return;
        }
        info!("Device information service available");
        for (field, slot) in self.slots.iter_mut() {
            *slot = FieldSlot {
                handle: bind_characteristic(service, characteristic_uuid(*field), "Device information"),
                ..FieldSlot::default()
            };
        }
        self.state = SessionState::Ready;
    }

    fn invalidate(&mut self) {
        for (_, slot) in self.slots.iter_mut() {
            *slot = FieldSlot::default();
        }
        self.bus.clear();
        self.state = SessionState::Invalid;
    }

    fn clear_requested_flags(&mut self) {
        for (_, slot) in self.slots.iter_mut() {
            slot.requested = false;
        }
    }

    fn handle_gatt_event(&mut self, _transport: &mut dyn Transport, event: &GattEvent) -> bool {
        let GattEvent::CharacteristicRead {
            characteristic,
            value,
            status,
        } = event
        else {
            return false;
        };

        let Some(field) = self
            .slots
            .iter()
            .find(|(_, slot)| slot.handle.as_ref() == Some(characteristic))
            .map(|(field, _)| *field)
        else {
            return false;
        };

        let slot = self.slot_mut(field);
        slot.requested = false;
        if !status.is_success() {
            warn!("Read of {:?} failed with status {:?}", field, status);
            return true;
        }

        let decoded = decode_string(value);
        debug!("{:?}: {}", field, decoded);
        slot.value = Some(decoded.clone());
        self.announce(field, decoded);
        true
    }
}
