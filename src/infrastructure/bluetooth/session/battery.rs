use super::{bind_characteristic, is_bound, ServiceSession, SessionState};
use crate::domain::models::BatteryLevel;
use crate::infrastructure::bluetooth::event_bus::{EventBus, SubscriberId};
use crate::infrastructure::bluetooth::protocol::{CHAR_BATTERY_LEVEL, SERVICE_BATTERY};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, GattEvent, ServiceHandle, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryEvent {
    LevelChanged(u8),
    NotificationChanged(bool),
}

/// Adopted battery service: one level characteristic, readable and notifying.
#[derive(Default)]
pub struct BatterySession {
    state: SessionState,
    level_char: Option<CharacteristicHandle>,
    level: Option<u8>,
    level_requested: bool,
    /// Direction of a descriptor write not yet confirmed
    notification_requested: Option<bool>,
    notification_enabled: bool,
    bus: EventBus<BatteryEvent>,
}

impl BatterySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> (SubscriberId, mpsc::UnboundedReceiver<BatteryEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn cached_level(&self) -> Option<u8> {
        self.level
    }

    pub fn is_notification_enabled(&self) -> bool {
        self.notification_enabled
    }

    /// Cached level, or request a read and report [`BatteryLevel::Pending`].
    pub fn get_level(&mut self, transport: &mut dyn Transport) -> BatteryLevel {
        if let Some(level) = self.level {
            return BatteryLevel::Percent(level);
        }
        if self.read_level(transport) {
            BatteryLevel::Pending
        } else {
            BatteryLevel::Unavailable
        }
    }

    fn read_level(&mut self, transport: &mut dyn Transport) -> bool {
        let Some(handle) = self.level_char else {
            return false;
        };

        if !self.level_requested {
            if !transport.queue_read(&handle) {
                warn!("Battery level read rejected by transport");
                return false;
            }
            self.level_requested = true;
        }
        true
    }

    /// Toggle level notifications. A second request in the same direction while the
    /// first is unconfirmed issues no further write.
    pub fn enable_notification(&mut self, transport: &mut dyn Transport, enable: bool) -> bool {
        let Some(handle) = self.level_char else {
            warn!("Battery level characteristic not bound");
            return false;
        };

        if self.notification_requested == Some(enable) {
            debug!("Battery notification toggle ({}) already in flight", enable);
            return true;
        }

        self.notification_requested = Some(enable);
        if !transport.write_notification_config(&handle, enable) {
            warn!("Battery notification toggle rejected by transport");
            self.notification_requested = None;
            return false;
        }
        true
    }
}

impl ServiceSession for BatterySession {
    fn service_uuid(&self) -> Uuid {
        SERVICE_BATTERY
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
        info!("Battery service available");
        self.level_char = bind_characteristic(service, CHAR_BATTERY_LEVEL, "Battery level");
        self.level = None;
        self.state = SessionState::Ready;
    }

    fn invalidate(&mut self) {
        self.level_char = None;
        self.level = None;
        self.notification_enabled = false;
        self.notification_requested = None;
        self.clear_requested_flags();
        self.bus.clear();
        self.state = SessionState::Invalid;
    }

    fn clear_requested_flags(&mut self) {
        self.level_requested = false;
        // A descriptor write refused with an ATT error never reports its handle
        self.notification_requested = None;
    }

    fn handle_gatt_event(&mut self, _transport: &mut dyn Transport, event: &GattEvent) -> bool {
        match event {
            GattEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            } if is_bound(&self.level_char, characteristic) => {
                self.level_requested = false;
                if status.is_success() {
                    self.update_level(value);
                } else {
                    warn!("Battery level read failed with status {:?}", status);
                }
                true
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } if is_bound(&self.level_char, characteristic) => {
                self.update_level(value);
                true
            }
            GattEvent::DescriptorWritten {
                characteristic,
                notifications_enabled,
                status,
            } if is_bound(&self.level_char, characteristic) => {
                self.notification_requested = None;
                if status.is_success() {
                    self.notification_enabled = *notifications_enabled;
                    self.bus
                        .publish(BatteryEvent::NotificationChanged(self.notification_enabled));
                } else {
                    warn!("Battery notification toggle failed with status {:?}", status);
                }
                true
            }
            _ => false,
        }
    }
}

impl BatterySession {
    fn update_level(&mut self, value: &[u8]) {
        match value.first() {
            Some(&level) => {
                self.level = Some(level);
                self.bus.publish(BatteryEvent::LevelChanged(level));
            }
            None => warn!("Empty battery level value"),
        }
    }
}
