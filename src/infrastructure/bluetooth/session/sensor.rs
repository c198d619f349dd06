//! Monitor HeatFlow sensor service.
//!
//! Values arrive as notifications. Commands and ADS configuration are writes with
//! response that share the link, so they go through a [`CommandQueue`] that keeps at
//! most one of them outstanding and guards it with a response timer.

use super::{bind_characteristic, is_bound, ServiceSession, SessionState};
use crate::domain::error::{FrameError, LinkError};
use crate::domain::models::{AdsConfigFrame, AdsValueFrame, SensorCommand};
use crate::infrastructure::bluetooth::event_bus::{EventBus, SubscriberId};
use crate::infrastructure::bluetooth::protocol::{
    FrameCodec, CHAR_ADS_CONFIGURATION, CHAR_ADS_VALUES, CHAR_COMMAND, SERVICE_SENSOR,
};
use crate::infrastructure::bluetooth::timer::{LinkTimer, TimerKind, TimerToken};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, GattEvent, LinkEventSender, ServiceHandle, Transport, WriteType,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Write-enabled characteristic classes. Declaration order is drain priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKey {
    Command,
    Configuration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    /// A values notification. A rejected frame carries sentinel fields and the error.
    Values {
        frame: AdsValueFrame,
        error: Option<FrameError>,
    },
    NotificationChanged(bool),
    /// Configuration echoed by the peripheral after a configuration write
    ConfigurationChanged {
        frame: AdsConfigFrame,
        error: Option<FrameError>,
    },
    CommandAcknowledged(SensorCommand),
    Error(LinkError),
}

/// Pending writes, at most one per [`QueueKey`], plus the class currently on air.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: BTreeMap<QueueKey, Vec<u8>>,
    in_flight: Option<QueueKey>,
}

impl CommandQueue {
    /// Store `payload` under `key`, replacing an older pending one. Returns whether
    /// something was replaced.
    pub fn put(&mut self, key: QueueKey, payload: Vec<u8>) -> bool {
        self.pending.insert(key, payload).is_some()
    }

    /// Highest-priority pending entry, unless a write is already outstanding.
    pub fn take_next(&mut self) -> Option<(QueueKey, Vec<u8>)> {
        if self.in_flight.is_some() {
            return None;
        }
        self.pending.pop_first()
    }

    pub fn start(&mut self, key: QueueKey) {
        self.in_flight = Some(key);
    }

    /// Close the outstanding write if it belongs to `key`.
    pub fn finish(&mut self, key: QueueKey) -> bool {
        if self.in_flight == Some(key) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Close whatever write is outstanding.
    pub fn abandon(&mut self) -> Option<QueueKey> {
        self.in_flight.take()
    }

    pub fn in_flight(&self) -> Option<QueueKey> {
        self.in_flight
    }

    pub fn is_transmitting(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }
}

pub struct SensorSession {
    state: SessionState,
    values_char: Option<CharacteristicHandle>,
    config_char: Option<CharacteristicHandle>,
    command_char: Option<CharacteristicHandle>,
    values_notification_enabled: bool,
    queue: CommandQueue,
    response_timer: LinkTimer,
    bus: EventBus<SensorEvent>,
}

impl SensorSession {
    /// `sender` receives the response timer's expiry as a `LinkEvent::ResponseTimeout`.
    pub fn new(response_timeout: Duration, sender: LinkEventSender) -> Self {
        Self {
            state: SessionState::Invalid,
            values_char: None,
            config_char: None,
            command_char: None,
            values_notification_enabled: false,
            queue: CommandQueue::default(),
            response_timer: LinkTimer::new(TimerKind::Response, response_timeout, sender),
            bus: EventBus::new(),
        }
    }

    pub fn subscribe(&mut self) -> (SubscriberId, mpsc::UnboundedReceiver<SensorEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn is_values_notification_enabled(&self) -> bool {
        self.values_notification_enabled
    }

    pub fn is_transmitting(&self) -> bool {
        self.queue.is_transmitting()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn set_command(&mut self, transport: &mut dyn Transport, command: SensorCommand) -> bool {
        if self.command_char.is_none() {
            warn!("Command characteristic not bound");
            return false;
        }
        let payload = FrameCodec::encode_command(command).to_vec();
        if self.queue.put(QueueKey::Command, payload) {
            debug!("Pending command replaced by {:?}", command);
        }
        self.drain(transport);
        true
    }

    pub fn set_configuration(
        &mut self,
        transport: &mut dyn Transport,
        index: i8,
        config: i16,
    ) -> bool {
        if self.config_char.is_none() {
            warn!("ADS configuration characteristic not bound");
            return false;
        }
        let payload = FrameCodec::encode_ads_config(&AdsConfigFrame { index, config }).to_vec();
        if self.queue.put(QueueKey::Configuration, payload) {
            debug!("Pending ADS configuration replaced");
        }
        self.drain(transport);
        true
    }

    /// Toggle value notifications with a descriptor write, outside the command queue.
    pub fn enable_ads_values_notification(
        &mut self,
        transport: &mut dyn Transport,
        enable: bool,
    ) -> bool {
        let Some(handle) = self.values_char else {
            warn!("ADS values characteristic not bound");
            return false;
        };

        if self.values_notification_enabled == enable {
            info!(
                "ADS values notification already {}, nothing to do",
                if enable { "enabled" } else { "disabled" }
            );
            return true;
        }
        transport.write_notification_config(&handle, enable)
    }

    /// Send the next pending write when the link is free.
    pub fn drain(&mut self, transport: &mut dyn Transport) -> bool {
        while let Some((key, payload)) = self.queue.take_next() {
            let Some(handle) = self.handle_for(key) else {
                warn!("{:?} dropped: characteristic not bound", key);
                continue;
            };

            if transport.queue_write(&handle, &payload, WriteType::WithResponse) {
                self.queue.start(key);
                self.response_timer.arm();
                debug!("{:?} write sent ({} bytes)", key, payload.len());
                return true;
            }

            warn!("{:?} write rejected by transport", key);
            self.bus.publish(SensorEvent::Error(LinkError::RequestRejected));
        }
        false
    }

    /// React to the response timer. Stale tokens are ignored.
    pub fn handle_response_timeout(
        &mut self,
        transport: &mut dyn Transport,
        token: TimerToken,
    ) -> bool {
        if !self.response_timer.fire(token) {
            debug!("Stale response timeout ignored");
            return false;
        }

        let Some(key) = self.queue.abandon() else {
            return false;
        };

        let timeout_ms = self.response_timer.window().as_millis() as u64;
        warn!("{:?} not acknowledged within {} ms", key, timeout_ms);
        let error = match key {
            QueueKey::Command => LinkError::CommandTimeout { timeout_ms },
            QueueKey::Configuration => LinkError::ConfigurationTimeout { timeout_ms },
        };
        self.bus.publish(SensorEvent::Error(error));

        self.drain(transport);
        true
    }

    fn handle_for(&self, key: QueueKey) -> Option<CharacteristicHandle> {
        match key {
            QueueKey::Command => self.command_char,
            QueueKey::Configuration => self.config_char,
        }
    }

    fn key_for(&self, handle: &CharacteristicHandle) -> Option<QueueKey> {
        if is_bound(&self.command_char, handle) {
            Some(QueueKey::Command)
        } else if is_bound(&self.config_char, handle) {
            Some(QueueKey::Configuration)
        } else {
            None
        }
    }

    fn on_write_ack(
        &mut self,
        transport: &mut dyn Transport,
        key: QueueKey,
        value: &[u8],
        success: bool,
    ) {
        if !self.queue.finish(key) {
            debug!("Unexpected {:?} acknowledgement ignored", key);
            return;
        }
        self.response_timer.cancel();

        if !success {
            warn!("{:?} write failed", key);
            self.bus.publish(SensorEvent::Error(LinkError::RequestRejected));
        } else {
            match key {
                QueueKey::Command => match FrameCodec::decode_command(value) {
                    Ok(command) => self.bus.publish(SensorEvent::CommandAcknowledged(command)),
                    Err(e) => self.bus.publish(SensorEvent::Error(e.into())),
                },
                QueueKey::Configuration => {
                    let event = match FrameCodec::decode_ads_config(value) {
                        Ok(frame) => SensorEvent::ConfigurationChanged { frame, error: None },
                        Err(e) => SensorEvent::ConfigurationChanged {
                            frame: AdsConfigFrame::default(),
                            error: Some(e),
                        },
                    };
                    self.bus.publish(event);
                }
            }
        }

        self.drain(transport);
    }

    fn on_values(&mut self, value: &[u8]) {
        let event = match FrameCodec::decode_ads_values(value) {
            Ok(frame) => SensorEvent::Values { frame, error: None },
            Err(e) => {
                warn!("ADS values rejected: {}", e);
                SensorEvent::Values {
                    frame: AdsValueFrame::default(),
                    error: Some(e),
                }
            }
        };
        self.bus.publish(event);
    }
}

impl ServiceSession for SensorSession {
    fn service_uuid(&self) -> Uuid {
        SERVICE_SENSOR
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
        info!("Sensor service available");
        self.config_char = bind_characteristic(service, CHAR_ADS_CONFIGURATION, "ADS configuration");
        self.command_char = bind_characteristic(service, CHAR_COMMAND, "Command");
        self.values_char = bind_characteristic(service, CHAR_ADS_VALUES, "ADS values");
        self.state = SessionState::Ready;
    }

    fn invalidate(&mut self) {
        // Timer first: nothing may fire against the cleared queue
        self.response_timer.cancel();
        self.queue.clear();
        self.config_char = None;
        self.command_char = None;
        self.values_char = None;
        self.values_notification_enabled = false;
        self.bus.clear();
        self.state = SessionState::Invalid;
    }

    fn clear_requested_flags(&mut self) {
        // An outstanding write is released by its acknowledgement or the response timer
    }

    fn handle_gatt_event(&mut self, transport: &mut dyn Transport, event: &GattEvent) -> bool {
        match event {
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } if is_bound(&self.values_char, characteristic) => {
                self.on_values(value);
                true
            }
            GattEvent::CharacteristicWritten {
                characteristic,
                value,
                status,
            } => match self.key_for(characteristic) {
                Some(key) => {
                    self.on_write_ack(transport, key, value, status.is_success());
                    true
                }
                None => false,
            },
            GattEvent::DescriptorWritten {
                characteristic,
                notifications_enabled,
                status,
            } if is_bound(&self.values_char, characteristic) => {
                if status.is_success() {
                    self.values_notification_enabled = *notifications_enabled;
                    self.bus.publish(SensorEvent::NotificationChanged(
                        self.values_notification_enabled,
                    ));
                } else {
                    warn!("ADS values notification toggle failed with status {:?}", status);
                }
                true
            }
            _ => false,
        }
    }
}
