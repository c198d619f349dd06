//! GATT Service Sessions
//!
//! One session per mandatory service. A session binds the characteristic handles of
//! its service for the lifetime of one connection, caches what it decodes and reports
//! changes on its own [`EventBus`](super::event_bus::EventBus).
//!
//! Sessions never hold the transport. The owning device lends it for each call, which
//! keeps every session a plain value owned by exactly one peripheral link.

pub mod battery;
pub mod device_information;
pub mod sensor;

pub use battery::{BatteryEvent, BatterySession};
pub use device_information::{DeviceInformationEvent, DeviceInformationSession};
pub use sensor::{QueueKey, SensorEvent, SensorSession};

use super::transport::{CharacteristicHandle, GattEvent, ServiceHandle, Transport};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No handles bound; every request is refused
    #[default]
    Invalid,
    /// Service discovery announced by the transport
    Discovering,
    /// Handles bound for the current connection
    Ready,
}

pub trait ServiceSession {
    fn service_uuid(&self) -> Uuid;

    fn state(&self) -> SessionState;

    /// Called when the transport starts resolving services.
    fn mark_discovering(&mut self);

    /// Bind the characteristics of `service`. Ignored when already bound.
    fn discover_service(&mut self, service: &ServiceHandle);

    /// Drop handles, cached values, in-flight flags, timers and subscribers.
    fn invalidate(&mut self);

    /// Forget pending requests so they are issued again, e.g. after bonding.
    fn clear_requested_flags(&mut self);

    /// Route a GATT completion or notification. Returns `true` when the event
    /// referenced one of this session's bound characteristics.
    fn handle_gatt_event(&mut self, transport: &mut dyn Transport, event: &GattEvent) -> bool;
}

/// Resolve one characteristic of a freshly discovered service, logging when absent.
pub(crate) fn bind_characteristic(
    service: &ServiceHandle,
    uuid: Uuid,
    label: &str,
) -> Option<CharacteristicHandle> {
    let handle = service.characteristic(uuid);
    if handle.is_none() {
        warn!("{} characteristic ({}) not found on {}", label, uuid, service.uuid);
    }
    handle
}

/// Equality against an optionally bound handle.
pub(crate) fn is_bound(bound: &Option<CharacteristicHandle>, handle: &CharacteristicHandle) -> bool {
    bound.as_ref() == Some(handle)
}
