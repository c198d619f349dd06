//! Peripheral Connection
//!
//! [`HeatFlowDevice`] owns the lifecycle of one peripheral link: it drives the
//! transport, binds the three service sessions once services are resolved, enables
//! notifications and handles the recovery paths (invalid device, authorization,
//! adapter power loss, link loss).
//!
//! The device is synchronous. Feed it every [`LinkEvent`] from its channel through
//! [`HeatFlowDevice::handle_event`]; no method blocks.

use crate::domain::error::{LinkError, ServiceKind};
use crate::domain::models::{
    BatteryLevel, ConnectionState, DeviceEvent, DeviceInfoField, PeripheralDescriptor,
    SensorCommand,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::event_bus::{EventBus, SubscriberId};
use crate::infrastructure::bluetooth::protocol::{
    CHAR_ADS_CONFIGURATION, CHAR_COMMAND, GATT_INSUFFICIENT_AUTHORIZATION, SERVICE_BATTERY,
    SERVICE_DEVICE_INFORMATION, SERVICE_SENSOR,
};
use crate::infrastructure::bluetooth::session::device_information::UNKNOWN_VALUE;
use crate::infrastructure::bluetooth::session::{
    BatteryEvent, BatterySession, DeviceInformationEvent, DeviceInformationSession, SensorEvent,
    SensorSession, ServiceSession,
};
use crate::infrastructure::bluetooth::timer::{LinkTimer, TimerKind, TimerToken};
use crate::infrastructure::bluetooth::transport::{
    AdapterEvent, BondingEvent, ConnectionEvent, ConnectionFailure, GattEvent, LinkEvent,
    LinkEventReceiver, LinkEventSender, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Runtime configuration of a link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Handed to the transport with every connect request
    pub connection_timeout: Duration,
    /// Window for a command or configuration write to be acknowledged
    pub response_timeout: Duration,
    /// Reconnect after the link is lost unexpectedly
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for LinkConfig {
    fn from(s: &Settings) -> Self {
        Self {
            connection_timeout: Duration::from_millis(s.connection_timeout_ms),
            response_timeout: Duration::from_millis(s.response_timeout_ms),
            auto_reconnect: s.auto_reconnect,
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
            max_reconnect_attempts: s.max_reconnect_attempts,
        }
    }
}

/// The three service sessions of a bound transport, with the receivers the device
/// drains after every event.
struct Sessions {
    battery: BatterySession,
    battery_rx: mpsc::UnboundedReceiver<BatteryEvent>,
    device_information: DeviceInformationSession,
    device_information_rx: mpsc::UnboundedReceiver<DeviceInformationEvent>,
    sensor: SensorSession,
    sensor_rx: mpsc::UnboundedReceiver<SensorEvent>,
}

impl Sessions {
    fn new(response_timeout: Duration, sender: LinkEventSender) -> Self {
        let mut battery = BatterySession::new();
        let mut device_information = DeviceInformationSession::new();
        let mut sensor = SensorSession::new(response_timeout, sender);
        let (_, battery_rx) = battery.subscribe();
        let (_, device_information_rx) = device_information.subscribe();
        let (_, sensor_rx) = sensor.subscribe();
        Self {
            battery,
            battery_rx,
            device_information,
            device_information_rx,
            sensor,
            sensor_rx,
        }
    }

    /// Invalidation drops session subscribers, so every connection subscribes anew.
    /// The replaced receivers are already drained; their registrations are pruned on
    /// the next publish.
    fn resubscribe(&mut self) {
        self.battery_rx = self.battery.subscribe().1;
        self.device_information_rx = self.device_information.subscribe().1;
        self.sensor_rx = self.sensor.subscribe().1;
    }

    fn all_mut(&mut self) -> [&mut dyn ServiceSession; 3] {
        [
            &mut self.battery,
            &mut self.device_information,
            &mut self.sensor,
        ]
    }

    /// Collect what the sessions published since the last call, in per-session order.
    fn take_events(&mut self) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(e) = self.device_information_rx.try_recv() {
            events.push(DeviceEvent::DeviceInformationChanged {
                field: e.field,
                value: e.value,
            });
        }
        while let Ok(e) = self.battery_rx.try_recv() {
            events.push(match e {
                BatteryEvent::LevelChanged(level) => DeviceEvent::BatteryLevelChanged(level),
                BatteryEvent::NotificationChanged(on) => DeviceEvent::BatteryNotificationChanged(on),
            });
        }
        while let Ok(e) = self.sensor_rx.try_recv() {
            events.push(match e {
                SensorEvent::Values { frame, error: None } => DeviceEvent::SensorValues(frame),
                SensorEvent::Values { error: Some(e), .. }
                | SensorEvent::ConfigurationChanged { error: Some(e), .. } => {
                    DeviceEvent::ProtocolError(e.into())
                }
                SensorEvent::NotificationChanged(on) => DeviceEvent::SensorNotificationChanged(on),
                SensorEvent::ConfigurationChanged { frame, error: None } => {
                    DeviceEvent::ConfigurationChanged(frame)
                }
                SensorEvent::CommandAcknowledged(command) => {
                    DeviceEvent::CommandAcknowledged(command)
                }
                SensorEvent::Error(e) => DeviceEvent::ProtocolError(e),
            });
        }
        events
    }
}

/// Connection state machine for one HeatFlow peripheral.
///
/// # Lifecycle
///
/// ```text
/// Disconnected ──connect()──▶ Connecting ──Connected──▶ Initializing ──values notify on──▶ Ready
///      ▲                          │                          │                              │
///      └──────────────────────────┴── error / Disconnected ──┴──────────────────────────────┘
/// ```
pub struct HeatFlowDevice<T: Transport> {
    descriptor: PeripheralDescriptor,
    config: LinkConfig,
    state: ConnectionState,
    transport: Option<T>,
    sessions: Option<Sessions>,
    link_tx: LinkEventSender,
    bus: EventBus<DeviceEvent>,
    bonding: bool,
    /// Set by `disconnect()` so the resulting link loss is not retried
    user_disconnect: bool,
    reconnect_timer: LinkTimer,
    reconnect_attempts: u32,
    /// The current connection attempt was started by the backoff timer
    reconnecting: bool,
}

impl<T: Transport> HeatFlowDevice<T> {
    /// Create an unbound device. The receiver must be pumped into
    /// [`handle_event`](Self::handle_event); transports and timers report through
    /// [`link_sender`](Self::link_sender).
    pub fn new(descriptor: PeripheralDescriptor, config: LinkConfig) -> (Self, LinkEventReceiver) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let reconnect_timer =
            LinkTimer::new(TimerKind::Backoff, config.reconnect_delay, link_tx.clone());
        let device = Self {
            descriptor,
            config,
            state: ConnectionState::default(),
            transport: None,
            sessions: None,
            link_tx,
            bus: EventBus::new(),
            bonding: false,
            user_disconnect: false,
            reconnect_timer,
            reconnect_attempts: 0,
            reconnecting: false,
        };
        (device, link_rx)
    }

    pub fn link_sender(&self) -> LinkEventSender {
        self.link_tx.clone()
    }

    pub fn descriptor(&self) -> &PeripheralDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut PeripheralDescriptor {
        &mut self.descriptor
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> (SubscriberId, mpsc::UnboundedReceiver<DeviceEvent>) {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ---------------------------------------------------------------------------------
    // Transport binding
    // ---------------------------------------------------------------------------------

    /// Attach a transport and create the service sessions.
    pub fn bind(&mut self, transport: T) {
        if self.transport.is_some() {
            warn!("Replacing bound transport for {}", self.descriptor.address());
            self.unbind();
        }
        self.transport = Some(transport);
        self.sessions = Some(Sessions::new(
            self.config.response_timeout,
            self.link_tx.clone(),
        ));
        info!("Transport bound for {}", self.descriptor);
        self.bus.publish(DeviceEvent::TransportBound);
    }

    /// Release the transport. Sessions are invalidated and dropped.
    pub fn unbind(&mut self) -> Option<T> {
        self.invalidate_sessions();
        self.publish_session_events();
        self.sessions = None;
        self.transport.take()
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    // ---------------------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A transport is bound and its adapter is powered.
    pub fn is_available(&self) -> bool {
        self.transport
            .as_ref()
            .map(|t| t.is_adapter_ready())
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Initializing | ConnectionState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    // ---------------------------------------------------------------------------------
    // Connection control
    // ---------------------------------------------------------------------------------

    /// Connect with the configured connection timeout.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.connect_with_timeout(self.config.connection_timeout)
    }

    /// Ask the transport to connect, giving up after `timeout`. On `Err` nothing
    /// further happens; on `Ok` the outcome arrives as connection events.
    pub fn connect_with_timeout(&mut self, timeout: Duration) -> Result<(), LinkError> {
        if !self.is_available() {
            warn!("Cannot connect {}: transport unavailable", self.descriptor.address());
            return Err(LinkError::TransportUnavailable);
        }
        if self.descriptor.address().is_empty() {
            return Err(LinkError::InvalidDescriptor);
        }
        if !matches!(self.state, ConnectionState::Disconnected { .. }) {
            return Err(LinkError::AlreadyConnected);
        }

        self.reconnect_timer.cancel();
        self.reconnect_attempts = 0;
        self.reconnecting = false;
        self.user_disconnect = false;
        self.start_connect(timeout)
    }

    fn start_connect(&mut self, timeout: Duration) -> Result<(), LinkError> {
        if let Some(sessions) = self.sessions.as_mut() {
            sessions.resubscribe();
        }

        let address = self.descriptor.address();
        let transport = self
            .transport
            .as_mut()
            .ok_or(LinkError::TransportUnavailable)?;

        info!("Connecting to {} (timeout {:?})", address, timeout);
        if !transport.connect(address, timeout) {
            warn!("Transport refused to connect {}", address);
            return Err(LinkError::RequestRejected);
        }
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Request teardown. The state only changes when the transport reports the link down.
    pub fn disconnect(&mut self) -> bool {
        if !self.is_available() {
            debug!("Disconnect ignored: transport unavailable");
            return false;
        }
        self.user_disconnect = true;
        self.reconnect_timer.cancel();
        match self.transport.as_mut() {
            Some(transport) => transport.disconnect(),
            None => false,
        }
    }

    /// Process one event from the link channel.
    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connection(e) => self.on_connection_event(e),
            LinkEvent::Adapter(e) => self.on_adapter_event(e),
            LinkEvent::Bonding(e) => self.on_bonding_event(e),
            LinkEvent::Gatt(e) => self.on_gatt_event(e),
            LinkEvent::ResponseTimeout(token) => {
                if let Some((transport, sessions)) = self.parts() {
                    sessions.sensor.handle_response_timeout(transport, token);
                }
            }
            LinkEvent::ReconnectDue(token) => self.on_reconnect_due(token),
        }
        self.publish_session_events();
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        debug!("{}: {:?}", self.descriptor.address(), event);
        match event {
            ConnectionEvent::Connecting => {
                self.set_state(ConnectionState::Connecting);
            }
            ConnectionEvent::Connected => {
                self.set_state(ConnectionState::Initializing);
            }
            ConnectionEvent::ServicesDiscovering => {
                if let Some(sessions) = self.sessions.as_mut() {
                    for session in sessions.all_mut() {
                        session.mark_discovering();
                    }
                }
            }
            ConnectionEvent::ServicesDiscovered => self.on_services_discovered(),
            ConnectionEvent::Disconnected { status } => self.on_disconnected(status),
            ConnectionEvent::Failed(ConnectionFailure::Timeout) => {
                error!("Connection to {} timed out", self.descriptor.address());
                self.fail(ConnectionState::ErrorTimeout, LinkError::ConnectionTimeout, 0);
            }
            ConnectionEvent::Failed(ConnectionFailure::ServiceDiscovery { status }) => {
                error!("Service discovery failed with status {}", status);
                if let Some(transport) = self.transport.as_mut() {
                    transport.disconnect();
                }
                self.fail(
                    ConnectionState::ErrorDiscoveringServices { status },
                    LinkError::ServiceDiscovery { status },
                    status,
                );
            }
        }
    }

    /// Report an error state and its reason, then collapse to `Disconnected`.
    fn fail(&mut self, state: ConnectionState, reason: LinkError, status: i32) {
        let retry = self.reconnecting && self.reconnect_allowed();
        self.reconnecting = false;
        self.invalidate_sessions();
        self.publish_session_events();
        self.set_state(state);
        self.bus.publish(DeviceEvent::ProtocolError(reason));
        self.set_state(ConnectionState::Disconnected { status });
        if retry {
            self.schedule_reconnect(status);
        }
    }

    fn on_services_discovered(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            warn!("Services discovered without a bound transport");
            return;
        };

        let battery = transport.resolve_service(SERVICE_BATTERY);
        let device_information = transport.resolve_service(SERVICE_DEVICE_INFORMATION);
        let sensor = transport.resolve_service(SERVICE_SENSOR);

        let (battery, device_information, sensor) = match (battery, device_information, sensor) {
            (Some(b), Some(d), Some(s)) => (b, d, s),
            (b, d, _) => {
                let missing = if b.is_none() {
                    ServiceKind::Battery
                } else if d.is_none() {
                    ServiceKind::DeviceInformation
                } else {
                    ServiceKind::Sensor
                };
                self.reject_device(missing);
                return;
            }
        };

        info!("Mandatory services resolved on {}", self.descriptor.address());
        if let Some(sessions) = self.sessions.as_mut() {
            sessions.battery.discover_service(&battery);
            sessions.device_information.discover_service(&device_information);
            sessions.sensor.discover_service(&sensor);
        }
        self.enable_notifications();
    }

    /// The peripheral lacks a mandatory service. Not retried automatically; the GATT
    /// cache is cleared so the next attempt resolves services from scratch.
    fn reject_device(&mut self, missing: ServiceKind) {
        error!(
            "{} is not a valid HeatFlow device: {} service missing",
            self.descriptor.address(),
            missing
        );
        self.reconnecting = false;
        self.set_state(ConnectionState::ErrorNotValid);
        if let Some(transport) = self.transport.as_mut() {
            transport.clear_gatt_cache();
            self.bus.publish(DeviceEvent::RecoveryHint);
            self.bus
                .publish(DeviceEvent::ProtocolError(LinkError::DeviceNotValid { missing }));
            transport.disconnect();
        }
    }

    fn on_disconnected(&mut self, status: i32) {
        let previous = self.state;
        self.bonding = false;
        self.invalidate_sessions();
        self.publish_session_events();
        self.set_state(ConnectionState::Disconnected { status });

        let retry = self.should_reconnect(previous, status);
        self.reconnecting = false;
        if retry {
            self.schedule_reconnect(status);
        }
        self.user_disconnect = false;
    }

    /// An established link dropped unexpectedly, or a reconnection attempt failed.
    fn should_reconnect(&self, previous: ConnectionState, status: i32) -> bool {
        let link_lost = status != 0
            && matches!(
                previous,
                ConnectionState::Initializing | ConnectionState::Ready
            );
        let attempt_failed = self.reconnecting
            && matches!(
                previous,
                ConnectionState::Connecting | ConnectionState::Initializing
            );
        (link_lost || attempt_failed) && self.reconnect_allowed()
    }

    fn reconnect_allowed(&self) -> bool {
        self.config.auto_reconnect
            && !self.user_disconnect
            && self.reconnect_attempts < self.config.max_reconnect_attempts
    }

    fn schedule_reconnect(&mut self, status: i32) {
        self.reconnect_attempts += 1;
        info!(
            "Link to {} down ({}), reconnecting in {:?} (attempt {}/{})",
            self.descriptor.address(),
            status,
            self.config.reconnect_delay,
            self.reconnect_attempts,
            self.config.max_reconnect_attempts
        );
        self.reconnect_timer.arm();
    }

    fn on_reconnect_due(&mut self, token: TimerToken) {
        if !self.reconnect_timer.fire(token) {
            return;
        }
        if !matches!(self.state, ConnectionState::Disconnected { .. }) || !self.is_available() {
            debug!("Reconnect skipped in state {}", self.state);
            return;
        }
        match self.start_connect(self.config.connection_timeout) {
            Ok(()) => self.reconnecting = true,
            Err(e) => {
                warn!("Reconnect attempt failed: {}", e);
                if self.reconnect_allowed() {
                    let status = self.state.status_code();
                    self.schedule_reconnect(status);
                } else {
                    info!(
                        "Giving up on {} after {} attempts",
                        self.descriptor.address(),
                        self.reconnect_attempts
                    );
                }
            }
        }
    }

    fn on_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::On => info!("Adapter powered on"),
            AdapterEvent::Off => {
                warn!("Adapter powered off, releasing {}", self.descriptor.address());
                self.reconnect_timer.cancel();
                self.reconnecting = false;
                self.bonding = false;
                if let Some(transport) = self.transport.as_mut() {
                    transport.disconnect();
                }
                self.unbind();
                let status = self.state.status_code();
                self.set_state(ConnectionState::Disconnected { status });
                self.bus.publish(DeviceEvent::AdapterOff);
            }
        }
    }

    fn on_bonding_event(&mut self, event: BondingEvent) {
        match event {
            BondingEvent::Bonding => {
                debug!("Bonding with {}", self.descriptor.address());
                self.bonding = true;
            }
            BondingEvent::Bonded => {
                info!("Bonded with {}", self.descriptor.address());
                self.bonding = false;
                if self.is_connected() {
                    self.enable_notifications();
                }
            }
            BondingEvent::NotBonded => {
                if self.bonding {
                    self.bonding = false;
                    error!("Bonding with {} failed", self.descriptor.address());
                    self.bus
                        .publish(DeviceEvent::ProtocolError(LinkError::BondingFailed));
                }
            }
        }
    }

    fn on_gatt_event(&mut self, event: GattEvent) {
        if let GattEvent::Error { status } = event {
            if status.0 == GATT_INSUFFICIENT_AUTHORIZATION {
                self.on_authorization_required();
            } else {
                warn!("GATT error {:?}", status);
            }
            return;
        }

        let Some((transport, sessions)) = self.parts() else {
            debug!("GATT event without bound sessions: {:?}", event);
            return;
        };
        let handled = sessions
            .all_mut()
            .into_iter()
            .any(|session| session.handle_gatt_event(transport, &event));
        if !handled {
            debug!("Unrouted GATT event: {:?}", event);
        }

        // Session notifications precede the state change they cause
        self.publish_session_events();

        let values_on = self
            .sessions
            .as_ref()
            .map(|s| s.sensor.is_values_notification_enabled())
            .unwrap_or(false);
        if self.state == ConnectionState::Initializing && values_on {
            self.set_state(ConnectionState::Ready);
        }
    }

    fn on_authorization_required(&mut self) {
        warn!("{} requires authorization, bonding", self.descriptor.address());
        if let Some(sessions) = self.sessions.as_mut() {
            for session in sessions.all_mut() {
                session.clear_requested_flags();
            }
        }
        if self.bonding {
            return;
        }
        let started = self
            .transport
            .as_mut()
            .map(|t| t.create_bond())
            .unwrap_or(false);
        if started {
            self.bonding = true;
        } else {
            error!("Transport refused to bond");
            self.bus
                .publish(DeviceEvent::ProtocolError(LinkError::BondingFailed));
        }
    }

    // ---------------------------------------------------------------------------------
    // Notification enablement
    // ---------------------------------------------------------------------------------

    /// Read device information, read and subscribe the battery level, subscribe sensor
    /// values. A failing step does not stop the following ones.
    fn enable_notifications(&mut self) -> bool {
        let info = self.read_device_information();
        let battery = self.enable_battery_notification();
        let sensor = self.set_values_notification(true).is_ok();
        debug!(
            "Notification enablement: info={} battery={} sensor={}",
            info, battery, sensor
        );
        info && battery && sensor
    }

    /// Fetch every device information field not cached yet.
    pub fn read_device_information(&mut self) -> bool {
        let Some((transport, sessions)) = self.parts() else {
            warn!("No device information session");
            return false;
        };
        sessions.device_information.read_all(transport)
    }

    fn enable_battery_notification(&mut self) -> bool {
        let Some((transport, sessions)) = self.parts() else {
            warn!("No battery session");
            return false;
        };
        sessions.battery.get_level(transport);
        sessions.battery.enable_notification(transport, true)
    }

    pub fn set_values_notification(&mut self, enable: bool) -> Result<(), LinkError> {
        let Some((transport, sessions)) = self.parts() else {
            warn!("No sensor session");
            return Err(LinkError::ServiceUnavailable(ServiceKind::Sensor));
        };
        if sessions.sensor.enable_ads_values_notification(transport, enable) {
            Ok(())
        } else {
            Err(LinkError::RequestRejected)
        }
    }

    // ---------------------------------------------------------------------------------
    // Sensor operations
    // ---------------------------------------------------------------------------------

    pub fn set_command(&mut self, command: SensorCommand) -> Result<(), LinkError> {
        let Some((transport, sessions)) = self.parts() else {
            return Err(LinkError::ServiceUnavailable(ServiceKind::Sensor));
        };
        let queued = sessions.sensor.set_command(transport, command);
        self.publish_session_events();
        if queued {
            Ok(())
        } else {
            Err(LinkError::CharacteristicMissing(CHAR_COMMAND))
        }
    }

    pub fn enable_measurement(&mut self) -> Result<(), LinkError> {
        self.set_command(SensorCommand::Start)
    }

    pub fn disable_measurement(&mut self) -> Result<(), LinkError> {
        self.set_command(SensorCommand::Stop)
    }

    /// Queue an ADS configuration register write.
    pub fn configure_ads(&mut self, index: i8, config: i16) -> Result<(), LinkError> {
        let Some((transport, sessions)) = self.parts() else {
            return Err(LinkError::ServiceUnavailable(ServiceKind::Sensor));
        };
        let queued = sessions.sensor.set_configuration(transport, index, config);
        self.publish_session_events();
        if queued {
            Ok(())
        } else {
            Err(LinkError::CharacteristicMissing(CHAR_ADS_CONFIGURATION))
        }
    }

    // ---------------------------------------------------------------------------------
    // Battery and device information
    // ---------------------------------------------------------------------------------

    pub fn battery_level(&mut self) -> BatteryLevel {
        match self.parts() {
            Some((transport, sessions)) => sessions.battery.get_level(transport),
            None => BatteryLevel::Unavailable,
        }
    }

    /// `"NN%"`, or `"-"` while unknown.
    pub fn battery_level_text(&mut self) -> String {
        match self.battery_level() {
            BatteryLevel::Percent(level) => format!("{}%", level),
            BatteryLevel::Pending | BatteryLevel::Unavailable => UNKNOWN_VALUE.to_string(),
        }
    }

    /// Cached value of `field`, or `"-"` after requesting it.
    pub fn device_information(&mut self, field: DeviceInfoField) -> String {
        match self.parts() {
            Some((transport, sessions)) => sessions.device_information.value(transport, field),
            None => UNKNOWN_VALUE.to_string(),
        }
    }

    // ---------------------------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------------------------

    /// Clear the transport's GATT cache so services are resolved afresh.
    pub fn recover_device(&mut self) -> bool {
        match self.transport.as_mut() {
            Some(transport) => {
                info!("Clearing GATT cache for {}", self.descriptor.address());
                transport.clear_gatt_cache();
                true
            }
            None => false,
        }
    }

    pub fn remove_bond(&mut self) -> bool {
        match self.transport.as_mut() {
            Some(transport) => transport.remove_bond(),
            None => false,
        }
    }

    // ---------------------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------------------

    fn parts(&mut self) -> Option<(&mut dyn Transport, &mut Sessions)> {
        match (self.transport.as_mut(), self.sessions.as_mut()) {
            (Some(transport), Some(sessions)) => Some((transport as &mut dyn Transport, sessions)),
            _ => None,
        }
    }

    fn invalidate_sessions(&mut self) {
        if let Some(sessions) = self.sessions.as_mut() {
            for session in sessions.all_mut() {
                session.invalidate();
            }
        }
    }

    fn publish_session_events(&mut self) {
        let Some(sessions) = self.sessions.as_mut() else {
            return;
        };
        for event in sessions.take_events() {
            self.bus.publish(event);
        }
    }

    /// Move to `next` when allowed, publishing only real changes.
    fn set_state(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if let (ConnectionState::Disconnected { .. }, ConnectionState::Disconnected { .. }) =
            (self.state, next)
        {
            self.state = next;
            return false;
        }
        if !self.state.can_transition_to(&next) {
            warn!("Ignoring transition {} -> {}", self.state, next);
            return false;
        }

        info!("{}: {} -> {}", self.descriptor.address(), self.state, next);
        self.state = next;
        if next == ConnectionState::Ready {
            self.reconnect_attempts = 0;
            self.reconnecting = false;
        }
        self.bus.publish(DeviceEvent::StateChanged(next));
        true
    }
}
