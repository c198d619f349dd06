//! Integration tests for the peripheral session engine, driven by the simulated peripheral.

use heatflow_link::domain::error::{FrameError, LinkError, ServiceKind};
use heatflow_link::domain::models::{
    AdsConfigFrame, AdsValueFrame, ConnectionState, DeviceEvent, DeviceInfoField,
    PeripheralDescriptor, SensorCommand,
};
use heatflow_link::infrastructure::bluetooth::protocol::{
    CHAR_ADS_CONFIGURATION, CHAR_ADS_VALUES, CHAR_BATTERY_LEVEL, CHAR_COMMAND, SERVICE_SENSOR,
};
use heatflow_link::infrastructure::bluetooth::simulator::TransportCall;
use heatflow_link::infrastructure::bluetooth::transport::{
    ConnectionEvent, ConnectionFailure, GattEvent, GattStatus, LinkEventReceiver,
};
use heatflow_link::infrastructure::bluetooth::{
    HeatFlowDevice, LinkConfig, LinkEvent, SimulatedTransport,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const ADDRESS: &str = "C0:FF:EE:00:00:01";

struct Harness {
    device: HeatFlowDevice<SimulatedTransport>,
    link_rx: LinkEventReceiver,
    peripheral: SimulatedTransport,
    events: UnboundedReceiver<DeviceEvent>,
}

impl Harness {
    fn new(peripheral: SimulatedTransport, config: LinkConfig) -> Self {
        let descriptor = PeripheralDescriptor::new(ADDRESS, Some("HeatFlow".to_string()), -60);
        let (mut device, link_rx) = HeatFlowDevice::new(descriptor, config);
        let (_, events) = device.subscribe();
        let peripheral = peripheral.respond_to(device.link_sender());
        device.bind(peripheral.clone());
        Self {
            device,
            link_rx,
            peripheral,
            events,
        }
    }

    fn simulated() -> Self {
        Self::new(SimulatedTransport::heatflow(), LinkConfig::default())
    }

    /// Deliver every queued link event, including the ones handling produces.
    fn pump(&mut self) {
        while let Ok(event) = self.link_rx.try_recv() {
            self.device.handle_event(event);
        }
    }

    fn take_events(&mut self) -> Vec<DeviceEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    fn connect_ready(&mut self) {
        self.device.connect().expect("connect accepted");
        self.pump();
        assert!(self.device.is_ready(), "state: {}", self.device.state());
        self.take_events();
        self.peripheral.clear_calls();
    }

    fn count_calls(&self, wanted: impl Fn(&TransportCall) -> bool) -> usize {
        self.peripheral.calls().iter().filter(|c| wanted(*c)).count()
    }
}

fn states(events: &[DeviceEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn protocol_errors(events: &[DeviceEvent]) -> Vec<LinkError> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::ProtocolError(err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

fn command_ack(h: &Harness, code: u8) -> LinkEvent {
    LinkEvent::Gatt(GattEvent::CharacteristicWritten {
        characteristic: h.peripheral.handle(CHAR_COMMAND).unwrap(),
        value: vec![code],
        status: GattStatus::SUCCESS,
    })
}

#[tokio::test]
async fn connect_walks_through_initialization_to_ready() {
    let mut h = Harness::simulated();
    h.device.connect().unwrap();
    h.pump();

    let events = h.take_events();
    assert_eq!(events[0], DeviceEvent::TransportBound);
    assert_eq!(
        states(&events),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Initializing,
            ConnectionState::Ready
        ]
    );

    let info: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::DeviceInformationChanged { field, .. } => Some(*field),
            _ => None,
        })
        .collect();
    assert_eq!(info.len(), 5);
    assert!(!info.contains(&DeviceInfoField::SoftwareRevision));
    assert!(events.contains(&DeviceEvent::BatteryLevelChanged(87)));
    assert!(events.contains(&DeviceEvent::SensorNotificationChanged(true)));

    // Ready is announced after the notification that caused it
    let ready_at = events
        .iter()
        .position(|e| *e == DeviceEvent::StateChanged(ConnectionState::Ready))
        .unwrap();
    let notify_at = events
        .iter()
        .position(|e| *e == DeviceEvent::SensorNotificationChanged(true))
        .unwrap();
    assert!(notify_at < ready_at);

    assert_eq!(
        h.device.device_information(DeviceInfoField::HardwareRevision),
        "B"
    );
    assert_eq!(h.device.battery_level_text(), "87%");
}

#[tokio::test]
async fn connect_refused_without_usable_transport() {
    let descriptor = PeripheralDescriptor::new(ADDRESS, None, -60);
    let (mut unbound, _rx) =
        HeatFlowDevice::<SimulatedTransport>::new(descriptor, LinkConfig::default());
    assert_eq!(unbound.connect(), Err(LinkError::TransportUnavailable));
    assert!(!unbound.disconnect());

    let mut h = Harness::simulated();
    h.peripheral.set_adapter_ready(false);
    assert_eq!(h.device.connect(), Err(LinkError::TransportUnavailable));
    assert_eq!(h.device.state(), ConnectionState::default());
    assert!(h.peripheral.calls().is_empty());

    let mut nameless = Harness::new(SimulatedTransport::heatflow(), LinkConfig::default());
    *nameless.device.descriptor_mut() = PeripheralDescriptor::new("", None, -60);
    assert_eq!(nameless.device.connect(), Err(LinkError::InvalidDescriptor));
}

#[tokio::test]
async fn connect_only_from_disconnected() {
    let mut h = Harness::simulated();
    h.connect_ready();

    assert_eq!(h.device.connect(), Err(LinkError::AlreadyConnected));
    h.device
        .handle_event(LinkEvent::Connection(ConnectionEvent::Connecting));
    assert_eq!(h.device.state(), ConnectionState::Ready);
    assert!(states(&h.take_events()).is_empty());
}

#[tokio::test]
async fn missing_mandatory_service_marks_device_invalid() {
    let mut h = Harness::new(
        SimulatedTransport::heatflow().without_service(SERVICE_SENSOR),
        LinkConfig {
            auto_reconnect: true,
            ..LinkConfig::default()
        },
    );
    h.device.connect().unwrap();
    h.pump();

    let events = h.take_events();
    assert_eq!(
        states(&events),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Initializing,
            ConnectionState::ErrorNotValid,
            ConnectionState::Disconnected { status: 0 },
        ]
    );
    assert!(events.contains(&DeviceEvent::RecoveryHint));
    assert_eq!(
        protocol_errors(&events),
        vec![LinkError::DeviceNotValid {
            missing: ServiceKind::Sensor
        }]
    );
    assert_eq!(h.count_calls(|c| *c == TransportCall::ClearGattCache), 1);
    assert_eq!(
        h.count_calls(|c| matches!(c, TransportCall::Connect { .. })),
        1
    );
}

#[tokio::test]
async fn connection_failures_collapse_to_disconnected() {
    let descriptor = PeripheralDescriptor::new(ADDRESS, None, -60);
    let (mut device, _rx) = HeatFlowDevice::new(descriptor, LinkConfig::default());
    let (_, mut events) = device.subscribe();
    // Records only, events are injected by hand
    device.bind(SimulatedTransport::heatflow());

    device.connect().unwrap();
    device.handle_event(LinkEvent::Connection(ConnectionEvent::Failed(
        ConnectionFailure::Timeout,
    )));

    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Connecting,
            ConnectionState::ErrorTimeout,
            ConnectionState::Disconnected { status: 0 },
        ]
    );
    assert_eq!(protocol_errors(&seen), vec![LinkError::ConnectionTimeout]);

    device.connect().unwrap();
    device.handle_event(LinkEvent::Connection(ConnectionEvent::Connected));
    device.handle_event(LinkEvent::Connection(ConnectionEvent::Failed(
        ConnectionFailure::ServiceDiscovery { status: 133 },
    )));
    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Initializing,
            ConnectionState::ErrorDiscoveringServices { status: 133 },
            ConnectionState::Disconnected { status: 133 },
        ]
    );
}

#[tokio::test]
async fn measurement_commands_are_acknowledged() {
    let mut h = Harness::simulated();
    h.connect_ready();

    h.device.enable_measurement().unwrap();
    h.device.configure_ads(1, 0x0483).unwrap();
    h.pump();

    let events = h.take_events();
    assert_eq!(
        events,
        vec![
            DeviceEvent::CommandAcknowledged(SensorCommand::Start),
            DeviceEvent::ConfigurationChanged(AdsConfigFrame {
                index: 1,
                config: 0x0483
            }),
        ]
    );
    assert_eq!(
        h.peripheral.calls(),
        vec![
            TransportCall::Write {
                characteristic: CHAR_COMMAND,
                value: vec![1]
            },
            TransportCall::Write {
                characteristic: CHAR_ADS_CONFIGURATION,
                value: vec![0x01, 0x83, 0x04]
            },
        ]
    );
}

#[tokio::test]
async fn pending_command_goes_before_pending_configuration() {
    let mut h = Harness::simulated();
    h.connect_ready();
    h.peripheral.set_ack_writes(false);

    // Occupy the link, then queue configuration ahead of a command
    h.device.set_command(SensorCommand::SingleAdc).unwrap();
    h.device.configure_ads(0, 7).unwrap();
    h.device.set_command(SensorCommand::Start).unwrap();
    h.device.set_command(SensorCommand::Temperature).unwrap();
    assert_eq!(h.peripheral.calls().len(), 1);

    let ack = command_ack(&h, 2);
    h.device.handle_event(ack);
    let ack = command_ack(&h, 4);
    h.device.handle_event(ack);

    let writes: Vec<_> = h
        .peripheral
        .calls()
        .into_iter()
        .map(|c| match c {
            TransportCall::Write {
                characteristic,
                value,
            } => (characteristic, value),
            other => panic!("unexpected call {:?}", other),
        })
        .collect();
    assert_eq!(
        writes,
        vec![
            (CHAR_COMMAND, vec![2]),
            (CHAR_COMMAND, vec![4]),
            (CHAR_ADS_CONFIGURATION, vec![0x00, 0x07, 0x00]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_write_times_out_once_and_queue_advances() {
    let mut h = Harness::simulated();
    h.connect_ready();
    h.peripheral.set_ack_writes(false);

    h.device.enable_measurement().unwrap();
    h.device.configure_ads(0, 0x0100).unwrap();

    let expiry = h.link_rx.recv().await.unwrap();
    assert!(matches!(expiry, LinkEvent::ResponseTimeout(_)));
    h.device.handle_event(expiry);

    assert_eq!(
        protocol_errors(&h.take_events()),
        vec![LinkError::CommandTimeout { timeout_ms: 8000 }]
    );
    assert_eq!(
        h.count_calls(|c| matches!(c, TransportCall::Write { characteristic, .. } if *characteristic == CHAR_ADS_CONFIGURATION)),
        1
    );

    let expiry = h.link_rx.recv().await.unwrap();
    h.device.handle_event(expiry);
    assert_eq!(
        protocol_errors(&h.take_events()),
        vec![LinkError::ConfigurationTimeout { timeout_ms: 8000 }]
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.link_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn link_loss_cancels_outstanding_response_timer() {
    let mut h = Harness::simulated();
    h.connect_ready();
    h.peripheral.set_ack_writes(false);

    h.device.enable_measurement().unwrap();
    h.peripheral.drop_link(8);
    h.pump();
    assert_eq!(h.device.state(), ConnectionState::Disconnected { status: 8 });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.link_rx.try_recv().is_err());
    assert!(protocol_errors(&h.take_events()).is_empty());
    assert_eq!(h.device.battery_level_text(), "-");
}

#[tokio::test]
async fn value_frames_are_decoded_or_rejected_whole() {
    let mut h = Harness::simulated();
    h.connect_ready();

    h.peripheral.notify_values_raw(&[0x83, 0x01, 0x00, 0x00, 0x00]);
    h.peripheral.notify_values_raw(&[0x83, 0x01]);
    h.pump();

    assert_eq!(
        h.take_events(),
        vec![
            DeviceEvent::SensorValues(AdsValueFrame {
                channel: 1,
                mux: 1,
                pga: 0,
                is_float: true,
                raw: Some(1),
            }),
            DeviceEvent::ProtocolError(LinkError::Frame(FrameError::Size {
                expected: 5,
                actual: 2
            })),
        ]
    );
}

#[tokio::test]
async fn battery_notifications_update_cached_level() {
    let mut h = Harness::simulated();
    h.connect_ready();

    h.peripheral.notify_battery(42);
    h.pump();
    assert_eq!(h.take_events(), vec![DeviceEvent::BatteryLevelChanged(42)]);
    assert_eq!(h.device.battery_level_text(), "42%");
    assert_eq!(h.count_calls(|c| *c == TransportCall::Read(CHAR_BATTERY_LEVEL)), 0);
}

#[tokio::test]
async fn values_notification_toggle_is_idempotent() {
    let mut h = Harness::simulated();
    h.connect_ready();

    h.device.set_values_notification(true).unwrap();
    assert!(h.peripheral.calls().is_empty());

    h.device.set_values_notification(false).unwrap();
    h.pump();
    assert_eq!(h.peripheral.calls().len(), 1);
    assert_eq!(
        h.take_events(),
        vec![DeviceEvent::SensorNotificationChanged(false)]
    );
    assert!(h.device.is_ready());
}

#[tokio::test]
async fn authorization_error_bonds_and_retries_enablement() {
    let mut h = Harness::simulated();
    h.peripheral.set_requires_bond(true);
    h.device.connect().unwrap();
    h.pump();

    assert!(h.peripheral.is_bonded());
    assert!(h.device.is_ready());
    assert_eq!(h.count_calls(|c| *c == TransportCall::CreateBond), 1);

    // Both descriptor writes were refused before bonding and go out again after
    let battery_toggles = h.count_calls(|c| {
        matches!(c, TransportCall::NotificationConfig { characteristic, enable: true } if *characteristic == CHAR_BATTERY_LEVEL)
    });
    let values_toggles = h.count_calls(|c| {
        matches!(c, TransportCall::NotificationConfig { characteristic, enable: true } if *characteristic == CHAR_ADS_VALUES)
    });
    assert_eq!((battery_toggles, values_toggles), (2, 2));

    let events = h.take_events();
    assert!(protocol_errors(&events).is_empty());
    assert!(events.contains(&DeviceEvent::BatteryNotificationChanged(true)));
    assert_eq!(
        h.device.device_information(DeviceInfoField::ManufacturerName),
        "HES-SO Valais"
    );
    assert_eq!(h.device.battery_level_text(), "87%");
}

#[tokio::test]
async fn failed_bonding_is_reported() {
    let mut h = Harness::simulated();
    h.peripheral.set_requires_bond(true);
    h.peripheral.set_bond_succeeds(false);
    h.device.connect().unwrap();
    h.pump();

    assert_eq!(
        protocol_errors(&h.take_events()),
        vec![LinkError::BondingFailed]
    );
    assert_eq!(h.count_calls(|c| *c == TransportCall::CreateBond), 1);
}

#[tokio::test]
async fn adapter_off_releases_transport() {
    let mut h = Harness::simulated();
    h.connect_ready();

    h.peripheral.power_off();
    h.pump();

    let events = h.take_events();
    assert_eq!(
        events,
        vec![
            DeviceEvent::StateChanged(ConnectionState::Disconnected { status: 0 }),
            DeviceEvent::AdapterOff,
        ]
    );
    assert!(h.device.transport().is_none());
    assert!(!h.device.is_available());
    assert_eq!(h.count_calls(|c| *c == TransportCall::Disconnect), 1);
    assert_eq!(h.device.connect(), Err(LinkError::TransportUnavailable));
    assert_eq!(h.device.battery_level_text(), "-");
}

#[tokio::test]
async fn disconnect_waits_for_transport_event() {
    let descriptor = PeripheralDescriptor::new(ADDRESS, None, -60);
    let (mut device, _rx) = HeatFlowDevice::new(descriptor, LinkConfig::default());
    device.bind(SimulatedTransport::heatflow());
    device.connect().unwrap();
    device.handle_event(LinkEvent::Connection(ConnectionEvent::Connected));

    assert!(device.disconnect());
    assert_eq!(device.state(), ConnectionState::Initializing);

    device.handle_event(LinkEvent::Connection(ConnectionEvent::Disconnected {
        status: 0,
    }));
    assert_eq!(device.state(), ConnectionState::Disconnected { status: 0 });
    assert!(!device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects_when_enabled() {
    let mut h = Harness::new(
        SimulatedTransport::heatflow(),
        LinkConfig {
            auto_reconnect: true,
            ..LinkConfig::default()
        },
    );
    h.connect_ready();

    h.peripheral.drop_link(8);
    h.pump();
    assert_eq!(h.device.state(), ConnectionState::Disconnected { status: 8 });

    let due = h.link_rx.recv().await.unwrap();
    assert!(matches!(due, LinkEvent::ReconnectDue(_)));
    h.device.handle_event(due);
    h.pump();

    assert!(h.device.is_ready());
    assert_eq!(
        h.count_calls(|c| matches!(c, TransportCall::Connect { .. })),
        1
    );

    // A requested disconnect is never retried
    h.device.disconnect();
    h.pump();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.link_rx.try_recv().is_err());
    assert_eq!(h.device.state(), ConnectionState::Disconnected { status: 0 });
}

#[tokio::test(start_paused = true)]
async fn failed_reconnects_stop_after_max_attempts() {
    let mut h = Harness::new(
        SimulatedTransport::heatflow(),
        LinkConfig {
            auto_reconnect: true,
            ..LinkConfig::default()
        },
    );
    h.connect_ready();

    h.peripheral.set_in_range(false);
    h.peripheral.drop_link(8);
    h.pump();

    for attempt in 1..=3 {
        let due = h.link_rx.recv().await.unwrap();
        assert!(
            matches!(due, LinkEvent::ReconnectDue(_)),
            "attempt {}: {:?}",
            attempt,
            due
        );
        h.device.handle_event(due);
        h.pump();
        assert_eq!(h.device.state(), ConnectionState::Disconnected { status: 0 });
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.link_rx.try_recv().is_err());
    assert_eq!(
        h.count_calls(|c| matches!(c, TransportCall::Connect { .. })),
        3
    );
    assert_eq!(
        protocol_errors(&h.take_events()),
        vec![LinkError::ConnectionTimeout; 3]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_retried_when_attempt_drops_while_connecting() {
    let descriptor = PeripheralDescriptor::new(ADDRESS, None, -60);
    let config = LinkConfig {
        auto_reconnect: true,
        ..LinkConfig::default()
    };
    let (mut device, mut link_rx) = HeatFlowDevice::new(descriptor, config);
    device.bind(SimulatedTransport::heatflow());

    device.connect().unwrap();
    device.handle_event(LinkEvent::Connection(ConnectionEvent::Connected));
    device.handle_event(LinkEvent::Connection(ConnectionEvent::Disconnected {
        status: 8,
    }));

    let due = link_rx.recv().await.unwrap();
    device.handle_event(due);
    assert_eq!(device.state(), ConnectionState::Connecting);

    device.handle_event(LinkEvent::Connection(ConnectionEvent::Disconnected {
        status: 133,
    }));
    assert_eq!(device.state(), ConnectionState::Disconnected { status: 133 });
    assert!(matches!(
        link_rx.recv().await.unwrap(),
        LinkEvent::ReconnectDue(_)
    ));
}

#[tokio::test]
async fn connect_timeout_is_handed_to_transport() {
    let mut h = Harness::simulated();
    h.device
        .connect_with_timeout(Duration::from_secs(3))
        .unwrap();
    h.pump();
    assert!(h.device.is_ready());
    assert_eq!(
        h.peripheral.calls()[0],
        TransportCall::Connect {
            address: ADDRESS.to_string(),
            timeout: Duration::from_secs(3),
        }
    );

    h.device.disconnect();
    h.pump();
    h.peripheral.clear_calls();
    h.device.connect().unwrap();
    assert_eq!(
        h.peripheral.calls()[0],
        TransportCall::Connect {
            address: ADDRESS.to_string(),
            timeout: LinkConfig::default().connection_timeout,
        }
    );
}

#[tokio::test]
async fn recovery_operations_reach_transport() {
    let mut h = Harness::simulated();
    assert!(h.device.recover_device());
    assert!(h.device.remove_bond());
    assert_eq!(
        h.peripheral.calls(),
        vec![TransportCall::ClearGattCache, TransportCall::RemoveBond]
    );
}
