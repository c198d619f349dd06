use heatflow_link::domain::models::{AdsValueFrame, DeviceEvent, PeripheralDescriptor};
use heatflow_link::domain::settings::SettingsService;
use heatflow_link::infrastructure::bluetooth::{LinkService, SimulatedTransport};
use heatflow_link::infrastructure::logging;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

const DEFAULT_ADDRESS: &str = "C0:FF:EE:00:00:01";

fn report(events: &mut UnboundedReceiver<DeviceEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            DeviceEvent::StateChanged(state) => info!("State: {}", state),
            DeviceEvent::SensorValues(frame) => info!(
                "ADS{} mux={} pga={} value={:?}",
                frame.channel,
                frame.mux,
                frame.pga,
                frame.value()
            ),
            DeviceEvent::ProtocolError(e) => warn!("Protocol error: {}", e),
            other => info!("{:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting HeatFlow link demo");

    let address = std::env::args()
        .nth(1)
        .or_else(|| settings_service.get().last_connected_address.clone())
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    let settings = Arc::new(Mutex::new(settings_service));

    let descriptor = PeripheralDescriptor::new(address, Some("HeatFlow".to_string()), -58);
    let mut service = LinkService::new(descriptor, settings)?;

    let peripheral = SimulatedTransport::heatflow().respond_to(service.device().link_sender());
    service.device_mut().bind(peripheral.clone());
    let (_, mut events) = service.device_mut().subscribe();

    service.device_mut().connect()?;
    if !service
        .run_until(Duration::from_secs(5), |device| device.is_ready())
        .await
    {
        anyhow::bail!("Device did not become ready");
    }
    report(&mut events);

    service.device_mut().enable_measurement()?;
    service.device_mut().configure_ads(0, 0x0483)?;
    service.pump_pending();

    for i in 0..4u8 {
        peripheral.notify_values(&AdsValueFrame {
            channel: (i % 2) as i8,
            mux: 3,
            pga: 1,
            is_float: true,
            raw: Some((21.5f32 + f32::from(i) * 0.25).to_bits() as i32),
        });
    }
    service.pump_pending();
    report(&mut events);

    service.device_mut().disable_measurement()?;
    service.pump_pending();
    info!("Battery: {}", service.device_mut().battery_level_text());

    service.device_mut().disconnect();
    service
        .run_until(Duration::from_secs(1), |device| !device.is_connected())
        .await;
    report(&mut events);

    Ok(())
}
