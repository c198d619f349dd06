//! Link Service
//!
//! Async driver around a [`HeatFlowDevice`]: it owns the device's event channel and
//! delivers events one at a time, so every transport callback, timer expiry and
//! acknowledgement is handled in a single context.

use crate::domain::models::{ConnectionState, PeripheralDescriptor};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::connection::{HeatFlowDevice, LinkConfig};
use crate::infrastructure::bluetooth::transport::{LinkEvent, LinkEventReceiver, Transport};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub struct LinkService<T: Transport> {
    device: HeatFlowDevice<T>,
    events: LinkEventReceiver,
    settings: Arc<Mutex<SettingsService>>,
}

impl<T: Transport> LinkService<T> {
    /// Create the service for `descriptor`, configured from the shared settings.
    pub fn new(
        descriptor: PeripheralDescriptor,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Result<Self> {
        let config = {
            let settings = settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            LinkConfig::from(settings.get())
        };

        let (device, events) = HeatFlowDevice::new(descriptor, config);
        Ok(Self {
            device,
            events,
            settings,
        })
    }

    pub fn device(&self) -> &HeatFlowDevice<T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut HeatFlowDevice<T> {
        &mut self.device
    }

    /// Wait for the next link event and handle it.
    pub async fn next_event(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Handle every event already queued. Returns how many were processed.
    pub fn pump_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Handle events until `done` holds for the device or `deadline` elapses.
    pub async fn run_until<F>(&mut self, deadline: Duration, mut done: F) -> bool
    where
        F: FnMut(&HeatFlowDevice<T>) -> bool,
    {
        let wait = async {
            while !done(&self.device) {
                if !self.next_event().await {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(deadline, wait).await.unwrap_or(false)
    }

    fn dispatch(&mut self, event: LinkEvent) {
        let before = self.device.state();
        self.device.handle_event(event);
        let after = self.device.state();

        if before != ConnectionState::Ready && after == ConnectionState::Ready {
            self.remember_device();
        }
    }

    fn remember_device(&self) {
        let address = self.device.descriptor().address();
        match self.settings.lock() {
            Ok(mut settings) => {
                if let Err(e) = settings.remember_address(address) {
                    warn!("Could not persist {}: {}", address, e);
                } else {
                    info!("Remembered {}", address);
                }
            }
            Err(_) => warn!("Settings lock poisoned, {} not remembered", address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulator::SimulatedTransport;
    use std::path::PathBuf;

    fn temp_settings_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("heatflow_link_{}_{}", name, std::process::id()));
        path.push("settings.json");
        path
    }

    #[tokio::test]
    async fn test_ready_link_is_remembered() {
        let path = temp_settings_path("service_ready");
        let settings = Arc::new(Mutex::new(SettingsService::with_path(path.clone())));
        let descriptor = PeripheralDescriptor::new("C0:FF:EE:00:00:07", None, -60);
        let mut service =
            LinkService::<SimulatedTransport>::new(descriptor, settings.clone()).unwrap();

        let peripheral = SimulatedTransport::heatflow().respond_to(service.device().link_sender());
        service.device_mut().bind(peripheral);
        service.device_mut().connect().unwrap();
        assert!(
            service
                .run_until(Duration::from_secs(1), |device| device.is_ready())
                .await
        );

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("C0:FF:EE:00:00:07")
        );
        assert_eq!(
            settings.lock().unwrap().get().known_addresses,
            vec!["C0:FF:EE:00:00:07".to_string()]
        );
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_link_that_never_gets_ready_is_not_remembered() {
        let path = temp_settings_path("service_not_ready");
        let settings = Arc::new(Mutex::new(SettingsService::with_path(path.clone())));
        let descriptor = PeripheralDescriptor::new("C0:FF:EE:00:00:08", None, -60);
        let mut service =
            LinkService::<SimulatedTransport>::new(descriptor, settings.clone()).unwrap();

        let peripheral = SimulatedTransport::heatflow().respond_to(service.device().link_sender());
        peripheral.set_in_range(false);
        service.device_mut().bind(peripheral);
        service.device_mut().connect().unwrap();
        assert_eq!(service.pump_pending(), 2);

        assert!(!service.device().is_connected());
        assert!(settings.lock().unwrap().get().last_connected_address.is_none());
        assert!(!path.exists());
    }
}
