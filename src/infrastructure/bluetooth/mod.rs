//! Bluetooth Module
//!
//! Peripheral-session engine for the HeatFlow sensor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkService                         │
//! │   (async driver - pumps LinkEvents into the device)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   HeatFlowDevice                         │
//! │  (connection state machine, recovery, EventBus fan-out)  │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌────────────┐   ┌──────────────────┐  ┌──────────────────┐
//! │  Battery   │   │ DeviceInformation│  │     Sensor       │
//! │  session   │   │     session      │  │ session + queue  │
//! └────────────┘   └──────────────────┘  └────────┬─────────┘
//!                                                 │
//!                                                 ▼
//!                                          ┌────────────┐
//!                                          │  Protocol  │
//!                                          │ FrameCodec │
//!                                          └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers and binary frame codec
//! - [`transport`] - Radio stack boundary and link events
//! - [`event_bus`] - Subscriber registry
//! - [`timer`] - Response and reconnection timers
//! - [`session`] - Per-service sessions
//! - [`connection`] - Connection state machine
//! - [`service`] - Async event driver
//! - [`simulator`] - In-process simulated peripheral

pub mod connection;
pub mod event_bus;
pub mod protocol;
pub mod service;
pub mod session;
pub mod simulator;
pub mod timer;
pub mod transport;

pub use connection::{HeatFlowDevice, LinkConfig};
pub use service::LinkService;
pub use simulator::SimulatedTransport;
pub use transport::{LinkEvent, Transport};
