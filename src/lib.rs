//! Peripheral-session engine for the HeatFlow wireless heat-flux sensor.
//!
//! [`infrastructure::bluetooth::HeatFlowDevice`] drives one peripheral through its
//! connection lifecycle and talks the sensor's GATT protocol over any
//! [`infrastructure::bluetooth::Transport`].

pub mod domain;
pub mod infrastructure;
