//! Error types surfaced by the link engine.
//!
//! Link-level failures also show up as [`ConnectionState`](super::models::ConnectionState)
//! transitions; the variants here are what callers see on the event bus or as a rejected
//! request.

use thiserror::Error;
use uuid::Uuid;

/// Failure to decode one of the peripheral's binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid frame size: expected {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },

    #[error("unknown command code: {0}")]
    UnknownCommand(u8),
}

/// Which GATT service a request was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Battery,
    DeviceInformation,
    Sensor,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Battery => "battery",
            Self::DeviceInformation => "device information",
            Self::Sensor => "sensor",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("transport is not available (unbound or adapter off)")]
    TransportUnavailable,

    #[error("peripheral descriptor has no address")]
    InvalidDescriptor,

    #[error("a connection is already in progress")]
    AlreadyConnected,

    #[error("device is not valid: mandatory {missing} service missing")]
    DeviceNotValid { missing: ServiceKind },

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("service discovery failed with status {status}")]
    ServiceDiscovery { status: i32 },

    #[error("link requires authorization")]
    AuthorizationRequired,

    #[error("bonding with the peripheral failed")]
    BondingFailed,

    #[error("no {0} session available")]
    ServiceUnavailable(ServiceKind),

    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("command not acknowledged within {timeout_ms} ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("configuration not acknowledged within {timeout_ms} ms")]
    ConfigurationTimeout { timeout_ms: u64 },

    #[error("transport rejected the request")]
    RequestRejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_converts_into_link_error() {
        let err: LinkError = FrameError::Size {
            expected: 5,
            actual: 2,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "invalid frame size: expected 5 bytes, got 2"
        );
    }

    #[test]
    fn timeout_messages_carry_window() {
        let err = LinkError::CommandTimeout { timeout_ms: 8000 };
        assert_eq!(err.to_string(), "command not acknowledged within 8000 ms");
    }
}
