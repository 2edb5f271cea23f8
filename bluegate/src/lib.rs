use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

pub mod uuid;

pub mod session;

pub mod peripheral;
use peripheral::{Advertisement, PeripheralRecord};

pub mod service;

pub mod characteristic;

pub mod subscription;

pub mod fake;

/// An opaque identifier for a physical device, stable for the lifetime of
/// the process.
///
/// Ids are assigned by the driver when a device is first seen advertising
/// and the session only ever learns about ids through advertisements, so
/// an id can't be used before it has been discovered at least once.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId(id.to_string())
    }
}
impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

/// Power state of the (single) radio adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}
impl AdapterState {
    /// Only a powered on adapter can scan or connect
    pub fn is_ready(self) -> bool {
        self == AdapterState::PoweredOn
    }
}
impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "poweredOff",
            AdapterState::PoweredOn => "poweredOn",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    /// The application asked for the disconnect
    Local,
    /// The driver reported an unsolicited disconnect
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

/// Identifies a data callback registered with the driver via
/// `BackendSession::attach_value_listener`. The callback stays registered
/// until the token is handed back to `detach_value_listener`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(pub u32);

/// The flavour of a characteristic value delivered by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Notification,
    Indication,
    Read,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Not Connected")]
    NotConnected,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("General Failure: {0}")]
    GeneralFailure(String),
}

/// Events fed from a driver backend into the session's event bridge.
///
/// A backend is handed the sending end of an unbounded channel when the
/// session starts and pushes these as the radio reports them.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    AdapterStateChanged {
        state: AdapterState,
    },
    PeripheralAdvertised {
        advertisement: Advertisement,
    },
    PeripheralDisconnected {
        peripheral_id: PeripheralId,
    },
    CharacteristicValue {
        token: ListenerToken,
        value: Vec<u8>,
        kind: ValueKind,
        // Stamped by the driver when the value arrived, so de-duplication
        // isn't skewed by how long the value sat in the queue
        received_at: Instant,
    },
}

/// Events broadcast to session subscribers.
///
/// Everything is sent by value; UUIDs are lowercase without separators and
/// binary payloads are lowercase hex.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    AdapterStateChanged {
        state: AdapterState,
    },
    DeviceDiscovered {
        peripheral: PeripheralRecord,
    },
    ScanFinished,
    ErrorOccurred {
        context: String,
        message: String,
    },
    Connected {
        peripheral: PeripheralRecord,
    },
    /// Once a peripheral has disconnected all of its cached characteristics
    /// and notification subscriptions are gone and have to be set up again
    /// after reconnecting.
    Disconnected {
        peripheral_id: PeripheralId,
        reason: DisconnectReason,
    },
    NotificationData {
        peripheral_id: PeripheralId,
        service_uuid: String,
        char_uuid: String,
        hex: String,
    },
}

impl Event {
    /// The peripheral this event relates to, if any
    pub fn peripheral_id(&self) -> Option<&PeripheralId> {
        match self {
            Event::DeviceDiscovered { peripheral } | Event::Connected { peripheral } => {
                Some(&peripheral.id)
            }
            Event::Disconnected { peripheral_id, .. }
            | Event::NotificationData { peripheral_id, .. } => Some(peripheral_id),
            Event::AdapterStateChanged { .. } | Event::ScanFinished | Event::ErrorOccurred { .. } => {
                None
            }
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Adapter not poweredOn (state={0})")]
    AdapterNotReady(AdapterState),

    #[error("Peripheral {0} not found")]
    PeripheralNotFound(PeripheralId),

    #[error("Service {0} not found")]
    ServiceNotFound(String),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(String),

    #[error("{0}")]
    OperationFailed(String),
}

impl From<GattError> for Error {
    fn from(err: GattError) -> Self {
        Error::OperationFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = Error::AdapterNotReady(AdapterState::PoweredOff);
        assert_eq!(err.to_string(), "Adapter not poweredOn (state=poweredOff)");

        let err = Error::PeripheralNotFound(PeripheralId::from("dev-1"));
        assert_eq!(err.to_string(), "Peripheral dev-1 not found");

        let err: Error = GattError::ReadNotPermitted.into();
        assert_eq!(err, Error::OperationFailed("Read Not Permitted".to_string()));
    }

    #[test]
    fn event_wire_shape() {
        let event = Event::Disconnected {
            peripheral_id: PeripheralId::from("dev-1"),
            reason: DisconnectReason::Remote,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "disconnected", "peripheralId": "dev-1", "reason": "remote" })
        );

        let json = serde_json::to_value(&Event::AdapterStateChanged { state: AdapterState::PoweredOn }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "adapterStateChanged", "state": "poweredOn" }));

        let json = serde_json::to_value(&Event::ScanFinished).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "scanFinished" }));
    }

    #[test]
    fn event_peripheral_id() {
        let event = Event::NotificationData {
            peripheral_id: PeripheralId::from("dev-1"),
            service_uuid: "ffe0".to_string(),
            char_uuid: "ffe1".to_string(),
            hex: "0102".to_string(),
        };
        assert_eq!(event.peripheral_id(), Some(&PeripheralId::from("dev-1")));
        assert_eq!(Event::ScanFinished.peripheral_id(), None);
    }
}
