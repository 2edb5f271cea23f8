use std::collections::HashMap;

use serde::Serialize;

use crate::characteristic::CharacteristicProperties;
use crate::{CharacteristicHandle, ServiceHandle};

/// A primary service as reported by the driver's service discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: String,
    pub handle: ServiceHandle,
}

/// A characteristic as reported by the driver, including the native handle
/// the driver needs for any further IO.
///
/// The handle is only meaningful while the peripheral stays connected and
/// is never handed to applications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: String,
    pub properties: CharacteristicProperties,
    pub handle: CharacteristicHandle,
}

/// The application-facing view of a characteristic
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: String,
    pub properties: CharacteristicProperties,
}

impl From<&CharacteristicDescriptor> for CharacteristicInfo {
    fn from(descriptor: &CharacteristicDescriptor) -> Self {
        CharacteristicInfo {
            uuid: descriptor.uuid.clone(),
            properties: descriptor.properties,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Per-peripheral characteristic lookup keyed by normalized
/// `(service uuid, characteristic uuid)`.
///
/// Lives inside the peripheral's state and is emptied whenever the
/// peripheral leaves the connected state.
#[derive(Debug, Default)]
pub(crate) struct CharacteristicCache {
    entries: HashMap<(String, String), CharacteristicDescriptor>,
}

impl CharacteristicCache {
    pub(crate) fn get(&self, service_uuid: &str, char_uuid: &str) -> Option<&CharacteristicDescriptor> {
        self.entries
            .get(&(service_uuid.to_string(), char_uuid.to_string()))
    }

    pub(crate) fn insert(&mut self, service_uuid: &str, descriptor: CharacteristicDescriptor) {
        self.entries
            .insert((service_uuid.to_string(), descriptor.uuid.clone()), descriptor);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(uuid: &str, handle: u32) -> CharacteristicDescriptor {
        CharacteristicDescriptor {
            uuid: uuid.to_string(),
            properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            handle: CharacteristicHandle(handle),
        }
    }

    #[test]
    fn cache_keys_on_service_and_characteristic() {
        let mut cache = CharacteristicCache::default();
        cache.insert("180f", descriptor("2a19", 1));
        cache.insert("ffe0", descriptor("2a19", 2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("180f", "2a19").map(|d| d.handle), Some(CharacteristicHandle(1)));
        assert_eq!(cache.get("ffe0", "2a19").map(|d| d.handle), Some(CharacteristicHandle(2)));
        assert!(cache.get("180a", "2a19").is_none());

        // rediscovery overwrites
        cache.insert("180f", descriptor("2a19", 7));
        assert_eq!(cache.get("180f", "2a19").map(|d| d.handle), Some(CharacteristicHandle(7)));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn service_descriptor_hides_native_handle() {
        let service = ServiceDescriptor {
            uuid: "180f".to_string(),
            characteristics: vec![CharacteristicInfo::from(&descriptor("2a19", 9))],
        };
        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json,
                   serde_json::json!({
                       "uuid": "180f",
                       "characteristics": [{ "uuid": "2a19", "properties": ["read", "notify"] }]
                   }));
    }
}
