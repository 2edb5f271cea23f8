use std::ops::Deref;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use dashmap::DashMap;
use log::trace;
use serde::{Serialize, Serializer};
use tokio::sync::Mutex;

use crate::service::CharacteristicCache;
use crate::PeripheralId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// What a driver reports each time a device advertises.
#[derive(Clone, Debug, PartialEq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub connectable: bool,
    pub service_uuids: Vec<String>,
    pub manufacturer_data: Option<Vec<u8>>,
}

impl Advertisement {
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Self {
            id: id.into(),
            address: String::new(),
            local_name: None,
            rssi: 0,
            connectable: true,
            service_uuids: vec![],
            manufacturer_data: None,
        }
    }
}

/// A value snapshot of everything known about a peripheral.
///
/// Records are created by the first advertisement seen for an id and are
/// never removed afterwards; ending a scan or disconnecting only changes
/// `state`, so a previously seen peripheral can be connected to again
/// without rescanning.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralRecord {
    pub id: PeripheralId,
    pub address: String,
    pub local_name: String,
    pub rssi: i16,
    pub connectable: bool,
    #[serde(rename = "serviceUuids")]
    pub advertised_service_uuids: Vec<String>,
    #[serde(serialize_with = "serialize_hex", skip_serializing_if = "Option::is_none")]
    pub manufacturer_data: Option<Vec<u8>>,
    pub state: ConnectionState,
}

fn serialize_hex<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match data {
        Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
        None => serializer.serialize_none(),
    }
}

impl PeripheralRecord {
    fn from_advertisement(advertisement: Advertisement) -> Self {
        PeripheralRecord {
            id: advertisement.id,
            address: advertisement.address,
            local_name: advertisement.local_name.unwrap_or_default(),
            rssi: advertisement.rssi,
            connectable: advertisement.connectable,
            advertised_service_uuids: advertisement
                .service_uuids
                .iter()
                .map(|uuid| crate::uuid::normalize(uuid))
                .collect(),
            manufacturer_data: advertisement.manufacturer_data,
            state: ConnectionState::Discovered,
        }
    }

    // Metadata refresh from a later advertisement. Scan responses often omit
    // the name or manufacturer data so those are only ever replaced, never
    // cleared.
    fn refresh(&mut self, advertisement: Advertisement) {
        self.address = advertisement.address;
        if let Some(name) = advertisement.local_name {
            self.local_name = name;
        }
        self.rssi = advertisement.rssi;
        self.connectable = advertisement.connectable;
        for uuid in advertisement.service_uuids.iter().map(|uuid| crate::uuid::normalize(uuid)) {
            if !self.advertised_service_uuids.contains(&uuid) {
                self.advertised_service_uuids.push(uuid);
            }
        }
        if advertisement.manufacturer_data.is_some() {
            self.manufacturer_data = advertisement.manufacturer_data;
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PeripheralState {
    // Note we use a std::sync RwLock since nothing awaits while holding
    // it, so reading a record never has to suspend
    pub(crate) inner: Arc<StdRwLock<PeripheralStateInner>>,

    // Serializes connect, disconnect, discovery, read/write and
    // (un)subscribe requests for this one peripheral. Requests for
    // different peripherals don't contend.
    pub(crate) ops: Arc<Mutex<()>>,
}
impl Deref for PeripheralState {
    type Target = Arc<StdRwLock<PeripheralStateInner>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug)]
pub(crate) struct PeripheralStateInner {
    pub(crate) record: PeripheralRecord,

    // Only valid while connected, see set_state()
    pub(crate) cache: CharacteristicCache,

    // One-shot: set by a successful connect and taken by whichever of a
    // local disconnect or an unsolicited driver disconnect comes first
    pub(crate) remote_disconnect_armed: bool,
}

impl PeripheralStateInner {
    pub(crate) fn is_connected(&self) -> bool {
        self.record.state == ConnectionState::Connected
    }

    /// Any transition out of `Connected` drops the characteristic cache
    /// since the native handles it holds are no longer valid.
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.record.state == ConnectionState::Connected && state != ConnectionState::Connected {
            trace!("Invalidating characteristic cache for {}", self.record.id);
            self.cache.clear();
        }
        self.record.state = state;
    }
}

impl PeripheralState {
    fn new(record: PeripheralRecord) -> Self {
        PeripheralState {
            inner: Arc::new(StdRwLock::new(PeripheralStateInner {
                record,
                cache: CharacteristicCache::default(),
                remote_disconnect_armed: false,
            })),
            ops: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn record(&self) -> PeripheralRecord {
        self.inner.read().unwrap().record.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.inner.read().unwrap().is_connected()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.write().unwrap().set_state(state);
    }
}

/// Durable map from peripheral id to what the session knows about it.
///
/// Only populated from advertisements the session itself observes.
#[derive(Debug, Default)]
pub(crate) struct PeripheralRegistry {
    peripherals: DashMap<PeripheralId, PeripheralState>,
}

impl PeripheralRegistry {
    /// Creates the record for a new id or refreshes the metadata of a known
    /// one, leaving its connection state untouched. Returns a snapshot.
    pub(crate) fn upsert_advertisement(&self, advertisement: Advertisement) -> PeripheralRecord {
        match self.get(&advertisement.id) {
            Some(peripheral_state) => {
                let mut state_guard = peripheral_state.write().unwrap();
                state_guard.record.refresh(advertisement);
                state_guard.record.clone()
            }
            None => {
                let record = PeripheralRecord::from_advertisement(advertisement);
                trace!("Registering new peripheral {}", record.id);
                self.peripherals
                    .insert(record.id.clone(), PeripheralState::new(record.clone()));
                record
            }
        }
    }

    pub(crate) fn get(&self, id: &PeripheralId) -> Option<PeripheralState> {
        self.peripherals.get(id).map(|item| item.value().clone())
    }

    pub(crate) fn snapshot(&self, id: &PeripheralId) -> Option<PeripheralRecord> {
        self.get(id).map(|peripheral_state| peripheral_state.record())
    }

    pub(crate) fn snapshots(&self) -> Vec<PeripheralRecord> {
        let mut records: Vec<PeripheralRecord> = self
            .peripherals
            .iter()
            .map(|item| item.value().record())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// All registered ids in order, whatever their connection state
    pub(crate) fn ids(&self) -> Vec<PeripheralId> {
        let mut ids: Vec<PeripheralId> = self.peripherals.iter().map(|item| item.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::CharacteristicProperties;
    use crate::service::CharacteristicDescriptor;
    use crate::CharacteristicHandle;

    fn advertisement(id: &str, rssi: i16) -> Advertisement {
        let mut advertisement = Advertisement::new(id);
        advertisement.address = "aa:bb:cc:dd:ee:ff".to_string();
        advertisement.rssi = rssi;
        advertisement
    }

    #[test]
    fn upsert_creates_discovered_record() {
        let registry = PeripheralRegistry::default();
        let mut adv = advertisement("dev-1", -60);
        adv.local_name = Some("Thermo".to_string());
        adv.service_uuids = vec!["0000180F-0000-1000-8000-00805F9B34FB".to_string()];

        let record = registry.upsert_advertisement(adv);
        assert_eq!(record.state, ConnectionState::Discovered);
        assert_eq!(record.local_name, "Thermo");
        assert_eq!(record.advertised_service_uuids, vec!["180f".to_string()]);
        assert_eq!(registry.snapshot(&PeripheralId::from("dev-1")), Some(record));
    }

    #[test]
    fn upsert_refreshes_metadata_but_not_state() {
        let registry = PeripheralRegistry::default();
        let mut adv = advertisement("dev-1", -60);
        adv.local_name = Some("Thermo".to_string());
        adv.manufacturer_data = Some(vec![0x4c, 0x00]);
        registry.upsert_advertisement(adv);
        registry.get(&PeripheralId::from("dev-1")).unwrap().set_state(ConnectionState::Connected);

        let record = registry.upsert_advertisement(advertisement("dev-1", -42));
        assert_eq!(record.rssi, -42);
        assert_eq!(record.local_name, "Thermo");
        assert_eq!(record.manufacturer_data, Some(vec![0x4c, 0x00]));
        assert_eq!(record.state, ConnectionState::Connected);
        registry.upsert_advertisement(advertisement("dev-0", -70));
        assert_eq!(registry.ids(), vec![PeripheralId::from("dev-0"), PeripheralId::from("dev-1")]);
    }

    #[test]
    fn leaving_connected_purges_cache() {
        let registry = PeripheralRegistry::default();
        registry.upsert_advertisement(advertisement("dev-1", -60));
        let peripheral_state = registry.get(&PeripheralId::from("dev-1")).unwrap();
        peripheral_state.set_state(ConnectionState::Connected);
        peripheral_state.write().unwrap().cache.insert("180f", CharacteristicDescriptor {
            uuid: "2a19".to_string(),
            properties: CharacteristicProperties::READ,
            handle: CharacteristicHandle(3),
        });

        peripheral_state.set_state(ConnectionState::Disconnecting);
        assert!(peripheral_state.read().unwrap().cache.is_empty());
        assert!(!peripheral_state.is_connected());
    }

    #[test]
    fn record_wire_shape() {
        let mut adv = advertisement("dev-1", -60);
        adv.manufacturer_data = Some(vec![0xAB, 0x01]);
        let record = PeripheralRecord::from_advertisement(adv);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["manufacturerData"], "ab01");
        assert_eq!(json["serviceUuids"], serde_json::json!([]));
        assert_eq!(json["state"], "discovered");
        assert_eq!(json["localName"], "");
    }
}
