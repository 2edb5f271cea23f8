use std::collections::HashMap;
use std::time::Duration;

use log::trace;
use serde::Serialize;
use tokio::time::Instant;

use crate::{CharacteristicHandle, ListenerToken, PeripheralId};

/// The default window within which an identical payload for the same key
/// is treated as a redelivery by the driver
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    pub peripheral_id: PeripheralId,
    pub service_uuid: String,
    pub char_uuid: String,
}

impl SubscriptionKey {
    /// Builds a key, normalizing both UUIDs
    pub fn new(peripheral_id: PeripheralId, service_uuid: &str, char_uuid: &str) -> Self {
        SubscriptionKey {
            peripheral_id,
            service_uuid: crate::uuid::normalize(service_uuid),
            char_uuid: crate::uuid::normalize(char_uuid),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SubscriptionRecord {
    pub(crate) key: SubscriptionKey,
    pub(crate) handle: CharacteristicHandle,
    pub(crate) token: ListenerToken,
}

#[derive(Clone, Debug)]
struct LastPayload {
    hex: String,
    at: Instant,
}

/// All active notification subscriptions, at most one per key, plus the
/// last payload seen for each key for de-duplication.
#[derive(Debug)]
pub(crate) struct SubscriptionTable {
    records: HashMap<SubscriptionKey, SubscriptionRecord>,
    by_token: HashMap<ListenerToken, SubscriptionKey>,
    last_payloads: HashMap<SubscriptionKey, LastPayload>,
    dedup_window: Duration,
}

impl SubscriptionTable {
    pub(crate) fn new(dedup_window: Duration) -> Self {
        SubscriptionTable {
            records: HashMap::new(),
            by_token: HashMap::new(),
            last_payloads: HashMap::new(),
            dedup_window,
        }
    }

    pub(crate) fn contains(&self, key: &SubscriptionKey) -> bool {
        self.records.contains_key(key)
    }

    pub(crate) fn insert(&mut self, record: SubscriptionRecord) {
        self.by_token.insert(record.token, record.key.clone());
        if let Some(replaced) = self.records.insert(record.key.clone(), record) {
            self.by_token.remove(&replaced.token);
        }
    }

    pub(crate) fn remove(&mut self, key: &SubscriptionKey) -> Option<SubscriptionRecord> {
        let record = self.records.remove(key)?;
        self.by_token.remove(&record.token);
        Some(record)
    }

    /// Removes and returns every record belonging to the given peripheral
    pub(crate) fn take_for_peripheral(&mut self, peripheral_id: &PeripheralId) -> Vec<SubscriptionRecord> {
        let keys = self.keys_for(peripheral_id);
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub(crate) fn clear_dedup_for_peripheral(&mut self, peripheral_id: &PeripheralId) {
        self.last_payloads
            .retain(|key, _| &key.peripheral_id != peripheral_id);
    }

    pub(crate) fn keys_for(&self, peripheral_id: &PeripheralId) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .records
            .keys()
            .filter(|key| &key.peripheral_id == peripheral_id)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Maps a value delivered for a listener token to its subscription key.
    ///
    /// Returns `None` if the token no longer belongs to a subscription or
    /// the payload repeats the previous one for the same key within the
    /// de-duplication window. A dropped duplicate doesn't move the window.
    pub(crate) fn route(&mut self, token: ListenerToken, hex: &str, received_at: Instant)
                        -> Option<SubscriptionKey> {
        let key = match self.by_token.get(&token) {
            Some(key) => key.clone(),
            None => {
                trace!("Dropping value for detached listener {:?}", token);
                return None;
            }
        };

        if let Some(prev) = self.last_payloads.get(&key) {
            if prev.hex == hex
               && received_at.saturating_duration_since(prev.at) < self.dedup_window
            {
                trace!("Dropping duplicate notification for {:?}", key);
                return None;
            }
        }

        self.last_payloads.insert(key.clone(), LastPayload {
            hex: hex.to_string(),
            at: received_at,
        });
        Some(key)
    }

    #[cfg(test)]
    fn has_dedup_state(&self, key: &SubscriptionKey) -> bool {
        self.last_payloads.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, service: &str, char: &str) -> SubscriptionKey {
        SubscriptionKey::new(PeripheralId::from(id), service, char)
    }

    fn table_with(keys: &[(&SubscriptionKey, u32)]) -> SubscriptionTable {
        let mut table = SubscriptionTable::new(DEFAULT_DEDUP_WINDOW);
        for (key, token) in keys {
            table.insert(SubscriptionRecord {
                key: (*key).clone(),
                handle: CharacteristicHandle(*token),
                token: ListenerToken(*token),
            });
        }
        table
    }

    #[test]
    fn key_normalizes_uuids() {
        assert_eq!(key("dev-1", "FFE0", "0000FFE1-0000-1000-8000-00805F9B34FB"),
                   key("dev-1", "ffe0", "ffe1"));
    }

    #[test]
    fn dedup_window_boundaries() {
        let k = key("dev-1", "ffe0", "ffe1");
        let mut table = table_with(&[(&k, 1)]);
        let t0 = Instant::now();

        assert_eq!(table.route(ListenerToken(1), "0102", t0), Some(k.clone()));
        // identical payload inside the window
        assert_eq!(table.route(ListenerToken(1), "0102", t0 + Duration::from_millis(3)), None);
        // the dropped duplicate didn't restart the window
        assert_eq!(table.route(ListenerToken(1), "0102", t0 + Duration::from_millis(10)),
                   Some(k.clone()));
        // a different payload always passes
        assert_eq!(table.route(ListenerToken(1), "0103", t0 + Duration::from_millis(11)),
                   Some(k.clone()));
        assert_eq!(table.route(ListenerToken(1), "0102", t0 + Duration::from_millis(12)),
                   Some(k));
    }

    #[test]
    fn dedup_is_per_key() {
        let a = key("dev-1", "ffe0", "ffe1");
        let b = key("dev-1", "ffe0", "ffe2");
        let mut table = table_with(&[(&a, 1), (&b, 2)]);
        let t0 = Instant::now();

        assert_eq!(table.route(ListenerToken(1), "aa", t0), Some(a));
        assert_eq!(table.route(ListenerToken(2), "aa", t0), Some(b));
    }

    #[test]
    fn unknown_token_is_dropped() {
        let mut table = table_with(&[]);
        assert_eq!(table.route(ListenerToken(5), "00", Instant::now()), None);
    }

    #[test]
    fn take_for_peripheral_only_takes_that_peripheral() {
        let a = key("dev-1", "ffe0", "ffe1");
        let b = key("dev-1", "180f", "2a19");
        let c = key("dev-2", "ffe0", "ffe1");
        let mut table = table_with(&[(&a, 1), (&b, 2), (&c, 3)]);
        table.route(ListenerToken(1), "01", Instant::now());
        table.route(ListenerToken(3), "01", Instant::now());

        let taken = table.take_for_peripheral(&PeripheralId::from("dev-1"));
        assert_eq!(taken.len(), 2);
        assert!(!table.contains(&a) && !table.contains(&b));
        assert!(table.contains(&c));
        // tokens of removed records no longer route
        assert_eq!(table.route(ListenerToken(2), "02", Instant::now()), None);

        table.clear_dedup_for_peripheral(&PeripheralId::from("dev-1"));
        assert!(!table.has_dedup_state(&a));
        assert!(table.has_dedup_state(&c));
    }
}
