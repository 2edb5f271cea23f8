//! A scriptable in-process adapter.
//!
//! The fake stands in for a native driver so that sessions can run without
//! a radio. Tests (and demos) keep a clone of the [`FakeAdapter`] handed to
//! [`crate::session::Backend::Fake`] and use it to add devices, advertise,
//! push notifications, drop connections and inject failures or latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use log::trace;
use tokio::sync::mpsc;

use crate::characteristic::{CharacteristicProperties, WriteType};
use crate::peripheral::Advertisement;
use crate::{AdapterState, BackendEvent, CharacteristicHandle, GattError, ListenerToken, PeripheralId,
            ServiceHandle, ValueKind};

mod session;
pub(crate) use session::FakeSession;

/// The driver calls the fake can count, fail or delay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FakeOp {
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    DiscoverServiceWithCharacteristics,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    AttachListener,
    DetachListener,
    DetachAdapterListeners,
}

#[derive(Clone, Debug)]
pub struct FakeCharacteristic {
    uuid: String,
    properties: CharacteristicProperties,
    value: Vec<u8>,
}

impl FakeCharacteristic {
    pub fn new(uuid: &str, properties: CharacteristicProperties) -> Self {
        FakeCharacteristic {
            uuid: uuid.to_string(),
            properties,
            value: vec![],
        }
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeService {
    uuid: String,
    characteristics: Vec<FakeCharacteristic>,
    combined_discovery_only: bool,
}

impl FakeService {
    pub fn new(uuid: &str) -> Self {
        FakeService {
            uuid: uuid.to_string(),
            characteristics: vec![],
            combined_discovery_only: false,
        }
    }

    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Plain characteristic discovery reports nothing for this service;
    /// its characteristics only show up via combined service discovery.
    pub fn combined_discovery_only(mut self) -> Self {
        self.combined_discovery_only = true;
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeDevice {
    advertisement: Advertisement,
    services: Vec<FakeService>,
}

impl FakeDevice {
    pub fn new(id: &str) -> Self {
        let mut advertisement = Advertisement::new(id);
        advertisement.address = format!("fa:ce:00:00:00:{:02x}", id.len() % 256);
        advertisement.rssi = -60;
        FakeDevice {
            advertisement,
            services: vec![],
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.advertisement.local_name = Some(name.to_string());
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.advertisement.address = address.to_string();
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.advertisement.rssi = rssi;
        self
    }

    pub fn with_manufacturer_data(mut self, data: &[u8]) -> Self {
        self.advertisement.manufacturer_data = Some(data.to_vec());
        self
    }

    /// Adds a GATT service, which is also listed in advertisements
    pub fn with_service(mut self, service: FakeService) -> Self {
        self.advertisement.service_uuids.push(service.uuid.clone());
        self.services.push(service);
        self
    }
}

#[derive(Debug)]
struct CharacteristicState {
    uuid: String,
    properties: CharacteristicProperties,
    handle: CharacteristicHandle,
    value: Vec<u8>,
    subscribed: bool,
}

#[derive(Debug)]
struct ServiceState {
    uuid: String,
    handle: ServiceHandle,
    combined_discovery_only: bool,
    characteristics: Vec<CharacteristicState>,
}

#[derive(Debug)]
struct DeviceState {
    advertisement: Advertisement,
    services: Vec<ServiceState>,
    connected: bool,
}

impl DeviceState {
    fn characteristic(&self, handle: CharacteristicHandle) -> Option<&CharacteristicState> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| characteristic.handle == handle)
    }

    fn characteristic_mut(&mut self, handle: CharacteristicHandle) -> Option<&mut CharacteristicState> {
        self.services
            .iter_mut()
            .flat_map(|service| service.characteristics.iter_mut())
            .find(|characteristic| characteristic.handle == handle)
    }

    fn find_by_uuid(&self, service_uuid: &str, char_uuid: &str) -> Option<&CharacteristicState> {
        let service_uuid = crate::uuid::normalize(service_uuid);
        let char_uuid = crate::uuid::normalize(char_uuid);
        self.services
            .iter()
            .filter(|service| crate::uuid::normalize(&service.uuid) == service_uuid)
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| crate::uuid::normalize(&characteristic.uuid) == char_uuid)
    }

    fn drop_link(&mut self) {
        self.connected = false;
        for service in self.services.iter_mut() {
            for characteristic in service.characteristics.iter_mut() {
                characteristic.subscribed = false;
            }
        }
    }
}

#[derive(Debug)]
struct FakeState {
    adapter_state: AdapterState,
    backend_bus: Option<mpsc::UnboundedSender<BackendEvent>>,
    adapter_listeners_attached: bool,
    scanning: bool,

    devices: BTreeMap<PeripheralId, DeviceState>,
    next_handle: u32,

    listeners: HashMap<ListenerToken, (PeripheralId, CharacteristicHandle)>,
    next_token: u32,

    failures: HashMap<FakeOp, GattError>,
    delays: HashMap<FakeOp, Duration>,
    calls: HashMap<FakeOp, usize>,
    last_write_type: Option<WriteType>,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            adapter_state: AdapterState::PoweredOn,
            backend_bus: None,
            adapter_listeners_attached: false,
            scanning: false,
            devices: BTreeMap::new(),
            next_handle: 1,
            listeners: HashMap::new(),
            next_token: 1,
            failures: HashMap::new(),
            delays: HashMap::new(),
            calls: HashMap::new(),
            last_write_type: None,
        }
    }
}

impl FakeState {
    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn send(&self, event: BackendEvent) {
        if let Some(bus) = &self.backend_bus {
            // The session may have gone away, which is fine
            let _ = bus.send(event);
        }
    }

    fn send_adapter_event(&self, event: BackendEvent) {
        if self.adapter_listeners_attached {
            self.send(event);
        } else {
            trace!("Fake: adapter listeners detached, dropping {:?}", event);
        }
    }

    fn advertise(&self, id: &PeripheralId) -> bool {
        match self.devices.get(id) {
            Some(device) => {
                self.send_adapter_event(BackendEvent::PeripheralAdvertised {
                    advertisement: device.advertisement.clone(),
                });
                true
            }
            None => false,
        }
    }

    fn deliver(&self, id: &PeripheralId, handle: CharacteristicHandle, value: &[u8], kind: ValueKind)
               -> usize {
        let received_at = tokio::time::Instant::now();
        let mut delivered = 0;
        for (token, target) in &self.listeners {
            if &target.0 == id && target.1 == handle {
                self.send(BackendEvent::CharacteristicValue {
                    token: *token,
                    value: value.to_vec(),
                    kind,
                    received_at,
                });
                delivered += 1;
            }
        }
        delivered
    }
}

/// Cloning gives another handle onto the same fake adapter.
#[derive(Clone, Debug, Default)]
pub struct FakeAdapter {
    state: Arc<StdMutex<FakeState>>,
}

impl FakeAdapter {
    /// A powered on adapter with no devices
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    // Called once by the session that adopts this adapter
    pub(crate) fn bind(self, backend_bus: mpsc::UnboundedSender<BackendEvent>) -> FakeSession {
        {
            let mut state = self.lock();
            state.backend_bus = Some(backend_bus);
            state.adapter_listeners_attached = true;
        }
        FakeSession::new(self)
    }

    /// Adds a device that will advertise whenever a scan starts
    pub fn add_device(&self, device: FakeDevice) -> PeripheralId {
        let mut state = self.lock();
        let mut services = vec![];
        for service in device.services {
            let handle = ServiceHandle(state.allocate_handle());
            let mut characteristics = vec![];
            for characteristic in service.characteristics {
                characteristics.push(CharacteristicState {
                    uuid: characteristic.uuid,
                    properties: characteristic.properties,
                    handle: CharacteristicHandle(state.allocate_handle()),
                    value: characteristic.value,
                    subscribed: false,
                });
            }
            services.push(ServiceState {
                uuid: service.uuid,
                handle,
                combined_discovery_only: service.combined_discovery_only,
                characteristics,
            });
        }

        let id = device.advertisement.id.clone();
        state.devices.insert(id.clone(), DeviceState {
            advertisement: device.advertisement,
            services,
            connected: false,
        });
        id
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        let mut state = self.lock();
        state.adapter_state = adapter_state;
        if !adapter_state.is_ready() {
            state.scanning = false;
        }
        state.send_adapter_event(BackendEvent::AdapterStateChanged { state: adapter_state });
    }

    /// Reports one advertisement from a device, whether or not a scan is
    /// running. Returns false for unknown devices.
    pub fn advertise(&self, id: &PeripheralId) -> bool {
        self.lock().advertise(id)
    }

    /// Pushes a notification to every listener of a characteristic, if the
    /// characteristic is currently subscribed. Returns how many listeners
    /// the value was delivered to.
    pub fn notify(&self, id: &PeripheralId, service_uuid: &str, char_uuid: &str, value: &[u8]) -> usize {
        let state = self.lock();
        let handle = match state
            .devices
            .get(id)
            .and_then(|device| device.find_by_uuid(service_uuid, char_uuid))
        {
            Some(characteristic) if characteristic.subscribed => characteristic.handle,
            _ => return 0,
        };
        state.deliver(id, handle, value, ValueKind::Notification)
    }

    /// Delivers a value of any kind to the listeners of a characteristic,
    /// regardless of subscription state
    pub fn deliver(&self, id: &PeripheralId, service_uuid: &str, char_uuid: &str, value: &[u8],
                   kind: ValueKind)
                   -> usize {
        let state = self.lock();
        let handle = match state
            .devices
            .get(id)
            .and_then(|device| device.find_by_uuid(service_uuid, char_uuid))
        {
            Some(characteristic) => characteristic.handle,
            None => return 0,
        };
        state.deliver(id, handle, value, kind)
    }

    /// Simulates the device dropping the link
    pub fn disconnect_remote(&self, id: &PeripheralId) {
        let mut state = self.lock();
        if let Some(device) = state.devices.get_mut(id) {
            device.drop_link();
        }
        state.send(BackendEvent::PeripheralDisconnected {
            peripheral_id: id.clone(),
        });
    }

    /// The next call of the given kind fails with `err`
    pub fn fail_next(&self, op: FakeOp, err: GattError) {
        self.lock().failures.insert(op, err);
    }

    /// Every call of the given kind takes (at least) this long
    pub fn set_delay(&self, op: FakeOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn call_count(&self, op: FakeOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn attached_listeners(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn adapter_listeners_attached(&self) -> bool {
        self.lock().adapter_listeners_attached
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.lock()
            .devices
            .get(id)
            .map(|device| device.connected)
            .unwrap_or(false)
    }

    pub fn is_subscribed(&self, id: &PeripheralId, service_uuid: &str, char_uuid: &str) -> bool {
        self.lock()
            .devices
            .get(id)
            .and_then(|device| device.find_by_uuid(service_uuid, char_uuid))
            .map(|characteristic| characteristic.subscribed)
            .unwrap_or(false)
    }

    /// The current value of a characteristic, as last written
    pub fn value(&self, id: &PeripheralId, service_uuid: &str, char_uuid: &str) -> Option<Vec<u8>> {
        self.lock()
            .devices
            .get(id)
            .and_then(|device| device.find_by_uuid(service_uuid, char_uuid))
            .map(|characteristic| characteristic.value.clone())
    }

    pub fn last_write_type(&self) -> Option<WriteType> {
        self.lock().last_write_type
    }
}
