use async_trait::async_trait;
use log::trace;

use crate::characteristic::{CharacteristicProperties, WriteType};
use crate::service::{CharacteristicDescriptor, DiscoveredService};
use crate::session::{BackendResult, BackendSession};
use crate::{AdapterState, CharacteristicHandle, GattError, ListenerToken, PeripheralId};

use super::{CharacteristicState, DeviceState, FakeAdapter, FakeOp, FakeState};

#[derive(Debug)]
pub(crate) struct FakeSession {
    adapter: FakeAdapter,
}

impl FakeSession {
    pub(crate) fn new(adapter: FakeAdapter) -> Self {
        FakeSession { adapter }
    }

    // Counts the call, applies any configured latency and then fails if a
    // failure was queued for this kind of call
    async fn enter(&self, op: FakeOp) -> BackendResult<()> {
        let (delay, failure) = {
            let mut state = self.adapter.lock();
            *state.calls.entry(op).or_default() += 1;
            (state.delays.get(&op).copied(), state.failures.remove(&op))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        trace!("Fake: {:?}", op);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // As enter() but for the synchronous calls, which can't be delayed
    fn enter_sync(&self, op: FakeOp) -> BackendResult<()> {
        let mut state = self.adapter.lock();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn device<'a>(state: &'a FakeState, id: &PeripheralId) -> BackendResult<&'a DeviceState> {
    state
        .devices
        .get(id)
        .ok_or_else(|| GattError::GeneralFailure(format!("no such device {}", id)))
}

fn connected_device<'a>(state: &'a FakeState, id: &PeripheralId) -> BackendResult<&'a DeviceState> {
    let device = device(state, id)?;
    if device.connected {
        Ok(device)
    } else {
        Err(GattError::NotConnected)
    }
}

fn connected_characteristic<'a>(state: &'a mut FakeState, id: &PeripheralId,
                                handle: CharacteristicHandle)
                                -> BackendResult<&'a mut CharacteristicState> {
    let device = state
        .devices
        .get_mut(id)
        .ok_or_else(|| GattError::GeneralFailure(format!("no such device {}", id)))?;
    if !device.connected {
        return Err(GattError::NotConnected);
    }
    device
        .characteristic_mut(handle)
        .ok_or_else(|| GattError::GeneralFailure(format!("no such characteristic {:?}", handle)))
}

fn descriptor(characteristic: &CharacteristicState) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        uuid: characteristic.uuid.clone(),
        properties: characteristic.properties,
        handle: characteristic.handle,
    }
}

fn matches(filter: &[String], uuid: &str) -> bool {
    filter.is_empty()
        || filter
            .iter()
            .any(|wanted| crate::uuid::normalize(wanted) == crate::uuid::normalize(uuid))
}

#[async_trait]
impl BackendSession for FakeSession {
    fn adapter_state(&self) -> AdapterState {
        self.adapter.lock().adapter_state
    }

    async fn start_scanning(&self, _allow_duplicates: bool) -> BackendResult<()> {
        self.enter(FakeOp::StartScan).await?;

        let mut state = self.adapter.lock();
        if !state.adapter_state.is_ready() {
            return Err(GattError::GeneralFailure(format!("adapter is {}", state.adapter_state)));
        }
        state.scanning = true;

        let ids: Vec<PeripheralId> = state.devices.keys().cloned().collect();
        for id in ids {
            state.advertise(&id);
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> BackendResult<()> {
        self.enter(FakeOp::StopScan).await?;
        self.adapter.lock().scanning = false;
        Ok(())
    }

    async fn peripheral_connect(&self, peripheral_id: &PeripheralId) -> BackendResult<()> {
        self.enter(FakeOp::Connect).await?;

        let mut state = self.adapter.lock();
        let device = state
            .devices
            .get_mut(peripheral_id)
            .ok_or_else(|| GattError::GeneralFailure(format!("no such device {}", peripheral_id)))?;
        device.connected = true;
        Ok(())
    }

    async fn peripheral_disconnect(&self, peripheral_id: &PeripheralId) -> BackendResult<()> {
        self.enter(FakeOp::Disconnect).await?;

        // Requested disconnects aren't reported on the backend bus
        if let Some(device) = self.adapter.lock().devices.get_mut(peripheral_id) {
            device.drop_link();
        }
        Ok(())
    }

    async fn discover_services(&self, peripheral_id: &PeripheralId, uuids: &[String])
                               -> BackendResult<Vec<DiscoveredService>> {
        self.enter(FakeOp::DiscoverServices).await?;

        let state = self.adapter.lock();
        let device = connected_device(&state, peripheral_id)?;
        Ok(device.services
                 .iter()
                 .filter(|service| matches(uuids, &service.uuid))
                 .map(|service| DiscoveredService {
                     uuid: service.uuid.clone(),
                     handle: service.handle,
                 })
                 .collect())
    }

    async fn discover_characteristics(&self, peripheral_id: &PeripheralId,
                                      service: &DiscoveredService, uuids: &[String])
                                      -> BackendResult<Vec<CharacteristicDescriptor>> {
        self.enter(FakeOp::DiscoverCharacteristics).await?;

        let state = self.adapter.lock();
        let device = connected_device(&state, peripheral_id)?;
        let service_state = device
            .services
            .iter()
            .find(|candidate| candidate.handle == service.handle)
            .ok_or_else(|| GattError::GeneralFailure(format!("no such service {}", service.uuid)))?;
        if service_state.combined_discovery_only {
            return Ok(vec![]);
        }
        Ok(service_state.characteristics
                        .iter()
                        .filter(|characteristic| matches(uuids, &characteristic.uuid))
                        .map(descriptor)
                        .collect())
    }

    async fn discover_service_with_characteristics(&self, peripheral_id: &PeripheralId,
                                                   service_uuid: &str)
                                                   -> BackendResult<Vec<CharacteristicDescriptor>> {
        self.enter(FakeOp::DiscoverServiceWithCharacteristics).await?;

        let state = self.adapter.lock();
        let device = connected_device(&state, peripheral_id)?;
        Ok(device.services
                 .iter()
                 .filter(|service| matches(&[service_uuid.to_string()], &service.uuid))
                 .flat_map(|service| service.characteristics.iter())
                 .map(descriptor)
                 .collect())
    }

    async fn characteristic_read(&self, peripheral_id: &PeripheralId,
                                 characteristic: CharacteristicHandle)
                                 -> BackendResult<Vec<u8>> {
        self.enter(FakeOp::Read).await?;

        let mut state = self.adapter.lock();
        let characteristic = connected_characteristic(&mut state, peripheral_id, characteristic)?;
        if !characteristic.properties.contains(CharacteristicProperties::READ) {
            return Err(GattError::ReadNotPermitted);
        }
        Ok(characteristic.value.clone())
    }

    async fn characteristic_write(&self, peripheral_id: &PeripheralId,
                                  characteristic: CharacteristicHandle, write_type: WriteType,
                                  data: &[u8])
                                  -> BackendResult<()> {
        self.enter(FakeOp::Write).await?;

        let mut state = self.adapter.lock();
        let characteristic = connected_characteristic(&mut state, peripheral_id, characteristic)?;
        let required = match write_type {
            WriteType::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            _ => CharacteristicProperties::WRITE,
        };
        if !characteristic.properties.contains(required) {
            return Err(GattError::WriteNotPermitted);
        }
        characteristic.value = data.to_vec();
        state.last_write_type = Some(write_type);
        Ok(())
    }

    async fn characteristic_subscribe(&self, peripheral_id: &PeripheralId,
                                      characteristic: CharacteristicHandle)
                                      -> BackendResult<()> {
        self.enter(FakeOp::Subscribe).await?;

        let mut state = self.adapter.lock();
        let characteristic = connected_characteristic(&mut state, peripheral_id, characteristic)?;
        if !characteristic
            .properties
            .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
        {
            return Err(GattError::Unsupported);
        }
        characteristic.subscribed = true;
        Ok(())
    }

    async fn characteristic_unsubscribe(&self, peripheral_id: &PeripheralId,
                                        characteristic: CharacteristicHandle)
                                        -> BackendResult<()> {
        self.enter(FakeOp::Unsubscribe).await?;

        let mut state = self.adapter.lock();
        let characteristic = connected_characteristic(&mut state, peripheral_id, characteristic)?;
        characteristic.subscribed = false;
        Ok(())
    }

    fn attach_value_listener(&self, peripheral_id: &PeripheralId,
                             characteristic: CharacteristicHandle)
                             -> BackendResult<ListenerToken> {
        self.enter_sync(FakeOp::AttachListener)?;

        let mut state = self.adapter.lock();
        device(&state, peripheral_id)?
            .characteristic(characteristic)
            .ok_or_else(|| GattError::GeneralFailure(format!("no such characteristic {:?}", characteristic)))?;
        let token = ListenerToken(state.next_token);
        state.next_token += 1;
        state.listeners
             .insert(token, (peripheral_id.clone(), characteristic));
        Ok(token)
    }

    fn detach_value_listener(&self, token: ListenerToken) -> BackendResult<()> {
        self.enter_sync(FakeOp::DetachListener)?;

        match self.adapter.lock().listeners.remove(&token) {
            Some(_) => Ok(()),
            None => Err(GattError::GeneralFailure(format!("no such listener {:?}", token))),
        }
    }

    fn detach_adapter_listeners(&self) -> BackendResult<()> {
        self.enter_sync(FakeOp::DetachAdapterListeners)?;

        self.adapter.lock().adapter_listeners_attached = false;
        Ok(())
    }
}
