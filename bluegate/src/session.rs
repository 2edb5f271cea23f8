use async_trait::async_trait;
use futures::{Future, Stream, StreamExt};
use log::{debug, error, trace, warn};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::characteristic::WriteType;
use crate::fake::FakeAdapter;
use crate::peripheral::{Advertisement, ConnectionState, PeripheralRecord, PeripheralRegistry, PeripheralState};
use crate::service::{CharacteristicDescriptor, CharacteristicInfo, DiscoveredService, ServiceDescriptor};
use crate::subscription::{SubscriptionKey, SubscriptionRecord, SubscriptionTable, DEFAULT_DEDUP_WINDOW};
use crate::{AdapterState, BackendEvent, CharacteristicHandle, DisconnectReason, Error, Event,
            GattError, ListenerToken, PeripheralId, Result, ValueKind};

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[tokio::test]
async fn session_eq() {
    let session0 = SessionConfig::new().start().await.unwrap();
    let session1 = SessionConfig::new().start().await.unwrap();
    assert_ne!(session0, session1);
    assert_eq!(session0, session0.clone());
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's not public API for SessionInner
// we don't really leak anything
#[derive(Debug)]
pub struct SessionInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,

    backend: Box<dyn BackendSession>,

    settings: Settings,

    // Last state reported through the adapter event bridge
    adapter_state: StdRwLock<AdapterState>,

    // Note: this is a (tokio) mutex since it's held while asking the driver
    // to start/stop scanning, which is what makes scanning single-flight.
    scan: Mutex<ScanSession>,

    peripherals: PeripheralRegistry,

    // Never held across an await
    subscriptions: StdMutex<SubscriptionTable>,

    // The task consuming backend events; aborted on shutdown
    bridge_task: StdMutex<Option<JoinHandle<()>>>,
    is_shut_down: AtomicBool,
}

#[derive(Debug, Default)]
struct ScanSession {
    active: bool,
    // Only used to suppress duplicate discovery events within one scan
    seen_ids: HashSet<PeripheralId>,
    // Bumped for each scan so a delayed auto-stop can't stop a later scan
    generation: u64,
}

#[derive(Clone, Debug)]
struct Settings {
    operation_timeout: Option<Duration>,
    scan_duration: Option<Duration>,
}

pub type BackendResult<T> = std::result::Result<T, GattError>;

/// The primitives a native radio driver provides.
///
/// A backend is also handed the sending end of a `BackendEvent` channel
/// (see [`BackendFactory`]) for reporting adapter state changes,
/// advertisements, unsolicited disconnects and characteristic values.
/// Disconnects requested through `peripheral_disconnect` must not be
/// reported on that channel.
///
/// Note: the session never calls into a backend concurrently for the same
/// peripheral, but may for different peripherals.
#[async_trait]
pub trait BackendSession: Send + Sync + fmt::Debug {
    fn adapter_state(&self) -> AdapterState;

    /// Scans for all advertising devices, whatever services they list.
    ///
    /// With `allow_duplicates` the driver should report every advertisement
    /// instead of filtering repeats itself.
    async fn start_scanning(&self, allow_duplicates: bool) -> BackendResult<()>;
    async fn stop_scanning(&self) -> BackendResult<()>;

    async fn peripheral_connect(&self, peripheral_id: &PeripheralId) -> BackendResult<()>;
    async fn peripheral_disconnect(&self, peripheral_id: &PeripheralId) -> BackendResult<()>;

    /// An empty `uuids` filter means all services
    async fn discover_services(&self, peripheral_id: &PeripheralId, uuids: &[String])
                               -> BackendResult<Vec<DiscoveredService>>;
    /// An empty `uuids` filter means all characteristics of the service
    async fn discover_characteristics(&self, peripheral_id: &PeripheralId,
                                      service: &DiscoveredService, uuids: &[String])
                                      -> BackendResult<Vec<CharacteristicDescriptor>>;
    /// Combined discovery of one named service and all of its characteristics.
    ///
    /// Some stacks only report characteristics this way.
    async fn discover_service_with_characteristics(&self, peripheral_id: &PeripheralId,
                                                   service_uuid: &str)
                                                   -> BackendResult<Vec<CharacteristicDescriptor>>;

    async fn characteristic_read(&self, peripheral_id: &PeripheralId,
                                 characteristic: CharacteristicHandle)
                                 -> BackendResult<Vec<u8>>;
    async fn characteristic_write(&self, peripheral_id: &PeripheralId,
                                  characteristic: CharacteristicHandle,
                                  write_type: WriteType, data: &[u8])
                                  -> BackendResult<()>;
    async fn characteristic_subscribe(&self, peripheral_id: &PeripheralId,
                                      characteristic: CharacteristicHandle)
                                      -> BackendResult<()>;
    async fn characteristic_unsubscribe(&self, peripheral_id: &PeripheralId,
                                        characteristic: CharacteristicHandle)
                                        -> BackendResult<()>;

    /// Registers a data callback for a characteristic. Values for it are
    /// reported as `BackendEvent::CharacteristicValue` carrying the
    /// returned token until the token is detached.
    fn attach_value_listener(&self, peripheral_id: &PeripheralId,
                             characteristic: CharacteristicHandle)
                             -> BackendResult<ListenerToken>;
    fn detach_value_listener(&self, token: ListenerToken) -> BackendResult<()>;

    /// Stops reporting adapter state changes and advertisements
    fn detach_adapter_listeners(&self) -> BackendResult<()>;
}

/// Creates a native backend once the session has an event channel for it
pub trait BackendFactory: Send {
    fn create(self: Box<Self>, backend_bus: mpsc::UnboundedSender<BackendEvent>)
              -> Result<Box<dyn BackendSession>>;
}

pub enum Backend {
    /// The in-process scriptable adapter from [`crate::fake`]
    Fake(FakeAdapter),
    Custom(Box<dyn BackendFactory>),
}

pub struct SessionConfig {
    backend: Backend,
    event_capacity: usize,
    notify_dedup_window: Duration,
    operation_timeout: Option<Duration>,
    scan_duration: Option<Duration>,
}

impl SessionConfig {
    /// A new configuration using a fresh [`FakeAdapter`] until another
    /// backend is set.
    pub fn new() -> SessionConfig {
        SessionConfig {
            backend: Backend::Fake(FakeAdapter::new()),
            event_capacity: 64,
            notify_dedup_window: DEFAULT_DEDUP_WINDOW,
            operation_timeout: None,
            scan_duration: None,
        }
    }

    pub fn set_backend(&mut self, backend: Backend) -> &mut Self {
        self.backend = backend;
        self
    }

    /// How many events a subscriber may fall behind by before it starts
    /// missing events
    pub fn set_event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn set_notify_dedup_window(&mut self, window: Duration) -> &mut Self {
        self.notify_dedup_window = window;
        self
    }

    /// Bounds every call into the driver. By default the driver's own
    /// timeouts (if any) are the only ones that apply.
    pub fn set_operation_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.operation_timeout = timeout;
        self
    }

    /// Automatically stop each scan after the given duration
    pub fn set_scan_duration(&mut self, duration: Option<Duration>) -> &mut Self {
        self.scan_duration = duration;
        self
    }

    pub async fn start(self) -> Result<Session> {
        Session::start(self).await
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    // The backend task and any delayed work only hold a Weak reference to
    // the SessionInner (otherwise the session could never be dropped) and
    // re`wrap()` it after upgrading.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: SessionConfig) -> Result<Self> {
        let (broadcast_sender, _) = broadcast::channel(config.event_capacity);

        // The backend feeds the backend bus and the bridge task below turns
        // that into state tracking and application events
        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        let backend: Box<dyn BackendSession> = match config.backend {
            Backend::Fake(fake) => Box::new(fake.bind(backend_bus_tx)),
            Backend::Custom(factory) => factory.create(backend_bus_tx)?,
        };
        let adapter_state = backend.adapter_state();

        let session =
            Session { inner: Arc::new(SessionInner { event_bus: broadcast_sender,
                                                     backend,
                                                     settings: Settings {
                                                         operation_timeout: config.operation_timeout,
                                                         scan_duration: config.scan_duration,
                                                     },
                                                     adapter_state: StdRwLock::new(adapter_state),
                                                     scan: Mutex::new(ScanSession::default()),
                                                     peripherals: PeripheralRegistry::default(),
                                                     subscriptions: StdMutex::new(SubscriptionTable::new(config.notify_dedup_window)),
                                                     bridge_task: StdMutex::new(None),
                                                     is_shut_down: AtomicBool::new(false),
                                                    }) };

        let weak_session = Arc::downgrade(&session.inner);
        let task = tokio::spawn(async move { Session::run_backend_task(weak_session, backend_bus_rx).await });
        *session.bridge_task.lock().unwrap() = Some(task);

        Ok(session)
    }

    fn emit(&self, event: Event) {
        // No subscribers isn't an error
        let _ = self.event_bus.send(event);
    }

    // Command failures go back to the caller and are also broadcast for
    // passive observers
    fn report<T>(&self, context: &str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!("{} failed: {}", context, err);
            self.emit(Event::ErrorOccurred {
                context: context.to_string(),
                message: err.to_string(),
            });
        }
        result
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down.load(Ordering::SeqCst) {
            Err(Error::OperationFailed("session shut down".to_string()))
        } else {
            Ok(())
        }
    }

    /// Awaits a driver call, applying the configured operation timeout
    async fn drive<T, F>(&self, op: &str, call: F) -> Result<T>
        where F: Future<Output = BackendResult<T>>
    {
        let result = match self.settings.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(Error::OperationFailed(format!("{} timed out", op))),
            },
            None => call.await,
        };
        result.map_err(|err| Error::OperationFailed(format!("{} failed: {}", op, err)))
    }

    fn known_peripheral(&self, id: &PeripheralId) -> Result<PeripheralState> {
        self.peripherals
            .get(id)
            .ok_or_else(|| Error::PeripheralNotFound(id.clone()))
    }

    fn check_connected(peripheral_state: &PeripheralState, id: &PeripheralId) -> Result<()> {
        if peripheral_state.is_connected() {
            Ok(())
        } else {
            Err(Error::PeripheralNotFound(id.clone()))
        }
    }

    async fn run_backend_task(weak_session_inner: Weak<SessionInner>,
                              backend_bus: mpsc::UnboundedReceiver<BackendEvent>) {
        trace!("Starting task to process backend events from the backend_bus...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(backend_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            // We only hold a strong reference back to the Session while we're
            // processing a backend event otherwise we would be holding a circular reference...
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting backend event processor task since Session has been dropped");
                    break;
                }
            };

            match event {
                BackendEvent::AdapterStateChanged { state } => {
                    session.on_adapter_state_changed(state).await;
                }
                BackendEvent::PeripheralAdvertised { advertisement } => {
                    session.on_advertisement(advertisement).await;
                }
                BackendEvent::PeripheralDisconnected { peripheral_id } => {
                    session.on_peripheral_disconnected(peripheral_id);
                }
                BackendEvent::CharacteristicValue { token, value, kind, received_at } => {
                    session.on_characteristic_value(token, value, kind, received_at);
                }
            }
        }

        trace!("Finished task processing backend events from the backend_bus");
    }

    async fn on_adapter_state_changed(&self, state: AdapterState) {
        trace!("AdapterStateChanged: {}", state);
        *self.adapter_state.write().unwrap() = state;
        self.emit(Event::AdapterStateChanged { state });

        if !state.is_ready() {
            // A scan can't survive the adapter going away
            self.stop_scanning_generation(None).await;
        }
    }

    async fn on_advertisement(&self, advertisement: Advertisement) {
        let mut scan = self.scan.lock().await;
        if !scan.active {
            trace!("Ignoring advertisement from {} while not scanning", advertisement.id);
            return;
        }

        let record = self.peripherals.upsert_advertisement(advertisement);
        if scan.seen_ids.insert(record.id.clone()) {
            trace!("Notifying peripheral {} discovered", record.id);
            self.emit(Event::DeviceDiscovered { peripheral: record });
        }
    }

    fn on_peripheral_disconnected(&self, peripheral_id: PeripheralId) {
        let peripheral_state = match self.peripherals.get(&peripheral_id) {
            Some(peripheral_state) => peripheral_state,
            None => {
                warn!("Spurious disconnect notification for unknown peripheral {}", peripheral_id);
                return;
            }
        };

        let armed = {
            let mut state_guard = peripheral_state.write().unwrap();
            let armed = std::mem::take(&mut state_guard.remote_disconnect_armed);
            if armed {
                state_guard.set_state(ConnectionState::Disconnected);
            }
            armed
        };
        if !armed {
            // Either a local disconnect is already handling this or we never
            // saw the peripheral connect
            trace!("Ignoring disconnect notification for {}", peripheral_id);
            return;
        }

        // The peripheral is no longer connected so there's nothing to
        // unsubscribe from and cleanup doesn't need to wait for the driver
        let stale = self.release_peripheral(&peripheral_state, &peripheral_id);
        debug!("Peripheral {} disconnected remotely, released {} subscription(s)",
               peripheral_id, stale.len());
        self.emit(Event::Disconnected {
            peripheral_id,
            reason: DisconnectReason::Remote,
        });
    }

    fn on_characteristic_value(&self, token: ListenerToken, value: Vec<u8>, kind: ValueKind,
                               received_at: tokio::time::Instant) {
        if kind != ValueKind::Notification {
            trace!("Ignoring {:?} value for listener {:?}", kind, token);
            return;
        }

        let hex = hex::encode(&value);
        let key = self.subscriptions.lock().unwrap().route(token, &hex, received_at);
        if let Some(key) = key {
            self.emit(Event::NotificationData {
                peripheral_id: key.peripheral_id,
                service_uuid: key.service_uuid,
                char_uuid: key.char_uuid,
                hex,
            });
        }
    }

    /// Returns a stream of session events: adapter state, discoveries,
    /// connection changes, errors and notification data.
    ///
    /// A subscriber only sees events sent after it subscribed, and one that
    /// falls too far behind skips the events it missed.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             match x {
                                                 Ok(x) => Some(x),
                                                 Err(err) => {
                                                     warn!("Event subscriber lagging: {}", err);
                                                     None
                                                 }
                                             }
                                         }))
    }

    /// As a convenience this provides a filtered stream of events that guarantees
    /// any peripheral events will only relate to the specified peripheral. Other
    /// events unrelated to peripherals will be delivered, unfiltered.
    pub fn peripheral_events(&self, peripheral_id: &PeripheralId) -> Result<impl Stream<Item = Event>> {
        let filter_id = peripheral_id.clone();

        Ok(self.events()?.filter(move |event| {
            let keep = match event.peripheral_id() {
                Some(id) => id == &filter_id,
                None => true,
            };
            futures::future::ready(keep)
        }))
    }

    pub fn adapter_state(&self) -> AdapterState {
        *self.adapter_state.read().unwrap()
    }

    pub async fn is_scanning(&self) -> bool {
        self.scan.lock().await.active
    }

    /// Starts scanning for all advertising peripherals.
    ///
    /// Does nothing if a scan is already running; each distinct peripheral
    /// is reported once per scan with a `DeviceDiscovered` event.
    pub async fn start_scanning(&self) -> Result<()> {
        let result = self.start_scanning_impl().await;
        self.report("scan", result)
    }

    async fn start_scanning_impl(&self) -> Result<()> {
        self.check_running()?;

        let mut scan = self.scan.lock().await;
        if scan.active {
            trace!("Already scanning");
            return Ok(());
        }

        let state = self.adapter_state();
        if !state.is_ready() {
            return Err(Error::AdapterNotReady(state));
        }

        scan.seen_ids.clear();
        scan.active = true;
        scan.generation += 1;

        // We de-duplicate per scan ourselves, so the driver shouldn't
        if let Err(err) = self.drive("scan start", self.backend.start_scanning(true)).await {
            scan.active = false;
            return Err(err);
        }

        if let Some(duration) = self.settings.scan_duration {
            let generation = scan.generation;
            let weak_session = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(strong_inner) = weak_session.upgrade() {
                    trace!("Scan duration elapsed");
                    Session::wrap(strong_inner).stop_scanning_generation(Some(generation)).await;
                }
            });
        }

        Ok(())
    }

    /// Stops any active scan and emits `ScanFinished`. Does nothing if not
    /// scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.stop_scanning_generation(None).await;
        Ok(())
    }

    async fn stop_scanning_generation(&self, generation: Option<u64>) {
        let mut scan = self.scan.lock().await;
        if !scan.active {
            return;
        }
        if let Some(generation) = generation {
            if generation != scan.generation {
                return;
            }
        }

        scan.active = false;
        if let Err(err) = self.drive("scan stop", self.backend.stop_scanning()).await {
            warn!("Ignoring failure to stop scanning: {}", err);
        }
        self.emit(Event::ScanFinished);
    }

    pub fn peripherals(&self) -> Vec<PeripheralRecord> {
        self.peripherals.snapshots()
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Result<PeripheralRecord> {
        self.peripherals
            .snapshot(id)
            .ok_or_else(|| Error::PeripheralNotFound(id.clone()))
    }

    /// Connects to a previously discovered peripheral.
    ///
    /// Connecting an already connected peripheral just returns its record.
    /// Once connected, an unsolicited disconnect reported by the driver
    /// cleans up the peripheral's state and emits
    /// `Disconnected { reason: Remote }`.
    pub async fn connect(&self, id: &PeripheralId) -> Result<PeripheralRecord> {
        let result = self.connect_impl(id).await;
        self.report("connect", result)
    }

    async fn connect_impl(&self, id: &PeripheralId) -> Result<PeripheralRecord> {
        self.check_running()?;
        let peripheral_state = self.known_peripheral(id)?;
        let _ops = peripheral_state.ops.lock().await;
        self.check_running()?;

        if peripheral_state.is_connected() {
            trace!("Peripheral {} already connected", id);
            return Ok(peripheral_state.record());
        }

        let state = self.adapter_state();
        if !state.is_ready() {
            return Err(Error::AdapterNotReady(state));
        }

        peripheral_state.set_state(ConnectionState::Connecting);
        if let Err(err) = self.drive("connect", self.backend.peripheral_connect(id)).await {
            peripheral_state.set_state(ConnectionState::Disconnected);
            return Err(err);
        }

        // The session may have been shut down while the driver was busy, in
        // which case nothing would be left to observe or release this link
        if let Err(err) = self.check_running() {
            if let Err(disconnect_err) = self.drive("disconnect", self.backend.peripheral_disconnect(id)).await {
                warn!("Ignoring failure to drop link to {} after shutdown: {}", id, disconnect_err);
            }
            peripheral_state.set_state(ConnectionState::Disconnected);
            return Err(err);
        }

        let record = {
            let mut state_guard = peripheral_state.write().unwrap();
            state_guard.set_state(ConnectionState::Connected);
            state_guard.remote_disconnect_armed = true;
            state_guard.record.clone()
        };

        trace!("Notifying peripheral {} connected", id);
        self.emit(Event::Connected { peripheral: record.clone() });
        Ok(record)
    }

    /// Disconnects a peripheral. Unknown peripherals are ignored.
    ///
    /// This is best-effort: even if the driver fails to disconnect, all
    /// cached characteristics and subscriptions for the peripheral are
    /// released and `Disconnected { reason: Local }` is emitted.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral_state = match self.peripherals.get(id) {
            Some(peripheral_state) => peripheral_state,
            None => {
                trace!("Nothing to disconnect for unknown peripheral {}", id);
                return Ok(());
            }
        };
        let _ops = peripheral_state.ops.lock().await;
        self.disconnect_locked(&peripheral_state, id).await;
        Ok(())
    }

    // Expects the peripheral's ops lock to be held
    async fn disconnect_locked(&self, peripheral_state: &PeripheralState, id: &PeripheralId) {
        let was_connected = {
            let mut state_guard = peripheral_state.write().unwrap();
            // A local disconnect supersedes the remote disconnect observer
            state_guard.remote_disconnect_armed = false;
            let was_connected = state_guard.is_connected();
            if was_connected {
                state_guard.set_state(ConnectionState::Disconnecting);
            }
            was_connected
        };

        let mut maybe_still_linked = false;
        if was_connected {
            if let Err(err) = self.drive("disconnect", self.backend.peripheral_disconnect(id)).await {
                warn!("Ignoring failure to disconnect {}: {}", id, err);
                maybe_still_linked = true;
            }
        }

        self.cleanup_peripheral(peripheral_state, id, maybe_still_linked).await;

        if was_connected {
            peripheral_state.set_state(ConnectionState::Disconnected);
        }
        trace!("Notifying peripheral {} disconnected", id);
        self.emit(Event::Disconnected {
            peripheral_id: id.clone(),
            reason: DisconnectReason::Local,
        });
    }

    /// Synchronous part of cleanup: detaches the data listener of every
    /// subscription of the peripheral, drops its characteristic cache and
    /// its de-duplication state. Returns the released subscriptions.
    ///
    /// Each step runs regardless of whether an earlier one failed.
    fn release_peripheral(&self, peripheral_state: &PeripheralState, id: &PeripheralId)
                          -> Vec<SubscriptionRecord> {
        let records = self.subscriptions.lock().unwrap().take_for_peripheral(id);
        for record in &records {
            if let Err(err) = self.backend.detach_value_listener(record.token) {
                warn!("Failed to detach listener for {:?}: {}", record.key, err);
            }
        }

        peripheral_state.write().unwrap().cache.clear();
        self.subscriptions
            .lock()
            .unwrap()
            .clear_dedup_for_peripheral(id);

        records
    }

    /// Releases all cached state for a peripheral. Driver unsubscribes are
    /// only attempted if the peripheral may still be connected, and their
    /// failures are ignored.
    async fn cleanup_peripheral(&self, peripheral_state: &PeripheralState, id: &PeripheralId,
                                still_connected: bool) {
        let records = self.release_peripheral(peripheral_state, id);
        if !still_connected {
            return;
        }
        for record in records {
            if let Err(err) = self
                .drive("unsubscribe", self.backend.characteristic_unsubscribe(id, record.handle))
                .await
            {
                warn!("Ignoring failure to unsubscribe {:?} during cleanup: {}", record.key, err);
            }
        }
    }

    /// Discovers all services of a connected peripheral along with their
    /// characteristics.
    ///
    /// Every call rediscovers and replaces the peripheral's characteristic
    /// cache, since the GATT topology may change between connections.
    pub async fn list_services(&self, id: &PeripheralId) -> Result<Vec<ServiceDescriptor>> {
        let result = self.list_services_impl(id).await;
        self.report("services", result)
    }

    async fn list_services_impl(&self, id: &PeripheralId) -> Result<Vec<ServiceDescriptor>> {
        self.check_running()?;
        let peripheral_state = self.known_peripheral(id)?;
        let _ops = peripheral_state.ops.lock().await;
        self.check_running()?;
        Session::check_connected(&peripheral_state, id)?;

        let services = self
            .drive("discover services", self.backend.discover_services(id, &[]))
            .await?;

        let mut discovered: Vec<(String, Vec<CharacteristicDescriptor>)> = vec![];
        for service in services {
            let mut characteristics = self
                .drive("discover characteristics",
                       self.backend.discover_characteristics(id, &service, &[]))
                .await?;

            if characteristics.is_empty() {
                debug!("No characteristics reported for service {}, retrying with combined discovery",
                       service.uuid);
                match self
                    .drive("discover service",
                           self.backend.discover_service_with_characteristics(id, &service.uuid))
                    .await
                {
                    Ok(found) => characteristics = found,
                    Err(err) => warn!("Ignoring combined discovery failure: {}", err),
                }
            }

            let characteristics = characteristics
                .into_iter()
                .map(normalize_descriptor)
                .collect();
            discovered.push((crate::uuid::normalize(&service.uuid), characteristics));
        }

        let mut state_guard = peripheral_state.write().unwrap();
        if !state_guard.is_connected() {
            return Err(Error::PeripheralNotFound(id.clone()));
        }
        state_guard.cache.clear();
        let mut out = vec![];
        for (service_uuid, characteristics) in discovered {
            for descriptor in &characteristics {
                state_guard.cache.insert(&service_uuid, descriptor.clone());
            }
            out.push(ServiceDescriptor {
                uuid: service_uuid,
                characteristics: characteristics.iter().map(CharacteristicInfo::from).collect(),
            });
        }
        debug!("Cached {} characteristic(s) for {}", state_guard.cache.len(), id);

        Ok(out)
    }

    // Cache first, otherwise discovers just the one service and
    // characteristic. Expects the peripheral's ops lock to be held.
    async fn resolve_characteristic(&self, peripheral_state: &PeripheralState, id: &PeripheralId,
                                    service_uuid: &str, char_uuid: &str)
                                    -> Result<CharacteristicDescriptor> {
        let cached = peripheral_state
            .read()
            .unwrap()
            .cache
            .get(service_uuid, char_uuid)
            .cloned();
        if let Some(descriptor) = cached {
            return Ok(descriptor);
        }
        debug!("Characteristic {}/{} not cached for {}, discovering", service_uuid, char_uuid, id);

        let services = self
            .drive("discover services",
                   self.backend.discover_services(id, &[service_uuid.to_string()]))
            .await?;
        let service = services
            .into_iter()
            .find(|service| crate::uuid::normalize(&service.uuid) == service_uuid)
            .ok_or_else(|| Error::ServiceNotFound(service_uuid.to_string()))?;

        let mut characteristics = self
            .drive("discover characteristics",
                   self.backend.discover_characteristics(id, &service, &[char_uuid.to_string()]))
            .await?;
        if characteristics.is_empty() {
            characteristics = self
                .drive("discover service",
                       self.backend.discover_service_with_characteristics(id, &service.uuid))
                .await?;
        }
        let descriptor = characteristics
            .into_iter()
            .map(normalize_descriptor)
            .find(|descriptor| descriptor.uuid == char_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound(char_uuid.to_string()))?;

        let mut state_guard = peripheral_state.write().unwrap();
        if !state_guard.is_connected() {
            return Err(Error::PeripheralNotFound(id.clone()));
        }
        state_guard.cache.insert(service_uuid, descriptor.clone());
        Ok(descriptor)
    }

    /// Reads a characteristic value, returned as lowercase hex.
    ///
    /// Doesn't require a prior `list_services`; an uncached characteristic
    /// is discovered on demand.
    pub async fn read_characteristic(&self, id: &PeripheralId, service_uuid: &str, char_uuid: &str)
                                     -> Result<String> {
        let result = self.read_characteristic_impl(id, service_uuid, char_uuid).await;
        self.report("read", result)
    }

    async fn read_characteristic_impl(&self, id: &PeripheralId, service_uuid: &str,
                                      char_uuid: &str)
                                      -> Result<String> {
        self.check_running()?;
        let service_uuid = crate::uuid::normalize(service_uuid);
        let char_uuid = crate::uuid::normalize(char_uuid);

        let peripheral_state = self.known_peripheral(id)?;
        let _ops = peripheral_state.ops.lock().await;
        self.check_running()?;
        Session::check_connected(&peripheral_state, id)?;

        let descriptor = self
            .resolve_characteristic(&peripheral_state, id, &service_uuid, &char_uuid)
            .await?;
        let value = self
            .drive("read", self.backend.characteristic_read(id, descriptor.handle))
            .await?;
        Ok(hex::encode(value))
    }

    /// Writes a hex encoded value to a characteristic
    pub async fn write_characteristic(&self, id: &PeripheralId, service_uuid: &str,
                                      char_uuid: &str, hex_value: &str, write_type: WriteType)
                                      -> Result<()> {
        let result = self
            .write_characteristic_impl(id, service_uuid, char_uuid, hex_value, write_type)
            .await;
        self.report("write", result)
    }

    async fn write_characteristic_impl(&self, id: &PeripheralId, service_uuid: &str,
                                       char_uuid: &str, hex_value: &str, write_type: WriteType)
                                       -> Result<()> {
        self.check_running()?;
        let data = hex::decode(hex_value)
            .map_err(|err| Error::OperationFailed(format!("invalid hex payload: {}", err)))?;
        let service_uuid = crate::uuid::normalize(service_uuid);
        let char_uuid = crate::uuid::normalize(char_uuid);

        let peripheral_state = self.known_peripheral(id)?;
        let _ops = peripheral_state.ops.lock().await;
        self.check_running()?;
        Session::check_connected(&peripheral_state, id)?;

        let descriptor = self
            .resolve_characteristic(&peripheral_state, id, &service_uuid, &char_uuid)
            .await?;
        self.drive("write",
                   self.backend.characteristic_write(id, descriptor.handle, write_type, &data))
            .await
    }

    /// Subscribes to notifications from a characteristic, delivered as
    /// `NotificationData` events.
    ///
    /// Subscribing again to the same characteristic is a no-op. Identical
    /// payloads repeated within the de-duplication window are dropped.
    pub async fn subscribe_notify(&self, id: &PeripheralId, service_uuid: &str, char_uuid: &str)
                                  -> Result<()> {
        let result = self.subscribe_notify_impl(id, service_uuid, char_uuid).await;
        self.report("notify", result)
    }

    async fn subscribe_notify_impl(&self, id: &PeripheralId, service_uuid: &str,
                                   char_uuid: &str)
                                   -> Result<()> {
        self.check_running()?;
        let key = SubscriptionKey::new(id.clone(), service_uuid, char_uuid);

        let peripheral_state = self.known_peripheral(id)?;
        let _ops = peripheral_state.ops.lock().await;
        self.check_running()?;
        Session::check_connected(&peripheral_state, id)?;

        if self.subscriptions.lock().unwrap().contains(&key) {
            trace!("Already subscribed to {:?}", key);
            return Ok(());
        }

        let descriptor = self
            .resolve_characteristic(&peripheral_state, id, &key.service_uuid, &key.char_uuid)
            .await?;

        let token = self
            .backend
            .attach_value_listener(id, descriptor.handle)
            .map_err(|err| Error::OperationFailed(format!("listen failed: {}", err)))?;
        let record = SubscriptionRecord {
            key: key.clone(),
            handle: descriptor.handle,
            token,
        };
        if !self.register_subscription(&peripheral_state, record) {
            if let Err(detach_err) = self.backend.detach_value_listener(token) {
                warn!("Failed to detach listener for dropped peripheral: {}", detach_err);
            }
            return Err(Error::PeripheralNotFound(id.clone()));
        }

        if let Err(err) = self
            .drive("subscribe", self.backend.characteristic_subscribe(id, descriptor.handle))
            .await
        {
            self.subscriptions.lock().unwrap().remove(&key);
            if let Err(detach_err) = self.backend.detach_value_listener(token) {
                warn!("Failed to detach listener after failed subscribe: {}", detach_err);
            }
            return Err(err);
        }

        debug!("Subscribed to {:?}", key);
        Ok(())
    }

    // The connection check happens under the subscriptions lock: a release
    // racing with this either runs first (and the check fails) or runs after
    // and takes the new record with it.
    fn register_subscription(&self, peripheral_state: &PeripheralState, record: SubscriptionRecord)
                             -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if !peripheral_state.is_connected() {
            return false;
        }
        subscriptions.insert(record);
        true
    }

    /// Stops notifications from a characteristic. Does nothing if not
    /// subscribed.
    ///
    /// The data listener is always detached, the driver unsubscribe is only
    /// attempted while the peripheral is connected and its failure is
    /// ignored.
    pub async fn unsubscribe_notify(&self, id: &PeripheralId, service_uuid: &str,
                                    char_uuid: &str)
                                    -> Result<()> {
        let key = SubscriptionKey::new(id.clone(), service_uuid, char_uuid);
        let peripheral_state = match self.peripherals.get(id) {
            Some(peripheral_state) => peripheral_state,
            None => return Ok(()),
        };
        let _ops = peripheral_state.ops.lock().await;

        let removed = self.subscriptions.lock().unwrap().remove(&key);
        let record = match removed {
            Some(record) => record,
            None => {
                trace!("Not subscribed to {:?}", key);
                return Ok(());
            }
        };

        if let Err(err) = self.backend.detach_value_listener(record.token) {
            warn!("Failed to detach listener for {:?}: {}", key, err);
        }
        if peripheral_state.is_connected() {
            if let Err(err) = self
                .drive("unsubscribe", self.backend.characteristic_unsubscribe(id, record.handle))
                .await
            {
                warn!("Ignoring failure to unsubscribe {:?}: {}", key, err);
            }
        }

        Ok(())
    }

    /// The characteristics currently subscribed to on a peripheral
    pub fn subscriptions(&self, id: &PeripheralId) -> Vec<SubscriptionKey> {
        self.subscriptions.lock().unwrap().keys_for(id)
    }

    /// How many characteristics are cached for a peripheral (always zero
    /// unless connected)
    pub fn cached_characteristic_count(&self, id: &PeripheralId) -> usize {
        match self.peripherals.get(id) {
            Some(peripheral_state) => peripheral_state.read().unwrap().cache.len(),
            None => 0,
        }
    }

    /// Tears the session down: disconnects every connected peripheral,
    /// stops scanning and detaches from the adapter.
    ///
    /// Every step is attempted even if earlier ones fail. Afterwards all
    /// commands fail, including ones that were already waiting on a
    /// peripheral; calling this again does nothing.
    pub async fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down session");

        // Waiting on each peripheral's queue lets in-flight commands finish
        // (or notice the shutdown) before deciding what needs disconnecting
        for id in self.peripherals.ids() {
            if let Some(peripheral_state) = self.peripherals.get(&id) {
                let _ops = peripheral_state.ops.lock().await;
                if peripheral_state.is_connected() {
                    self.disconnect_locked(&peripheral_state, &id).await;
                }
            }
        }

        self.stop_scanning_generation(None).await;

        if let Err(err) = self.backend.detach_adapter_listeners() {
            error!("Failed to detach adapter listeners: {}", err);
        }

        if let Some(task) = self.bridge_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

fn normalize_descriptor(descriptor: CharacteristicDescriptor) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        uuid: crate::uuid::normalize(&descriptor.uuid),
        ..descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &PeripheralId, char_uuid: &str, token: u32) -> SubscriptionRecord {
        SubscriptionRecord {
            key: SubscriptionKey::new(id.clone(), "ffe0", char_uuid),
            handle: CharacteristicHandle(token),
            token: ListenerToken(token),
        }
    }

    #[tokio::test]
    async fn subscription_not_registered_after_peripheral_dropped() {
        let session = SessionConfig::new().start().await.unwrap();
        let id = PeripheralId::from("dev-1");
        session.peripherals.upsert_advertisement(Advertisement::new(id.clone()));
        let peripheral_state = session.peripherals.get(&id).unwrap();

        peripheral_state.set_state(ConnectionState::Connected);
        assert!(session.register_subscription(&peripheral_state, record(&id, "ffe1", 1)));

        // A remote disconnect marks the peripheral disconnected before
        // releasing its subscriptions
        peripheral_state.set_state(ConnectionState::Disconnected);
        session.release_peripheral(&peripheral_state, &id);
        assert!(!session.register_subscription(&peripheral_state, record(&id, "ffe2", 2)));

        let subscriptions = session.subscriptions.lock().unwrap();
        assert!(subscriptions.keys_for(&id).is_empty());
    }
}
