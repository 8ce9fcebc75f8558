//! Reliable, reconnecting control session for one device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, trace, warn};
use serde::Serialize;
use serde_json::{Map, Value, json};
use strum_macros::Display;

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionEvent, EventSink};
use crate::dispatcher::{Attempt, Command, CommandKind, InFlight, RetryPolicy, Verdict};
use crate::errors::Error;
use crate::pending::{PendingCommand, PendingState, Reconciler};
use crate::properties::{MirroredProperties, Property};
use crate::protocol::{self, Inbound};
use crate::runtime::{self, BoxFuture};
use crate::types::{DeviceId, Endpoint};

type Result<T> = std::result::Result<T, Error>;

/// Invoked whenever a mirrored property changes.
pub type PropertyCallback = Arc<dyn Fn(&DeviceId, Property) + Send + Sync + 'static>;

// start_cf: 10 state changes, then recover the previous state.
const IDENTIFY_FLOW: &str = "500,2,4000,1,500,2,4000,100";

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Diagnostics for a session.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub id: DeviceId,
    pub model: String,
    pub endpoint: String,
    pub state: SessionState,
    pub reconciling: bool,
    pub pending: Vec<PendingCommand>,
    pub in_flight: usize,
    pub properties: MirroredProperties,
    pub last_error: Option<String>,
}

/// Control session of one device.
///
/// Cloning is cheap; every clone drives the same socket, pending-state cache
/// and in-flight table.
///
/// # Example
///
/// ```no_run
/// use yeelight_rs::{DeviceId, DeviceSession, Endpoint, SessionConfig};
///
/// # async fn demo() -> Result<(), yeelight_rs::Error> {
/// let id = DeviceId::from_full_id("0x000000000015243f")?;
/// let session = DeviceSession::new(
///     id,
///     "color",
///     Endpoint::new("192.168.1.239", 55443),
///     &SessionConfig::default(),
/// );
///
/// session.set_state("set_power", vec!["on".into(), "smooth".into(), 500.into()]).await?;
/// let props = session.query(&["power", "bright"]).await?;
/// println!("{props:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

struct Inner {
    me: Weak<Inner>,
    id: DeviceId,
    model: String,
    policy: RetryPolicy,
    endpoint: Mutex<Endpoint>,
    connection: runtime::Mutex<Option<Connection>>,
    generation: AtomicU64,
    state: Mutex<SessionState>,
    // Set once the session has lost a socket, failed an attempt or moved.
    disrupted: AtomicBool,
    in_flight: InFlight,
    pending: Mutex<PendingState>,
    reconciler: Reconciler,
    properties: Mutex<MirroredProperties>,
    on_property: Mutex<Option<PropertyCallback>>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeviceSession {
    pub fn new(id: DeviceId, model: &str, endpoint: Endpoint, config: &SessionConfig) -> Self {
        DeviceSession {
            inner: Arc::new_cyclic(|me| Inner {
                me: me.clone(),
                id,
                model: model.to_string(),
                policy: RetryPolicy::from(config),
                endpoint: Mutex::new(endpoint),
                connection: runtime::Mutex::new(None),
                generation: AtomicU64::new(0),
                state: Mutex::new(SessionState::Disconnected),
                disrupted: AtomicBool::new(false),
                in_flight: InFlight::default(),
                pending: Mutex::new(PendingState::new()),
                reconciler: Reconciler::default(),
                properties: Mutex::new(MirroredProperties::default()),
                on_property: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.inner.id
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn endpoint(&self) -> Endpoint {
        lock(&self.inner.endpoint).clone()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// True only while a socket is connected.
    pub fn is_online(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Snapshot of the locally mirrored properties.
    pub fn properties(&self) -> MirroredProperties {
        lock(&self.inner.properties).clone()
    }

    /// Snapshot of the cached desired state, in replay order.
    pub fn pending(&self) -> Vec<PendingCommand> {
        lock(&self.inner.pending).replay_order()
    }

    /// Register the callback notified of mirrored property changes.
    pub fn on_property_changed<F>(&self, callback: F)
    where
        F: Fn(&DeviceId, Property) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_property) = Some(Arc::new(callback));
    }

    /// Request a state change.
    ///
    /// The command is cached as desired state before it is sent, so it is
    /// replayed after any later reconnect. Connectivity failures are not
    /// reported: the call then resolves with an empty result.
    pub async fn set_state(&self, method: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        self.inner
            .send_command(Command::new(method, params, CommandKind::Mutating))
            .await
    }

    /// Read properties from the device, keyed by property name.
    pub async fn query(&self, properties: &[&str]) -> Result<HashMap<String, Value>> {
        let params = properties.iter().map(|p| json!(p)).collect();
        let values = self
            .inner
            .send_command(Command::new("get_prop", params, CommandKind::Query))
            .await?;
        Ok(properties
            .iter()
            .map(|p| p.to_string())
            .zip(values)
            .collect())
    }

    /// Flash the device so a user can tell which one it is.
    pub async fn identify(&self) -> Result<()> {
        let params = vec![json!(10), json!(0), json!(IDENTIFY_FLOW)];
        self.inner
            .send_command(Command::new("start_cf", params, CommandKind::Query))
            .await
            .map(|_| ())
    }

    /// Point the session at a new address.
    ///
    /// Any live socket is closed; the next command connects to the new
    /// endpoint. Pending desired state is kept. Returns `false` if the
    /// endpoint did not change.
    pub async fn update_endpoint(&self, endpoint: Endpoint) -> bool {
        {
            let mut current = lock(&self.inner.endpoint);
            if *current == endpoint {
                return false;
            }
            info!("{}: endpoint {} -> {}", self.inner.id, current, endpoint);
            *current = endpoint;
        }
        self.inner.disrupted.store(true, Ordering::Release);
        self.inner.close_connection().await;
        true
    }

    /// Replay every cached desired-state command, in priority order.
    ///
    /// Does nothing if a flush is already running on this session.
    pub async fn flush(&self) {
        self.inner.flush().await
    }

    /// Close the socket, if any. Pending state is kept.
    pub async fn disconnect(&self) {
        self.inner.close_connection().await;
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            id: self.inner.id.clone(),
            model: self.inner.model.clone(),
            endpoint: self.endpoint().to_string(),
            state: self.state(),
            reconciling: self.inner.reconciler.is_running(),
            pending: self.pending(),
            in_flight: self.inner.in_flight.len(),
            properties: self.properties(),
            last_error: lock(&self.inner.last_error).clone(),
        }
    }
}

impl Inner {
    async fn send_command(&self, command: Command) -> Result<Vec<Value>> {
        if command.kind == CommandKind::Mutating {
            lock(&self.pending).upsert(&command.method, command.params.clone());
        }
        self.dispatch(&command).await
    }

    async fn dispatch(&self, command: &Command) -> Result<Vec<Value>> {
        let line = protocol::encode_request(command.id, &command.method, &command.params)?;
        let mut retry = self.policy.start();

        loop {
            let err = match self.attempt(command, &line, retry.current()).await {
                Ok(values) => {
                    if command.kind == CommandKind::Mutating {
                        self.apply_optimistic(command);
                    }
                    return Ok(values);
                }
                Err(err) => err,
            };

            *lock(&self.last_error) = Some(err.to_string());
            self.disrupted.store(true, Ordering::Release);

            match retry.on_failure(&err) {
                Verdict::Retry(next) => {
                    debug!(
                        "{}: {} #{} failed ({err}), retrying with {:?} deadline",
                        self.id, command.method, command.id, next.deadline
                    );
                }
                Verdict::Rejected => return self.rejected(command, err),
                Verdict::Abort => {
                    warn!("{}: {} is unreachable, giving up", self.id, self.endpoint());
                    break;
                }
                Verdict::Exhausted => {
                    warn!(
                        "{}: {} #{} failed after {} attempts",
                        self.id,
                        command.method,
                        command.id,
                        self.policy.retries() + 1
                    );
                    break;
                }
            }
        }

        self.close_connection().await;
        match command.kind {
            CommandKind::Mutating => Ok(Vec::new()),
            CommandKind::Query => Err(Error::command_failed(command.id, &command.method)),
        }
    }

    async fn attempt(&self, command: &Command, line: &str, attempt: Attempt) -> Result<Vec<Value>> {
        // Connecting, writing and waiting share the attempt's deadline. A
        // replay runs its own commands and is not charged to this one.
        let started = runtime::Instant::now();
        let fresh = match runtime::timeout(attempt.deadline, self.ensure_open()).await {
            Ok(fresh) => fresh?,
            Err(_) => {
                debug!("{}: connect to {} timed out", self.id, self.endpoint());
                self.close_connection().await;
                return Err(Error::TimedOut { id: command.id });
            }
        };
        let mut left = attempt.deadline.saturating_sub(started.elapsed());
        if fresh && (attempt.index > 0 || self.disrupted.load(Ordering::Acquire)) {
            self.flush().await;
        }

        let started = runtime::Instant::now();
        let reply = self.in_flight.register(command.id);
        match runtime::timeout(left, self.write(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.in_flight.remove(command.id);
                return Err(err);
            }
            Err(_) => {
                // A partially written line leaves the stream unusable.
                self.in_flight.remove(command.id);
                self.close_connection().await;
                return Err(Error::TimedOut { id: command.id });
            }
        }
        trace!("{}: sent {}", self.id, line.trim_end());
        left = left.saturating_sub(started.elapsed());

        match runtime::timeout(left, reply).await {
            Ok(Ok(Ok(values))) => Ok(values),
            Ok(Ok(Err(device))) => Err(Error::Device {
                id: command.id,
                code: device.code,
                message: device.message,
            }),
            Ok(Err(_cancelled)) => Err(Error::Disconnected),
            Err(_) => {
                self.in_flight.remove(command.id);
                Err(Error::TimedOut { id: command.id })
            }
        }
    }

    fn rejected(&self, command: &Command, err: Error) -> Result<Vec<Value>> {
        match command.kind {
            CommandKind::Query => Err(err),
            CommandKind::Mutating => {
                warn!("{}: device declined {}: {err}", self.id, command.method);
                Ok(Vec::new())
            }
        }
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(_guard) = self.reconciler.try_begin() else {
                trace!("{}: flush already running", self.id);
                return;
            };

            let replay = lock(&self.pending).replay_order();
            if replay.is_empty() {
                return;
            }
            debug!("{}: replaying {} cached command(s)", self.id, replay.len());

            for pending in replay {
                let command = Command::new(pending.method, pending.params, CommandKind::Mutating);
                // Entries stay cached whatever the outcome.
                let _ = self.dispatch(&command).await;
                if *lock(&self.state) != SessionState::Connected {
                    debug!("{}: connection lost, flush stopped", self.id);
                    break;
                }
            }
        })
    }

    /// Make sure a socket to the current endpoint is open.
    ///
    /// Returns `true` if a new socket had to be opened.
    async fn ensure_open(&self) -> Result<bool> {
        let endpoint = self.endpoint();
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_open() && conn.endpoint() == &endpoint {
                return Ok(false);
            }
        }
        if let Some(stale) = guard.take() {
            stale.close().await;
        }

        self.set_state(SessionState::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        match Connection::open(&endpoint, generation, self.sink()).await {
            Ok(conn) => {
                // The reader may already have seen the peer hang up.
                let state = if conn.is_open() {
                    SessionState::Connected
                } else {
                    SessionState::Disconnected
                };
                *guard = Some(conn);
                self.set_state(state);
                Ok(true)
            }
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn write(&self, line: &str) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::Disconnected);
        };
        if let Err(err) = conn.send(line).await {
            if let Some(dead) = guard.take() {
                dead.close().await;
            }
            self.set_state(SessionState::Disconnected);
            return Err(err);
        }
        Ok(())
    }

    async fn close_connection(&self) {
        let stale = self.connection.lock().await.take();
        if let Some(conn) = stale {
            debug!("{}: closing connection to {}", self.id, conn.endpoint());
            conn.close().await;
        }
        self.set_state(SessionState::Disconnected);
    }

    fn sink(&self) -> EventSink {
        // The sink must not keep the session alive.
        let weak = self.me.clone();
        Arc::new(move |generation: u64, event: ConnectionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(generation, event);
            }
        })
    }

    fn handle_event(&self, generation: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(Inbound::Response { id, outcome }) => {
                if !self.in_flight.resolve(id, outcome) {
                    trace!("{}: discarding response for unknown id {id}", self.id);
                }
            }
            ConnectionEvent::Message(Inbound::Props(props)) => self.apply_push(&props),
            ConnectionEvent::Closed { error } => {
                if generation != self.generation.load(Ordering::Acquire) {
                    return;
                }
                debug!("{}: connection closed (error: {error})", self.id);
                self.disrupted.store(true, Ordering::Release);
                self.set_state(SessionState::Disconnected);
                self.in_flight.abandon_all();
            }
        }
    }

    fn apply_push(&self, props: &Map<String, Value>) {
        let changes: Vec<Property> = {
            let mut mirrored = lock(&self.properties);
            props
                .iter()
                .filter_map(|(name, value)| mirrored.apply(name, value))
                .collect()
        };
        self.notify(changes);
    }

    fn apply_optimistic(&self, command: &Command) {
        let changes = lock(&self.properties).apply_command(&command.method, &command.params);
        self.notify(changes);
    }

    fn notify(&self, changes: Vec<Property>) {
        if changes.is_empty() {
            return;
        }
        // Released before calling out, so the callback may replace itself.
        let callback = lock(&self.on_property).clone();
        for change in changes {
            trace!("{}: {change:?}", self.id);
            if let Some(cb) = callback.as_ref() {
                cb(&self.id, change);
            }
        }
    }

    fn endpoint(&self) -> Endpoint {
        lock(&self.endpoint).clone()
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }
}

#[cfg(all(test, feature = "runtime-tokio"))]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, StalledListener, refused_endpoint};
    use std::time::Duration;

    fn config(retries: u32, base_ms: u64) -> SessionConfig {
        SessionConfig {
            retries,
            base_timeout: Duration::from_millis(base_ms),
            ..SessionConfig::default()
        }
    }

    fn session(endpoint: Endpoint, config: &SessionConfig) -> DeviceSession {
        let id = DeviceId::from_full_id("0x000000000015243f").unwrap();
        DeviceSession::new(id, "color", endpoint, config)
    }

    #[tokio::test]
    async fn test_query_returns_named_values() {
        let device = FakeDevice::start(|r| {
            vec![json!({"id": r["id"], "result": ["on", "50"]}).to_string()]
        })
        .await;
        let session = session(device.endpoint(), &config(2, 200));

        let props = session.query(&["power", "bright"]).await.unwrap();
        assert_eq!(props["power"], json!("on"));
        assert_eq!(props["bright"], json!("50"));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_online());
    }

    #[tokio::test]
    async fn test_device_error_is_not_retried() {
        let device = FakeDevice::start(|r| {
            vec![json!({"id": r["id"], "error": {"code": -1, "message": "unsupported"}}).to_string()]
        })
        .await;
        let session = session(device.endpoint(), &config(3, 100));

        let err = session.query(&["power"]).await.unwrap_err();
        assert!(matches!(err, Error::Device { code: -1, .. }));
        assert_eq!(device.methods().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_device_exhausts_query() {
        let device = FakeDevice::start(|_| Vec::new()).await;
        let session = session(device.endpoint(), &config(2, 20));

        let err = session.query(&["power"]).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(device.methods(), vec!["get_prop"; 3]);

        // Every attempt reuses the id the failure reports.
        let requests = device.requests();
        let id = requests[0]["id"].as_u64();
        assert!(id.is_some());
        assert!(requests.iter().all(|r| r["id"].as_u64() == id));
        assert_eq!(err.command_id(), id);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_hanging_connect_fails_within_retry_budget() {
        let listener = StalledListener::start().await;
        // 20 + 40 + 80 ms over three attempts.
        let session = session(listener.endpoint(), &config(2, 20));

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(2), session.query(&["power"]))
            .await
            .expect("query outlived its retry budget");
        assert!(started.elapsed() < Duration::from_secs(1));

        let err = outcome.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(err.command_id().is_some());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.diagnostics().last_error.is_some());
    }

    #[tokio::test]
    async fn test_hanging_connect_keeps_mutating_command_cached() {
        let listener = StalledListener::start().await;
        let session = session(listener.endpoint(), &config(1, 20));

        tokio::time::timeout(
            Duration::from_secs(2),
            session.set_state("set_power", vec![json!("on"), json!("sudden"), json!(0)]),
        )
        .await
        .expect("set_state outlived its retry budget")
        .unwrap();
        assert_eq!(session.pending().len(), 1);
        assert!(!session.is_online());
    }

    #[tokio::test]
    async fn test_mutating_command_is_cached_when_offline() {
        let session = session(refused_endpoint(), &config(1, 10));

        let params = vec![json!("on"), json!("smooth"), json!(400)];
        let result = session.set_state("set_power", params.clone()).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(
            session.pending(),
            vec![PendingCommand {
                method: "set_power".into(),
                params
            }]
        );
        assert!(!session.is_online());
        assert!(session.diagnostics().last_error.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_replays_desired_state_in_order() {
        let old = FakeDevice::acking().await;
        let session = session(old.endpoint(), &config(2, 200));

        session.set_state("set_bright", vec![json!(50)]).await.unwrap();
        session
            .set_state("set_power", vec![json!("on"), json!("smooth"), json!(400)])
            .await
            .unwrap();
        assert_eq!(old.methods(), vec!["set_bright", "set_power"]);

        let new = FakeDevice::acking().await;
        assert!(session.update_endpoint(new.endpoint()).await);
        assert!(!session.update_endpoint(new.endpoint()).await);

        session.query(&["power"]).await.unwrap();
        assert_eq!(new.methods(), vec!["set_power", "set_bright", "get_prop"]);
        // Replaying never drains the cache.
        assert_eq!(session.pending().len(), 2);
        // Nothing went to the old address after the move.
        assert_eq!(old.methods().len(), 2);
    }

    #[tokio::test]
    async fn test_first_connection_does_not_flush() {
        let device = FakeDevice::acking().await;
        let session = session(device.endpoint(), &config(2, 200));

        session.set_state("set_bright", vec![json!(10)]).await.unwrap();
        session.set_state("set_bright", vec![json!(20)]).await.unwrap();
        assert_eq!(device.methods(), vec!["set_bright", "set_bright"]);
    }

    #[tokio::test]
    async fn test_push_updates_mirrored_properties() {
        let device = FakeDevice::start(|r| {
            let mut out = vec![json!({"id": r["id"], "result": ["on"]}).to_string()];
            if r["method"] == "get_prop" {
                out.push(
                    json!({"method": "props", "params": {"power": "off", "bright": "30"}})
                        .to_string(),
                );
            }
            out
        })
        .await;
        let session = session(device.endpoint(), &config(2, 200));

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        session.on_property_changed(move |_, change| sink.lock().unwrap().push(change));

        session
            .set_state("set_power", vec![json!("on"), json!("sudden"), json!(0)])
            .await
            .unwrap();
        assert_eq!(session.properties().power(), Some(true));
        session.query(&["power"]).await.unwrap();

        for _ in 0..100 {
            if session.properties().power() == Some(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(session.properties().power(), Some(false));
        assert_eq!(session.properties().brightness(), Some(30));
        let changes = changes.lock().unwrap().clone();
        assert!(changes.contains(&Property::Power(true)));
        assert!(changes.contains(&Property::Power(false)));
        assert!(changes.contains(&Property::Brightness(30)));
    }

    #[tokio::test]
    async fn test_property_callback_may_replace_itself() {
        let device = FakeDevice::acking().await;
        let session = session(device.endpoint(), &config(2, 200));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = session.clone();
        let sink = Arc::clone(&seen);
        session.on_property_changed(move |_, _| {
            let sink = Arc::clone(&sink);
            handle.on_property_changed(move |_, change| sink.lock().unwrap().push(change));
        });

        let calls = async {
            session
                .set_state("set_power", vec![json!("on"), json!("sudden"), json!(0)])
                .await
                .unwrap();
            session.set_state("set_bright", vec![json!(40)]).await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(2), calls)
            .await
            .expect("replacing the callback from inside it blocked");

        assert_eq!(*seen.lock().unwrap(), vec![Property::Brightness(40)]);
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_discarded() {
        let device = FakeDevice::start(|r| {
            vec![
                json!({"id": 0, "result": ["stale"]}).to_string(),
                json!({"id": r["id"], "result": ["on"]}).to_string(),
            ]
        })
        .await;
        let session = session(device.endpoint(), &config(2, 200));

        let props = session.query(&["power"]).await.unwrap();
        assert_eq!(props["power"], json!("on"));
        assert_eq!(session.diagnostics().in_flight, 0);
    }

    #[tokio::test]
    async fn test_diagnostics_serialize() {
        let session = session(refused_endpoint(), &config(0, 10));
        let diag = serde_json::to_value(session.diagnostics()).unwrap();
        assert_eq!(diag["id"], json!("15243f"));
        assert_eq!(diag["state"], json!("Disconnected"));
        assert!(diag.get("last_error").is_none());
    }
}
