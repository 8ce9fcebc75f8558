//! Device discovery over the SSDP-style multicast protocol.
//!
//! Devices answer search requests (and periodically advertise themselves)
//! with an HTTP-like datagram:
//!
//! ```text
//! HTTP/1.1 200 OK
//! Location: yeelight://192.168.1.239:55443
//! id: 0x000000000015243f
//! model: color
//! support: get_prop set_default set_power toggle set_bright ...
//! power: on
//! bright: 100
//! ```

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::Serialize;
use strum_macros::Display;

use crate::config::DiscoveryConfig;
use crate::errors::Error;
use crate::registry::SessionRegistry;
use crate::runtime::{self, AsyncUdpSocket, Instant, JoinHandle, UdpSocket};
use crate::session::DeviceSession;
use crate::types::{DeviceId, Endpoint};

type Result<T> = std::result::Result<T, Error>;

/// Datagram broadcast to ask devices to identify themselves.
pub const SEARCH_REQUEST: &str = "M-SEARCH * HTTP/1.1\r\n\
                                  HOST: 239.255.255.250:1982\r\n\
                                  MAN: \"ssdp:discover\"\r\n\
                                  ST: wifi_bulb\r\n";

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything a device advertised about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub identity: DeviceId,
    /// Vendor identifier the identity was derived from.
    pub full_id: String,
    pub model: String,
    pub endpoint: Endpoint,
    /// Advertised method names.
    pub support: Vec<String>,
    /// Every other header, keyed by lower-cased name.
    pub properties: HashMap<String, String>,
}

/// Parse one discovery datagram.
///
/// Returns `Ok(None)` for search requests, which the listener hears from
/// itself and from other controllers on the network.
///
/// ```
/// use yeelight_rs::parse_advertisement;
///
/// let datagram = "HTTP/1.1 200 OK\r\n\
///                 Location: yeelight://192.168.1.239:55443\r\n\
///                 id: 0x000000000015243f\r\n\
///                 model: color\r\n\
///                 support: get_prop set_power\r\n\
///                 name: desk\r\n";
/// let record = parse_advertisement(datagram).unwrap().unwrap();
/// assert_eq!(record.identity.as_str(), "15243f");
/// assert_eq!(record.support, vec!["get_prop", "set_power"]);
/// assert_eq!(record.properties["name"], "desk");
/// ```
pub fn parse_advertisement(datagram: &str) -> Result<Option<DeviceRecord>> {
    let mut lines = datagram.lines().map(str::trim).filter(|l| !l.is_empty());
    let status = lines
        .next()
        .ok_or_else(|| Error::MalformedAdvertisement("empty datagram".to_string()))?;
    if status.starts_with("M-SEARCH") {
        return Ok(None);
    }

    let mut headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let full_id = headers
        .remove("id")
        .ok_or_else(|| Error::MalformedAdvertisement(format!("no id in {status:?} datagram")))?;
    let location = headers
        .remove("location")
        .ok_or_else(|| Error::MalformedAdvertisement(format!("no location for {full_id}")))?;

    Ok(Some(DeviceRecord {
        identity: DeviceId::from_full_id(&full_id)?,
        endpoint: Endpoint::from_location(&location)?,
        model: headers.remove("model").unwrap_or_else(|| "unknown".to_string()),
        support: headers
            .remove("support")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
        full_id,
        properties: headers,
    }))
}

/// Progress of the proactive search loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum DiscoveryPhase {
    /// Not started.
    Idle,
    /// Broadcasting search requests.
    Searching,
    /// Every known device has a session; only the passive listener runs.
    Settled,
}

/// What a single datagram changed.
#[derive(Debug, Clone, PartialEq)]
pub enum DatagramOutcome {
    /// Search request, malformed datagram or removed device.
    Ignored,
    /// A previously unknown device; its session was created.
    Discovered(DeviceRecord),
    /// A known device moved to a new endpoint.
    EndpointUpdated(DeviceId, Endpoint),
    /// A known device at its known endpoint.
    Unchanged,
}

pub type DiscoveredCallback = Box<dyn Fn(&DeviceRecord, &DeviceSession) + Send + Sync + 'static>;
pub type EndpointChangedCallback = Box<dyn Fn(&DeviceId, &Endpoint) + Send + Sync + 'static>;

/// Finds devices and keeps the endpoints of their sessions current.
///
/// The listener broadcasts a search request every
/// [`search_interval`](DiscoveryConfig::search_interval) until every device it
/// heard of has a session, and keeps listening passively for late or newly
/// powered-on devices until [`stop`](Self::stop) is called.
#[derive(Clone)]
pub struct DiscoveryListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    config: DiscoveryConfig,
    registry: Arc<SessionRegistry>,
    running: AtomicBool,
    phase: Mutex<DiscoveryPhase>,
    known: Mutex<HashMap<DeviceId, DeviceRecord>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    on_discovered: Mutex<Option<DiscoveredCallback>>,
    on_endpoint_changed: Mutex<Option<EndpointChangedCallback>>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DiscoveryListener {
    pub fn new(config: DiscoveryConfig, registry: Arc<SessionRegistry>) -> Self {
        DiscoveryListener {
            inner: Arc::new(ListenerInner {
                config,
                registry,
                running: AtomicBool::new(false),
                phase: Mutex::new(DiscoveryPhase::Idle),
                known: Mutex::new(HashMap::new()),
                socket: Mutex::new(None),
                on_discovered: Mutex::new(None),
                on_endpoint_changed: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Called once per new device, after its session was created.
    pub fn on_discovered<F>(&self, callback: F)
    where
        F: Fn(&DeviceRecord, &DeviceSession) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_discovered) = Some(Box::new(callback));
    }

    /// Called whenever a known device reports a new endpoint.
    pub fn on_endpoint_changed<F>(&self, callback: F)
    where
        F: Fn(&DeviceId, &Endpoint) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_endpoint_changed) = Some(Box::new(callback));
    }

    pub fn phase(&self) -> DiscoveryPhase {
        *lock(&self.inner.phase)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Records of every device heard so far.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        lock(&self.inner.known).values().cloned().collect()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// Bind the discovery socket and run the search and listen loops.
    ///
    /// The returned handle completes once [`stop`](Self::stop) was called and
    /// both loops noticed it.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        let config = &self.inner.config;
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|e| Error::socket("bind", e))?;
        if config.join_multicast {
            socket
                .join_multicast_v4(*config.multicast_addr.ip(), Ipv4Addr::UNSPECIFIED)
                .map_err(|e| Error::socket("join_multicast_v4", e))?;
        }
        if let Ok(addr) = socket.local_addr() {
            debug!("discovery listening on {addr}");
        }

        *lock(&self.inner.socket) = Some(Arc::new(socket));
        self.inner.running.store(true, Ordering::SeqCst);
        self.set_phase(DiscoveryPhase::Searching);

        let search = self.clone();
        let listen = self.clone();
        Ok(runtime::spawn(async move {
            futures::future::join(search.search_loop(), listen.listen_loop()).await;
        }))
    }

    /// Stop both loops. The passive listener exits within its receive timeout.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Broadcast one search request.
    pub async fn search(&self) -> Result<()> {
        let socket = lock(&self.inner.socket).clone().ok_or_else(|| {
            Error::socket(
                "search",
                io::Error::new(io::ErrorKind::NotConnected, "listener not started"),
            )
        })?;
        socket
            .send_to(
                SEARCH_REQUEST.as_bytes(),
                &self.inner.config.multicast_addr.to_string(),
            )
            .await
            .map_err(|e| Error::socket("send_to", e))?;
        trace!("sent search request to {}", self.inner.config.multicast_addr);
        Ok(())
    }

    /// Feed one received datagram through the listener.
    pub async fn handle_datagram(&self, datagram: &str) -> DatagramOutcome {
        let record = match parse_advertisement(datagram) {
            Ok(Some(record)) => record,
            Ok(None) => return DatagramOutcome::Ignored,
            Err(e) => {
                debug!("dropping discovery datagram: {e}");
                return DatagramOutcome::Ignored;
            }
        };

        let registry = &self.inner.registry;
        if registry.is_blocked(&record.identity) {
            return DatagramOutcome::Ignored;
        }

        let is_new = {
            let mut known = lock(&self.inner.known);
            let is_new = !known.contains_key(&record.identity);
            known.insert(record.identity.clone(), record.clone());
            is_new
        };

        if let Some(session) = registry.get(&record.identity) {
            if !session.update_endpoint(record.endpoint.clone()).await {
                return DatagramOutcome::Unchanged;
            }
            if let Some(cb) = lock(&self.inner.on_endpoint_changed).as_ref() {
                cb(&record.identity, &record.endpoint);
            }
            return DatagramOutcome::EndpointUpdated(record.identity, record.endpoint);
        }

        // Heard before but its session is still being set up.
        if !is_new {
            return DatagramOutcome::Unchanged;
        }

        let Some(session) = registry.create_or_update(&record).await else {
            return DatagramOutcome::Ignored;
        };
        info!(
            "discovered {} {} at {}",
            record.model, record.identity, record.endpoint
        );
        if let Some(cb) = lock(&self.inner.on_discovered).as_ref() {
            cb(&record, &session);
        }
        DatagramOutcome::Discovered(record)
    }

    /// True once at least one device is known and all of them have a session.
    pub fn is_settled(&self) -> bool {
        let known = lock(&self.inner.known);
        let registry = &self.inner.registry;
        !known.is_empty()
            && known
                .keys()
                .all(|id| registry.contains(id) || registry.is_blocked(id))
    }

    async fn search_loop(self) {
        while self.is_running() {
            if let Err(e) = self.search().await {
                warn!("discovery search failed: {e}");
                *lock(&self.inner.last_error) = Some(e.to_string());
            }
            runtime::sleep(self.inner.config.search_interval).await;

            if self.is_settled() {
                info!("all {} known device(s) initialized", lock(&self.inner.known).len());
                self.set_phase(DiscoveryPhase::Settled);
                return;
            }
        }
    }

    async fn listen_loop(self) {
        let Some(socket) = lock(&self.inner.socket).clone() else {
            return;
        };
        let mut buffer = [0u8; 4096];

        while self.is_running() {
            match runtime::timeout(RECV_TIMEOUT, socket.recv_from(&mut buffer)).await {
                Ok(Ok((size, addr))) => {
                    let datagram = String::from_utf8_lossy(&buffer[..size]).into_owned();
                    trace!("datagram from {addr}: {} bytes", size);
                    self.handle_datagram(&datagram).await;
                }
                Ok(Err(e)) => {
                    debug!("discovery receive failed: {e}");
                    *lock(&self.inner.last_error) = Some(e.to_string());
                }
                // Receive timeout; re-check the running flag.
                Err(_) => continue,
            }
        }

        debug!("discovery listener stopped");
        *lock(&self.inner.socket) = None;
        self.set_phase(DiscoveryPhase::Idle);
    }

    fn set_phase(&self, phase: DiscoveryPhase) {
        *lock(&self.inner.phase) = phase;
    }
}

/// Send one search request and collect every answer within `discovery_timeout`.
///
/// No sessions are created; answers are deduplicated by identity.
///
/// ```no_run
/// use std::time::Duration;
/// use yeelight_rs::discover;
///
/// # async fn demo() -> Result<(), yeelight_rs::Error> {
/// for device in discover(Duration::from_secs(3)).await? {
///     println!("{} {} at {}", device.identity, device.model, device.endpoint);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn discover(discovery_timeout: Duration) -> Result<Vec<DeviceRecord>> {
    let config = DiscoveryConfig::default();
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::socket("bind", e))?;
    socket
        .send_to(SEARCH_REQUEST.as_bytes(), &config.multicast_addr.to_string())
        .await
        .map_err(|e| Error::socket("send_to", e))?;

    let mut discovered: HashMap<DeviceId, DeviceRecord> = HashMap::new();
    let start = Instant::now();
    let mut buffer = [0u8; 4096];

    while start.elapsed() < discovery_timeout {
        match runtime::timeout(RECV_TIMEOUT, socket.recv_from(&mut buffer)).await {
            Ok(Ok((size, _))) => {
                let datagram = String::from_utf8_lossy(&buffer[..size]);
                if let Ok(Some(record)) = parse_advertisement(&datagram) {
                    discovered.insert(record.identity.clone(), record);
                }
            }
            Ok(Err(_)) | Err(_) => continue,
        }
    }

    Ok(discovered.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADVERTISEMENT: &str = "HTTP/1.1 200 OK\r\n\
        Cache-Control: max-age=3600\r\n\
        Location: yeelight://192.168.1.239:55443\r\n\
        Server: POSIX UPnP/1.0 YGLC/1\r\n\
        id: 0x000000000015243f\r\n\
        model: color\r\n\
        fw_ver: 18\r\n\
        support: get_prop set_default set_power toggle set_bright start_cf set_ct_abx set_hsv\r\n\
        power: on\r\n\
        bright: 100\r\n\
        ct: 4000\r\n\
        name: my_bulb\r\n";

    fn moved(host: &str) -> String {
        ADVERTISEMENT.replace("192.168.1.239", host)
    }

    #[test]
    fn test_parse_advertisement() {
        let record = parse_advertisement(ADVERTISEMENT).unwrap().unwrap();
        assert_eq!(record.identity.as_str(), "15243f");
        assert_eq!(record.full_id, "0x000000000015243f");
        assert_eq!(record.model, "color");
        assert_eq!(record.endpoint, Endpoint::new("192.168.1.239", 55443));
        assert_eq!(record.support.len(), 8);
        assert_eq!(record.properties["fw_ver"], "18");
        assert_eq!(record.properties["cache-control"], "max-age=3600");
        assert!(!record.properties.contains_key("id"));
    }

    #[test]
    fn test_notify_and_search_requests() {
        let notify = ADVERTISEMENT.replace("HTTP/1.1 200 OK", "NOTIFY * HTTP/1.1");
        assert!(parse_advertisement(&notify).unwrap().is_some());
        assert_eq!(parse_advertisement(SEARCH_REQUEST).unwrap(), None);
    }

    #[test]
    fn test_malformed_advertisements() {
        assert!(parse_advertisement("").is_err());
        assert!(parse_advertisement("HTTP/1.1 200 OK\r\nid: 0x000000000015243f\r\n").is_err());
        assert!(parse_advertisement("HTTP/1.1 200 OK\r\nLocation: yeelight://h:1\r\n").is_err());
        assert!(
            parse_advertisement("HTTP/1.1 200 OK\r\nid: 0x12\r\nLocation: yeelight://h:1\r\n")
                .is_err()
        );
    }

    #[test]
    fn test_missing_model_defaults() {
        let datagram = "HTTP/1.1 200 OK\r\nid: 0x0000000000abcdef\r\nLocation: yeelight://10.0.0.2\r\n";
        let record = parse_advertisement(datagram).unwrap().unwrap();
        assert_eq!(record.model, "unknown");
        assert!(record.support.is_empty());
        assert_eq!(record.endpoint.port(), Endpoint::DEFAULT_PORT);
    }

    #[cfg(feature = "runtime-tokio")]
    mod listener {
        use super::*;
        use std::sync::atomic::AtomicUsize;

        fn listener() -> DiscoveryListener {
            DiscoveryListener::new(
                DiscoveryConfig::default(),
                Arc::new(SessionRegistry::default()),
            )
        }

        #[tokio::test]
        async fn test_new_device_yields_one_record() {
            let listener = listener();
            let discovered = Arc::new(AtomicUsize::new(0));
            let count = Arc::clone(&discovered);
            listener.on_discovered(move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            });

            assert!(!listener.is_settled());
            let first = listener.handle_datagram(ADVERTISEMENT).await;
            assert!(matches!(first, DatagramOutcome::Discovered(_)));
            assert_eq!(
                listener.handle_datagram(ADVERTISEMENT).await,
                DatagramOutcome::Unchanged
            );

            assert_eq!(discovered.load(Ordering::SeqCst), 1);
            assert_eq!(listener.registry().len(), 1);
            assert!(listener.is_settled());
        }

        #[tokio::test]
        async fn test_known_device_moves() {
            let listener = listener();
            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            listener.on_endpoint_changed(move |id, ep| {
                sink.lock().unwrap().push((id.clone(), ep.clone()));
            });

            listener.handle_datagram(ADVERTISEMENT).await;
            let outcome = listener.handle_datagram(&moved("192.168.1.77")).await;

            let id = DeviceId::from_full_id("0x000000000015243f").unwrap();
            let ep = Endpoint::new("192.168.1.77", 55443);
            assert_eq!(outcome, DatagramOutcome::EndpointUpdated(id.clone(), ep.clone()));
            assert_eq!(*changes.lock().unwrap(), vec![(id.clone(), ep.clone())]);
            assert_eq!(listener.registry().len(), 1);
            assert_eq!(listener.registry().get(&id).unwrap().endpoint(), ep);
        }

        #[tokio::test]
        async fn test_ignores_noise_and_removed_devices() {
            let listener = listener();
            assert_eq!(
                listener.handle_datagram(SEARCH_REQUEST).await,
                DatagramOutcome::Ignored
            );
            assert_eq!(
                listener.handle_datagram("not an advertisement").await,
                DatagramOutcome::Ignored
            );

            listener.handle_datagram(ADVERTISEMENT).await;
            let id = DeviceId::from_full_id("15243f").unwrap();
            listener.registry().remove(&id).await;
            assert_eq!(
                listener.handle_datagram(ADVERTISEMENT).await,
                DatagramOutcome::Ignored
            );
            assert!(listener.is_settled());
        }

        #[tokio::test]
        async fn test_search_before_start_fails() {
            assert!(listener().search().await.is_err());
        }

        #[tokio::test]
        async fn test_listens_for_advertisements() {
            let config = DiscoveryConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                join_multicast: false,
                search_interval: Duration::from_millis(50),
                ..DiscoveryConfig::default()
            };
            let listener = DiscoveryListener::new(config, Arc::new(SessionRegistry::default()));
            let handle = listener.start().await.unwrap();
            assert_eq!(listener.phase(), DiscoveryPhase::Searching);

            let addr = lock(&listener.inner.socket)
                .as_ref()
                .unwrap()
                .local_addr()
                .unwrap();
            let device = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            device.send_to(ADVERTISEMENT.as_bytes(), addr).await.unwrap();

            for _ in 0..100 {
                if listener.phase() == DiscoveryPhase::Settled {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(listener.phase(), DiscoveryPhase::Settled);
            assert_eq!(listener.devices().len(), 1);

            listener.stop();
            handle.await;
            assert!(!listener.is_running());
            assert_eq!(listener.phase(), DiscoveryPhase::Idle);
        }
    }
}
