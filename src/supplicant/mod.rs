//! The supplicant (iwd) client.
//!
//! Presents a stable Wi-Fi API to the bus facade while tolerating a
//! supplicant that may be absent at boot, disappear, or reappear. Service
//! lifecycle is driven by two bus subscriptions — `NameOwnerChanged` for
//! the iwd name and `InterfacesAdded` from its object manager (a station
//! can appear well after the name during boot) — feeding an idempotent
//! initialization path.
//!
//! Connection attempts run a small state machine: each `connect` captures
//! a fresh generation from a monotonic counter, and only the attempt whose
//! generation is still current may clear `connecting_ssid` when its
//! association call returns. Success and failure transitions arrive
//! asynchronously via station property changes and are folded into the
//! state store there.

mod agent;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use zbus::fdo::{DBusProxy, ObjectManagerProxy};
use zbus::names::OwnedInterfaceName;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};
use zbus::Connection;

use crate::models::{
    dbm_to_percent, ConnectionState, ConnectionType, Network, NetworkError, Security,
};
use crate::proxies::{
    iface, AccessPointProxy, AgentManagerProxy, DeviceProxy, KnownNetworkProxy, NetworkProxy,
    StationProxy, IWD_SERVICE,
};
use crate::service::helpers;
use crate::state::{StateManager, StateSnapshot};
use crate::Result;

pub use agent::{CredentialAgent, PendingCredentials, AGENT_PATH};

/// Hard deadline for a scan; past it the caller proceeds with whatever the
/// supplicant currently knows.
const SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Supplicants occasionally return an empty ordered-networks list right
/// after a scan; one retry after this delay papers over the race.
const EMPTY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay before the post-init network fetch, so the active SSID read from
/// station properties has landed in the store first.
const INITIAL_FETCH_DELAY: Duration = Duration::from_millis(100);

type InterfaceProps = HashMap<String, OwnedValue>;

/// Paths discovered from the supplicant's object tree, plus the event
/// tasks bound to them.
#[derive(Debug, Default)]
struct Discovered {
    station: Option<OwnedObjectPath>,
    device: Option<OwnedObjectPath>,
    initialized: bool,
    agent_registered: bool,
    station_task: Option<tokio::task::JoinHandle<()>>,
    device_task: Option<tokio::task::JoinHandle<()>>,
}

/// Client for the wireless supplicant's D-Bus object model.
pub struct SupplicantClient {
    conn: Connection,
    state: Arc<StateManager>,
    pending: Arc<PendingCredentials>,
    discovered: Mutex<Discovered>,
    /// Monotonic generation counter; see module docs.
    connect_generation: Mutex<u64>,
}

impl SupplicantClient {
    /// Connects to the system bus, exports the credential agent, and starts
    /// the lifecycle watcher. Initialization is attempted immediately but a
    /// missing supplicant is not an error; the watcher picks it up later.
    pub async fn new(state: Arc<StateManager>) -> Result<Arc<Self>> {
        let conn = Connection::system().await?;
        let pending = Arc::new(PendingCredentials::new());

        conn.object_server()
            .at(AGENT_PATH, CredentialAgent::new(pending.clone()))
            .await?;

        let client = Arc::new(Self {
            conn,
            state,
            pending,
            discovered: Mutex::new(Discovered::default()),
            connect_generation: Mutex::new(0),
        });

        let watcher = client.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run_lifecycle_watcher().await {
                warn!("supplicant lifecycle watcher ended: {e}");
            }
        });

        if let Err(e) = Self::maybe_init(&client).await {
            info!("supplicant not available yet ({e}), waiting for it to appear");
        }

        Ok(client)
    }

    fn station_path(&self) -> Option<OwnedObjectPath> {
        self.discovered
            .lock()
            .expect("discovery lock poisoned")
            .station
            .clone()
    }

    fn device_path(&self) -> Option<OwnedObjectPath> {
        self.discovered
            .lock()
            .expect("discovery lock poisoned")
            .device
            .clone()
    }

    async fn station_proxy(&self) -> Result<StationProxy<'_>> {
        let path = self
            .station_path()
            .ok_or(NetworkError::SupplicantUnavailable)?;
        Ok(StationProxy::builder(&self.conn).path(path)?.build().await?)
    }

    async fn device_proxy(&self) -> Result<DeviceProxy<'_>> {
        let path = self
            .device_path()
            .ok_or(NetworkError::SupplicantUnavailable)?;
        Ok(DeviceProxy::builder(&self.conn).path(path)?.build().await?)
    }

    async fn object_manager(&self) -> Result<ObjectManagerProxy<'_>> {
        Ok(ObjectManagerProxy::builder(&self.conn)
            .destination(IWD_SERVICE)?
            .path("/")?
            .build()
            .await?)
    }

    /// Watches the supplicant's bus lifecycle: the well-known name coming
    /// and going, and station interfaces appearing after boot.
    async fn run_lifecycle_watcher(self: Arc<Self>) -> Result<()> {
        let bus = DBusProxy::new(&self.conn).await?;
        let mut owner_changes = bus.receive_name_owner_changed().await?;

        let object_manager = self.object_manager().await?;
        let mut interfaces_added = object_manager.receive_interfaces_added().await?;

        loop {
            tokio::select! {
                Some(signal) = owner_changes.next() => {
                    let args = match signal.args() {
                        Ok(args) => args,
                        Err(e) => {
                            debug!("malformed NameOwnerChanged: {e}");
                            continue;
                        }
                    };
                    if args.name.as_str() != IWD_SERVICE {
                        continue;
                    }
                    if args.new_owner.is_none() {
                        info!("supplicant disappeared, marking Wi-Fi unavailable");
                        self.handle_disappear();
                    } else {
                        info!("supplicant appeared, initializing");
                        if let Err(e) = Self::maybe_init(&self).await {
                            warn!("supplicant init failed: {e}");
                        }
                    }
                }
                Some(signal) = interfaces_added.next() => {
                    let args = match signal.args() {
                        Ok(args) => args,
                        Err(e) => {
                            debug!("malformed InterfacesAdded: {e}");
                            continue;
                        }
                    };
                    let has_station = args
                        .interfaces_and_properties
                        .keys()
                        .any(|name| name.as_str() == iface::STATION);
                    if has_station {
                        info!("station interface appeared, initializing");
                        if let Err(e) = Self::maybe_init(&self).await {
                            warn!("supplicant init after station appearance failed: {e}");
                        }
                    }
                }
                else => break,
            }
        }

        Ok(())
    }

    /// Idempotent supplicant initialization.
    ///
    /// Enumerates the object tree, records station and device paths, seeds
    /// the store from their properties and from the saved-network set,
    /// subscribes to property changes, and registers the credential agent.
    /// Returns without touching anything when already initialized, and
    /// leaves the client uninitialized when no station exists yet.
    async fn maybe_init(this: &Arc<Self>) -> Result<()> {
        if this
            .discovered
            .lock()
            .expect("discovery lock poisoned")
            .initialized
        {
            return Ok(());
        }

        let object_manager = this.object_manager().await?;
        let objects = object_manager.get_managed_objects().await.map_err(zbus::Error::from)?;

        let mut station: Option<OwnedObjectPath> = None;
        let mut device: Option<OwnedObjectPath> = None;
        let mut connected_network: Option<OwnedObjectPath> = None;
        let mut saved_networks = Vec::new();

        for (path, interfaces) in &objects {
            if let Some(station_props) = iface_props(interfaces, iface::STATION) {
                station = Some(path.clone());
                debug!("found station at {}", path.as_str());

                // Device properties (Powered included) must come from the
                // same object when the interfaces share a path.
                if let Some(device_props) = iface_props(interfaces, iface::DEVICE) {
                    device = Some(path.clone());
                    this.apply_device_props(device_props);
                }

                connected_network = this.apply_station_props(station_props);
            }

            if device.is_none() {
                if let Some(device_props) = iface_props(interfaces, iface::DEVICE) {
                    device = Some(path.clone());
                    this.apply_device_props(device_props);
                }
            }

            if let Some(known_props) = iface_props(interfaces, iface::KNOWN_NETWORK) {
                if let Some(name) = prop_str(known_props, "Name") {
                    debug!("found known network: {name}");
                    saved_networks.push(name);
                }
            }
        }

        let Some(station) = station else {
            return Err(NetworkError::SupplicantUnavailable);
        };

        // Saved networks land in state only after a station was found, so
        // a failed boot-time probe leaves no partial update behind.
        if !saved_networks.is_empty() {
            this.state
                .update(|st| st.saved_networks = saved_networks.clone());
        }

        let station_task = Self::spawn_station_events(this, station.clone());
        let device_task = device.clone().map(|path| Self::spawn_device_events(this, path));

        let agent_registered = match this.register_agent().await {
            Ok(()) => true,
            Err(e) => {
                // Saved networks still connect without an agent.
                warn!("agent registration failed: {e}");
                false
            }
        };

        {
            let mut discovered = this.discovered.lock().expect("discovery lock poisoned");
            discovered.station = Some(station);
            discovered.device = device;
            discovered.initialized = true;
            discovered.agent_registered = agent_registered;
            discovered.station_task = Some(station_task);
            discovered.device_task = device_task;
        }
        info!("supplicant client initialized");

        // Populate the network list shortly after init so a daemon started
        // against an already-connected station exports a fresh list.
        let client = this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INITIAL_FETCH_DELAY).await;
            if let Some(path) = connected_network {
                if let Err(e) = client.fetch_network_details(&path).await {
                    debug!("initial connected-network fetch failed: {e}");
                }
            }
            client.refresh_networks().await;
        });

        Ok(())
    }

    /// Registers the exported agent with iwd's AgentManager.
    async fn register_agent(&self) -> Result<()> {
        let manager = AgentManagerProxy::new(&self.conn).await?;
        let path = ObjectPath::try_from(AGENT_PATH).map_err(zbus::Error::from)?;
        manager.register_agent(path).await?;
        debug!("agent registered at {AGENT_PATH}");
        Ok(())
    }

    /// Resets discovery and writes the safe degraded snapshot after the
    /// supplicant dropped off the bus.
    fn handle_disappear(&self) {
        {
            let mut discovered = self.discovered.lock().expect("discovery lock poisoned");
            // Event streams track the well-known name and would happily
            // deliver the next owner's signals to the old tasks; stop them
            // so re-initialization starts a single fresh set.
            if let Some(task) = discovered.station_task.take() {
                task.abort();
            }
            if let Some(task) = discovered.device_task.take() {
                task.abort();
            }
            *discovered = Discovered::default();
        }
        self.pending.clear_all();

        self.state.update(|st| {
            st.wifi_enabled = false;
            st.wifi_scanning = false;
            st.connection_state = ConnectionState::Disconnected;
            st.active_ssid.clear();
            st.signal_strength = 0;
        });
    }

    fn apply_device_props(&self, props: &InterfaceProps) {
        let name = prop_str(props, "Name");
        let address = prop_str(props, "Address");
        let powered = prop_bool(props, "Powered");
        self.state.update(|st| {
            if let Some(name) = name {
                st.interface_name = name;
            }
            if let Some(address) = address {
                st.mac_address = address;
            }
            if let Some(powered) = powered {
                st.wifi_enabled = powered;
            }
        });
    }

    /// Seeds connection state from a station property map and returns the
    /// connected-network path for the caller to resolve asynchronously.
    fn apply_station_props(&self, props: &InterfaceProps) -> Option<OwnedObjectPath> {
        let station_state = prop_str(props, "State");
        let scanning = prop_bool(props, "Scanning");
        self.state.update(|st| {
            if let Some(value) = &station_state {
                debug!("station state at init: {value}");
                match value.as_str() {
                    "disconnected" => st.connection_state = ConnectionState::Disconnected,
                    "connecting" => st.connection_state = ConnectionState::Connecting,
                    "connected" | "roaming" => st.connection_state = ConnectionState::Connected,
                    _ => {}
                }
            }
            if let Some(scanning) = scanning {
                st.wifi_scanning = scanning;
            }
        });

        prop_path(props, "ConnectedNetwork").filter(|p| !p.as_str().is_empty() && p.as_str() != "/")
    }

    fn spawn_station_events(
        this: &Arc<Self>,
        station: OwnedObjectPath,
    ) -> tokio::task::JoinHandle<()> {
        let client = this.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run_station_events(station).await {
                warn!("station event loop ended: {e}");
            }
        })
    }

    fn spawn_device_events(
        this: &Arc<Self>,
        device: OwnedObjectPath,
    ) -> tokio::task::JoinHandle<()> {
        let client = this.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run_device_events(device).await {
                warn!("device event loop ended: {e}");
            }
        })
    }

    /// Dispatches station property changes until the streams end (which
    /// happens when the supplicant goes away; re-init spawns a new loop).
    async fn run_station_events(self: Arc<Self>, station: OwnedObjectPath) -> Result<()> {
        let proxy = StationProxy::builder(&self.conn)
            .path(station)?
            .build()
            .await?;

        let mut state_changes = proxy.receive_state_changed().await;
        let mut scanning_changes = proxy.receive_scanning_changed().await;
        let mut network_changes = proxy.receive_connected_network_changed().await;

        loop {
            tokio::select! {
                Some(change) = state_changes.next() => {
                    match change.get().await {
                        Ok(value) => Self::handle_station_state(&self, &value),
                        Err(e) => debug!("station State read failed: {e}"),
                    }
                }
                Some(change) = scanning_changes.next() => {
                    match change.get().await {
                        Ok(scanning) => Self::handle_scanning(&self, scanning),
                        Err(e) => debug!("station Scanning read failed: {e}"),
                    }
                }
                Some(change) = network_changes.next() => {
                    match change.get().await {
                        Ok(path) => self.handle_connected_network(path).await,
                        Err(e) => debug!("station ConnectedNetwork read failed: {e}"),
                    }
                }
                else => break,
            }
        }

        Ok(())
    }

    async fn run_device_events(self: Arc<Self>, device: OwnedObjectPath) -> Result<()> {
        let proxy = DeviceProxy::builder(&self.conn)
            .path(device)?
            .build()
            .await?;
        let mut powered_changes = proxy.receive_powered_changed().await;

        while let Some(change) = powered_changes.next().await {
            match change.get().await {
                Ok(powered) => self.state.update(|st| st.wifi_enabled = powered),
                Err(e) => debug!("device Powered read failed: {e}"),
            }
        }

        Ok(())
    }

    /// Folds a station `State` transition into the store and runs the
    /// follow-ups the transition calls for.
    fn handle_station_state(this: &Arc<Self>, value: &str) {
        debug!("station state: {value}");
        let mut effects = TransitionEffects::default();

        this.state
            .update(|st| effects = apply_station_transition(st, value));

        if let Some(iface_name) = effects.usb_fallback {
            info!("Wi-Fi lost with USB tethering standing by, starting fallback");
            let client = this.clone();
            tokio::spawn(async move { client.try_usb_fallback(&iface_name).await });
        }

        // Refresh saved and visible networks once connected so their
        // connected/saved flags match the new association.
        if effects.refresh_lists {
            let client = this.clone();
            tokio::spawn(async move {
                client.refresh_known_networks().await;
                client.refresh_networks().await;
            });
        }
    }

    fn handle_scanning(this: &Arc<Self>, scanning: bool) {
        this.state.update(|st| st.wifi_scanning = scanning);
        if !scanning {
            // Falling edge: a scan finished somewhere (ours or iwd's own
            // periodic one) — pick up the fresh results.
            let client = this.clone();
            tokio::spawn(async move { client.refresh_networks().await });
        }
    }

    async fn handle_connected_network(&self, path: OwnedObjectPath) {
        if path.as_str().is_empty() || path.as_str() == "/" {
            return;
        }
        if let Err(e) = self.fetch_network_details(&path).await {
            debug!("connected-network detail fetch failed: {e}");
        }
    }

    /// Reads the connected network's name and security and resolves its
    /// signal strength through the ordered-networks list.
    async fn fetch_network_details(&self, path: &OwnedObjectPath) -> Result<()> {
        let network = NetworkProxy::builder(&self.conn)
            .path(path.clone())?
            .build()
            .await?;
        let name = network.name().await.unwrap_or_default();
        let security = Security::parse(&network.network_type().await.unwrap_or_default());

        let mut rssi = None;
        if let Ok(station) = self.station_proxy().await {
            match station.get_ordered_networks().await {
                Ok(ordered) => {
                    // Signal arrives in 1/100 dBm units.
                    rssi = ordered
                        .iter()
                        .find(|(p, _)| p.as_str() == path.as_str())
                        .map(|(_, centi_dbm)| centi_dbm / 100);
                }
                Err(e) => debug!("ordered-networks fetch failed: {e}"),
            }
        }

        self.state.update(|st| {
            if !name.is_empty() {
                st.active_ssid = name.clone();
            }
            st.active_security = security.to_string();
            if let Some(dbm) = rssi {
                st.signal_rssi = dbm;
                st.signal_strength = dbm_to_percent(dbm);
            }
        });

        Ok(())
    }

    /// Enables or disables the radio. The store follows via the device
    /// `Powered` property change.
    pub async fn set_wifi_enabled(&self, enabled: bool) -> Result<()> {
        let device = self.device_proxy().await?;
        device.set_powered(enabled).await?;
        Ok(())
    }

    /// Triggers a scan and blocks until it completes (or 15 s pass), then
    /// returns the fresh ordered network list.
    ///
    /// A `Busy` reply means a scan is already running; the wait proceeds
    /// against that one.
    pub async fn scan(&self) -> Result<Vec<Network>> {
        let station = self.station_proxy().await?;

        // Subscribe before triggering so a fast completion is not missed.
        let mut scanning_changes = station.receive_scanning_changed().await;

        if let Err(e) = station.scan().await {
            if !is_busy_error(&e) {
                warn!("scan request failed: {e}");
                return Err(e.into());
            }
            debug!("scan already in progress, waiting for it to finish");
        }

        let mut seen_scanning = station.scanning().await.unwrap_or(false);
        let wait_for_idle = async {
            while let Some(change) = scanning_changes.next().await {
                match change.get().await {
                    Ok(true) => seen_scanning = true,
                    Ok(false) if seen_scanning => break,
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(SCAN_TIMEOUT, wait_for_idle)
            .await
            .is_err()
        {
            warn!("scan timed out after {SCAN_TIMEOUT:?}, proceeding with current results");
        }

        let mut networks = self.fetch_networks().await?;
        if networks.is_empty() {
            debug!("ordered networks empty right after scan, retrying once");
            tokio::time::sleep(EMPTY_RETRY_DELAY).await;
            networks = self.fetch_networks().await?;
        }

        self.state.update(|st| st.networks = networks.clone());
        Ok(networks)
    }

    /// Fetches the current ordered network list and assembles the exported
    /// records. The `connected` flag comes from the authoritative
    /// `active_ssid`, not from the supplicant's per-network property.
    async fn fetch_networks(&self) -> Result<Vec<Network>> {
        let station = self.station_proxy().await?;
        let ordered = station.get_ordered_networks().await?;
        debug!("ordered networks returned {} entries", ordered.len());

        let active_ssid = self.state.get().active_ssid;
        let mut networks = Vec::with_capacity(ordered.len());
        for (path, centi_dbm) in ordered {
            match self.network_info(&path, centi_dbm).await {
                Ok(mut net) => {
                    net.connected = !active_ssid.is_empty() && net.ssid == active_ssid;
                    networks.push(net);
                }
                Err(e) => debug!("skipping network {}: {e}", path.as_str()),
            }
        }
        Ok(networks)
    }

    async fn network_info(&self, path: &OwnedObjectPath, centi_dbm: i16) -> Result<Network> {
        let proxy = NetworkProxy::builder(&self.conn)
            .path(path.clone())?
            .build()
            .await?;

        let dbm = centi_dbm / 100;
        let saved = proxy
            .known_network()
            .await
            .map(|p| !p.as_str().is_empty() && p.as_str() != "/")
            .unwrap_or(false);

        Ok(Network {
            ssid: proxy.name().await?,
            security: Security::parse(&proxy.network_type().await.unwrap_or_default()),
            signal_dbm: dbm,
            signal: dbm_to_percent(dbm),
            connected: false,
            saved,
            frequency: 0,
            object_path: path.to_string(),
        })
    }

    /// Refreshes the exported network list, leaving state untouched on
    /// failure.
    pub async fn refresh_networks(&self) {
        match self.fetch_networks().await {
            Ok(networks) => self.state.update(|st| st.networks = networks.clone()),
            Err(e) => debug!("network refresh failed: {e}"),
        }
    }

    /// Re-reads the saved-network set from the supplicant's object tree.
    pub async fn refresh_known_networks(&self) {
        match self.saved_network_names().await {
            Ok(saved) => {
                debug!("saved networks refreshed: {saved:?}");
                self.state.update(|st| st.saved_networks = saved.clone());
            }
            Err(e) => debug!("known-network refresh failed: {e}"),
        }
    }

    async fn saved_network_names(&self) -> Result<Vec<String>> {
        let object_manager = self.object_manager().await?;
        let objects = object_manager.get_managed_objects().await.map_err(zbus::Error::from)?;

        let mut saved = Vec::new();
        for interfaces in objects.values() {
            if let Some(props) = iface_props(interfaces, iface::KNOWN_NETWORK) {
                if let Some(name) = prop_str(props, "Name") {
                    saved.push(name);
                }
            }
        }
        Ok(saved)
    }

    /// Starts a connection attempt.
    ///
    /// Resolves the SSID to a network path via a scan (unless hidden),
    /// parks the passphrase for the agent callback, marks the attempt in
    /// state, and issues the association call. Only the newest attempt may
    /// clear `connecting_ssid` when its call returns; older returns are
    /// stale and skip the write. Success transitions arrive through
    /// station property changes, not through this return value.
    pub async fn connect(
        &self,
        ssid: &str,
        password: &str,
        security: &str,
        hidden: bool,
    ) -> Result<()> {
        let my_generation = {
            let mut generation = self
                .connect_generation
                .lock()
                .expect("generation lock poisoned");
            *generation += 1;
            *generation
        };
        info!(
            "connect: ssid={ssid} security={security} hidden={hidden} (generation {my_generation})"
        );

        let networks = self.scan().await?;
        let found = networks.iter().find(|n| n.ssid == ssid);
        let (network_path, network_security) = match found {
            Some(net) => (Some(net.object_path.clone()), net.security),
            None if hidden => (None, Security::parse(security)),
            None => return Err(NetworkError::NotFound(ssid.to_string())),
        };

        let requested = Security::parse(security);
        if !password.is_empty()
            && (network_security.wants_passphrase() || requested.wants_passphrase())
        {
            let agent_registered = self
                .discovered
                .lock()
                .expect("discovery lock poisoned")
                .agent_registered;
            if let Some(path) = &network_path {
                if agent_registered {
                    self.pending.set(path, password.to_string());
                } else {
                    // Without an agent the supplicant can only read the
                    // passphrase from its profile store.
                    warn!("no agent registered, seeding profile for {ssid}");
                    let profile_security = if network_security.wants_passphrase() {
                        network_security
                    } else {
                        requested
                    };
                    if let Err(e) =
                        helpers::write_supplicant_profile(ssid, password, profile_security.as_str())
                            .await
                    {
                        warn!("profile seed failed for {ssid}: {e}");
                    }
                }
            }
        }

        self.state.update(|st| {
            st.connecting_ssid = ssid.to_string();
            st.connecting_generation = my_generation;
        });

        let result = match &network_path {
            None => {
                debug!("connecting to hidden network {ssid}");
                let station = self.station_proxy().await?;
                station.connect_hidden_network(ssid).await
            }
            Some(path) => {
                debug!("connecting via network object {path}");
                let proxy = NetworkProxy::builder(&self.conn)
                    .path(path.as_str())?
                    .build()
                    .await?;
                proxy.connect().await
            }
        };

        {
            let generation = self
                .connect_generation
                .lock()
                .expect("generation lock poisoned");
            if *generation == my_generation {
                self.state.update(|st| st.connecting_ssid.clear());
            } else {
                debug!(
                    "stale connect return (generation {my_generation}, current {})",
                    *generation
                );
            }
        }

        if let Err(e) = result {
            warn!("association call failed for {ssid}: {e}");
            if let Some(path) = &network_path {
                self.pending.clear(path);
            }
            return Err(e.into());
        }

        Ok(())
    }

    /// Connects to a saved network; the supplicant supplies credentials
    /// from its own store.
    pub async fn connect_saved(&self, ssid: &str) -> Result<()> {
        self.connect(ssid, "", "", false).await
    }

    /// Disassociates from the current network.
    pub async fn disconnect(&self) -> Result<()> {
        let station = self.station_proxy().await?;
        station.disconnect().await?;
        Ok(())
    }

    /// Removes the saved profile for `ssid`.
    pub async fn forget(&self, ssid: &str) -> Result<()> {
        let path = self
            .find_known_network(ssid)
            .await?
            .ok_or_else(|| NetworkError::NoSavedNetwork(ssid.to_string()))?;
        let known = KnownNetworkProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await?;
        known.forget().await?;
        Ok(())
    }

    /// Toggles unattended reconnection for a saved network.
    pub async fn set_auto_connect(&self, ssid: &str, enabled: bool) -> Result<()> {
        let path = self
            .find_known_network(ssid)
            .await?
            .ok_or_else(|| NetworkError::NoSavedNetwork(ssid.to_string()))?;
        let known = KnownNetworkProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await?;
        known.set_auto_connect(enabled).await?;
        Ok(())
    }

    async fn find_known_network(&self, ssid: &str) -> Result<Option<OwnedObjectPath>> {
        let object_manager = self.object_manager().await?;
        let objects = object_manager.get_managed_objects().await.map_err(zbus::Error::from)?;

        for (path, interfaces) in &objects {
            if let Some(props) = iface_props(interfaces, iface::KNOWN_NETWORK) {
                if prop_str(props, "Name").as_deref() == Some(ssid) {
                    return Ok(Some(path.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Switches the device into AP mode and starts broadcasting.
    pub async fn start_hotspot(&self, ssid: &str, password: &str) -> Result<()> {
        let device = self.device_proxy().await?;
        device.set_mode("ap").await?;

        let path = self
            .device_path()
            .ok_or(NetworkError::SupplicantUnavailable)?;
        let ap = AccessPointProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await?;
        ap.start(ssid, password).await?;
        Ok(())
    }

    /// Stops the access point and returns to station mode.
    pub async fn stop_hotspot(&self) -> Result<()> {
        let path = self
            .device_path()
            .ok_or(NetworkError::SupplicantUnavailable)?;
        let ap = AccessPointProxy::builder(&self.conn)
            .path(path)?
            .build()
            .await?;
        ap.stop().await?;

        let device = self.device_proxy().await?;
        device.set_mode("station").await?;
        Ok(())
    }

    /// Brings the USB interface up and runs DHCP on it after Wi-Fi loss.
    /// Runs detached from the station event handler; never blocks it.
    async fn try_usb_fallback(&self, iface_name: &str) {
        info!("attempting USB tethering fallback on {iface_name}");

        if let Err(e) = helpers::bring_up_interface(iface_name).await {
            warn!("failed to bring up {iface_name}: {e}");
            return;
        }
        if let Err(e) = helpers::run_dhcp(iface_name, true).await {
            warn!("DHCP failed on {iface_name}: {e}");
            return;
        }

        info!("USB tethering fallback established on {iface_name}");
        self.state.update(|st| {
            st.usb_tethering_connected = true;
            st.connection_type = ConnectionType::Usb;
        });
    }
}

/// Follow-ups a station transition asks the caller to run outside the
/// state lock.
#[derive(Debug, Default, PartialEq, Eq)]
struct TransitionEffects {
    /// Interface to run the USB fallback on.
    usb_fallback: Option<String>,
    /// Refresh saved and visible network lists.
    refresh_lists: bool,
}

/// The station `State` transition rules.
///
/// `connected`/`roaming` map to connected, `connecting` to connecting. On
/// entry into `disconnected` two derived rules fire: a previous
/// `connecting` is reinterpreted as an authentication failure (iwd exposes
/// no disconnect reason here), and a previous `connected` with USB
/// tethering standing by requests the asynchronous fallback.
fn apply_station_transition(st: &mut StateSnapshot, value: &str) -> TransitionEffects {
    let mut effects = TransitionEffects::default();
    let prev = st.connection_state;

    match value {
        "disconnected" => {
            st.connection_state = ConnectionState::Disconnected;
            st.active_ssid.clear();
            st.connecting_ssid.clear();
            st.last_captive_check_ssid.clear();
            if prev == ConnectionState::Connecting {
                st.connection_state = ConnectionState::Failed;
                st.last_error = "Authentication failed".into();
            }
            if prev == ConnectionState::Connected
                && st.usb_tethering_available
                && !st.usb_interface_name.is_empty()
            {
                effects.usb_fallback = Some(st.usb_interface_name.clone());
            }
        }
        "connecting" => {
            st.connection_state = ConnectionState::Connecting;
            st.last_error.clear();
        }
        "connected" => {
            st.connection_state = ConnectionState::Connected;
            st.connecting_ssid.clear();
            st.last_error.clear();
            effects.refresh_lists = true;
        }
        "roaming" => st.connection_state = ConnectionState::Connected,
        other => debug!("unhandled station state: {other}"),
    }

    effects
}

fn is_busy_error(error: &zbus::Error) -> bool {
    match error {
        zbus::Error::MethodError(name, _, _) => name.as_str().ends_with(".Busy"),
        _ => false,
    }
}

fn iface_props<'a>(
    interfaces: &'a HashMap<OwnedInterfaceName, InterfaceProps>,
    name: &str,
) -> Option<&'a InterfaceProps> {
    interfaces
        .iter()
        .find(|(k, _)| k.as_str() == name)
        .map(|(_, v)| v)
}

fn prop_str(props: &InterfaceProps, name: &str) -> Option<String> {
    props
        .get(name)?
        .downcast_ref::<&str>()
        .ok()
        .map(str::to_owned)
}

fn prop_bool(props: &InterfaceProps, name: &str) -> Option<bool> {
    props.get(name)?.downcast_ref::<bool>().ok()
}

fn prop_path(props: &InterfaceProps, name: &str) -> Option<OwnedObjectPath> {
    props
        .get(name)?
        .downcast_ref::<ObjectPath>()
        .ok()
        .map(Into::into)
}

// Lifecycle, scan, and connect paths need a live supplicant on the system
// bus; they are exercised end-to-end rather than unit-tested. The pure
// pieces below (transition rules, pending credentials) have test modules.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_maps_and_clears_error() {
        let mut st = StateSnapshot {
            last_error: "Authentication failed".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "connecting");

        assert_eq!(st.connection_state, ConnectionState::Connecting);
        assert!(st.last_error.is_empty());
        assert_eq!(effects, TransitionEffects::default());
    }

    #[test]
    fn connected_clears_attempt_and_requests_refresh() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connecting,
            connecting_ssid: "Home".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "connected");

        assert_eq!(st.connection_state, ConnectionState::Connected);
        assert!(st.connecting_ssid.is_empty());
        assert!(effects.refresh_lists);
        assert_eq!(effects.usb_fallback, None);
    }

    #[test]
    fn connecting_to_disconnected_is_auth_failure() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connecting,
            connecting_ssid: "Home".into(),
            active_ssid: "Home".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "disconnected");

        assert_eq!(st.connection_state, ConnectionState::Failed);
        assert_eq!(st.last_error, "Authentication failed");
        assert!(st.connecting_ssid.is_empty());
        assert!(st.active_ssid.is_empty());
        assert_eq!(effects, TransitionEffects::default());
    }

    #[test]
    fn plain_disconnect_is_not_a_failure() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connected,
            active_ssid: "Home".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "disconnected");

        assert_eq!(st.connection_state, ConnectionState::Disconnected);
        assert!(st.last_error.is_empty());
        assert_eq!(effects, TransitionEffects::default());
    }

    #[test]
    fn wifi_loss_with_usb_standby_requests_fallback() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connected,
            active_ssid: "Home".into(),
            usb_tethering_available: true,
            usb_interface_name: "enp0s26u1u2".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "disconnected");

        assert_eq!(effects.usb_fallback.as_deref(), Some("enp0s26u1u2"));
    }

    #[test]
    fn wifi_loss_without_usb_carrier_does_not_fall_back() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connected,
            usb_tethering_available: false,
            usb_interface_name: "enp0s26u1u2".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "disconnected");

        assert_eq!(effects.usb_fallback, None);
    }

    #[test]
    fn roaming_keeps_connected_without_side_effects() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connected,
            active_ssid: "Home".into(),
            ..Default::default()
        };
        let effects = apply_station_transition(&mut st, "roaming");

        assert_eq!(st.connection_state, ConnectionState::Connected);
        assert_eq!(st.active_ssid, "Home");
        assert_eq!(effects, TransitionEffects::default());
    }

    #[test]
    fn unknown_state_is_ignored() {
        let mut st = StateSnapshot {
            connection_state: ConnectionState::Connected,
            ..Default::default()
        };
        apply_station_transition(&mut st, "disconnecting");
        assert_eq!(st.connection_state, ConnectionState::Connected);
    }

    #[test]
    fn non_method_errors_are_not_busy() {
        let not_busy = zbus::Error::from(zbus::fdo::Error::Failed("scan failed".into()));
        assert!(!is_busy_error(&not_busy));
    }
}
