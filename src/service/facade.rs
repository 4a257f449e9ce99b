//! The exported `org.xshell.Network` object.
//!
//! One object, one interface: read-only properties mirroring the state
//! snapshot, methods that mutate state directly or hand off to the
//! supplicant client, and change signals. Long operations (scan, connect,
//! DHCP) run as detached tasks so method returns are immediate.
//!
//! Every state mutation is broadcast as a `PropertiesChanged` carrying the
//! full property map — clients deduplicate. Targeted signals
//! (`ConnectionChanged`, `TrafficUpdated`, …) are derived by diffing
//! consecutive snapshots in the fan-out task.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{Array, OwnedValue, Signature, Structure, Type, Value};
use zbus::{interface, Connection};

use crate::models::{frequency_to_band, ConnectionState, Network};
use crate::service::{helpers, portal};
use crate::state::{StateManager, StateSnapshot};
use crate::supplicant::SupplicantClient;
use crate::Result;

/// Well-known name the daemon claims at startup.
pub const SERVICE_NAME: &str = "org.xshell.Network";
/// Path of the single exported object.
pub const OBJECT_PATH: &str = "/org/xshell/Network";
/// The custom interface on that object.
pub const INTERFACE_NAME: &str = "org.xshell.Network";

/// Which message bus to publish on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Wire form of one network: `(ssid, security, signal%, connected, frequency)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct NetworkEntry(pub String, pub String, pub u8, pub bool, pub u32);

impl From<&Network> for NetworkEntry {
    fn from(network: &Network) -> Self {
        Self(
            network.ssid.clone(),
            network.security.to_string(),
            network.signal,
            network.connected,
            network.frequency,
        )
    }
}

fn network_entries(networks: &[Network]) -> Vec<NetworkEntry> {
    networks.iter().map(Into::into).collect()
}

/// The service object behind `/org/xshell/Network`.
pub struct NetworkService {
    state: Arc<StateManager>,
    supplicant: Option<Arc<SupplicantClient>>,
}

impl NetworkService {
    fn supplicant(&self) -> zbus::fdo::Result<Arc<SupplicantClient>> {
        self.supplicant
            .clone()
            .ok_or_else(|| zbus::fdo::Error::Failed("supplicant not available".into()))
    }
}

#[interface(name = "org.xshell.Network")]
impl NetworkService {
    // --- methods ---

    /// Powers the radio on or off. `WifiEnabled` follows via the device
    /// property change; the optimistic write here keeps the UI snappy.
    async fn enable_wifi(
        &self,
        enabled: bool,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let supplicant = self.supplicant()?;

        if let Err(e) = supplicant.set_wifi_enabled(enabled).await {
            let _ = Self::error(&emitter, "EnableWifi", &e.to_string()).await;
            return Ok(false);
        }

        self.state.update(|st| st.wifi_enabled = enabled);
        Self::wifi_state_changed(&emitter, enabled).await?;
        Ok(true)
    }

    /// Triggers a scan. Returns immediately; completion is signalled via
    /// `ScanCompleted` and the refreshed `Networks` property.
    async fn scan(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        let supplicant = self.supplicant()?;

        self.state.update(|st| st.wifi_scanning = true);
        Self::scan_started(&emitter).await?;

        let state = self.state.clone();
        let emitter = emitter.to_owned();
        tokio::spawn(async move {
            let result = supplicant.scan().await;
            state.update(|st| st.wifi_scanning = false);

            match result {
                Ok(networks) => {
                    let _ = Self::networks_changed(&emitter, network_entries(&networks)).await;
                }
                Err(e) => {
                    let _ = Self::error(&emitter, "Scan", &e.to_string()).await;
                }
            }
            let _ = Self::scan_completed(&emitter).await;
        });

        Ok(())
    }

    /// Starts a connection attempt. Keys: `ssid` (required), `password`,
    /// `security`, `hidden`. Returns once the attempt is underway; the
    /// outcome arrives through state changes.
    async fn connect(
        &self,
        params: HashMap<String, OwnedValue>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let supplicant = self.supplicant()?;

        let ssid = param_str(&params, "ssid")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs("ssid is required".into()))?;
        let password = param_str(&params, "password").unwrap_or_default();
        let security = param_str(&params, "security").unwrap_or_else(|| "psk".into());
        let hidden = param_bool(&params, "hidden").unwrap_or(false);

        info!("Connect request for {ssid}");
        self.state.update(|st| {
            st.connection_state = ConnectionState::Connecting;
            st.active_ssid = ssid.clone();
            st.last_error.clear();
        });
        Self::connection_changed(&emitter, "connecting", &ssid, 0).await?;

        let state = self.state.clone();
        let emitter = emitter.to_owned();
        tokio::spawn(async move {
            if let Err(e) = supplicant.connect(&ssid, &password, &security, hidden).await {
                state.update(|st| {
                    st.connection_state = ConnectionState::Failed;
                    st.last_error = e.to_string();
                });
                let _ = Self::error(&emitter, "Connect", &e.to_string()).await;
                let _ = Self::connection_changed(&emitter, "failed", &ssid, 0).await;
            }
            // Success lands via the station property handlers.
        });

        Ok(true)
    }

    /// Connects to a saved network; credentials come from the
    /// supplicant's own store.
    async fn connect_saved(
        &self,
        ssid: String,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let supplicant = self.supplicant()?;

        self.state.update(|st| {
            st.connection_state = ConnectionState::Connecting;
            st.active_ssid = ssid.clone();
        });
        Self::connection_changed(&emitter, "connecting", &ssid, 0).await?;

        let state = self.state.clone();
        let emitter = emitter.to_owned();
        tokio::spawn(async move {
            if let Err(e) = supplicant.connect_saved(&ssid).await {
                state.update(|st| st.connection_state = ConnectionState::Failed);
                let _ = Self::error(&emitter, "ConnectSaved", &e.to_string()).await;
            }
        });

        Ok(true)
    }

    /// Disassociates from the current network.
    async fn disconnect(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        let supplicant = self.supplicant()?;
        let previous = self.state.get().active_ssid;

        if let Err(e) = supplicant.disconnect().await {
            let _ = Self::error(&emitter, "Disconnect", &e.to_string()).await;
            return Ok(());
        }

        self.state.update(|st| {
            st.connection_state = ConnectionState::Disconnected;
            st.active_ssid.clear();
            st.signal_rssi = 0;
            st.signal_strength = 0;
        });
        Self::connection_changed(&emitter, "disconnected", &previous, 0).await?;
        Ok(())
    }

    /// Removes a saved profile and refreshes the saved set.
    async fn forget(
        &self,
        ssid: String,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let supplicant = self.supplicant()?;

        if let Err(e) = supplicant.forget(&ssid).await {
            let _ = Self::error(&emitter, "Forget", &e.to_string()).await;
            return Ok(false);
        }

        supplicant.refresh_known_networks().await;
        Ok(true)
    }

    /// Toggles unattended reconnection for a saved network.
    async fn set_auto_connect(
        &self,
        ssid: String,
        enabled: bool,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let supplicant = self.supplicant()?;

        if let Err(e) = supplicant.set_auto_connect(&ssid, enabled).await {
            let _ = Self::error(&emitter, "SetAutoConnect", &e.to_string()).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Switches the radio into AP mode and starts broadcasting.
    async fn start_hotspot(
        &self,
        ssid: String,
        password: String,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let supplicant = self.supplicant()?;

        if let Err(e) = supplicant.start_hotspot(&ssid, &password).await {
            let _ = Self::error(&emitter, "StartHotspot", &e.to_string()).await;
            return Ok(false);
        }

        self.state.update(|st| {
            st.hotspot_active = true;
            st.hotspot_ssid = ssid.clone();
        });
        Ok(true)
    }

    /// Stops the access point and returns to station mode.
    async fn stop_hotspot(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        let supplicant = self.supplicant()?;

        if let Err(e) = supplicant.stop_hotspot().await {
            let _ = Self::error(&emitter, "StopHotspot", &e.to_string()).await;
            return Ok(());
        }

        self.state.update(|st| {
            st.hotspot_active = false;
            st.hotspot_ssid.clear();
        });
        Ok(())
    }

    /// Blocks or unblocks all radios via rfkill.
    async fn set_airplane_mode(
        &self,
        enabled: bool,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        if let Err(e) = helpers::set_rfkill(enabled).await {
            warn!("airplane mode switch failed: {e}");
            let _ = Self::error(&emitter, "SetAirplaneMode", &e.to_string()).await;
            return Ok(false);
        }

        self.state.update(|st| st.airplane_mode = enabled);
        Ok(true)
    }

    /// Probes for a captive portal and records the result.
    async fn check_captive_portal(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let (detected, url) = portal::check_captive_portal().await;

        self.state.update(|st| {
            st.captive_portal_detected = detected;
            st.captive_portal_url = url.clone();
            st.last_captive_check_ssid = st.active_ssid.clone();
        });
        Self::captive_portal_status(&emitter, detected, &url).await?;

        Ok(detected)
    }

    /// Opens the recorded portal URL in the default browser.
    async fn open_captive_portal(&self) {
        let url = self.state.get().captive_portal_url;
        if !url.is_empty() {
            helpers::open_url(&url);
        }
    }

    /// Requests DHCP on the USB tethering interface. The phone side
    /// controls tethering itself; this only asks for an address.
    async fn request_usb_network(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<bool> {
        let st = self.state.get();

        if !st.usb_interface_detected {
            return Err(zbus::fdo::Error::Failed(
                "no USB network interface detected".into(),
            ));
        }
        if !st.usb_tethering_available {
            return Err(zbus::fdo::Error::Failed(
                "USB tethering not available (no carrier)".into(),
            ));
        }
        if st.usb_tethering_connected {
            return Ok(true);
        }

        let emitter = emitter.to_owned();
        tokio::spawn(async move {
            let iface = st.usb_interface_name;
            info!("requesting USB network on {iface}");
            if let Err(e) = helpers::run_dhcp(&iface, false).await {
                warn!("USB DHCP request failed on {iface}: {e}");
                let _ = Self::error(&emitter, "RequestUsbNetwork", &e.to_string()).await;
            }
            // Success is observed through the kernel address event.
        });

        Ok(true)
    }

    /// Releases the DHCP lease on the USB tethering interface.
    async fn release_usb_network(&self) {
        let st = self.state.get();
        if st.usb_interface_name.is_empty() {
            return;
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            let iface = st.usb_interface_name;
            info!("releasing USB network on {iface}");
            helpers::release_dhcp(&iface).await;
            state.update(|s| s.usb_tethering_connected = false);
        });
    }

    // --- properties (all read-only) ---

    #[zbus(property)]
    async fn wifi_enabled(&self) -> bool {
        self.state.get().wifi_enabled
    }

    #[zbus(property)]
    async fn wifi_scanning(&self) -> bool {
        self.state.get().wifi_scanning
    }

    #[zbus(property)]
    async fn connection_state(&self) -> String {
        self.state.get().connection_state.to_string()
    }

    #[zbus(property, name = "ConnectingSSID")]
    async fn connecting_ssid(&self) -> String {
        self.state.get().connecting_ssid
    }

    #[zbus(property, name = "ActiveSSID")]
    async fn active_ssid(&self) -> String {
        self.state.get().active_ssid
    }

    #[zbus(property)]
    async fn active_security(&self) -> String {
        self.state.get().active_security
    }

    #[zbus(property, name = "SignalRSSI")]
    async fn signal_rssi(&self) -> i16 {
        self.state.get().signal_rssi
    }

    #[zbus(property)]
    async fn signal_strength(&self) -> u8 {
        self.state.get().signal_strength
    }

    #[zbus(property)]
    async fn frequency(&self) -> u32 {
        self.state.get().frequency
    }

    /// Band label derived from the frequency.
    #[zbus(property)]
    async fn band(&self) -> String {
        frequency_to_band(self.state.get().frequency).to_string()
    }

    #[zbus(property)]
    async fn ip_address(&self) -> String {
        self.state.get().ip_address
    }

    #[zbus(property)]
    async fn gateway(&self) -> String {
        self.state.get().gateway
    }

    #[zbus(property)]
    async fn mac_address(&self) -> String {
        self.state.get().mac_address
    }

    #[zbus(property)]
    async fn interface_name(&self) -> String {
        self.state.get().interface_name
    }

    #[zbus(property)]
    async fn connection_type(&self) -> String {
        self.state.get().connection_type.to_string()
    }

    #[zbus(property)]
    async fn traffic_in(&self) -> u64 {
        self.state.get().traffic_in
    }

    #[zbus(property)]
    async fn traffic_out(&self) -> u64 {
        self.state.get().traffic_out
    }

    #[zbus(property)]
    async fn networks(&self) -> Vec<NetworkEntry> {
        network_entries(&self.state.get().networks)
    }

    #[zbus(property)]
    async fn saved_networks(&self) -> Vec<String> {
        self.state.get().saved_networks
    }

    #[zbus(property)]
    async fn airplane_mode(&self) -> bool {
        self.state.get().airplane_mode
    }

    #[zbus(property)]
    async fn hotspot_active(&self) -> bool {
        self.state.get().hotspot_active
    }

    #[zbus(property)]
    async fn captive_portal_detected(&self) -> bool {
        self.state.get().captive_portal_detected
    }

    #[zbus(property)]
    async fn usb_interface_detected(&self) -> bool {
        self.state.get().usb_interface_detected
    }

    #[zbus(property)]
    async fn usb_tethering_available(&self) -> bool {
        self.state.get().usb_tethering_available
    }

    #[zbus(property)]
    async fn usb_tethering_connected(&self) -> bool {
        self.state.get().usb_tethering_connected
    }

    #[zbus(property)]
    async fn usb_interface_name(&self) -> String {
        self.state.get().usb_interface_name
    }

    #[zbus(property)]
    async fn last_error(&self) -> String {
        self.state.get().last_error
    }

    // --- signals ---

    #[zbus(signal)]
    async fn wifi_state_changed(emitter: &SignalEmitter<'_>, enabled: bool) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn scan_started(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn scan_completed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn networks_changed(
        emitter: &SignalEmitter<'_>,
        networks: Vec<NetworkEntry>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn connection_changed(
        emitter: &SignalEmitter<'_>,
        state: &str,
        ssid: &str,
        signal: u8,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn traffic_updated(
        emitter: &SignalEmitter<'_>,
        in_bytes: u64,
        out_bytes: u64,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn address_changed(
        emitter: &SignalEmitter<'_>,
        ip: &str,
        gateway: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn interface_changed(
        emitter: &SignalEmitter<'_>,
        iface: &str,
        is_up: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn captive_portal_status(
        emitter: &SignalEmitter<'_>,
        detected: bool,
        url: &str,
    ) -> zbus::Result<()>;

    /// `(operation, message)` for failures that have no method return to
    /// travel on.
    #[zbus(signal)]
    async fn error(emitter: &SignalEmitter<'_>, operation: &str, message: &str)
        -> zbus::Result<()>;
}

/// Acquires the bus name, exports the object, and wires the state fan-out.
///
/// Name acquisition failure is the only fatal startup error in the daemon;
/// it propagates out of here.
pub async fn serve(
    bus: BusKind,
    state: Arc<StateManager>,
    supplicant: Option<Arc<SupplicantClient>>,
) -> Result<Connection> {
    let service = NetworkService {
        state: state.clone(),
        supplicant,
    };

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    // The change callback runs on the writer's thread and must not block;
    // it forwards snapshots to the emitter task through an unbounded
    // channel, preserving update order.
    let (tx, rx) = mpsc::unbounded_channel();
    state.set_on_change(move |snapshot| {
        let _ = tx.send(snapshot.clone());
    });
    tokio::spawn(run_fanout(conn.clone(), rx));

    Ok(conn)
}

/// Emits one `PropertiesChanged` (full map) per state update, plus the
/// targeted signals derived from what actually changed.
async fn run_fanout(conn: Connection, mut rx: mpsc::UnboundedReceiver<StateSnapshot>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("signal emitter construction failed: {e}");
            return;
        }
    };

    let mut previous: Option<StateSnapshot> = None;
    while let Some(snapshot) = rx.recv().await {
        if let Err(e) = emit_properties_changed(&conn, &snapshot).await {
            debug!("PropertiesChanged emission failed: {e}");
        }

        if let Some(prev) = &previous {
            emit_diff_signals(&emitter, prev, &snapshot).await;
        }
        previous = Some(snapshot);
    }
}

async fn emit_diff_signals(emitter: &SignalEmitter<'_>, prev: &StateSnapshot, st: &StateSnapshot) {
    if prev.wifi_enabled != st.wifi_enabled {
        let _ = NetworkService::wifi_state_changed(emitter, st.wifi_enabled).await;
    }
    if prev.connection_state != st.connection_state || prev.active_ssid != st.active_ssid {
        let _ = NetworkService::connection_changed(
            emitter,
            st.connection_state.as_str(),
            &st.active_ssid,
            st.signal_strength,
        )
        .await;
    }
    if prev.traffic_in != st.traffic_in || prev.traffic_out != st.traffic_out {
        let _ = NetworkService::traffic_updated(emitter, st.traffic_in, st.traffic_out).await;
    }
    if prev.ip_address != st.ip_address || prev.gateway != st.gateway {
        let _ = NetworkService::address_changed(emitter, &st.ip_address, &st.gateway).await;
    }
    if prev.interface_name != st.interface_name {
        let _ = NetworkService::interface_changed(
            emitter,
            &st.interface_name,
            !st.interface_name.is_empty(),
        )
        .await;
    }
    if prev.networks != st.networks {
        let _ = NetworkService::networks_changed(emitter, network_entries(&st.networks)).await;
    }
}

async fn emit_properties_changed(conn: &Connection, st: &StateSnapshot) -> zbus::Result<()> {
    let props = property_map(st);
    conn.emit_signal(
        None::<zbus::names::BusName<'_>>,
        OBJECT_PATH,
        "org.freedesktop.DBus.Properties",
        "PropertiesChanged",
        &(INTERFACE_NAME, props, Vec::<String>::new()),
    )
    .await
}

/// The full public property map, as carried by every `PropertiesChanged`.
fn property_map(st: &StateSnapshot) -> HashMap<&'static str, Value<'static>> {
    let mut props: HashMap<&'static str, Value<'static>> = HashMap::new();
    props.insert("WifiEnabled", st.wifi_enabled.into());
    props.insert("WifiScanning", st.wifi_scanning.into());
    props.insert("ConnectionState", st.connection_state.to_string().into());
    props.insert("ConnectingSSID", st.connecting_ssid.clone().into());
    props.insert("ActiveSSID", st.active_ssid.clone().into());
    props.insert("ActiveSecurity", st.active_security.clone().into());
    props.insert("SignalRSSI", st.signal_rssi.into());
    props.insert("SignalStrength", st.signal_strength.into());
    props.insert("Frequency", st.frequency.into());
    props.insert("Band", frequency_to_band(st.frequency).into());
    props.insert("IpAddress", st.ip_address.clone().into());
    props.insert("Gateway", st.gateway.clone().into());
    props.insert("MacAddress", st.mac_address.clone().into());
    props.insert("InterfaceName", st.interface_name.clone().into());
    props.insert("ConnectionType", st.connection_type.to_string().into());
    props.insert("TrafficIn", st.traffic_in.into());
    props.insert("TrafficOut", st.traffic_out.into());
    props.insert("Networks", networks_value(&st.networks));
    props.insert("SavedNetworks", st.saved_networks.clone().into());
    props.insert("AirplaneMode", st.airplane_mode.into());
    props.insert("HotspotActive", st.hotspot_active.into());
    props.insert("CaptivePortalDetected", st.captive_portal_detected.into());
    props.insert("UsbInterfaceDetected", st.usb_interface_detected.into());
    props.insert("UsbTetheringAvailable", st.usb_tethering_available.into());
    props.insert("UsbTetheringConnected", st.usb_tethering_connected.into());
    props.insert("UsbInterfaceName", st.usb_interface_name.clone().into());
    props.insert("LastError", st.last_error.clone().into());
    props
}

/// Builds the `a(ssybu)` value for the Networks property.
fn networks_value(networks: &[Network]) -> Value<'static> {
    let signature = Signature::try_from("(ssybu)").expect("static signature");
    let mut array = Array::new(&signature);
    for network in networks {
        let entry = Structure::from((
            network.ssid.clone(),
            network.security.to_string(),
            network.signal,
            network.connected,
            network.frequency,
        ));
        if let Err(e) = array.append(Value::from(entry)) {
            debug!("network entry append failed: {e}");
        }
    }
    Value::from(array)
}

fn param_str(params: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    params
        .get(key)?
        .downcast_ref::<&str>()
        .ok()
        .map(str::to_owned)
}

fn param_bool(params: &HashMap<String, OwnedValue>, key: &str) -> Option<bool> {
    params.get(key)?.downcast_ref::<bool>().ok()
}
