//! Kernel event watcher.
//!
//! Subscribes to the RTNETLINK link and IPv4 address multicast groups and
//! drives interface bookkeeping from them: which interface carries the
//! connection, USB tethering lifecycle (detected / available / connected),
//! addressing, and the default gateway.
//!
//! Wi-Fi connection state is owned by the supplicant client; this module
//! only promotes `connecting`/`obtaining` to `connected` once an address
//! lands on the active interface. USB interfaces are matched by ifindex
//! rather than name on removal, since USB device names reshuffle across
//! replug.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::UnboundedReceiver;
use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage, State as LinkState};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::AsyncSocket;
use rtnetlink::{Handle, IpVersion};

use crate::models::{ConnectionState, ConnectionType};
use crate::service::helpers;
use crate::state::StateManager;
use crate::sysfs;
use crate::Result;

/// RTNETLINK multicast groups: RTMGRP_LINK | RTMGRP_IPV4_IFADDR.
const MCAST_GROUPS: u32 = 0x1 | 0x10;

/// Resume-triggered fetches only fire within this window after wakeup.
const RESUME_FETCH_WINDOW: Duration = Duration::from_secs(60);

/// The multicast message stream handed to [`NetWatcher::run`].
pub type NetlinkMessages =
    UnboundedReceiver<(NetlinkMessage<RouteNetlinkMessage>, netlink_sys::SocketAddr)>;

/// The fields of an RTM_NEWLINK/RTM_DELLINK message the watcher acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkEvent {
    name: String,
    index: u32,
    up: bool,
    carrier: bool,
    mac: Option<String>,
}

/// Privileged follow-ups decided while holding the state lock, executed
/// after it is released.
#[derive(Debug, PartialEq, Eq)]
enum LinkAction {
    BringUp(String),
    RunDhcp(String),
}

/// Watches kernel link/address/route events and mirrors them into state.
pub struct NetWatcher {
    handle: Handle,
    state: Arc<StateManager>,
    sys_root: PathBuf,
    /// Last logged "up:carrier" per ifindex; deduplicates log lines only,
    /// state is always rewritten.
    last_link_state: HashMap<u32, String>,
}

impl NetWatcher {
    /// Opens the netlink connection, joins the multicast groups, and
    /// spawns the connection driver. The returned message stream must be
    /// passed to [`run`].
    ///
    /// [`run`]: Self::run
    pub fn new(state: Arc<StateManager>) -> Result<(Self, NetlinkMessages)> {
        let (mut conn, handle, messages) = rtnetlink::new_connection()?;

        let addr = netlink_sys::SocketAddr::new(0, MCAST_GROUPS);
        conn.socket_mut().socket_mut().bind(&addr)?;
        tokio::spawn(conn);

        Ok((
            Self {
                handle,
                state,
                sys_root: PathBuf::from(sysfs::SYS_CLASS_NET),
                last_link_state: HashMap::new(),
            },
            messages,
        ))
    }

    /// Replays the current tables, then processes multicast events until
    /// the stream ends.
    pub async fn run(mut self, mut messages: NetlinkMessages) {
        if let Err(e) = self.enumerate_links().await {
            warn!("initial link enumeration failed: {e}");
        }
        if let Err(e) = self.enumerate_addresses().await {
            warn!("initial address enumeration failed: {e}");
        }

        while let Some((message, _source)) = messages.next().await {
            self.handle_message(message).await;
        }
        warn!("netlink message stream ended");
    }

    async fn handle_message(&mut self, message: NetlinkMessage<RouteNetlinkMessage>) {
        match message.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                if let Some(event) = parse_link(&link) {
                    self.handle_link_event(event);
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                let index = link.header.index;
                let name = parse_link(&link).map(|e| e.name).unwrap_or_default();
                info!("link removed: {name} (index {index})");
                apply_link_removal(&self.state, index);
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(address)) => {
                if let Some((index, ip)) = parse_address(&address) {
                    self.handle_address_event(index, ip).await;
                }
            }
            // Address removal is not tracked; the next address event
            // rewrites the field.
            _ => {}
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if event.name.is_empty() || event.name == "lo" {
            return;
        }

        let link_key = format!("{}:{}", event.up, event.carrier);
        if self.last_link_state.get(&event.index) != Some(&link_key) {
            info!(
                "link {} (index {}): up={} carrier={}",
                event.name, event.index, event.up, event.carrier
            );
            self.last_link_state.insert(event.index, link_key);
        }

        let is_usb = sysfs::is_usb_interface(&self.sys_root, &event.name);
        let connection_type = sysfs::classify_interface(&self.sys_root, &event.name);
        let actions = apply_link_update(&self.state, &event, is_usb, connection_type);
        execute_actions(actions);
    }

    async fn handle_address_event(&mut self, index: u32, ip: IpAddr) {
        let name = match self.link_name_by_index(index).await {
            Ok(Some(name)) => name,
            Ok(None) => return,
            Err(e) => {
                debug!("link lookup for index {index} failed: {e}");
                return;
            }
        };
        if name == "lo" {
            return;
        }

        info!("address change on {name}: {ip}");

        let is_usb = sysfs::is_usb_interface(&self.sys_root, &name);
        let has_default_route = if is_usb {
            self.has_default_route_via(index).await
        } else {
            false
        };
        apply_address_update(&self.state, &name, ip, is_usb, has_default_route);

        self.maybe_trigger_fetches(ip);

        if let Err(e) = self.fetch_gateway().await {
            debug!("gateway fetch failed: {e}");
        }
    }

    /// One-shot external fetches keyed to fresh IPv4 connectivity: once
    /// shortly after resume, once at startup.
    fn maybe_trigger_fetches(&self, ip: IpAddr) {
        if !ip.is_ipv4() {
            return;
        }
        let st = self.state.get();

        let within_resume_window = st
            .resume_timestamp
            .map(|t| t.elapsed() < RESUME_FETCH_WINDOW)
            .unwrap_or(false);
        if st.was_resumed && !st.weather_triggered && within_resume_window {
            info!("resume + IPv4: triggering weather fetch");
            spawn_weather_fetch("resume");
            self.state.update(|s| {
                s.was_resumed = false;
                s.weather_triggered = true;
            });
            return;
        }

        if st.is_startup && !st.weather_triggered {
            info!("startup + IPv4: triggering weather fetch");
            spawn_weather_fetch("startup");
            self.state.update(|s| {
                s.is_startup = false;
                s.weather_triggered = true;
            });
        }
    }

    async fn link_name_by_index(&self, index: u32) -> Result<Option<String>> {
        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await.map_err(into_io)? {
            if link.header.index == index {
                return Ok(parse_link(&link).map(|e| e.name));
            }
        }
        Ok(None)
    }

    async fn has_default_route_via(&self, index: u32) -> bool {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        loop {
            match routes.try_next().await {
                Ok(Some(route)) => {
                    if is_default_route(&route)
                        && route_gateway(&route).is_some()
                        && route_oif(&route) == Some(index)
                    {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(e) => {
                    debug!("route enumeration failed: {e}");
                    return false;
                }
            }
        }
    }

    /// Records the first default route's gateway.
    async fn fetch_gateway(&self) -> Result<()> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(route) = routes.try_next().await.map_err(into_io)? {
            if !is_default_route(&route) {
                continue;
            }
            if let Some(gateway) = route_gateway(&route) {
                self.state.update(|st| st.gateway = gateway.to_string());
                break;
            }
        }
        Ok(())
    }

    /// Replays the link table so the daemon starts with interfaces already
    /// classified and the MAC of the active one recorded.
    async fn enumerate_links(&mut self) -> Result<()> {
        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await.map_err(into_io)? {
            let Some(event) = parse_link(&link) else {
                continue;
            };
            if event.name == "lo" {
                continue;
            }

            let is_usb = sysfs::is_usb_interface(&self.sys_root, &event.name);
            if is_usb {
                let connection_type = ConnectionType::Usb;
                let actions = apply_link_update(&self.state, &event, true, connection_type);
                execute_actions(actions);
                continue;
            }

            if event.up {
                let connection_type = sysfs::classify_interface(&self.sys_root, &event.name);
                self.state.update(|st| {
                    st.interface_name = event.name.clone();
                    if let Some(mac) = &event.mac {
                        st.mac_address = mac.clone();
                    }
                    st.connection_type = connection_type;
                });
            }
        }
        Ok(())
    }

    /// Replays the address table for the active interface.
    async fn enumerate_addresses(&self) -> Result<()> {
        let interface_name = self.state.get().interface_name;
        if interface_name.is_empty() {
            return Ok(());
        }

        let mut index = None;
        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await.map_err(into_io)? {
            if parse_link(&link).map(|e| e.name).as_deref() == Some(interface_name.as_str()) {
                index = Some(link.header.index);
                break;
            }
        }
        let Some(index) = index else {
            return Ok(());
        };

        let mut addresses = self.handle.address().get().execute();
        while let Some(address) = addresses.try_next().await.map_err(into_io)? {
            if let Some((addr_index, ip)) = parse_address(&address) {
                if addr_index == index {
                    self.state.update(|st| st.ip_address = ip.to_string());
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Folds a link update into state and returns the privileged follow-ups.
///
/// For USB interfaces: detection is sticky until link removal; tethering
/// availability follows carrier; the rising edge of availability brings
/// the interface up (when down) and starts DHCP. For other interfaces the
/// active-interface fields are updated when unset or matching.
fn apply_link_update(
    state: &StateManager,
    event: &LinkEvent,
    is_usb: bool,
    connection_type: ConnectionType,
) -> Vec<LinkAction> {
    let mut actions = Vec::new();

    state.update(|st| {
        if is_usb {
            st.usb_interface_detected = true;
            st.usb_interface_name = event.name.clone();
            st.usb_interface_index = event.index;

            if event.carrier {
                if !st.usb_tethering_available {
                    st.usb_tethering_available = true;
                    if !event.up {
                        actions.push(LinkAction::BringUp(event.name.clone()));
                    }
                    actions.push(LinkAction::RunDhcp(event.name.clone()));
                }
            } else {
                // Carrier lost: tethering gone, but the interface itself
                // is still plugged in.
                st.usb_tethering_available = false;
                st.usb_tethering_connected = false;
            }
        }

        if !is_usb && event.up && (st.interface_name == event.name || st.interface_name.is_empty())
        {
            st.interface_name = event.name.clone();
            st.connection_type = connection_type;
        }
    });

    actions
}

/// Clears the USB fields when the tracked interface disappears.
fn apply_link_removal(state: &StateManager, index: u32) {
    state.update(|st| {
        if st.usb_interface_index == index {
            debug!("tracked USB interface removed (index {index})");
            st.usb_interface_detected = false;
            st.usb_tethering_available = false;
            st.usb_tethering_connected = false;
            st.usb_interface_name.clear();
            st.usb_interface_index = 0;
        }
    });
}

/// Folds an address assignment into state.
///
/// USB addressing counts as connected only with a default route through
/// the interface; Wi-Fi/ethernet addressing promotes an in-flight
/// connection to `connected`.
fn apply_address_update(
    state: &StateManager,
    name: &str,
    ip: IpAddr,
    is_usb: bool,
    has_default_route: bool,
) {
    state.update(|st| {
        if is_usb && st.usb_interface_name == name {
            st.ip_address = ip.to_string();
            if has_default_route {
                info!("USB tethering connected on {name}: {ip}");
                st.usb_tethering_connected = true;
                st.connection_type = ConnectionType::Usb;
            }
        }

        if !is_usb && st.interface_name == name {
            st.ip_address = ip.to_string();
            if st.connection_state == ConnectionState::Connecting
                || st.connection_state == ConnectionState::Obtaining
            {
                st.connection_state = ConnectionState::Connected;
            }
        }
    });
}

fn execute_actions(actions: Vec<LinkAction>) {
    for action in actions {
        match action {
            LinkAction::BringUp(name) => {
                info!("bringing up USB interface {name}");
                tokio::spawn(async move {
                    if let Err(e) = helpers::bring_up_interface(&name).await {
                        warn!("failed to bring up {name}: {e}");
                    }
                });
            }
            LinkAction::RunDhcp(name) => {
                info!("starting DHCP on USB interface {name}");
                tokio::spawn(async move {
                    if let Err(e) = helpers::run_dhcp(&name, false).await {
                        // No IP means the address watcher never reports
                        // connected; nothing else to unwind.
                        warn!("DHCP failed on {name}: {e}");
                    }
                });
            }
        }
    }
}

fn spawn_weather_fetch(reason: &str) {
    let reason = format!("--reason={reason}");
    tokio::spawn(async move {
        let home = std::env::var("HOME").unwrap_or_default();
        let result = tokio::process::Command::new(format!("{home}/.local/bin/x-fetch"))
            .arg("weather")
            .arg(&reason)
            .status()
            .await;
        if let Err(e) = result {
            debug!("weather fetch failed: {e}");
        }
    });
}

fn parse_link(message: &LinkMessage) -> Option<LinkEvent> {
    let mut name = None;
    let mut up = false;
    let mut carrier = false;
    let mut mac = None;

    for attribute in &message.attributes {
        match attribute {
            LinkAttribute::IfName(value) => name = Some(value.clone()),
            LinkAttribute::OperState(state) => up = *state == LinkState::Up,
            LinkAttribute::Carrier(value) => carrier = *value == 1,
            LinkAttribute::Address(bytes) => mac = Some(format_mac(bytes)),
            _ => {}
        }
    }

    Some(LinkEvent {
        name: name?,
        index: message.header.index,
        up,
        carrier,
        mac,
    })
}

fn parse_address(message: &AddressMessage) -> Option<(u32, IpAddr)> {
    for attribute in &message.attributes {
        if let AddressAttribute::Address(ip) = attribute {
            return Some((message.header.index, *ip));
        }
    }
    None
}

fn is_default_route(route: &RouteMessage) -> bool {
    route.header.destination_prefix_length == 0
}

fn route_gateway(route: &RouteMessage) -> Option<IpAddr> {
    for attribute in &route.attributes {
        if let RouteAttribute::Gateway(gateway) = attribute {
            match gateway {
                RouteAddress::Inet(ip) => return Some(IpAddr::V4(*ip)),
                RouteAddress::Inet6(ip) => return Some(IpAddr::V6(*ip)),
                _ => {}
            }
        }
    }
    None
}

fn route_oif(route: &RouteMessage) -> Option<u32> {
    for attribute in &route.attributes {
        if let RouteAttribute::Oif(index) = attribute {
            return Some(*index);
        }
    }
    None
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn into_io(error: rtnetlink::Error) -> crate::models::NetworkError {
    crate::models::NetworkError::Io(std::io::Error::other(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_event(up: bool, carrier: bool) -> LinkEvent {
        LinkEvent {
            name: "enp0s26u1u2".into(),
            index: 7,
            up,
            carrier,
            mac: None,
        }
    }

    #[test]
    fn usb_carrier_up_marks_available_and_requests_dhcp() {
        let state = StateManager::new();
        let actions = apply_link_update(&state, &usb_event(false, true), true, ConnectionType::Usb);

        let st = state.get();
        assert!(st.usb_interface_detected);
        assert!(st.usb_tethering_available);
        assert_eq!(st.usb_interface_name, "enp0s26u1u2");
        assert_eq!(st.usb_interface_index, 7);
        // interface was down: bring it up, then DHCP
        assert_eq!(
            actions,
            vec![
                LinkAction::BringUp("enp0s26u1u2".into()),
                LinkAction::RunDhcp("enp0s26u1u2".into()),
            ]
        );
    }

    #[test]
    fn usb_rising_edge_fires_dhcp_once() {
        let state = StateManager::new();
        let first = apply_link_update(&state, &usb_event(true, true), true, ConnectionType::Usb);
        assert_eq!(first, vec![LinkAction::RunDhcp("enp0s26u1u2".into())]);

        // repeated carrier-up reports must not restart DHCP
        let second = apply_link_update(&state, &usb_event(true, true), true, ConnectionType::Usb);
        assert!(second.is_empty());
    }

    #[test]
    fn usb_carrier_loss_keeps_detected() {
        let state = StateManager::new();
        apply_link_update(&state, &usb_event(true, true), true, ConnectionType::Usb);
        apply_address_update(
            &state,
            "enp0s26u1u2",
            "192.0.2.5".parse().unwrap(),
            true,
            true,
        );
        assert!(state.get().usb_tethering_connected);

        let actions = apply_link_update(&state, &usb_event(true, false), true, ConnectionType::Usb);
        assert!(actions.is_empty());

        let st = state.get();
        assert!(st.usb_interface_detected); // sticky until removal
        assert!(!st.usb_tethering_available);
        assert!(!st.usb_tethering_connected);
    }

    #[test]
    fn link_removal_clears_usb_fields_by_index() {
        let state = StateManager::new();
        apply_link_update(&state, &usb_event(true, true), true, ConnectionType::Usb);

        // a different index must not clear anything
        apply_link_removal(&state, 99);
        assert!(state.get().usb_interface_detected);

        apply_link_removal(&state, 7);
        let st = state.get();
        assert!(!st.usb_interface_detected);
        assert!(!st.usb_tethering_available);
        assert!(!st.usb_tethering_connected);
        assert!(st.usb_interface_name.is_empty());
        assert_eq!(st.usb_interface_index, 0);
    }

    #[test]
    fn usb_address_without_route_is_not_connected() {
        let state = StateManager::new();
        apply_link_update(&state, &usb_event(true, true), true, ConnectionType::Usb);

        apply_address_update(
            &state,
            "enp0s26u1u2",
            "192.0.2.5".parse().unwrap(),
            true,
            false,
        );

        let st = state.get();
        assert_eq!(st.ip_address, "192.0.2.5");
        assert!(!st.usb_tethering_connected);
    }

    #[test]
    fn usb_address_with_route_connects() {
        let state = StateManager::new();
        apply_link_update(&state, &usb_event(true, true), true, ConnectionType::Usb);

        apply_address_update(
            &state,
            "enp0s26u1u2",
            "192.0.2.5".parse().unwrap(),
            true,
            true,
        );

        let st = state.get();
        assert!(st.usb_tethering_connected);
        assert_eq!(st.connection_type, ConnectionType::Usb);
        assert_eq!(st.ip_address, "192.0.2.5");
    }

    #[test]
    fn wifi_address_promotes_connecting_to_connected() {
        let state = StateManager::new();
        state.update(|st| {
            st.interface_name = "wlan0".into();
            st.connection_state = ConnectionState::Connecting;
        });

        apply_address_update(&state, "wlan0", "10.0.0.2".parse().unwrap(), false, false);

        let st = state.get();
        assert_eq!(st.connection_state, ConnectionState::Connected);
        assert_eq!(st.ip_address, "10.0.0.2");
    }

    #[test]
    fn wifi_address_leaves_settled_state_alone() {
        let state = StateManager::new();
        state.update(|st| {
            st.interface_name = "wlan0".into();
            st.connection_state = ConnectionState::Connected;
        });

        apply_address_update(&state, "wlan0", "10.0.0.3".parse().unwrap(), false, false);
        assert_eq!(state.get().connection_state, ConnectionState::Connected);

        state.update(|st| st.connection_state = ConnectionState::Disconnected);
        apply_address_update(&state, "wlan0", "10.0.0.4".parse().unwrap(), false, false);
        assert_eq!(state.get().connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn address_for_other_interface_is_ignored() {
        let state = StateManager::new();
        state.update(|st| st.interface_name = "wlan0".into());

        apply_address_update(&state, "enp3s0", "10.0.0.9".parse().unwrap(), false, false);
        assert!(state.get().ip_address.is_empty());
    }

    #[test]
    fn non_usb_link_claims_active_interface_when_unset() {
        let state = StateManager::new();
        let event = LinkEvent {
            name: "wlan0".into(),
            index: 3,
            up: true,
            carrier: true,
            mac: None,
        };

        apply_link_update(&state, &event, false, ConnectionType::Wifi);

        let st = state.get();
        assert_eq!(st.interface_name, "wlan0");
        assert_eq!(st.connection_type, ConnectionType::Wifi);
    }

    #[test]
    fn non_usb_link_does_not_steal_active_interface() {
        let state = StateManager::new();
        state.update(|st| st.interface_name = "wlan0".into());
        let event = LinkEvent {
            name: "enp3s0".into(),
            index: 4,
            up: true,
            carrier: true,
            mac: None,
        };

        apply_link_update(&state, &event, false, ConnectionType::Ethernet);
        assert_eq!(state.get().interface_name, "wlan0");
    }

    #[test]
    fn parse_link_extracts_attributes() {
        let mut message = LinkMessage::default();
        message.header.index = 5;
        message.attributes.push(LinkAttribute::IfName("wlan0".into()));
        message.attributes.push(LinkAttribute::OperState(LinkState::Up));
        message.attributes.push(LinkAttribute::Carrier(1));
        message
            .attributes
            .push(LinkAttribute::Address(vec![0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]));

        let event = parse_link(&message).unwrap();
        assert_eq!(event.name, "wlan0");
        assert_eq!(event.index, 5);
        assert!(event.up);
        assert!(event.carrier);
        assert_eq!(event.mac.as_deref(), Some("00:1a:7d:da:71:13"));
    }

    #[test]
    fn parse_link_without_name_is_dropped() {
        let mut message = LinkMessage::default();
        message.header.index = 5;
        assert_eq!(parse_link(&message), None);
    }

    #[test]
    fn format_mac_renders_colon_separated() {
        assert_eq!(format_mac(&[0xaa, 0xbb, 0x01]), "aa:bb:01");
    }
}
