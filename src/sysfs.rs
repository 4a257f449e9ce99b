//! sysfs access: interface classification and byte counters.
//!
//! The kernel's `/sys/class/net` tree is the source of truth for what an
//! interface physically is: a `device/subsystem` symlink ending in `/usb`
//! marks USB, a `wireless` directory marks Wi-Fi, a bare `device` entry
//! marks other physical (ethernet) hardware, anything else is virtual.
//! Everything here takes the class directory as a parameter so tests can
//! point it at a fixture tree.

use std::fs;
use std::path::Path;

use crate::models::ConnectionType;

/// The real sysfs network class directory.
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// Whether the interface sits on the USB bus.
pub fn is_usb_interface(root: &Path, name: &str) -> bool {
    let subsystem = root.join(name).join("device/subsystem");
    match fs::read_link(subsystem) {
        Ok(target) => target.to_string_lossy().ends_with("/usb"),
        Err(_) => false,
    }
}

/// Whether the kernel exposes a wireless directory for the interface.
pub fn is_wifi_interface(root: &Path, name: &str) -> bool {
    root.join(name).join("wireless").exists()
}

/// Whether the interface is backed by a physical device at all.
pub fn is_physical_interface(root: &Path, name: &str) -> bool {
    root.join(name).join("device").exists()
}

/// Classifies an interface by its sysfs footprint. USB wins over Wi-Fi:
/// a USB Wi-Fi dongle is tracked as the tethering candidate it is.
pub fn classify_interface(root: &Path, name: &str) -> ConnectionType {
    if is_usb_interface(root, name) {
        ConnectionType::Usb
    } else if is_wifi_interface(root, name) {
        ConnectionType::Wifi
    } else if is_physical_interface(root, name) {
        ConnectionType::Ethernet
    } else {
        ConnectionType::Unknown
    }
}

/// Reads the rx/tx byte counters for an interface. Missing or malformed
/// counters read as zero.
pub fn read_stats(root: &Path, name: &str) -> (u64, u64) {
    let base = root.join(name).join("statistics");
    (
        read_u64(&base.join("rx_bytes")),
        read_u64(&base.join("tx_bytes")),
    )
}

fn read_u64(path: &Path) -> u64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Finds an interface worth sampling: the first non-loopback one whose
/// operstate is "up", with wireless names (`wl` prefix) taking priority.
pub fn find_active_interface(root: &Path) -> Option<String> {
    let entries = fs::read_dir(root).ok()?;

    let mut first_up = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }

        let operstate = fs::read_to_string(root.join(&name).join("operstate")).unwrap_or_default();
        if operstate.trim() != "up" {
            continue;
        }

        if name.starts_with("wl") {
            return Some(name);
        }
        if first_up.is_none() {
            first_up = Some(name);
        }
    }

    first_up
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// A throwaway /sys/class/net lookalike under the system temp dir.
    struct FixtureTree {
        root: PathBuf,
    }

    impl FixtureTree {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "xnetd-sysfs-{tag}-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        fn add_iface(&self, name: &str) -> PathBuf {
            let dir = self.root.join(name);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn set_operstate(&self, name: &str, value: &str) {
            fs::write(self.root.join(name).join("operstate"), value).unwrap();
        }
    }

    impl Drop for FixtureTree {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn classify_wifi_interface() {
        let tree = FixtureTree::new("wifi");
        let dir = tree.add_iface("wlan0");
        fs::create_dir_all(dir.join("wireless")).unwrap();
        fs::create_dir_all(dir.join("device")).unwrap();

        assert_eq!(
            classify_interface(&tree.root, "wlan0"),
            ConnectionType::Wifi
        );
    }

    #[test]
    fn classify_usb_interface() {
        let tree = FixtureTree::new("usb");
        let dir = tree.add_iface("enp0s26u1u2");
        fs::create_dir_all(dir.join("device")).unwrap();
        // Point device/subsystem at a directory whose path ends in /usb.
        let bus = tree.root.join("bus").join("usb");
        fs::create_dir_all(&bus).unwrap();
        std::os::unix::fs::symlink(&bus, dir.join("device/subsystem")).unwrap();

        assert!(is_usb_interface(&tree.root, "enp0s26u1u2"));
        assert_eq!(
            classify_interface(&tree.root, "enp0s26u1u2"),
            ConnectionType::Usb
        );
    }

    #[test]
    fn classify_ethernet_interface() {
        let tree = FixtureTree::new("eth");
        let dir = tree.add_iface("enp3s0");
        fs::create_dir_all(dir.join("device")).unwrap();

        assert_eq!(
            classify_interface(&tree.root, "enp3s0"),
            ConnectionType::Ethernet
        );
    }

    #[test]
    fn classify_virtual_interface() {
        let tree = FixtureTree::new("virt");
        tree.add_iface("veth0");

        assert_eq!(
            classify_interface(&tree.root, "veth0"),
            ConnectionType::Unknown
        );
    }

    #[test]
    fn classify_missing_interface() {
        let tree = FixtureTree::new("missing");
        assert_eq!(
            classify_interface(&tree.root, "nope0"),
            ConnectionType::Unknown
        );
    }

    #[test]
    fn read_stats_parses_counters() {
        let tree = FixtureTree::new("stats");
        let dir = tree.add_iface("wlan0");
        fs::create_dir_all(dir.join("statistics")).unwrap();
        fs::write(dir.join("statistics/rx_bytes"), "12345\n").unwrap();
        fs::write(dir.join("statistics/tx_bytes"), "678\n").unwrap();

        assert_eq!(read_stats(&tree.root, "wlan0"), (12345, 678));
    }

    #[test]
    fn read_stats_tolerates_missing_files() {
        let tree = FixtureTree::new("nostats");
        tree.add_iface("wlan0");

        assert_eq!(read_stats(&tree.root, "wlan0"), (0, 0));
    }

    #[test]
    fn find_active_prefers_wireless_names() {
        let tree = FixtureTree::new("active");
        tree.add_iface("enp3s0");
        tree.set_operstate("enp3s0", "up\n");
        tree.add_iface("wlan0");
        tree.set_operstate("wlan0", "up\n");
        tree.add_iface("lo");
        tree.set_operstate("lo", "up\n");

        assert_eq!(find_active_interface(&tree.root).as_deref(), Some("wlan0"));
    }

    #[test]
    fn find_active_skips_down_and_loopback() {
        let tree = FixtureTree::new("down");
        tree.add_iface("lo");
        tree.set_operstate("lo", "up\n");
        tree.add_iface("wlan0");
        tree.set_operstate("wlan0", "down\n");
        tree.add_iface("enp3s0");
        tree.set_operstate("enp3s0", "up\n");

        assert_eq!(
            find_active_interface(&tree.root).as_deref(),
            Some("enp3s0")
        );
    }

    #[test]
    fn find_active_none_when_everything_down() {
        let tree = FixtureTree::new("alldown");
        tree.add_iface("wlan0");
        tree.set_operstate("wlan0", "down\n");

        assert_eq!(find_active_interface(&tree.root), None);
    }
}
