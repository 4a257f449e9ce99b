//! Privileged helper invocations.
//!
//! Everything that needs root goes through `sudo` here: radio kill
//! switches, interface bring-up, DHCP, and supplicant profile writes.
//! Failures are surfaced as [`NetworkError::Helper`] so callers can log
//! them and raise an `Error` bus signal without tearing anything down.

use std::process::Stdio;

use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::models::NetworkError;
use crate::Result;

async fn run_sudo(operation: &str, args: &[&str]) -> Result<()> {
    let status = Command::new("sudo")
        .args(args)
        .status()
        .await
        .map_err(|e| NetworkError::helper(operation, e))?;
    if !status.success() {
        return Err(NetworkError::helper(operation, format!("{status}")));
    }
    Ok(())
}

/// Blocks or unblocks all radios; the airplane-mode backend.
pub async fn set_rfkill(block: bool) -> Result<()> {
    let action = if block { "block" } else { "unblock" };
    run_sudo("rfkill", &["rfkill", action, "all"]).await
}

/// Brings a network interface up.
pub async fn bring_up_interface(name: &str) -> Result<()> {
    run_sudo("ip link", &["ip", "link", "set", name, "up"]).await
}

/// Runs IPv4 DHCP on an interface. `wait` blocks until a lease is bound;
/// otherwise dhcpcd daemonizes quietly and the address watcher picks the
/// lease up from the kernel.
pub async fn run_dhcp(name: &str, wait: bool) -> Result<()> {
    let mode = if wait { "-w" } else { "-q" };
    run_sudo("dhcpcd", &["dhcpcd", "-4", mode, name]).await
}

/// Releases the DHCP lease on an interface. The interface may already be
/// gone; that is not an error worth surfacing.
pub async fn release_dhcp(name: &str) {
    if let Err(e) = run_sudo("dhcpcd", &["dhcpcd", "-k", name]).await {
        debug!("DHCP release on {name}: {e}");
    }
}

/// Seeds a supplicant profile with a passphrase.
///
/// The store only accepts mode 600 files, and writing under /var/lib
/// needs root, hence tee + chmod rather than direct file I/O.
pub async fn write_supplicant_profile(ssid: &str, password: &str, security: &str) -> Result<()> {
    let path = format!("/var/lib/iwd/{ssid}.{security}");

    let mut child = Command::new("sudo")
        .args(["tee", &path])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .map_err(|e| NetworkError::helper("profile write", e))?;

    if let Some(mut stdin) = child.stdin.take() {
        let contents = format!("[Security]\nPassphrase={password}\n");
        stdin
            .write_all(contents.as_bytes())
            .await
            .map_err(|e| NetworkError::helper("profile write", e))?;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| NetworkError::helper("profile write", e))?;
    if !status.success() {
        return Err(NetworkError::helper("profile write", format!("{status}")));
    }

    if let Err(e) = run_sudo("chmod", &["chmod", "600", &path]).await {
        warn!("profile permissions on {path}: {e}");
    }

    debug!("wrote supplicant profile for {ssid}");
    Ok(())
}

/// Opens a URL with whichever desktop opener is installed. Detached; the
/// browser outlives us.
pub fn open_url(url: &str) {
    for opener in ["xdg-open", "gio", "gnome-open", "kde-open"] {
        match Command::new(opener).arg(url).spawn() {
            Ok(_) => return,
            Err(_) => continue,
        }
    }
    warn!("no URL opener found for {url}");
}
