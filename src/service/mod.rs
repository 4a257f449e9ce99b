//! The D-Bus service facade and its thin collaborators.
//!
//! [`facade`] exports the `org.xshell.Network` object; [`helpers`] wraps
//! the privileged shell-outs it delegates to; [`portal`] probes for
//! captive portals.

pub mod facade;
pub(crate) mod helpers;
pub(crate) mod portal;

pub use facade::{serve, BusKind, NetworkEntry, NetworkService, OBJECT_PATH, SERVICE_NAME};
