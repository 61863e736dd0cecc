//! Kernel link plumbing for macvtap interfaces.
//!
//! This library provides helpers for:
//! - Network namespace references and namespace-bound netlink sessions
//! - Classifying kernel links (loopback, bond, plain device, ...)
//! - Observing link change notifications with automatic resubscription
//! - Creating, re-creating, deleting and handing over macvtap interfaces
//! - Per-namespace sysctl writes
//!
//! Every kernel operation takes an explicit namespace; the calling thread is
//! never moved between namespaces.

pub mod error;
pub mod link;
pub mod macvtap;
pub mod netlink;
pub mod netns;
pub mod observer;
pub mod sysctl;

pub use error::LinkError;
pub use link::{LinkInfo, LinkKind, LinkPredicate, MacAddr};
pub use macvtap::{
    tap_device_path, InterfaceConfig, InterfaceResult, LinkManager, MacvtapManager, MacvtapMode,
};
pub use netlink::{NetlinkEventSource, NetlinkSession};
pub use netns::NetNs;
pub use observer::{LinkEventHandler, LinkEventSource, LinkObserver, LinkUpdates, ObserverConfig};
