//! Macvtap CNI plugin.
//!
//! Moves a macvtap interface allocated by the device plugin into a pod
//! sandbox, optionally delegating addressing to an IPAM plugin.

pub mod config;
pub mod error;
pub mod ipam;
pub mod logging;
pub mod plugin;
pub mod skel;
pub mod types;

pub use config::{EnvArgs, NetConf};
pub use error::{CniError, ErrorDocument};
pub use plugin::Provisioner;
pub use skel::{CmdArgs, Command};
pub use types::{CniResult, VersionInfo, CURRENT_VERSION, SUPPORTED_VERSIONS};
