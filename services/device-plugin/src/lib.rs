//! Macvtap device plugin.
//!
//! Discovers macvtap resources (from static configuration or by scanning the
//! host's links) and advertises `<resource>Mvp<n>` devices for each of them
//! while the resource's lower device exists.

pub mod config;
pub mod error;
pub mod lister;
pub mod plugin;
pub mod registry;
pub mod shutdown;

pub use config::{parse_resource_config, Config, ConfigEvent, ResourceConfig};
pub use error::{DiscoveryError, PluginError};
pub use lister::{MacvtapLister, ResourceDescriptor, RESOURCE_NAMESPACE};
pub use plugin::{AdvertisementState, ConsumerGone, DeviceListSink, MacvtapDevicePlugin};
pub use registry::{LoggingSink, PluginRegistry};
pub use shutdown::ShutdownSignals;
