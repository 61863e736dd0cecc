//! Running device plugins, keyed by resource name.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use macvtap_proto::deviceplugin::v1beta1::ListAndWatchResponse;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::PluginError;
use crate::lister::{MacvtapLister, RESOURCE_NAMESPACE};
use crate::plugin::{AdvertisementState, DeviceListSink, MacvtapDevicePlugin};

/// Sink that records advertisements in the log.
#[derive(Debug, Clone)]
pub struct LoggingSink {
    resource: String,
}

impl LoggingSink {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

#[async_trait]
impl DeviceListSink for LoggingSink {
    async fn send_list(&mut self, response: ListAndWatchResponse) -> Result<(), PluginError> {
        info!(
            resource = %format!("{RESOURCE_NAMESPACE}/{}", self.resource),
            devices = response.devices.len(),
            "Advertising devices"
        );
        Ok(())
    }
}

struct Running {
    plugin: Arc<MacvtapDevicePlugin>,
    task: JoinHandle<AdvertisementState>,
}

/// Keeps one ListAndWatch running per discovered resource.
pub struct PluginRegistry {
    lister: Arc<MacvtapLister>,
    running: HashMap<String, Running>,
}

impl PluginRegistry {
    pub fn new(lister: Arc<MacvtapLister>) -> Self {
        Self {
            lister,
            running: HashMap::new(),
        }
    }

    /// Names with a running plugin, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<MacvtapDevicePlugin>> {
        self.running.get(name).map(|r| r.plugin.clone())
    }

    /// Start plugins for new names and stop those no longer listed.
    pub async fn apply(&mut self, names: &[String]) {
        let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();

        let gone: Vec<String> = self
            .running
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            if let Some(running) = self.running.remove(&name) {
                stop(&name, running).await;
            }
        }

        for name in wanted {
            if self.running.contains_key(name) {
                continue;
            }
            let plugin = Arc::new(self.lister.new_plugin(name));
            let sink = LoggingSink::new(name);
            let task = {
                let plugin = plugin.clone();
                tokio::spawn(async move { plugin.list_and_watch(sink).await })
            };
            info!(resource = %name, "Started device plugin");
            self.running
                .insert(name.to_string(), Running { plugin, task });
        }
    }

    /// Stop every running plugin.
    pub async fn shutdown(&mut self) {
        for (name, running) in self.running.drain() {
            stop(&name, running).await;
        }
    }
}

async fn stop(name: &str, running: Running) {
    running.plugin.stop();
    match running.task.await {
        Ok(state) => info!(
            resource = %name,
            lower_device_exists = state.lower_device_exists,
            "Stopped device plugin"
        ),
        Err(e) => warn!(resource = %name, error = %e, "Device plugin task failed"),
    }
}
