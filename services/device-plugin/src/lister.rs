//! Resource discovery.
//!
//! Resources come from one of two places, chosen per configuration snapshot:
//!
//! - Static configuration: the configured names are emitted once.
//! - Link scan (no configuration): every suitable macvtap parent on the host
//!   becomes a resource named after it. The list is re-emitted whenever a
//!   relevant link changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use macvtap_link::{
    LinkEventHandler, LinkEventSource, LinkManager, LinkObserver, LinkPredicate, MacvtapMode,
    ObserverConfig,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{parse_resource_config, ConfigEvent, ResourceConfig, DEFAULT_CAPACITY};
use crate::error::DiscoveryError;
use crate::plugin::MacvtapDevicePlugin;

/// Namespace every advertised resource name lives under.
pub const RESOURCE_NAMESPACE: &str = "macvtap.network.kubevirt.io";

/// Everything a device plugin needs to know about its resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub lower_device: String,
    pub mode: MacvtapMode,
    pub capacity: u32,
    /// Namespace the lower device lives in.
    pub netns_path: PathBuf,
}

/// How a discovery cycle ended.
enum CycleEnd {
    /// Names emitted; wait for the next configuration snapshot.
    Done,
    /// Nobody is listening for names any more.
    ConsumerClosed,
}

/// Re-scans the host's links on every observer callback.
struct Rescan {
    links: Arc<dyn LinkManager>,
    relay: mpsc::Sender<Vec<String>>,
}

#[async_trait]
impl LinkEventHandler for Rescan {
    async fn on_link_event(&mut self) {
        match self.links.suitable_parents().await {
            Ok(names) => {
                debug!(?names, "Rescanned links");
                // Only fails once discovery has moved on.
                let _ = self.relay.send(names).await;
            }
            Err(e) => warn!(error = %e, "Failed to rescan links"),
        }
    }
}

/// Discovers macvtap resources and builds their device plugins.
pub struct MacvtapLister {
    links: Arc<dyn LinkManager>,
    events: Arc<dyn LinkEventSource>,
    netns_path: PathBuf,
    observer_config: ObserverConfig,
    resources: RwLock<HashMap<String, ResourceConfig>>,
}

impl MacvtapLister {
    pub fn new(
        links: Arc<dyn LinkManager>,
        events: Arc<dyn LinkEventSource>,
        netns_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            links,
            events,
            netns_path: netns_path.into(),
            observer_config: ObserverConfig::default(),
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_observer_config(mut self, config: ObserverConfig) -> Self {
        self.observer_config = config;
        self
    }

    pub fn resource_namespace(&self) -> &'static str {
        RESOURCE_NAMESPACE
    }

    /// Emit resource name lists to `names` as configuration arrives on
    /// `configs`.
    ///
    /// Each `Updated` snapshot restarts discovery. `Removed` clears the
    /// configuration and emits an empty list. Returns `Ok` once `names` is
    /// closed; a closed `configs` channel is an error.
    pub async fn discover(
        &self,
        mut configs: mpsc::Receiver<ConfigEvent>,
        names: mpsc::Sender<Vec<String>>,
    ) -> Result<(), DiscoveryError> {
        let mut pending = configs.recv().await;

        loop {
            match pending.take() {
                None => return Err(DiscoveryError::ConfigSourceClosed),
                Some(ConfigEvent::Removed) => {
                    info!("Resource configuration removed");
                    self.store(Vec::new());
                    if names.send(Vec::new()).await.is_err() {
                        return Ok(());
                    }
                    pending = configs.recv().await;
                }
                Some(ConfigEvent::Updated(raw)) => {
                    tokio::select! {
                        end = self.run_cycle(&raw, &names) => match end? {
                            CycleEnd::ConsumerClosed => return Ok(()),
                            CycleEnd::Done => pending = configs.recv().await,
                        },
                        event = configs.recv() => {
                            debug!("Configuration changed, restarting discovery");
                            pending = event;
                        }
                    }
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        raw: &str,
        names: &mpsc::Sender<Vec<String>>,
    ) -> Result<CycleEnd, DiscoveryError> {
        let configs = if raw.trim().is_empty() {
            Vec::new()
        } else {
            parse_resource_config(raw)?
        };

        if configs.is_empty() {
            self.store(Vec::new());
            return self.scan_links(names).await;
        }

        let mut list: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        list.sort();
        list.dedup();
        self.store(configs);

        info!(resources = ?list, "Using configured resources");
        match names.send(list).await {
            Ok(()) => Ok(CycleEnd::Done),
            Err(_) => Ok(CycleEnd::ConsumerClosed),
        }
    }

    async fn scan_links(
        &self,
        names: &mpsc::Sender<Vec<String>>,
    ) -> Result<CycleEnd, DiscoveryError> {
        let (relay_tx, mut relay_rx) = mpsc::channel(1);

        let initial = self
            .links
            .suitable_parents()
            .await
            .map_err(DiscoveryError::Scan)?;
        info!(resources = ?initial, "Discovered macvtap parents");
        if relay_tx.send(initial).await.is_err() {
            return Ok(CycleEnd::ConsumerClosed);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let observer = LinkObserver::new(self.events.clone(), LinkPredicate::SuitableMacvtapParent)
            .with_config(self.observer_config.clone());
        let mut handler = Rescan {
            links: self.links.clone(),
            relay: relay_tx,
        };
        let observe = observer.run(&mut handler, stop_rx);
        tokio::pin!(observe);

        let end = loop {
            tokio::select! {
                Some(list) = relay_rx.recv() => {
                    if names.send(list).await.is_err() {
                        break CycleEnd::ConsumerClosed;
                    }
                }
                _ = names.closed() => break CycleEnd::ConsumerClosed,
                _ = &mut observe => break CycleEnd::Done,
            }
        };

        stop_tx.send_replace(true);
        Ok(end)
    }

    fn store(&self, configs: Vec<ResourceConfig>) {
        let map = configs.into_iter().map(|c| (c.name.clone(), c)).collect();
        *self.resources.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    /// Configured descriptor for `name`, or the link-scan default: the
    /// resource is named after its lower device, in bridge mode.
    pub fn resolve_descriptor(&self, name: &str) -> ResourceDescriptor {
        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        match resources.get(name) {
            Some(config) => ResourceDescriptor {
                name: config.name.clone(),
                lower_device: config.lower_device.clone(),
                mode: config.mode,
                capacity: config.capacity,
                netns_path: self.netns_path.clone(),
            },
            None => ResourceDescriptor {
                name: name.to_string(),
                lower_device: name.to_string(),
                mode: MacvtapMode::Bridge,
                capacity: DEFAULT_CAPACITY,
                netns_path: self.netns_path.clone(),
            },
        }
    }

    pub fn new_plugin(&self, name: &str) -> MacvtapDevicePlugin {
        MacvtapDevicePlugin::new(
            self.resolve_descriptor(name),
            self.links.clone(),
            self.events.clone(),
        )
        .with_observer_config(self.observer_config.clone())
    }
}
