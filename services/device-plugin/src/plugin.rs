//! Per-resource device plugin.
//!
//! A `MacvtapDevicePlugin` advertises `<name>Mvp0 .. <name>Mvp<capacity-1>`
//! while the resource's lower device exists and nothing while it does not.
//! Allocation creates the macvtap interface on demand and hands its tap
//! character device to the container.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use macvtap_link::observer::stopped;
use macvtap_link::{
    tap_device_path, LinkEventHandler, LinkEventSource, LinkManager, LinkObserver, LinkPredicate,
    ObserverConfig,
};
use macvtap_proto::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    DeviceSpec, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::lister::ResourceDescriptor;

/// Device IDs are `<resource name><suffix><index>`.
pub const DEVICE_SUFFIX: &str = "Mvp";

/// cgroup permissions granted on the tap device.
const TAP_PERMISSIONS: &str = "rw";

/// Resolves once a [`DeviceListSink`]'s consumer is gone.
pub type ConsumerGone = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Consumer of ListAndWatch device lists.
#[async_trait]
pub trait DeviceListSink: Send {
    async fn send_list(&mut self, response: ListAndWatchResponse) -> Result<(), PluginError>;

    /// Ends ListAndWatch when it resolves. The default never does.
    fn consumer_gone(&self) -> ConsumerGone {
        Box::pin(std::future::pending())
    }
}

#[async_trait]
impl DeviceListSink for mpsc::Sender<ListAndWatchResponse> {
    async fn send_list(&mut self, response: ListAndWatchResponse) -> Result<(), PluginError> {
        self.send(response)
            .await
            .map_err(|_| PluginError::StreamClosed)
    }

    fn consumer_gone(&self) -> ConsumerGone {
        let tx = self.clone();
        Box::pin(async move { tx.closed().await })
    }
}

#[async_trait]
impl DeviceListSink for mpsc::Sender<Result<ListAndWatchResponse, Status>> {
    async fn send_list(&mut self, response: ListAndWatchResponse) -> Result<(), PluginError> {
        self.send(Ok(response))
            .await
            .map_err(|_| PluginError::StreamClosed)
    }

    fn consumer_gone(&self) -> ConsumerGone {
        let tx = self.clone();
        Box::pin(async move { tx.closed().await })
    }
}

/// What is currently advertised for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementState {
    pub resource_name: String,
    pub lower_device_exists: bool,
    pub advertised: Vec<Device>,
}

/// Re-checks the lower device on every link event and advertises on change.
struct Advertiser<S> {
    links: Arc<dyn LinkManager>,
    lower_device: String,
    devices: Vec<Device>,
    state: AdvertisementState,
    sink: S,
}

#[async_trait]
impl<S: DeviceListSink> LinkEventHandler for Advertiser<S> {
    async fn on_link_event(&mut self) {
        let exists = match self.links.exists(&self.lower_device).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(
                    resource = %self.state.resource_name,
                    lower_device = %self.lower_device,
                    error = %e,
                    "Failed to check lower device"
                );
                return;
            }
        };

        if exists == self.state.lower_device_exists {
            return;
        }

        self.state.lower_device_exists = exists;
        self.state.advertised = if exists {
            self.devices.clone()
        } else {
            Vec::new()
        };

        info!(
            resource = %self.state.resource_name,
            lower_device = %self.lower_device,
            exists,
            devices = self.state.advertised.len(),
            "Lower device changed, advertising devices"
        );

        let response = ListAndWatchResponse {
            devices: self.state.advertised.clone(),
        };
        if let Err(e) = self.sink.send_list(response).await {
            warn!(resource = %self.state.resource_name, error = %e, "Failed to send device list");
        }
    }
}

/// Device plugin for one macvtap resource.
pub struct MacvtapDevicePlugin {
    descriptor: ResourceDescriptor,
    links: Arc<dyn LinkManager>,
    events: Arc<dyn LinkEventSource>,
    observer_config: ObserverConfig,
    stop: watch::Sender<bool>,
}

impl MacvtapDevicePlugin {
    pub fn new(
        descriptor: ResourceDescriptor,
        links: Arc<dyn LinkManager>,
        events: Arc<dyn LinkEventSource>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            descriptor,
            links,
            events,
            observer_config: ObserverConfig::default(),
            stop,
        }
    }

    pub fn with_observer_config(mut self, config: ObserverConfig) -> Self {
        self.observer_config = config;
        self
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn device_ids(&self) -> Vec<String> {
        (0..self.descriptor.capacity)
            .map(|i| format!("{}{DEVICE_SUFFIX}{i}", self.descriptor.name))
            .collect()
    }

    /// Full, healthy device list.
    pub fn devices(&self) -> Vec<Device> {
        self.device_ids().into_iter().map(Device::healthy).collect()
    }

    /// Advertise devices to `sink` until [`MacvtapDevicePlugin::stop`] or
    /// until the sink's consumer goes away.
    ///
    /// Nothing is sent until the lower device is first seen; afterwards a
    /// list is sent only when its existence flips.
    pub async fn list_and_watch<S: DeviceListSink>(&self, sink: S) -> AdvertisementState {
        let consumer_gone = sink.consumer_gone();
        let mut advertiser = Advertiser {
            links: self.links.clone(),
            lower_device: self.descriptor.lower_device.clone(),
            devices: self.devices(),
            state: AdvertisementState {
                resource_name: self.descriptor.name.clone(),
                lower_device_exists: false,
                advertised: Vec::new(),
            },
            sink,
        };

        info!(
            resource = %self.descriptor.name,
            lower_device = %self.descriptor.lower_device,
            capacity = self.descriptor.capacity,
            "Starting ListAndWatch"
        );

        let (run_stop, run_stop_rx) = watch::channel(false);
        let mut plugin_stop = self.stop.subscribe();
        let until_done = async {
            tokio::select! {
                _ = stopped(&mut plugin_stop) => {}
                _ = consumer_gone => {
                    info!(resource = %self.descriptor.name, "ListAndWatch consumer went away");
                }
            }
            run_stop.send_replace(true);
        };

        let observer = LinkObserver::new(
            self.events.clone(),
            LinkPredicate::Named(self.descriptor.lower_device.clone()),
        )
        .with_config(self.observer_config.clone());
        tokio::join!(observer.run(&mut advertiser, run_stop_rx), until_done);

        info!(resource = %self.descriptor.name, "ListAndWatch stopped");
        advertiser.state
    }

    /// ListAndWatch as a server stream, the shape a tonic service returns.
    pub fn list_and_watch_stream(
        self: &Arc<Self>,
    ) -> ReceiverStream<Result<ListAndWatchResponse, Status>> {
        let (tx, rx) = mpsc::channel(4);
        let plugin = Arc::clone(self);
        tokio::spawn(async move {
            plugin.list_and_watch(tx).await;
        });
        ReceiverStream::new(rx)
    }

    /// Create a fresh interface for every requested device.
    ///
    /// Any existing interface with the same name is deleted first. The first
    /// failure fails the whole request.
    pub async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, PluginError> {
        let mut response = AllocateResponse::default();

        for container in request.container_requests {
            let mut devices = Vec::with_capacity(container.devices_ids.len());
            for id in container.devices_ids {
                let index = self
                    .links
                    .recreate(&id, &self.descriptor.lower_device, self.descriptor.mode)
                    .await
                    .map_err(|source| PluginError::Allocation {
                        device: id.clone(),
                        source,
                    })?;

                let path = tap_device_path(index).to_string_lossy().into_owned();
                debug!(device = %id, index, path = %path, "Allocated macvtap device");
                devices.push(DeviceSpec {
                    container_path: path.clone(),
                    host_path: path,
                    permissions: TAP_PERMISSIONS.to_string(),
                });
            }
            response.container_responses.push(ContainerAllocateResponse {
                devices,
                ..Default::default()
            });
        }

        info!(
            resource = %self.descriptor.name,
            containers = response.container_responses.len(),
            "Allocation complete"
        );
        Ok(response)
    }

    pub fn get_device_plugin_options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    pub fn pre_start_container(&self, _request: PreStartContainerRequest) -> PreStartContainerResponse {
        PreStartContainerResponse {}
    }

    pub fn get_preferred_allocation(
        &self,
        _request: PreferredAllocationRequest,
    ) -> PreferredAllocationResponse {
        PreferredAllocationResponse::default()
    }

    /// Stop ListAndWatch.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}
