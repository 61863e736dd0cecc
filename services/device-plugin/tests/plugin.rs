use std::sync::Arc;
use std::time::Duration;

use macvtap_device_plugin::{MacvtapDevicePlugin, PluginError, ResourceDescriptor};
use macvtap_link::{LinkError, LinkInfo, MacvtapMode, ObserverConfig};
use macvtap_proto::deviceplugin::v1beta1::{
    AllocateRequest, ContainerAllocateRequest, ListAndWatchResponse,
};
use macvtap_testing::{FakeLinkEvents, FakeLinks};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

fn descriptor(name: &str, lower: &str, capacity: u32) -> ResourceDescriptor {
    ResourceDescriptor {
        name: name.into(),
        lower_device: lower.into(),
        mode: MacvtapMode::Bridge,
        capacity,
        netns_path: "/proc/1/ns/net".into(),
    }
}

fn plugin(links: &FakeLinks, events: &FakeLinkEvents, capacity: u32) -> Arc<MacvtapDevicePlugin> {
    Arc::new(
        MacvtapDevicePlugin::new(
            descriptor("dataplane", "eth0", capacity),
            Arc::new(links.clone()),
            Arc::new(events.clone()),
        )
        .with_observer_config(ObserverConfig {
            resubscribe_interval: Duration::from_secs(10),
        }),
    )
}

fn allocate_request(ids: &[&str]) -> AllocateRequest {
    AllocateRequest {
        container_requests: vec![ContainerAllocateRequest {
            devices_ids: ids.iter().map(|id| id.to_string()).collect(),
        }],
    }
}

async fn next_list(rx: &mut mpsc::Receiver<ListAndWatchResponse>) -> ListAndWatchResponse {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for device list")
        .expect("advertiser ended")
}

/// Give the advertiser time to process anything already published.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn advertises_only_on_existence_flip() {
    let events = FakeLinkEvents::new();
    let links = FakeLinks::with_events(events.clone());
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 3);

    let (tx, mut rx) = mpsc::channel(8);
    let task = tokio::spawn({
        let plugin = plugin.clone();
        async move { plugin.list_and_watch(tx).await }
    });

    let list = next_list(&mut rx).await;
    let ids: Vec<&str> = list.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["dataplaneMvp0", "dataplaneMvp1", "dataplaneMvp2"]);
    assert!(list.devices.iter().all(|d| d.health == "Healthy"));

    // Spurious callbacks while the device still exists send nothing.
    events.publish(LinkInfo::device(2, "eth0"));
    events.publish(LinkInfo::device(2, "eth0"));
    events.disconnect_all();
    events.wait_for_subscriptions(2).await;
    settle().await;
    assert!(rx.try_recv().is_err());

    links.remove("eth0");
    assert!(next_list(&mut rx).await.devices.is_empty());

    links.add_device("eth0");
    assert_eq!(next_list(&mut rx).await.devices.len(), 3);

    plugin.stop();
    let state = task.await.unwrap();
    assert!(state.lower_device_exists);
    assert_eq!(state.advertised.len(), 3);
}

#[tokio::test]
async fn nothing_is_sent_while_lower_device_is_missing() {
    let events = FakeLinkEvents::new();
    let links = FakeLinks::with_events(events.clone());
    let plugin = plugin(&links, &events, 2);

    let (tx, mut rx) = mpsc::channel(8);
    let task = tokio::spawn({
        let plugin = plugin.clone();
        async move { plugin.list_and_watch(tx).await }
    });

    events.wait_for_subscriptions(1).await;
    links.add_device("eth1");
    settle().await;
    assert!(rx.try_recv().is_err());

    links.add_device("eth0");
    assert_eq!(next_list(&mut rx).await.devices.len(), 2);

    plugin.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn closed_consumer_ends_list_and_watch() {
    let events = FakeLinkEvents::new();
    let links = FakeLinks::with_events(events.clone());
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 1);

    let (tx, mut rx) = mpsc::channel::<ListAndWatchResponse>(1);
    let task = tokio::spawn({
        let plugin = plugin.clone();
        async move { plugin.list_and_watch(tx).await }
    });

    assert_eq!(next_list(&mut rx).await.devices.len(), 1);
    drop(rx);

    let state = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("ListAndWatch kept running without a consumer")
        .unwrap();
    assert!(state.lower_device_exists);
    assert_eq!(events.active_feeds(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_streams_release_their_subscriptions() {
    let events = FakeLinkEvents::new();
    let links = FakeLinks::with_events(events.clone());
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 2);

    for _ in 0..3 {
        let mut stream = plugin.list_and_watch_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.devices.len(), 2);
    }

    links.remove("eth0");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(events.active_feeds(), 0);

    // The plugin itself is still usable for the next consumer.
    links.add_device("eth0");
    let mut stream = plugin.list_and_watch_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.devices.len(), 2);
    assert_eq!(events.active_feeds(), 1);

    plugin.stop();
}

#[tokio::test]
async fn stream_yields_device_lists() {
    let events = FakeLinkEvents::new();
    let links = FakeLinks::with_events(events.clone());
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 2);

    let mut stream = plugin.list_and_watch_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.devices.len(), 2);

    plugin.stop();
}

#[tokio::test]
async fn allocate_recreates_leftover_interface() {
    let links = FakeLinks::new();
    let events = FakeLinkEvents::new();
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 10);

    // Left behind by an earlier allocation that never completed.
    let stale = links.add_device("dataplaneMvp5");

    let response = plugin
        .allocate(allocate_request(&["dataplaneMvp5"]))
        .await
        .unwrap();

    let link = links.get("dataplaneMvp5").unwrap();
    assert_ne!(link.info.index, stale);
    assert_eq!(link.lower.as_deref(), Some("eth0"));
    assert_eq!(link.mode, Some(MacvtapMode::Bridge));

    let spec = &response.container_responses[0].devices[0];
    let path = format!("/dev/tap{}", link.info.index);
    assert_eq!(spec.host_path, path);
    assert_eq!(spec.container_path, path);
    assert_eq!(spec.permissions, "rw");
}

#[tokio::test]
async fn allocate_is_repeatable() {
    let links = FakeLinks::new();
    let events = FakeLinkEvents::new();
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 10);

    plugin.allocate(allocate_request(&["dataplaneMvp0"])).await.unwrap();
    plugin.allocate(allocate_request(&["dataplaneMvp0"])).await.unwrap();

    let macvtaps: Vec<String> = links
        .names()
        .into_iter()
        .filter(|n| n.starts_with("dataplaneMvp"))
        .collect();
    assert_eq!(macvtaps, vec!["dataplaneMvp0"]);
}

#[tokio::test]
async fn allocate_serves_every_container() {
    let links = FakeLinks::new();
    let events = FakeLinkEvents::new();
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 10);

    let request = AllocateRequest {
        container_requests: vec![
            ContainerAllocateRequest {
                devices_ids: vec!["dataplaneMvp0".into(), "dataplaneMvp1".into()],
            },
            ContainerAllocateRequest {
                devices_ids: vec!["dataplaneMvp2".into()],
            },
        ],
    };
    let response = plugin.allocate(request).await.unwrap();

    assert_eq!(response.container_responses.len(), 2);
    assert_eq!(response.container_responses[0].devices.len(), 2);
    assert_eq!(response.container_responses[1].devices.len(), 1);
}

#[tokio::test]
async fn allocation_failure_aborts_request() {
    let links = FakeLinks::new();
    let events = FakeLinkEvents::new();
    links.add_device("eth0");
    let plugin = plugin(&links, &events, 10);

    plugin.allocate(allocate_request(&["dataplaneMvp0"])).await.unwrap();
    links.fail_next_create("no memory");

    let err = plugin
        .allocate(allocate_request(&["dataplaneMvp1", "dataplaneMvp2"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Allocation { ref device, .. } if device == "dataplaneMvp1"));
    assert!(links.get("dataplaneMvp2").is_none());
}

#[tokio::test]
async fn allocation_without_lower_device_is_a_precondition_failure() {
    let links = FakeLinks::new();
    let events = FakeLinkEvents::new();
    let plugin = plugin(&links, &events, 10);

    let err = plugin
        .allocate(allocate_request(&["dataplaneMvp0"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PluginError::Allocation {
            source: LinkError::LowerDeviceNotFound(_),
            ..
        }
    ));
    let status: tonic::Status = err.into();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}
