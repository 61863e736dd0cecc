//! In-memory link table and notification feed.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use macvtap_link::{
    LinkError, LinkEventSource, LinkInfo, LinkKind, LinkManager, LinkUpdates, MacAddr,
    MacvtapMode,
};
use tokio::sync::mpsc;
use tracing::debug;

/// A link in the fake table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub info: LinkInfo,
    /// Lower device, for macvtap links.
    pub lower: Option<String>,
    pub mode: Option<MacvtapMode>,
}

#[derive(Debug)]
struct Table {
    links: BTreeMap<String, FakeLink>,
    next_index: u32,
    fail_next_create: Option<String>,
}

/// In-memory stand-in for one namespace's links.
///
/// Starts with `lo` at index 1. Indexes are never reused, so re-creating a
/// link always yields a new index. When built with [`FakeLinks::with_events`]
/// every change is published to the event source, like the kernel does.
#[derive(Debug, Clone)]
pub struct FakeLinks {
    table: Arc<Mutex<Table>>,
    events: Option<FakeLinkEvents>,
}

impl Default for FakeLinks {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLinks {
    pub fn new() -> Self {
        let mut lo = LinkInfo::device(1, "lo");
        lo.loopback = true;
        let mut links = BTreeMap::new();
        links.insert(
            "lo".to_string(),
            FakeLink {
                info: lo,
                lower: None,
                mode: None,
            },
        );
        Self {
            table: Arc::new(Mutex::new(Table {
                links,
                next_index: 2,
                fail_next_create: None,
            })),
            events: None,
        }
    }

    pub fn with_events(events: FakeLinkEvents) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, info: &LinkInfo) {
        if let Some(events) = &self.events {
            events.publish(info.clone());
        }
    }

    fn insert(&self, name: &str, kind: LinkKind) -> u32 {
        let info = {
            let mut table = self.table();
            let index = table.next_index;
            table.next_index += 1;
            let mut info = LinkInfo::device(index, name).with_kind(kind);
            info.mac = Some(MacAddr([0x02, 0, 0, 0, (index >> 8) as u8, index as u8]));
            info.tx_queue_len = Some(1000);
            table.links.insert(
                name.to_string(),
                FakeLink {
                    info: info.clone(),
                    lower: None,
                    mode: None,
                },
            );
            info
        };
        self.publish(&info);
        info.index
    }

    /// Add a plain device. Returns its index.
    pub fn add_device(&self, name: &str) -> u32 {
        self.insert(name, LinkKind::Device)
    }

    pub fn add_bond(&self, name: &str) -> u32 {
        self.insert(name, LinkKind::Bond)
    }

    pub fn add_bridge(&self, name: &str) -> u32 {
        self.insert(name, LinkKind::Bridge)
    }

    /// Enslave `name` to `controller`. Panics if either is missing.
    pub fn enslave(&self, name: &str, controller: &str) {
        let info = {
            let mut table = self.table();
            let controller_index = table.links[controller].info.index;
            let link = table
                .links
                .get_mut(name)
                .unwrap_or_else(|| panic!("no link named {name}"));
            link.info.controller = Some(controller_index);
            link.info.clone()
        };
        self.publish(&info);
    }

    /// Remove a link, if present.
    pub fn remove(&self, name: &str) -> Option<FakeLink> {
        let removed = self.table().links.remove(name);
        if let Some(link) = &removed {
            self.publish(&link.info);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<FakeLink> {
        self.table().links.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.table().links.keys().cloned().collect()
    }

    /// Make the next `create` fail with the given reason.
    pub fn fail_next_create(&self, reason: &str) {
        self.table().fail_next_create = Some(reason.to_string());
    }
}

#[async_trait]
impl LinkManager for FakeLinks {
    async fn create(&self, name: &str, lower: &str, mode: MacvtapMode) -> Result<u32, LinkError> {
        let info = {
            let mut table = self.table();
            if let Some(reason) = table.fail_next_create.take() {
                return Err(LinkError::Io(io::Error::other(reason)));
            }
            let parent = table
                .links
                .get(lower)
                .ok_or_else(|| LinkError::LowerDeviceNotFound(lower.to_string()))?;
            if parent.info.loopback {
                return Err(LinkError::UnsuitableLowerDevice(lower.to_string()));
            }
            if table.links.contains_key(name) {
                return Err(LinkError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("link {name:?} exists"),
                )));
            }
            let tx_queue_len = parent.info.tx_queue_len;

            let index = table.next_index;
            table.next_index += 1;
            let mut info = LinkInfo::device(index, name).with_kind(LinkKind::Macvtap);
            info.mac = Some(MacAddr([0x02, 0xfe, 0, 0, (index >> 8) as u8, index as u8]));
            info.tx_queue_len = tx_queue_len;
            table.links.insert(
                name.to_string(),
                FakeLink {
                    info: info.clone(),
                    lower: Some(lower.to_string()),
                    mode: Some(mode),
                },
            );
            info
        };
        debug!(link = %name, lower = %lower, index = info.index, "[FAKE] Created macvtap");
        self.publish(&info);
        Ok(info.index)
    }

    async fn delete(&self, name: &str) -> Result<(), LinkError> {
        self.remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, LinkError> {
        Ok(self.table().links.contains_key(name))
    }

    async fn suitable_parents(&self) -> Result<Vec<String>, LinkError> {
        Ok(self
            .table()
            .links
            .values()
            .filter(|l| l.info.is_suitable_macvtap_parent())
            .map(|l| l.info.name.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
struct Feeds {
    subscribers: Vec<mpsc::UnboundedSender<LinkInfo>>,
    subscriptions: usize,
    failures_left: usize,
}

/// Link notification source driven by the test.
#[derive(Debug, Clone, Default)]
pub struct FakeLinkEvents {
    feeds: Arc<Mutex<Feeds>>,
}

impl FakeLinkEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn feeds(&self) -> MutexGuard<'_, Feeds> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a notification to every live feed.
    pub fn publish(&self, link: LinkInfo) {
        self.feeds()
            .subscribers
            .retain(|tx| tx.send(link.clone()).is_ok());
    }

    /// Close every live feed, as if the transport had failed.
    pub fn disconnect_all(&self) {
        self.feeds().subscribers.clear();
    }

    /// Make the next `n` subscription attempts fail.
    pub fn fail_next_subscriptions(&self, n: usize) {
        self.feeds().failures_left = n;
    }

    /// Number of successful subscriptions so far.
    pub fn subscription_count(&self) -> usize {
        self.feeds().subscriptions
    }

    pub fn active_feeds(&self) -> usize {
        let mut feeds = self.feeds();
        feeds.subscribers.retain(|tx| !tx.is_closed());
        feeds.subscribers.len()
    }

    /// Wait until at least `n` subscriptions have succeeded.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        while self.subscription_count() < n {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl LinkEventSource for FakeLinkEvents {
    async fn subscribe(&self) -> Result<LinkUpdates, LinkError> {
        let mut feeds = self.feeds();
        if feeds.failures_left > 0 {
            feeds.failures_left -= 1;
            return Err(LinkError::Subscription("injected failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        feeds.subscribers.push(tx);
        feeds.subscriptions += 1;
        Ok(LinkUpdates::from_channel(rx))
    }
}
