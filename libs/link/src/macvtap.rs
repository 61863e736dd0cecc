//! Macvtap interface lifecycle.
//!
//! Interfaces are created in one namespace (the host, for the device plugin),
//! later handed over to a sandbox namespace and configured there. Hand-over is
//! all or nothing: if anything fails after the move, both the old and the new
//! name are deleted inside the sandbox, since nothing outside it can reach the
//! interface any more.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use futures::TryStreamExt;
use nix::unistd::{chown, Gid, Uid};
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage, MacVtapMode};
use rtnetlink::{Handle, LinkMacVtap, LinkUnspec};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::error::{is_no_such_device, LinkError};
use crate::link::{LinkInfo, MacAddr};
use crate::netns::NetNs;
use crate::sysctl;

/// Macvtap forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MacvtapMode {
    #[default]
    Bridge,
    Private,
    Vepa,
}

impl MacvtapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacvtapMode::Bridge => "bridge",
            MacvtapMode::Private => "private",
            MacvtapMode::Vepa => "vepa",
        }
    }
}

impl From<MacvtapMode> for MacVtapMode {
    fn from(mode: MacvtapMode) -> Self {
        match mode {
            MacvtapMode::Bridge => MacVtapMode::Bridge,
            MacvtapMode::Private => MacVtapMode::Private,
            MacvtapMode::Vepa => MacVtapMode::Vepa,
        }
    }
}

impl FromStr for MacvtapMode {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "bridge" => Ok(MacvtapMode::Bridge),
            "private" => Ok(MacvtapMode::Private),
            "vepa" => Ok(MacvtapMode::Vepa),
            other => Err(LinkError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for MacvtapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MacvtapMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MacvtapMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Character device backing a macvtap interface.
pub fn tap_device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/tap{index}"))
}

/// Attributes applied while handing an interface to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub mac: Option<MacAddr>,
    pub mtu: Option<u32>,
    pub promiscuous: bool,
    /// Owner of `/dev/tap<index>`.
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub proxy_arp: bool,
}

/// Interface as it ended up inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceResult {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub sandbox: PathBuf,
    pub index: u32,
}

/// Macvtap lifecycle operations within one namespace.
#[async_trait]
pub trait LinkManager: Send + Sync {
    /// Create `name` on top of `lower` and bring it up. Returns the new
    /// interface's index.
    async fn create(&self, name: &str, lower: &str, mode: MacvtapMode) -> Result<u32, LinkError>;

    /// Delete `name`. A missing interface is not an error.
    async fn delete(&self, name: &str) -> Result<(), LinkError>;

    async fn exists(&self, name: &str) -> Result<bool, LinkError>;

    /// Names of links that can parent a macvtap interface, sorted.
    async fn suitable_parents(&self) -> Result<Vec<String>, LinkError>;

    /// Delete whatever is called `name`, then create it afresh.
    ///
    /// A previous allocation may have left an interface of the same name
    /// behind, and there is no release callback to clean it up.
    async fn recreate(
        &self,
        name: &str,
        lower: &str,
        mode: MacvtapMode,
    ) -> Result<u32, LinkError> {
        self.delete(name).await?;
        self.create(name, lower, mode).await
    }
}

/// Kernel-backed [`LinkManager`].
#[derive(Debug, Clone)]
pub struct MacvtapManager {
    netns: NetNs,
}

impl MacvtapManager {
    pub fn new(netns: NetNs) -> Self {
        Self { netns }
    }

    pub fn open(netns_path: impl AsRef<Path>) -> Result<Self, LinkError> {
        Ok(Self::new(NetNs::open(netns_path)?))
    }

    pub fn netns(&self) -> &NetNs {
        &self.netns
    }

    /// Move `current` into `target`, configure it and rename it to `new`.
    pub async fn move_and_configure(
        &self,
        current: &str,
        new: &str,
        config: &InterfaceConfig,
        target: &NetNs,
    ) -> Result<InterfaceResult, LinkError> {
        let session = self.netns.connect(0).await?;
        let handle = session.handle();

        // Rollback after the move goes through this session.
        let target_session = target.connect(0).await?;
        let target_handle = target_session.handle();

        let link = lookup(handle, current)
            .await?
            .ok_or_else(|| LinkError::LinkNotFound(current.to_string()))?;

        let fd = target.as_fd().as_raw_fd();
        handle
            .link()
            .set(
                LinkUnspec::new_with_index(link.header.index)
                    .setns_by_fd(fd)
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| {
                LinkError::netlink(
                    format!(
                        "failed to move {current:?} to netns {}",
                        target.path().display()
                    ),
                    e,
                )
            })?;

        info!(
            link = %current,
            netns = %target.path().display(),
            "Moved macvtap interface into sandbox"
        );

        match configure(target_handle, current, new, config, target).await {
            Ok(result) => Ok(result),
            Err(e) => {
                for name in [current, new] {
                    if let Err(cleanup) = delete_by_name(target_handle, name).await {
                        warn!(
                            link = %name,
                            netns = %target.path().display(),
                            error = %cleanup,
                            "Failed to roll back macvtap interface"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

async fn configure(
    handle: &Handle,
    current: &str,
    new: &str,
    config: &InterfaceConfig,
    target: &NetNs,
) -> Result<InterfaceResult, LinkError> {
    // The index can change when the target namespace already uses it.
    let index = lookup(handle, current)
        .await?
        .ok_or_else(|| LinkError::LinkNotFound(current.to_string()))?
        .header
        .index;

    if let Some(mtu) = config.mtu {
        set_link(
            handle,
            LinkUnspec::new_with_index(index).mtu(mtu).build(),
            format!("failed to set MTU {mtu} on {current:?}"),
        )
        .await?;
    }

    if let Some(mac) = config.mac {
        set_link(
            handle,
            LinkUnspec::new_with_index(index)
                .address(mac.octets().to_vec())
                .build(),
            format!("failed to set MAC {mac} on {current:?}"),
        )
        .await?;
    }

    set_link(
        handle,
        LinkUnspec::new_with_index(index).name(new.to_string()).build(),
        format!("failed to rename {current:?} to {new:?}"),
    )
    .await?;

    if config.proxy_arp {
        let key = sysctl::interface_key("ipv4", new, "proxy_arp");
        if let Err(e) = target.run(|| sysctl::write(&key, "1")).and_then(|r| r) {
            warn!(link = %new, error = %e, "Failed to enable proxy ARP");
        }
    }

    set_link(
        handle,
        LinkUnspec::new_with_index(index).up().build(),
        format!("failed to set {new:?} up"),
    )
    .await?;

    if config.promiscuous {
        set_link(
            handle,
            LinkUnspec::new_with_index(index).promiscuous(true).build(),
            format!("failed to set {new:?} promiscuous"),
        )
        .await?;
    }

    let link = lookup(handle, new)
        .await?
        .map(|msg| LinkInfo::from_message(&msg))
        .ok_or_else(|| LinkError::LinkNotFound(new.to_string()))?;

    if config.owner.is_some() || config.group.is_some() {
        set_tap_ownership(link.index, config.owner, config.group)?;
    }

    debug!(link = %new, index = link.index, mac = ?link.mac, "Configured macvtap interface");

    Ok(InterfaceResult {
        name: new.to_string(),
        mac: link.mac,
        sandbox: target.path().to_path_buf(),
        index: link.index,
    })
}

/// Hand `/dev/tap<index>` to the sandbox's user. Skipped when the node is not
/// present on this host.
fn set_tap_ownership(index: u32, owner: Option<u32>, group: Option<u32>) -> Result<(), LinkError> {
    let path = tap_device_path(index);
    if !path.exists() {
        debug!(path = %path.display(), "Tap device node missing, skipping ownership");
        return Ok(());
    }
    chown(path.as_path(), owner.map(Uid::from_raw), group.map(Gid::from_raw))
        .map_err(|source| LinkError::Ownership { path, source })
}

#[async_trait]
impl LinkManager for MacvtapManager {
    async fn create(&self, name: &str, lower: &str, mode: MacvtapMode) -> Result<u32, LinkError> {
        let session = self.netns.connect(0).await?;
        let handle = session.handle();

        let parent = lookup(handle, lower)
            .await?
            .map(|msg| LinkInfo::from_message(&msg))
            .ok_or_else(|| LinkError::LowerDeviceNotFound(lower.to_string()))?;
        if parent.loopback {
            return Err(LinkError::UnsuitableLowerDevice(lower.to_string()));
        }

        let mut msg = LinkMacVtap::new(name, parent.index, mode.into())
            .up()
            .build();
        // The macvtap driver misbehaves when the queue length is left unset.
        if let Some(len) = parent.tx_queue_len {
            msg.attributes.push(LinkAttribute::TxQueueLen(len));
        }

        handle
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("failed to create macvtap {name:?}"), e))?;

        let index = lookup(handle, name)
            .await?
            .ok_or_else(|| LinkError::LinkNotFound(name.to_string()))?
            .header
            .index;

        info!(
            link = %name,
            lower = %lower,
            mode = %mode,
            index,
            "Created macvtap interface"
        );
        Ok(index)
    }

    async fn delete(&self, name: &str) -> Result<(), LinkError> {
        let session = self.netns.connect(0).await?;
        delete_by_name(session.handle(), name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, LinkError> {
        let session = self.netns.connect(0).await?;
        Ok(lookup(session.handle(), name).await?.is_some())
    }

    async fn suitable_parents(&self) -> Result<Vec<String>, LinkError> {
        let session = self.netns.connect(0).await?;
        let mut links = session.handle().link().get().execute();
        let mut names = Vec::new();
        while let Some(msg) = links
            .try_next()
            .await
            .map_err(|e| LinkError::netlink("failed to list links", e))?
        {
            let link = LinkInfo::from_message(&msg);
            if link.is_suitable_macvtap_parent() {
                names.push(link.name);
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn lookup(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, LinkError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) if is_no_such_device(&e) => Ok(None),
        Err(e) => Err(LinkError::netlink(format!("failed to lookup link {name:?}"), e)),
    }
}

async fn set_link(handle: &Handle, msg: LinkMessage, context: String) -> Result<(), LinkError> {
    handle
        .link()
        .set(msg)
        .execute()
        .await
        .map_err(|e| LinkError::netlink(context, e))
}

async fn delete_by_name(handle: &Handle, name: &str) -> Result<(), LinkError> {
    let Some(link) = lookup(handle, name).await? else {
        return Ok(());
    };
    match handle.link().del(link.header.index).execute().await {
        Ok(()) => {
            info!(link = %name, "Deleted link");
            Ok(())
        }
        Err(e) if is_no_such_device(&e) => Ok(()),
        Err(e) => Err(LinkError::netlink(format!("failed to delete {name:?}"), e)),
    }
}
