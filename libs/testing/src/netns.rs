//! Throwaway network namespaces for privileged tests.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use futures::TryStreamExt;
use macvtap_link::{LinkError, LinkInfo, NetNs};
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use rtnetlink::{LinkBond, LinkDummy};

/// A fresh network namespace, alive as long as this value.
///
/// The namespace is held by a parked thread that unshared it; its path is
/// that thread's `/proc/<pid>/task/<tid>/ns/net`. Needs `CAP_SYS_ADMIN`.
pub struct TestNetNs {
    path: PathBuf,
    release: Option<mpsc::Sender<()>>,
    holder: Option<JoinHandle<()>>,
}

impl TestNetNs {
    pub fn new() -> Result<Self, LinkError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = thread::Builder::new()
            .name("test-netns".to_string())
            .spawn(move || {
                let entered = unshare(CloneFlags::CLONE_NEWNET).map(|()| {
                    PathBuf::from(format!(
                        "/proc/{}/task/{}/ns/net",
                        std::process::id(),
                        nix::unistd::gettid()
                    ))
                });
                let failed = entered.is_err();
                let _ = ready_tx.send(entered);
                if !failed {
                    // Blocks until the sender is dropped.
                    let _ = release_rx.recv();
                }
            })?;

        let path = ready_rx
            .recv()
            .map_err(|_| LinkError::Io(std::io::Error::other("netns holder exited")))?
            .map_err(|source| LinkError::NamespaceEnter {
                path: PathBuf::from("<unshare>"),
                source,
            })?;

        Ok(Self {
            path,
            release: Some(release_tx),
            holder: Some(holder),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn netns(&self) -> Result<NetNs, LinkError> {
        NetNs::open(&self.path)
    }

    /// Add an up dummy link. Returns its index.
    pub async fn add_dummy(&self, name: &str) -> Result<u32, LinkError> {
        self.add(LinkDummy::new(name).up().build(), name).await
    }

    pub async fn add_bond(&self, name: &str) -> Result<u32, LinkError> {
        self.add(LinkBond::new(name).up().build(), name).await
    }

    /// Index of `name`, if it exists in the namespace.
    pub async fn link_index(&self, name: &str) -> Result<Option<u32>, LinkError> {
        Ok(self.link(name).await?.map(|link| link.index))
    }

    /// Current state of `name`, if it exists in the namespace.
    pub async fn link(&self, name: &str) -> Result<Option<LinkInfo>, LinkError> {
        let session = self.netns()?.connect(0).await?;
        let mut links = session
            .handle()
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(link) => Ok(link.as_ref().map(LinkInfo::from_message)),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -(Errno::ENODEV as i32) => {
                Ok(None)
            }
            Err(source) => Err(LinkError::Netlink {
                context: format!("failed to lookup {name:?}"),
                source,
            }),
        }
    }

    async fn add(
        &self,
        msg: rtnetlink::packet_route::link::LinkMessage,
        name: &str,
    ) -> Result<u32, LinkError> {
        let session = self.netns()?.connect(0).await?;
        session
            .handle()
            .link()
            .add(msg)
            .execute()
            .await
            .map_err(|source| LinkError::Netlink {
                context: format!("failed to add {name:?}"),
                source,
            })?;
        drop(session);
        self.link_index(name)
            .await?
            .ok_or_else(|| LinkError::LinkNotFound(name.to_string()))
    }
}

impl Drop for TestNetNs {
    fn drop(&mut self) {
        self.release.take();
        if let Some(holder) = self.holder.take() {
            let _ = holder.join();
        }
    }
}
