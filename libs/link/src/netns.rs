//! Network namespace references.
//!
//! A `NetNs` holds an open file on a namespace (`/proc/<pid>/ns/net`, a
//! bind-mounted `/var/run/netns/<name>`, or the sandbox path handed to the
//! CNI plugin). Work that must happen inside the namespace is done on a
//! dedicated thread that `setns`es and then exits, so the caller's thread and
//! the runtime's worker threads always stay where they started.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::LinkError;
use crate::netlink::NetlinkSession;

/// Open reference to a network namespace.
#[derive(Debug, Clone)]
pub struct NetNs {
    path: PathBuf,
    file: Arc<File>,
}

impl NetNs {
    /// Open the namespace at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| LinkError::NamespaceOpen {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            file: Arc::new(file),
        })
    }

    /// Namespace file of this process's main thread.
    pub fn main_thread_path() -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/net", std::process::id()))
    }

    /// Open the namespace the process was started in.
    pub fn main_thread() -> Result<Self, LinkError> {
        Self::open(Self::main_thread_path())
    }

    /// Path this reference was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking closure on a short-lived thread inside this namespace.
    pub fn run<F, T>(&self, f: F) -> Result<T, LinkError>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        thread::scope(|scope| {
            let worker = scope.spawn(|| -> Result<T, LinkError> {
                self.enter()?;
                Ok(f())
            });
            match worker.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }

    /// Open a netlink route session whose socket lives in this namespace.
    ///
    /// `groups` is the multicast membership bitmask to bind; 0 for a plain
    /// request/response session. Must be called from within a tokio runtime.
    pub async fn connect(&self, groups: u32) -> Result<NetlinkSession, LinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::Io(std::io::Error::other(e)))?;
        let (tx, rx) = oneshot::channel();
        let ns = self.clone();

        thread::Builder::new()
            .name("netns-connect".to_string())
            .spawn(move || {
                let result = ns.enter().and_then(|()| {
                    let _guard = runtime.enter();
                    NetlinkSession::open(groups)
                });
                let _ = tx.send(result);
            })?;

        debug!(netns = %self.path.display(), groups, "Opening netlink session");

        rx.await.map_err(|_| {
            LinkError::Io(std::io::Error::other("netns worker exited without a session"))
        })?
    }

    fn enter(&self) -> Result<(), LinkError> {
        setns(self.file.as_ref(), CloneFlags::CLONE_NEWNET).map_err(|source| {
            LinkError::NamespaceEnter {
                path: self.path.clone(),
                source,
            }
        })
    }
}

impl AsFd for NetNs {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl PartialEq for NetNs {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}
