//! Namespace-bound netlink sessions.

use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use rtnetlink::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::LinkError;
use crate::link::LinkInfo;
use crate::netns::NetNs;
use crate::observer::{LinkEventSource, LinkUpdates};

/// Multicast group bitmask for link add/remove/change notifications.
pub const RTMGRP_LINK: u32 = 0x1;

type Unsolicited = UnboundedReceiver<(NetlinkMessage<RouteNetlinkMessage>, SocketAddr)>;

/// A netlink route connection whose socket belongs to one namespace.
///
/// Requests issued through [`NetlinkSession::handle`] act on that namespace
/// regardless of which thread issues them. Dropping the session tears the
/// connection down.
pub struct NetlinkSession {
    handle: Handle,
    messages: Unsolicited,
    task: JoinHandle<()>,
}

impl NetlinkSession {
    /// Open a session in the calling thread's namespace.
    ///
    /// Must run inside a tokio runtime context; the connection driver is
    /// spawned onto it.
    pub(crate) fn open(groups: u32) -> Result<Self, LinkError> {
        let (mut connection, handle, messages) = rtnetlink::new_connection()?;
        if groups != 0 {
            connection
                .socket_mut()
                .socket_mut()
                .bind(&SocketAddr::new(0, groups))?;
        }
        let task = tokio::spawn(connection);
        Ok(Self {
            handle,
            messages,
            task,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Next link notification, or `None` once the connection is gone.
    pub(crate) async fn next_link(&mut self) -> Option<LinkInfo> {
        while let Some((msg, _)) = self.messages.next().await {
            match msg.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link))
                | NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                    return Some(LinkInfo::from_message(&link));
                }
                other => debug!(payload = ?other, "Ignoring netlink message"),
            }
        }
        None
    }
}

impl Drop for NetlinkSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for NetlinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkSession").finish_non_exhaustive()
    }
}

/// Kernel link notifications for one namespace.
///
/// Every subscription reopens the namespace path, so a namespace that was
/// recreated under the same path is picked up on resubscription.
#[derive(Debug, Clone)]
pub struct NetlinkEventSource {
    netns_path: std::path::PathBuf,
}

impl NetlinkEventSource {
    pub fn new(netns_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            netns_path: netns_path.into(),
        }
    }
}

#[async_trait::async_trait]
impl LinkEventSource for NetlinkEventSource {
    async fn subscribe(&self) -> Result<LinkUpdates, LinkError> {
        let ns = NetNs::open(&self.netns_path)?;
        let session = ns.connect(RTMGRP_LINK).await?;
        Ok(LinkUpdates::from_session(session))
    }
}
