//! Link change observer.
//!
//! `LinkObserver` keeps a subscription to link notifications alive and calls
//! a handler whenever something relevant may have changed. It is a two-state
//! machine:
//!
//! - `Unsubscribed`: try to subscribe. On failure, wait the resubscribe
//!   interval and try again.
//! - `Subscribed`: forward matching notifications to the handler. When the
//!   feed closes, drop back to `Unsubscribed`.
//!
//! The handler is invoked once every time a subscription becomes live, even
//! if no notification arrives, because anything that changed while
//! unsubscribed would otherwise be lost. Handlers must therefore re-derive
//! current state rather than react to deltas.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::link::{LinkInfo, LinkPredicate};
use crate::netlink::NetlinkSession;

/// Default delay between resubscription attempts.
pub const DEFAULT_RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(10);

/// Callback invoked on relevant link changes.
#[async_trait]
pub trait LinkEventHandler: Send {
    async fn on_link_event(&mut self);
}

#[async_trait]
impl<F> LinkEventHandler for F
where
    F: FnMut() + Send,
{
    async fn on_link_event(&mut self) {
        self()
    }
}

/// Source of link notification feeds.
#[async_trait]
pub trait LinkEventSource: Send + Sync {
    /// Establish a new live feed.
    async fn subscribe(&self) -> Result<LinkUpdates, LinkError>;
}

/// A live feed of link notifications. `None` from [`LinkUpdates::next`]
/// means the transport is gone.
#[derive(Debug)]
pub struct LinkUpdates {
    feed: Feed,
}

#[derive(Debug)]
enum Feed {
    Kernel(NetlinkSession),
    Channel(mpsc::UnboundedReceiver<LinkInfo>),
}

impl LinkUpdates {
    pub(crate) fn from_session(session: NetlinkSession) -> Self {
        Self {
            feed: Feed::Kernel(session),
        }
    }

    /// Feed backed by an in-process channel. Closing every sender closes the
    /// feed.
    pub fn from_channel(rx: mpsc::UnboundedReceiver<LinkInfo>) -> Self {
        Self {
            feed: Feed::Channel(rx),
        }
    }

    pub async fn next(&mut self) -> Option<LinkInfo> {
        match &mut self.feed {
            Feed::Kernel(session) => session.next_link().await,
            Feed::Channel(rx) => rx.recv().await,
        }
    }
}

/// Observer tuning.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub resubscribe_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            resubscribe_interval: DEFAULT_RESUBSCRIBE_INTERVAL,
        }
    }
}

enum State {
    Unsubscribed { retry: bool },
    Subscribed(LinkUpdates),
}

/// Watches one namespace's links for changes matching a predicate.
pub struct LinkObserver {
    source: Arc<dyn LinkEventSource>,
    predicate: LinkPredicate,
    config: ObserverConfig,
}

impl LinkObserver {
    pub fn new(source: Arc<dyn LinkEventSource>, predicate: LinkPredicate) -> Self {
        Self {
            source,
            predicate,
            config: ObserverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn predicate(&self) -> &LinkPredicate {
        &self.predicate
    }

    /// Observe until `stop` turns true or its sender is dropped.
    ///
    /// Transport failures are handled here by resubscribing; they are never
    /// returned. No handler call starts after stop has been observed.
    pub async fn run<H>(&self, handler: &mut H, mut stop: watch::Receiver<bool>)
    where
        H: LinkEventHandler + ?Sized,
    {
        let mut state = State::Unsubscribed { retry: false };

        loop {
            if stop_requested(&stop) {
                break;
            }

            state = match state {
                State::Unsubscribed { retry } => {
                    if retry {
                        tokio::select! {
                            biased;
                            _ = stopped(&mut stop) => break,
                            _ = tokio::time::sleep(self.config.resubscribe_interval) => {}
                        }
                    }

                    let subscribed = tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => break,
                        result = self.source.subscribe() => result,
                    };

                    match subscribed {
                        Ok(updates) => {
                            info!(predicate = ?self.predicate, "Subscribed to link events");
                            if stop_requested(&stop) {
                                break;
                            }
                            handler.on_link_event().await;
                            State::Subscribed(updates)
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                retry_in_secs = self.config.resubscribe_interval.as_secs(),
                                "Failed to subscribe to link events"
                            );
                            State::Unsubscribed { retry: true }
                        }
                    }
                }
                State::Subscribed(mut updates) => {
                    let update = tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => break,
                        update = updates.next() => update,
                    };

                    match update {
                        Some(link) => {
                            if self.predicate.matches(&link) {
                                debug!(link = %link.name, index = link.index, "Link event");
                                if stop_requested(&stop) {
                                    break;
                                }
                                handler.on_link_event().await;
                            }
                            State::Subscribed(updates)
                        }
                        None => {
                            warn!(
                                retry_in_secs = self.config.resubscribe_interval.as_secs(),
                                "Link event feed closed, resubscribing"
                            );
                            State::Unsubscribed { retry: true }
                        }
                    }
                }
            };
        }

        debug!(predicate = ?self.predicate, "Link observer stopped");
    }
}

/// Whether stop has been requested, without waiting.
pub fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// Resolves once stop is requested.
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_requested_on_true() {
        let (tx, rx) = watch::channel(false);
        assert!(!stop_requested(&rx));
        tx.send_replace(true);
        assert!(stop_requested(&rx));
    }

    #[tokio::test]
    async fn test_stop_requested_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(stop_requested(&rx));
        stopped(&mut rx).await;
    }

    #[tokio::test]
    async fn test_channel_feed_closes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut updates = LinkUpdates::from_channel(rx);
        tx.send(LinkInfo::device(2, "eth0")).unwrap();
        drop(tx);
        assert_eq!(updates.next().await.unwrap().name, "eth0");
        assert!(updates.next().await.is_none());
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(
            ObserverConfig::default().resubscribe_interval,
            Duration::from_secs(10)
        );
    }
}
