//! Macvtap device plugin daemon
//!
//! Discovers macvtap resources on this host and keeps one ListAndWatch
//! advertiser running per resource.
//!
//! ## Architecture
//!
//! - **Discovery**: emits the current resource names, either from
//!   `DP_MACVTAP_CONF` or by watching the host's links
//! - **Registry**: starts and stops a device plugin per discovered name

use std::sync::Arc;

use anyhow::{Context, Result};
use macvtap_device_plugin::{
    Config, ConfigEvent, MacvtapLister, PluginRegistry, ShutdownSignals,
};
use macvtap_link::{MacvtapManager, NetlinkEventSource, ObserverConfig};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting macvtap device plugin");
    info!(
        netns = %config.netns_path.display(),
        static_config = config.resources.is_some(),
        resubscribe_interval_secs = config.resubscribe_interval.as_secs(),
        "Configuration loaded"
    );

    let links = MacvtapManager::open(&config.netns_path)
        .with_context(|| format!("failed to open {}", config.netns_path.display()))?;
    let events = NetlinkEventSource::new(&config.netns_path);

    let lister = Arc::new(
        MacvtapLister::new(Arc::new(links), Arc::new(events), &config.netns_path)
            .with_observer_config(ObserverConfig {
                resubscribe_interval: config.resubscribe_interval,
            }),
    );

    // The environment is read once; the sender stays alive so discovery
    // does not treat the source as gone.
    let (config_tx, config_rx) = mpsc::channel(1);
    config_tx
        .send(ConfigEvent::Updated(config.resources.clone().unwrap_or_default()))
        .await
        .context("discovery channel closed")?;

    let mut signals = ShutdownSignals::new().context("failed to install signal handlers")?;

    let (names_tx, mut names_rx) = mpsc::channel(1);
    let mut discovery = tokio::spawn({
        let lister = Arc::clone(&lister);
        async move { lister.discover(config_rx, names_tx).await }
    });

    let mut registry = PluginRegistry::new(Arc::clone(&lister));

    let outcome = loop {
        tokio::select! {
            signal = signals.recv() => {
                info!(signal, "Received shutdown signal");
                discovery.abort();
                break Ok(Ok(()));
            }
            names = names_rx.recv() => match names {
                Some(names) => {
                    info!(resources = ?names, "Resources discovered");
                    registry.apply(&names).await;
                }
                // Discovery only drops its sender when it ends.
                None => break (&mut discovery).await,
            }
        }
    };

    registry.shutdown().await;
    drop(config_tx);

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Discovery failed");
            return Err(e).context("resource discovery failed");
        }
        Err(e) => {
            error!(error = %e, "Discovery task panicked");
            anyhow::bail!("discovery task panicked: {e}");
        }
    }

    info!("Device plugin shutdown complete");
    Ok(())
}
