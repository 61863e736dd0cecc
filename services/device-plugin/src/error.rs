//! Error types for discovery and advertisement.

use macvtap_link::LinkError;
use thiserror::Error;

/// Resource discovery errors. Any of these ends discovery; the daemon exits
/// so that it is restarted rather than advertising stale resources.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Resource configuration is not valid JSON or has invalid values.
    #[error("invalid resource configuration: {0}")]
    ConfigParse(String),

    /// Scanning the host's links failed.
    #[error("failed to scan links: {0}")]
    Scan(#[source] LinkError),

    /// The configuration source went away.
    #[error("configuration source closed")]
    ConfigSourceClosed,
}

/// Device plugin errors.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Creating the interface for a requested device failed.
    #[error("failed to allocate device {device}: {source}")]
    Allocation {
        device: String,
        #[source]
        source: LinkError,
    },

    /// The ListAndWatch consumer went away.
    #[error("device list stream closed")]
    StreamClosed,
}

impl From<PluginError> for tonic::Status {
    fn from(err: PluginError) -> Self {
        match &err {
            PluginError::Allocation { source, .. } => match source {
                LinkError::LowerDeviceNotFound(_) | LinkError::UnsuitableLowerDevice(_) => {
                    tonic::Status::failed_precondition(err.to_string())
                }
                LinkError::InvalidMode(_) => tonic::Status::invalid_argument(err.to_string()),
                _ => tonic::Status::internal(err.to_string()),
            },
            PluginError::StreamClosed => tonic::Status::cancelled(err.to_string()),
        }
    }
}
