//! Error types for link operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Link and namespace errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The lower device a macvtap child should be bound to does not exist.
    #[error("failed to lookup lower device {0:?}: link not found")]
    LowerDeviceNotFound(String),

    /// The lower device exists but cannot parent a macvtap child.
    #[error("lower device {0:?} cannot parent a macvtap interface")]
    UnsuitableLowerDevice(String),

    /// Unknown macvtap mode string.
    #[error("unknown macvtap mode: {0:?}")]
    InvalidMode(String),

    /// Named link does not exist in the namespace.
    #[error("link {0:?} not found")]
    LinkNotFound(String),

    /// Could not open a network namespace reference.
    #[error("failed to open netns {path:?}: {source}")]
    NamespaceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not switch a worker thread into a namespace.
    #[error("failed to enter netns {path:?}: {source}")]
    NamespaceEnter {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// Netlink request failed.
    #[error("{context}: {source}")]
    Netlink {
        context: String,
        #[source]
        source: rtnetlink::Error,
    },

    /// Link notification subscription could not be established.
    #[error("failed to subscribe to link events: {0}")]
    Subscription(String),

    /// Sysctl read or write failed.
    #[error("sysctl {key}: {source}")]
    Sysctl {
        key: String,
        #[source]
        source: io::Error,
    },

    /// Changing ownership of a tap device node failed.
    #[error("failed to set ownership of {path:?}: {source}")]
    Ownership {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    pub fn netlink(context: impl Into<String>, source: rtnetlink::Error) -> Self {
        LinkError::Netlink {
            context: context.into(),
            source,
        }
    }

    /// Whether this error means the link is already gone.
    ///
    /// Idempotent paths (delete, existence checks) treat this as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            LinkError::LinkNotFound(_) => true,
            LinkError::Netlink { source, .. } => is_no_such_device(source),
            _ => false,
        }
    }

    /// Standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            LinkError::LowerDeviceNotFound(_) => "lower_device_not_found",
            LinkError::UnsuitableLowerDevice(_) => "unsuitable_lower_device",
            LinkError::InvalidMode(_) => "invalid_mode",
            LinkError::LinkNotFound(_) => "link_not_found",
            LinkError::NamespaceOpen { .. } | LinkError::NamespaceEnter { .. } => "namespace_open",
            LinkError::Netlink { .. } => "netlink_error",
            LinkError::Subscription(_) => "subscription_transport",
            LinkError::Sysctl { .. } => "sysctl_error",
            LinkError::Ownership { .. } => "ownership_error",
            LinkError::Io(_) => "io_error",
        }
    }
}

/// ENODEV is what the kernel answers for lookups of missing links.
pub(crate) fn is_no_such_device(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -libc::ENODEV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(LinkError::LinkNotFound("eth9".into()).is_not_found());
        assert!(!LinkError::LowerDeviceNotFound("eth9".into()).is_not_found());
        assert!(!LinkError::InvalidMode("foo".into()).is_not_found());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            LinkError::InvalidMode("foo".into()).reason_code(),
            "invalid_mode"
        );
        assert_eq!(
            LinkError::Subscription("closed".into()).reason_code(),
            "subscription_transport"
        );
    }

    #[test]
    fn test_display_mentions_device() {
        let err = LinkError::LowerDeviceNotFound("eth0".into());
        assert!(err.to_string().contains("\"eth0\""));
    }
}
