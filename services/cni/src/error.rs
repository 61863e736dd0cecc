//! CNI errors and the error document printed on failure.

use std::io;

use macvtap_link::LinkError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known CNI error codes.
pub mod code {
    pub const INCOMPATIBLE_VERSION: u32 = 1;
    pub const UNKNOWN_CONTAINER: u32 = 3;
    pub const INVALID_ENVIRONMENT: u32 = 4;
    pub const IO_FAILURE: u32 = 5;
    pub const DECODING_FAILURE: u32 = 6;
    pub const INVALID_NETWORK_CONFIG: u32 = 7;
    pub const INTERNAL: u32 = 999;
}

#[derive(Debug, Error)]
pub enum CniError {
    /// Network configuration could not be decoded.
    #[error("failed to load netconf: {0}")]
    ConfigParse(String),

    /// Network configuration decoded but is unusable.
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    /// `CNI_ARGS` or another CNI environment variable is malformed or missing.
    #[error("{0}")]
    InvalidEnvArgs(String),

    #[error("failed to open netns {path:?}: {source}")]
    NamespaceOpen {
        path: String,
        #[source]
        source: LinkError,
    },

    #[error(transparent)]
    Link(#[from] LinkError),

    /// The delegated IPAM plugin failed.
    #[error("IPAM plugin {plugin:?} failed: {msg}")]
    IpamExec {
        plugin: String,
        code: u32,
        msg: String,
    },

    #[error("IPAM plugin returned missing IP config")]
    IpamNoAddress,

    #[error("incompatible CNI version {0:?}")]
    UnsupportedVersion(String),

    #[error("unknown CNI_COMMAND: {0:?}")]
    UnknownCommand(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CniError {
    /// CNI error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            CniError::ConfigParse(_) => code::DECODING_FAILURE,
            CniError::InvalidConfig(_) => code::INVALID_NETWORK_CONFIG,
            CniError::InvalidEnvArgs(_) | CniError::UnknownCommand(_) => code::INVALID_ENVIRONMENT,
            CniError::NamespaceOpen { .. } => code::UNKNOWN_CONTAINER,
            CniError::IpamExec { code, .. } => *code,
            CniError::UnsupportedVersion(_) => code::INCOMPATIBLE_VERSION,
            CniError::Io(_) => code::IO_FAILURE,
            CniError::Link(_) | CniError::IpamNoAddress => code::INTERNAL,
        }
    }

    fn details(&self) -> String {
        match self {
            CniError::Link(e) | CniError::NamespaceOpen { source: e, .. } => {
                e.reason_code().to_string()
            }
            _ => String::new(),
        }
    }

    /// The document printed to stdout when a command fails.
    pub fn to_document(&self, cni_version: &str) -> ErrorDocument {
        ErrorDocument {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details: self.details(),
        }
    }
}

/// CNI error result: `{cniVersion, code, msg, details}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDocument {
    #[serde(default)]
    pub cni_version: String,
    pub code: u32,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}
