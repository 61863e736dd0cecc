//! Network configuration (stdin) and `CNI_ARGS`.

use macvtap_link::MacAddr;
use serde::Deserialize;

use crate::error::CniError;

/// Default owner of the tap device: the `qemu` user.
pub const DEFAULT_OWNER: u32 = 107;

/// Network configuration passed on stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Name of the pre-created macvtap interface in the host namespace.
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    /// 0 leaves the MTU untouched.
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub promisc_mode: bool,
    #[serde(default = "default_owner")]
    pub owner: u32,
    #[serde(default = "default_owner")]
    pub group: u32,
    #[serde(default)]
    pub ipam: Option<IpamConf>,
}

fn default_owner() -> u32 {
    DEFAULT_OWNER
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin_type: String,
}

impl NetConf {
    pub fn parse(stdin: &[u8]) -> Result<Self, CniError> {
        serde_json::from_slice(stdin).map_err(|e| CniError::ConfigParse(e.to_string()))
    }

    pub fn mtu_override(&self) -> Option<u32> {
        (self.mtu > 0).then_some(self.mtu)
    }

    /// IPAM plugin to delegate to. Set means the attachment is layer 3.
    pub fn ipam_plugin(&self) -> Option<&str> {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.plugin_type.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// Arguments passed through `CNI_ARGS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvArgs {
    pub mac: Option<MacAddr>,
    pub ignore_unknown: bool,
}

impl EnvArgs {
    /// Parse `KEY=VALUE;KEY=VALUE`. Unknown keys are rejected unless
    /// `IgnoreUnknown` is set to `1` or `true`.
    pub fn parse(raw: &str) -> Result<Self, CniError> {
        let mut pairs = Vec::new();
        for pair in raw.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| CniError::InvalidEnvArgs(format!("ARGS: invalid pair {pair:?}")))?;
            pairs.push((key, value));
        }

        let mut args = EnvArgs::default();
        if let Some((_, value)) = pairs.iter().find(|(k, _)| *k == "IgnoreUnknown") {
            args.ignore_unknown = matches!(value.to_ascii_lowercase().as_str(), "1" | "true");
        }

        let mut unknown = Vec::new();
        for (key, value) in pairs {
            match key {
                "IgnoreUnknown" => {}
                "MAC" if !value.is_empty() => {
                    let mac = value.parse().map_err(|e: macvtap_link::link::ParseMacError| {
                        CniError::InvalidEnvArgs(e.to_string())
                    })?;
                    args.mac = Some(mac);
                }
                "MAC" => {}
                other => unknown.push(other),
            }
        }

        if !unknown.is_empty() && !args.ignore_unknown {
            return Err(CniError::InvalidEnvArgs(format!(
                "ARGS: unknown args {unknown:?}"
            )));
        }
        Ok(args)
    }
}
