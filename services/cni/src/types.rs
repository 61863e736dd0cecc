//! CNI result types.
//!
//! Results are built in the current shape and rendered for whatever
//! `cniVersion` the runtime asked for. IPAM plugins may still answer in the
//! pre-0.3 shape (`ip4` / `ip6`); that is converted on the way in.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{CniError, ErrorDocument};

/// Versions this plugin can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

pub const CURRENT_VERSION: &str = "1.1.0";

/// Resolve a configured version; empty means the current one.
pub fn negotiate_version(requested: &str) -> Result<&'static str, CniError> {
    if requested.is_empty() {
        return Ok(CURRENT_VERSION);
    }
    SUPPORTED_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .ok_or_else(|| CniError::UnsupportedVersion(requested.to_string()))
}

/// Output of `CNI_COMMAND=VERSION`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: &'static str,
    pub supported_versions: &'static [&'static str],
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: CURRENT_VERSION,
            supported_versions: SUPPORTED_VERSIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// `"4"` or `"6"`; only present below 1.0.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into the result's `interfaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    fn is_empty(&self) -> bool {
        *self == Dns::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

impl CniResult {
    /// Render for `version`: IP entries carry `"version"` below 1.0.0.
    pub fn for_version(mut self, version: &str) -> Self {
        let legacy = version.starts_with("0.");
        for ip in &mut self.ips {
            ip.version = legacy.then(|| family(&ip.address).to_string());
        }
        self.cni_version = version.to_string();
        self
    }

    /// First gateway of the same address family as `addr`.
    pub fn gateway_for(&self, addr: &IpAddr) -> Option<IpAddr> {
        self.ips
            .iter()
            .filter_map(|ip| ip.gateway)
            .find(|gw| gw.is_ipv4() == addr.is_ipv4())
    }
}

fn family(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "4",
        IpNet::V6(_) => "6",
    }
}

#[derive(Debug, Deserialize)]
struct LegacyIp {
    ip: IpNet,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[serde(default)]
    ip4: Option<LegacyIp>,
    #[serde(default)]
    ip6: Option<LegacyIp>,
    #[serde(default)]
    dns: Dns,
}

impl From<LegacyResult> for CniResult {
    fn from(legacy: LegacyResult) -> Self {
        let mut result = CniResult {
            dns: legacy.dns,
            ..Default::default()
        };
        for ip in [legacy.ip4, legacy.ip6].into_iter().flatten() {
            result.ips.push(IpConfig {
                version: None,
                address: ip.ip,
                gateway: ip.gateway,
                interface: None,
            });
            result.routes.extend(ip.routes);
        }
        result
    }
}

/// What a delegated plugin printed on stdout.
#[derive(Debug)]
pub enum PluginOutput {
    Result(CniResult),
    Error(ErrorDocument),
}

/// Parse a delegated plugin's stdout: a current result, a legacy result or
/// an error document.
pub fn parse_plugin_output(stdout: &[u8]) -> Result<PluginOutput, CniError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|e| CniError::ConfigParse(e.to_string()))?;

    if value.get("code").is_some() && value.get("ips").is_none() {
        let doc = serde_json::from_value(value).map_err(|e| CniError::ConfigParse(e.to_string()))?;
        return Ok(PluginOutput::Error(doc));
    }

    let result = if value.get("ip4").is_some() || value.get("ip6").is_some() {
        serde_json::from_value::<LegacyResult>(value).map(CniResult::from)
    } else {
        serde_json::from_value::<CniResult>(value)
    }
    .map_err(|e| CniError::ConfigParse(e.to_string()))?;

    // Interfaces reported by IPAM refer to nothing in our result.
    let ips = result
        .ips
        .into_iter()
        .map(|ip| IpConfig {
            version: None,
            interface: None,
            ..ip
        })
        .collect();
    Ok(PluginOutput::Result(CniResult { ips, ..result }))
}
