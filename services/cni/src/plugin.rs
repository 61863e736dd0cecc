//! CNI commands.
//!
//! ADD hands the macvtap interface named by `deviceID` (created earlier by
//! the device plugin in the host namespace) to the sandbox, renaming it to
//! `CNI_IFNAME`. DEL removes it again. Neither keeps state between calls.

use std::io;

use macvtap_link::{InterfaceConfig, LinkError, LinkManager, MacvtapManager, NetNs};
use tracing::{info, warn};

use crate::config::{EnvArgs, NetConf};
use crate::error::CniError;
use crate::ipam;
use crate::skel::CmdArgs;
use crate::types::{negotiate_version, CniResult, Interface};

/// Runs CNI commands against interfaces living in `host`.
#[derive(Debug, Clone)]
pub struct Provisioner {
    host: MacvtapManager,
}

impl Provisioner {
    pub fn new(host: NetNs) -> Self {
        Self {
            host: MacvtapManager::new(host),
        }
    }

    /// Provisioner for the namespace the plugin was started in.
    pub fn from_main_thread() -> Result<Self, CniError> {
        Ok(Self::new(NetNs::main_thread()?))
    }

    pub async fn cmd_add(&self, args: &CmdArgs) -> Result<CniResult, CniError> {
        let conf = NetConf::parse(&args.stdin)?;
        let version = negotiate_version(&conf.cni_version)?;
        if conf.device_id.is_empty() {
            return Err(CniError::InvalidConfig("deviceID is required".to_string()));
        }
        let env = EnvArgs::parse(&args.args)?;

        let target = NetNs::open(&args.netns).map_err(|source| CniError::NamespaceOpen {
            path: args.netns.clone(),
            source,
        })?;

        match self.add(&conf, &env, args, &target).await {
            Ok(result) => {
                info!(
                    device = %conf.device_id,
                    ifname = %args.ifname,
                    netns = %args.netns,
                    "Interface added to sandbox"
                );
                Ok(result.for_version(version))
            }
            Err(e) => {
                // Whatever is left in the host namespace would leak.
                if let Err(cleanup) = self.host.delete(&conf.device_id).await {
                    warn!(
                        device = %conf.device_id,
                        error = %cleanup,
                        "Failed to delete device after failed add"
                    );
                }
                Err(e)
            }
        }
    }

    async fn add(
        &self,
        conf: &NetConf,
        env: &EnvArgs,
        args: &CmdArgs,
        target: &NetNs,
    ) -> Result<CniResult, CniError> {
        let iface_config = InterfaceConfig {
            mac: env.mac,
            mtu: conf.mtu_override(),
            promiscuous: conf.promisc_mode,
            owner: Some(conf.owner),
            group: Some(conf.group),
            proxy_arp: true,
        };

        let iface = self
            .host
            .move_and_configure(&conf.device_id, &args.ifname, &iface_config, target)
            .await?;

        let mut result = CniResult {
            interfaces: vec![Interface {
                name: iface.name.clone(),
                mac: iface.mac.map(|m| m.to_string()),
                sandbox: Some(iface.sandbox.display().to_string()),
            }],
            ..Default::default()
        };

        let Some(plugin) = conf.ipam_plugin() else {
            return Ok(result);
        };

        let ipam_result = ipam::exec_add(plugin, args).await?;
        match apply_ipam(ipam_result, &mut result, target, &iface.name, iface.index).await {
            Ok(()) => Ok(result),
            Err(e) => {
                if let Err(release) = ipam::exec_del(plugin, args).await {
                    warn!(plugin, error = %release, "Failed to release IPAM allocation");
                }
                Err(e)
            }
        }
    }

    pub async fn cmd_del(&self, args: &CmdArgs) -> Result<(), CniError> {
        let conf = NetConf::parse(&args.stdin)?;

        if let Some(plugin) = conf.ipam_plugin() {
            ipam::exec_del(plugin, args).await?;
        }

        if args.netns.is_empty() {
            return Ok(());
        }

        let target = match NetNs::open(&args.netns) {
            Ok(target) => target,
            Err(LinkError::NamespaceOpen { ref source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                info!(netns = %args.netns, "Sandbox already gone");
                return Ok(());
            }
            Err(source) => {
                return Err(CniError::NamespaceOpen {
                    path: args.netns.clone(),
                    source,
                })
            }
        };

        MacvtapManager::new(target).delete(&args.ifname).await?;
        info!(ifname = %args.ifname, netns = %args.netns, "Interface removed from sandbox");
        Ok(())
    }

    pub async fn cmd_check(&self, _args: &CmdArgs) -> Result<(), CniError> {
        Ok(())
    }
}

async fn apply_ipam(
    ipam_result: CniResult,
    result: &mut CniResult,
    target: &NetNs,
    ifname: &str,
    index: u32,
) -> Result<(), CniError> {
    if ipam_result.ips.is_empty() {
        return Err(CniError::IpamNoAddress);
    }

    result.ips = ipam_result
        .ips
        .into_iter()
        .map(|mut ip| {
            ip.interface = Some(0);
            ip
        })
        .collect();
    result.routes = ipam_result.routes;
    result.dns = ipam_result.dns;

    ipam::configure_iface(target, ifname, index, result).await
}
