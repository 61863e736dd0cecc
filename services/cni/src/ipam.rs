//! IPAM delegation and address configuration.
//!
//! The IPAM plugin named in the network configuration is executed as a
//! separate CNI plugin with the same stdin. Its result is applied to the
//! interface inside the sandbox.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use macvtap_link::{sysctl, LinkError, NetNs};
use rtnetlink::RouteMessageBuilder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{code, CniError};
use crate::skel::CmdArgs;
use crate::types::{parse_plugin_output, CniResult, PluginOutput};

/// Locate `plugin` in the `CNI_PATH` directories.
pub fn find_plugin(plugin: &str, paths: &[PathBuf]) -> Result<PathBuf, CniError> {
    if paths.is_empty() {
        return Err(CniError::InvalidEnvArgs(
            "required env variable CNI_PATH missing".to_string(),
        ));
    }
    paths
        .iter()
        .map(|dir| dir.join(plugin))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| CniError::IpamExec {
            plugin: plugin.to_string(),
            code: code::INTERNAL,
            msg: format!("failed to find plugin {plugin:?} in path {paths:?}"),
        })
}

/// Run the IPAM plugin's ADD and return its result in the current shape.
pub async fn exec_add(plugin: &str, args: &CmdArgs) -> Result<CniResult, CniError> {
    let stdout = exec(plugin, "ADD", args).await?;
    match parse_plugin_output(&stdout)? {
        PluginOutput::Result(result) => Ok(result),
        PluginOutput::Error(doc) => Err(CniError::IpamExec {
            plugin: plugin.to_string(),
            code: doc.code,
            msg: doc.msg,
        }),
    }
}

/// Run the IPAM plugin's DEL, releasing whatever ADD allocated.
pub async fn exec_del(plugin: &str, args: &CmdArgs) -> Result<(), CniError> {
    exec(plugin, "DEL", args).await.map(|_| ())
}

async fn exec(plugin: &str, command: &str, args: &CmdArgs) -> Result<Vec<u8>, CniError> {
    let path = find_plugin(plugin, &args.path)?;
    let cni_path = std::env::join_paths(&args.path)
        .map_err(|e| CniError::InvalidEnvArgs(e.to_string()))?;

    debug!(plugin = %path.display(), command, "Executing IPAM plugin");

    let mut child = Command::new(&path)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", &args.container_id)
        .env("CNI_NETNS", &args.netns)
        .env("CNI_IFNAME", &args.ifname)
        .env("CNI_ARGS", &args.args)
        .env("CNI_PATH", cni_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| exec_error(plugin, &path, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(&args.stdin).await {
            // The plugin exited without reading its configuration.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(exec_error(plugin, &path, e)),
            Ok(()) => {}
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| exec_error(plugin, &path, e))?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    // A failing plugin should print an error document; fall back to the
    // exit status when it did not.
    match parse_plugin_output(&output.stdout) {
        Ok(PluginOutput::Error(doc)) => Err(CniError::IpamExec {
            plugin: plugin.to_string(),
            code: doc.code,
            msg: doc.msg,
        }),
        _ => Err(CniError::IpamExec {
            plugin: plugin.to_string(),
            code: code::INTERNAL,
            msg: format!("{} exited with {}", path.display(), output.status),
        }),
    }
}

fn exec_error(plugin: &str, path: &Path, err: std::io::Error) -> CniError {
    CniError::IpamExec {
        plugin: plugin.to_string(),
        code: code::INTERNAL,
        msg: format!("failed to run {}: {err}", path.display()),
    }
}

/// Apply `result`'s addresses and routes to interface `index` in `netns`.
///
/// ARP notifications are enabled first, best effort, so that neighbours learn
/// the new address right away.
pub async fn configure_iface(
    netns: &NetNs,
    ifname: &str,
    index: u32,
    result: &CniResult,
) -> Result<(), CniError> {
    let key = sysctl::interface_key("ipv4", ifname, "arp_notify");
    if let Err(e) = netns.run(|| sysctl::write(&key, "1")).and_then(|r| r) {
        warn!(link = %ifname, error = %e, "Failed to enable ARP notify");
    }

    let session = netns.connect(0).await?;
    let handle = session.handle();

    for ip in &result.ips {
        handle
            .address()
            .add(index, ip.address.addr(), ip.address.prefix_len())
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("failed to add address {}", ip.address), e))?;
        debug!(link = %ifname, address = %ip.address, "Added address");
    }

    for route in &result.routes {
        let dst = route.dst.addr();
        let gateway = route.gw.or_else(|| result.gateway_for(&dst));
        let msg = match (dst, gateway) {
            (IpAddr::V4(dst), gw) => {
                let builder = RouteMessageBuilder::<Ipv4Addr>::default()
                    .destination_prefix(dst, route.dst.prefix_len())
                    .output_interface(index);
                match gw {
                    Some(IpAddr::V4(gw)) => builder.gateway(gw).build(),
                    _ => builder.build(),
                }
            }
            (IpAddr::V6(dst), gw) => {
                let builder = RouteMessageBuilder::<Ipv6Addr>::default()
                    .destination_prefix(dst, route.dst.prefix_len())
                    .output_interface(index);
                match gw {
                    Some(IpAddr::V6(gw)) => builder.gateway(gw).build(),
                    _ => builder.build(),
                }
            }
        };
        handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("failed to add route {}", route.dst), e))?;
        debug!(link = %ifname, dst = %route.dst, gateway = ?gateway, "Added route");
    }

    info!(
        link = %ifname,
        addresses = result.ips.len(),
        routes = result.routes.len(),
        "Configured sandbox addressing"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn args(dir: &TempDir) -> CmdArgs {
        CmdArgs {
            container_id: "abc".into(),
            netns: "/var/run/netns/abc".into(),
            ifname: "net1".into(),
            args: String::new(),
            path: vec![dir.path().to_path_buf()],
            stdin: br#"{"ipam":{"type":"fake"}}"#.to_vec(),
        }
    }

    #[test]
    fn test_find_plugin() {
        let empty = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        script(&dir, "fake", "exit 0");

        let paths = vec![empty.path().to_path_buf(), dir.path().to_path_buf()];
        assert_eq!(find_plugin("fake", &paths).unwrap(), dir.path().join("fake"));
        assert!(matches!(
            find_plugin("missing", &paths),
            Err(CniError::IpamExec { .. })
        ));
        assert!(matches!(
            find_plugin("fake", &[]),
            Err(CniError::InvalidEnvArgs(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_add_passes_command_and_stdin() {
        let dir = TempDir::new().unwrap();
        // Echo the command and the stdin length back inside a result.
        script(
            &dir,
            "fake",
            r#"len=$(wc -c | tr -d ' ')
echo "{\"cniVersion\":\"1.0.0\",\"ips\":[{\"address\":\"10.1.0.5/24\",\"gateway\":\"10.1.0.1\"}],\"dns\":{\"domain\":\"$CNI_COMMAND-$CNI_IFNAME-$len\"}}""#,
        );

        let result = exec_add("fake", &args(&dir)).await.unwrap();
        assert_eq!(result.ips[0].address.to_string(), "10.1.0.5/24");
        assert_eq!(result.dns.domain, "ADD-net1-24");
    }

    #[tokio::test]
    async fn test_exec_add_error_document() {
        let dir = TempDir::new().unwrap();
        script(
            &dir,
            "fake",
            r#"echo '{"cniVersion":"1.0.0","code":11,"msg":"range exhausted"}'
exit 1"#,
        );

        let err = exec_add("fake", &args(&dir)).await.unwrap_err();
        assert!(matches!(
            err,
            CniError::IpamExec { code: 11, ref msg, .. } if msg == "range exhausted"
        ));
    }

    #[tokio::test]
    async fn test_exec_failure_without_document() {
        let dir = TempDir::new().unwrap();
        script(&dir, "fake", "exit 3");

        let err = exec_del("fake", &args(&dir)).await.unwrap_err();
        assert_eq!(err.code(), code::INTERNAL);
    }

    #[tokio::test]
    async fn test_exec_del() {
        let dir = TempDir::new().unwrap();
        script(&dir, "fake", r#"[ "$CNI_COMMAND" = "DEL" ] || exit 1"#);
        exec_del("fake", &args(&dir)).await.unwrap();
    }
}
