//! ADD/DEL against real namespaces. These need CAP_NET_ADMIN and
//! CAP_SYS_ADMIN.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use macvtap_cni::{CmdArgs, Provisioner};
use macvtap_link::{LinkManager, MacvtapManager, MacvtapMode};
use macvtap_testing::TestNetNs;
use tempfile::TempDir;

struct Fixture {
    host: TestNetNs,
    sandbox: TestNetNs,
    provisioner: Provisioner,
}

async fn fixture(device: &str) -> Fixture {
    let host = TestNetNs::new().unwrap();
    host.add_dummy("eth0").await.unwrap();
    MacvtapManager::new(host.netns().unwrap())
        .create(device, "eth0", MacvtapMode::Bridge)
        .await
        .unwrap();
    let provisioner = Provisioner::new(host.netns().unwrap());
    Fixture {
        host,
        sandbox: TestNetNs::new().unwrap(),
        provisioner,
    }
}

fn args(sandbox: &TestNetNs, stdin: &str) -> CmdArgs {
    CmdArgs {
        container_id: "abc".into(),
        netns: sandbox.path().display().to_string(),
        ifname: "net1".into(),
        args: String::new(),
        path: Vec::new(),
        stdin: stdin.as_bytes().to_vec(),
    }
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn add_then_del_twice() {
    let f = fixture("dev500").await;
    let args = args(&f.sandbox, r#"{"cniVersion":"0.3.1","deviceID":"dev500","mtu":1000}"#);

    let result = f.provisioner.cmd_add(&args).await.unwrap();
    assert_eq!(result.cni_version, "0.3.1");
    assert_eq!(result.interfaces[0].name, "net1");
    assert!(result.interfaces[0].mac.is_some());
    assert!(result.ips.is_empty());

    let link = f.sandbox.link("net1").await.unwrap().unwrap();
    assert_eq!(link.mtu, Some(1000));
    assert_eq!(
        result.interfaces[0].mac,
        link.mac.map(|m| m.to_string())
    );
    assert_eq!(f.host.link_index("dev500").await.unwrap(), None);

    f.provisioner.cmd_del(&args).await.unwrap();
    assert_eq!(f.sandbox.link_index("net1").await.unwrap(), None);

    f.provisioner.cmd_del(&args).await.unwrap();
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn add_with_mac_from_args() {
    let f = fixture("dev501").await;
    let mut args = args(&f.sandbox, r#"{"deviceID":"dev501"}"#);
    args.args = "IgnoreUnknown=1;K8S_POD_NAME=vm;MAC=02:00:00:00:05:01".into();

    let result = f.provisioner.cmd_add(&args).await.unwrap();
    assert_eq!(result.interfaces[0].mac.as_deref(), Some("02:00:00:00:05:01"));
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn failed_add_leaves_nothing_behind() {
    let f = fixture("dev502").await;
    // Larger than the lower device allows.
    let args = args(&f.sandbox, r#"{"deviceID":"dev502","mtu":65000}"#);

    f.provisioner.cmd_add(&args).await.unwrap_err();

    assert_eq!(f.host.link_index("dev502").await.unwrap(), None);
    assert_eq!(f.sandbox.link_index("dev502").await.unwrap(), None);
    assert_eq!(f.sandbox.link_index("net1").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn add_applies_ipam_addresses() {
    let f = fixture("dev503").await;
    let dir = TempDir::new().unwrap();
    let plugin = dir.path().join("fake-ipam");
    fs::write(
        &plugin,
        r#"#!/bin/sh
echo '{"cniVersion":"0.4.0","ips":[{"version":"4","address":"10.1.0.5/24","gateway":"10.1.0.1"}],"routes":[{"dst":"10.2.0.0/16"}]}'
"#,
    )
    .unwrap();
    fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();

    let mut args = args(
        &f.sandbox,
        r#"{"cniVersion":"1.0.0","deviceID":"dev503","ipam":{"type":"fake-ipam"}}"#,
    );
    args.path = vec![dir.path().to_path_buf()];

    let result = f.provisioner.cmd_add(&args).await.unwrap();
    assert_eq!(result.ips.len(), 1);
    assert_eq!(result.ips[0].version, None);
    assert_eq!(result.ips[0].interface, Some(0));
    assert_eq!(result.routes[0].dst.to_string(), "10.2.0.0/16");
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn add_fails_without_ipam_address() {
    let f = fixture("dev504").await;
    let dir = TempDir::new().unwrap();
    let released = dir.path().join("released");
    let plugin = dir.path().join("fake-ipam");
    fs::write(
        &plugin,
        format!(
            r#"#!/bin/sh
if [ "$CNI_COMMAND" = "DEL" ]; then touch {}; exit 0; fi
echo '{{"cniVersion":"1.0.0","ips":[]}}'
"#,
            released.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();

    let mut args = args(
        &f.sandbox,
        r#"{"deviceID":"dev504","ipam":{"type":"fake-ipam"}}"#,
    );
    args.path = vec![dir.path().to_path_buf()];

    let err = f.provisioner.cmd_add(&args).await.unwrap_err();
    assert!(matches!(err, macvtap_cni::CniError::IpamNoAddress));
    assert!(released.exists());
}
