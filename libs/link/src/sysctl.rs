//! Sysctl access through `/proc/sys`.
//!
//! Keys use dotted notation (`net.ipv4.conf.eth0.proxy_arp`). Interface names
//! may themselves contain dots; inside a key those are written as `/`, which
//! is what the kernel expects once the key is turned back into a path.
//!
//! `/proc/sys/net` resolves against the namespace of the calling thread, so
//! per-interface writes for another namespace go through [`NetNs::run`].
//!
//! [`NetNs::run`]: crate::netns::NetNs::run

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LinkError;

const PROC_SYS: &str = "/proc/sys";

/// Key for a per-interface setting, e.g. `interface_key("ipv4", "eth0", "proxy_arp")`.
pub fn interface_key(family: &str, iface: &str, param: &str) -> String {
    format!("net.{family}.conf.{}.{param}", iface.replace('.', "/"))
}

/// Relative path of a dotted key below the sysctl root.
pub fn key_to_path(key: &str) -> PathBuf {
    let swapped: String = key
        .chars()
        .map(|c| match c {
            '.' => '/',
            '/' => '.',
            other => other,
        })
        .collect();
    PathBuf::from(swapped)
}

pub fn write(key: &str, value: &str) -> Result<(), LinkError> {
    write_in(Path::new(PROC_SYS), key, value)
}

pub fn read(key: &str) -> Result<String, LinkError> {
    read_in(Path::new(PROC_SYS), key)
}

/// Write `value` to `key` below an explicit root.
pub fn write_in(root: &Path, key: &str, value: &str) -> Result<(), LinkError> {
    fs::write(root.join(key_to_path(key)), value).map_err(|source| LinkError::Sysctl {
        key: key.to_string(),
        source,
    })
}

pub fn read_in(root: &Path, key: &str) -> Result<String, LinkError> {
    fs::read_to_string(root.join(key_to_path(key)))
        .map(|v| v.trim_end().to_string())
        .map_err(|source| LinkError::Sysctl {
            key: key.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ipv4", "eth0", "proxy_arp", "net.ipv4.conf.eth0.proxy_arp")]
    #[case("ipv4", "eth0.100", "arp_notify", "net.ipv4.conf.eth0/100.arp_notify")]
    #[case("ipv6", "bond0.2.3", "accept_ra", "net.ipv6.conf.bond0/2/3.accept_ra")]
    fn test_interface_key(
        #[case] family: &str,
        #[case] iface: &str,
        #[case] param: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(interface_key(family, iface, param), expected);
    }

    #[rstest]
    #[case("net.ipv4.conf.eth0.proxy_arp", "net/ipv4/conf/eth0/proxy_arp")]
    #[case("net.ipv4.conf.eth0/100.proxy_arp", "net/ipv4/conf/eth0.100/proxy_arp")]
    fn test_key_to_path(#[case] key: &str, #[case] expected: &str) {
        assert_eq!(key_to_path(key), PathBuf::from(expected));
    }

    #[test]
    fn test_write_and_read_below_root() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("net/ipv4/conf/eth0.100");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("proxy_arp"), "0\n").unwrap();

        let key = interface_key("ipv4", "eth0.100", "proxy_arp");
        assert_eq!(read_in(root.path(), &key).unwrap(), "0");
        write_in(root.path(), &key, "1").unwrap();
        assert_eq!(read_in(root.path(), &key).unwrap(), "1");
    }

    #[test]
    fn test_write_missing_key() {
        let root = tempfile::tempdir().unwrap();
        let err = write_in(root.path(), "net.ipv4.conf.nope.proxy_arp", "1").unwrap_err();
        assert!(matches!(err, LinkError::Sysctl { ref key, .. } if key == "net.ipv4.conf.nope.proxy_arp"));
    }
}
