//! Kernel link classification.

use std::fmt;
use std::str::FromStr;

use rtnetlink::packet_route::link::{
    InfoKind, LinkAttribute, LinkFlags, LinkInfo as NlLinkInfo, LinkMessage,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Build from a raw attribute payload; anything but 6 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error returned when a MAC address string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut octets = [0u8; 6];
        let mut parts = s.split(sep);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Link type as reported by the kernel's `IFLA_INFO_KIND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// No kind reported: a physical NIC (or loopback).
    Device,
    Bond,
    Bridge,
    Macvtap,
    Dummy,
    Other(String),
}

impl From<&InfoKind> for LinkKind {
    fn from(kind: &InfoKind) -> Self {
        match kind {
            InfoKind::Bond => LinkKind::Bond,
            InfoKind::Bridge => LinkKind::Bridge,
            InfoKind::MacVtap => LinkKind::Macvtap,
            InfoKind::Dummy => LinkKind::Dummy,
            InfoKind::Other(name) => LinkKind::Other(name.clone()),
            other => LinkKind::Other(format!("{other:?}").to_lowercase()),
        }
    }
}

/// The parts of a kernel link message this crate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub loopback: bool,
    /// Index of the bond or bridge this link is enslaved to.
    pub controller: Option<u32>,
    pub mac: Option<MacAddr>,
    pub mtu: Option<u32>,
    pub tx_queue_len: Option<u32>,
}

impl LinkInfo {
    /// Plain device with the given index and name.
    pub fn device(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            kind: LinkKind::Device,
            loopback: false,
            controller: None,
            mac: None,
            mtu: None,
            tx_queue_len: None,
        }
    }

    pub fn with_kind(mut self, kind: LinkKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_controller(mut self, controller: Option<u32>) -> Self {
        self.controller = controller;
        self
    }

    pub fn from_message(msg: &LinkMessage) -> Self {
        let mut info = Self::device(msg.header.index, String::new());
        info.loopback = msg.header.flags.contains(LinkFlags::Loopback);

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => info.name = name.clone(),
                LinkAttribute::Address(bytes) => info.mac = MacAddr::from_bytes(bytes),
                LinkAttribute::Controller(idx) => info.controller = Some(*idx),
                LinkAttribute::Mtu(mtu) => info.mtu = Some(*mtu),
                LinkAttribute::TxQueueLen(len) => info.tx_queue_len = Some(*len),
                LinkAttribute::LinkInfo(infos) => {
                    for nl in infos {
                        if let NlLinkInfo::Kind(kind) = nl {
                            info.kind = LinkKind::from(kind);
                        }
                    }
                }
                _ => {}
            }
        }
        info
    }

    /// Non-loopback bond or plain device: the link types that can parent a
    /// macvtap child.
    pub fn is_macvtap_parent_kind(&self) -> bool {
        !self.loopback && matches!(self.kind, LinkKind::Bond | LinkKind::Device)
    }

    /// Whether a macvtap child can be parented to this link right now.
    ///
    /// On top of the type check, the link must not be enslaved to another bond
    /// or bridge.
    pub fn is_suitable_macvtap_parent(&self) -> bool {
        self.is_macvtap_parent_kind() && self.controller.is_none()
    }
}

/// Filter applied to link notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPredicate {
    /// Exact interface name.
    Named(String),
    /// Links of a type that can parent macvtap children. Enslaved links
    /// still match, so that being enslaved or released is noticed.
    SuitableMacvtapParent,
}

impl LinkPredicate {
    pub fn matches(&self, link: &LinkInfo) -> bool {
        match self {
            LinkPredicate::Named(name) => link.name == *name,
            LinkPredicate::SuitableMacvtapParent => link.is_macvtap_parent_kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn message(index: u32, name: &str) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg
    }

    #[test]
    fn test_from_message_plain_device() {
        let mut msg = message(2, "eth0");
        msg.attributes
            .push(LinkAttribute::Address(vec![0x02, 0, 0, 0, 0, 0x01]));
        msg.attributes.push(LinkAttribute::TxQueueLen(1000));

        let info = LinkInfo::from_message(&msg);
        assert_eq!(info.index, 2);
        assert_eq!(info.name, "eth0");
        assert_eq!(info.kind, LinkKind::Device);
        assert_eq!(info.tx_queue_len, Some(1000));
        assert_eq!(info.mac.unwrap().to_string(), "02:00:00:00:00:01");
        assert!(info.is_suitable_macvtap_parent());
    }

    #[test]
    fn test_from_message_loopback() {
        let mut msg = message(1, "lo");
        msg.header.flags = LinkFlags::Loopback | LinkFlags::Up;
        let info = LinkInfo::from_message(&msg);
        assert!(info.loopback);
        assert!(!info.is_suitable_macvtap_parent());
    }

    #[test]
    fn test_from_message_enslaved_bond() {
        let mut msg = message(5, "bond0");
        msg.attributes
            .push(LinkAttribute::LinkInfo(vec![NlLinkInfo::Kind(InfoKind::Bond)]));
        let info = LinkInfo::from_message(&msg);
        assert_eq!(info.kind, LinkKind::Bond);
        assert!(info.is_suitable_macvtap_parent());

        msg.attributes.push(LinkAttribute::Controller(9));
        let info = LinkInfo::from_message(&msg);
        assert_eq!(info.controller, Some(9));
        assert!(!info.is_suitable_macvtap_parent());
        // Still reported, so a rescan notices it went away.
        assert!(LinkPredicate::SuitableMacvtapParent.matches(&info));
    }

    #[rstest]
    #[case(LinkKind::Device, true)]
    #[case(LinkKind::Bond, true)]
    #[case(LinkKind::Bridge, false)]
    #[case(LinkKind::Macvtap, false)]
    #[case(LinkKind::Dummy, false)]
    #[case(LinkKind::Other("vlan".into()), false)]
    fn test_suitability_by_kind(#[case] kind: LinkKind, #[case] suitable: bool) {
        let link = LinkInfo::device(3, "x").with_kind(kind);
        assert_eq!(link.is_suitable_macvtap_parent(), suitable);
        assert_eq!(LinkPredicate::SuitableMacvtapParent.matches(&link), suitable);
    }

    #[test]
    fn test_named_predicate() {
        let pred = LinkPredicate::Named("eth0".into());
        assert!(pred.matches(&LinkInfo::device(2, "eth0")));
        assert!(!pred.matches(&LinkInfo::device(3, "eth01")));
    }

    #[rstest]
    #[case("0a:58:0a:f4:00:05", Some([0x0a, 0x58, 0x0a, 0xf4, 0x00, 0x05]))]
    #[case("0A-58-0A-F4-00-05", Some([0x0a, 0x58, 0x0a, 0xf4, 0x00, 0x05]))]
    #[case("0a:58:0a:f4:00", None)]
    #[case("0a:58:0a:f4:00:05:06", None)]
    #[case("zz:58:0a:f4:00:05", None)]
    fn test_parse_mac(#[case] input: &str, #[case] expected: Option<[u8; 6]>) {
        assert_eq!(input.parse::<MacAddr>().ok().map(|m| m.octets()), expected);
    }

    #[test]
    fn test_mac_serde() {
        let mac: MacAddr = serde_json::from_str("\"02:00:00:00:00:0a\"").unwrap();
        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"02:00:00:00:00:0a\"");
    }
}
