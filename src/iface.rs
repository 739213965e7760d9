//! Interface Binding and Address Mode.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// The closed set of address families this crate discovers/announces on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Ipv4,
    Ipv6LinkLocal,
}

impl AddressMode {
    /// The SSDP multicast group address for this family.
    pub fn group_addr(&self) -> IpAddr {
        match self {
            AddressMode::Ipv4 => IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)),
            AddressMode::Ipv6LinkLocal => {
                IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c))
            }
        }
    }

    /// The SSDP multicast group socket address (group + port 1900).
    pub fn group_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group_addr(), 1900)
    }

    /// Display form used in the `HOST` header (`"239.255.255.250:1900"` or
    /// `"[FF02::C]:1900"`).
    pub fn display_string(&self) -> String {
        match self {
            AddressMode::Ipv4 => "239.255.255.250:1900".to_string(),
            AddressMode::Ipv6LinkLocal => "[FF02::C]:1900".to_string(),
        }
    }

    /// True iff `addr` belongs to this address family (and, for IPv6, is
    /// link-local).
    fn accepts(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (AddressMode::Ipv4, IpAddr::V4(_)) => true,
            (AddressMode::Ipv6LinkLocal, IpAddr::V6(v6)) => is_unicast_link_local(v6),
            _ => false,
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressMode::Ipv4 => write!(f, "ipv4"),
            AddressMode::Ipv6LinkLocal => write!(f, "ipv6-link-local"),
        }
    }
}

fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// A (network interface, interface address, address mode) triple.
#[derive(Debug, Clone)]
pub struct InterfaceBinding {
    pub interface_name: String,
    pub address: IpAddr,
    pub mode: AddressMode,
    /// CIDR prefix length of `address` on this interface, used by the
    /// valid-segment check.
    pub prefix_len: u8,
}

impl InterfaceBinding {
    /// Build the binding for `interface_name`/`mode` by picking the first
    /// matching address (first IPv4, or first link-local IPv6) reported by
    /// the OS. Fails with [`Error::NoSuitableAddress`] if the interface has
    /// none.
    pub fn resolve(interface_name: &str, mode: AddressMode) -> Result<Self> {
        let interfaces = if_addrs::get_if_addrs().map_err(Error::Io)?;

        interfaces
            .into_iter()
            .find(|i| i.name == interface_name && mode.accepts(&i.ip()))
            .map(|i| InterfaceBinding {
                interface_name: i.name.clone(),
                address: i.ip(),
                mode,
                prefix_len: prefix_len_of(&i),
            })
            .ok_or(Error::NoSuitableAddress)
    }

    /// Enumerate one binding per (interface, mode) pair that has a
    /// suitable address, across every local interface.
    pub fn all() -> Result<Vec<Self>> {
        let interfaces = if_addrs::get_if_addrs().map_err(Error::Io)?;
        let mut bindings = Vec::new();

        for mode in [AddressMode::Ipv4, AddressMode::Ipv6LinkLocal] {
            let mut seen_ifaces = std::collections::HashSet::new();
            for i in &interfaces {
                if i.is_loopback() {
                    continue;
                }
                if !mode.accepts(&i.ip()) {
                    continue;
                }
                if !seen_ifaces.insert(i.name.clone()) {
                    continue;
                }
                bindings.push(InterfaceBinding {
                    interface_name: i.name.clone(),
                    address: i.ip(),
                    mode,
                    prefix_len: prefix_len_of(i),
                });
            }
        }

        Ok(bindings)
    }

    /// True iff `source` shares the first `prefix_len` bits with this
    /// binding's address.
    pub fn shares_segment(&self, source: &IpAddr) -> bool {
        match (self.address, source) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let net = ipnet::Ipv4Net::new(a, self.prefix_len.min(32))
                    .map(|n| n.trunc());
                match net {
                    Ok(net) => net.contains(b),
                    Err(_) => a == *b,
                }
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let net = ipnet::Ipv6Net::new(a, self.prefix_len.min(128))
                    .map(|n| n.trunc());
                match net {
                    Ok(net) => net.contains(b),
                    Err(_) => a == *b,
                }
            }
            _ => false,
        }
    }
}

fn prefix_len_of(iface: &if_addrs::Interface) -> u8 {
    match &iface.addr {
        if_addrs::IfAddr::V4(v4) => netmask_to_prefix_len(IpAddr::V4(v4.netmask)),
        if_addrs::IfAddr::V6(v6) => netmask_to_prefix_len(IpAddr::V6(v6.netmask)),
    }
}

fn netmask_to_prefix_len(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(m) => u32::from(m).count_ones() as u8,
        IpAddr::V6(m) => u128::from(m).count_ones() as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_addresses_match_spec() {
        assert_eq!(
            AddressMode::Ipv4.group_socket_addr().to_string(),
            "239.255.255.250:1900"
        );
        assert_eq!(AddressMode::Ipv4.display_string(), "239.255.255.250:1900");
        assert_eq!(AddressMode::Ipv6LinkLocal.display_string(), "[FF02::C]:1900");
    }

    #[test]
    fn ipv6_mode_rejects_non_link_local() {
        let global: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(!AddressMode::Ipv6LinkLocal.accepts(&global));
        let link_local: IpAddr = "fe80::1".parse().unwrap();
        assert!(AddressMode::Ipv6LinkLocal.accepts(&link_local));
    }

    #[test]
    fn ipv4_mode_rejects_ipv6() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert!(!AddressMode::Ipv4.accepts(&v6));
    }

    #[test]
    fn shares_segment_same_subnet() {
        let binding = InterfaceBinding {
            interface_name: "eth0".into(),
            address: "192.168.1.10".parse().unwrap(),
            mode: AddressMode::Ipv4,
            prefix_len: 24,
        };
        let src: IpAddr = "192.168.1.55".parse().unwrap();
        assert!(binding.shares_segment(&src));

        let other: IpAddr = "192.168.2.55".parse().unwrap();
        assert!(!binding.shares_segment(&other));
    }

    #[test]
    fn shares_segment_different_family_is_false() {
        let binding = InterfaceBinding {
            interface_name: "eth0".into(),
            address: "192.168.1.10".parse().unwrap(),
            mode: AddressMode::Ipv4,
            prefix_len: 24,
        };
        let src: IpAddr = "fe80::1".parse().unwrap();
        assert!(!binding.shares_segment(&src));
    }
}
