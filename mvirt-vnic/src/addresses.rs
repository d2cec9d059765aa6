//! Host address reporting helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};

/// One address configured on a host device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub label: String,
    /// Address with its prefix length, e.g. `10.0.0.5/24`.
    pub address: IpNet,
    /// Secondary addresses are never reported as the main IPv4 address.
    pub primary: bool,
}

impl AddressEntry {
    pub fn new(label: impl Into<String>, address: IpNet, primary: bool) -> Self {
        Self {
            label: label.into(),
            address,
            primary,
        }
    }
}

/// Addresses of one device as reported to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub ipv4addr: Option<Ipv4Addr>,
    pub ipv4netmask: Option<Ipv4Addr>,
    pub ipv4addrs: Vec<Ipv4Net>,
    pub ipv6addrs: Vec<Ipv6Net>,
}

/// Collect the addresses of `dev`.
///
/// With several primary IPv4 addresses, the one sharing a subnet with
/// `ipv4_gateway` is reported. Otherwise the first IPv4 address is.
pub fn ip_info(dev: &str, addrs: &[AddressEntry], ipv4_gateway: Option<Ipv4Addr>) -> IpInfo {
    let mut info = IpInfo::default();

    for entry in addrs.iter().filter(|a| a.label == dev) {
        match entry.address {
            IpNet::V4(net) => {
                info.ipv4addrs.push(net);
                if info.ipv4addr.is_none()
                    && entry.primary
                    && let Some(gateway) = ipv4_gateway
                    && net.contains(&gateway)
                {
                    info.ipv4addr = Some(net.addr());
                    info.ipv4netmask = Some(net.netmask());
                }
            }
            IpNet::V6(net) => info.ipv6addrs.push(net),
        }
    }

    // No address in the gateway subnet is fine if another route reaches it.
    if info.ipv4addr.is_none()
        && let Some(first) = info.ipv4addrs.first()
    {
        info.ipv4addr = Some(first.addr());
        info.ipv4netmask = Some(first.netmask());
    }
    info
}

/// Dotted netmask for an IPv4 prefix length.
pub fn prefix_to_netmask(prefix: u8) -> Result<Ipv4Addr> {
    let net = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, prefix).map_err(|_| Error::InvalidPrefix(prefix))?;
    Ok(net.netmask())
}

/// IPv4-mapped IPv6 form (`::ffff:a.b.c.d`).
pub fn ipv4_to_mapped(ip: Ipv4Addr) -> Ipv6Addr {
    ip.to_ipv6_mapped()
}

/// Label of the device carrying `ip`. IPv4 addresses also match their
/// IPv4-mapped IPv6 form.
pub fn device_by_ip(ip: IpAddr, addrs: &[AddressEntry]) -> Option<&str> {
    addrs
        .iter()
        .find(|entry| match entry.address.addr() {
            IpAddr::V4(v4) => ip == IpAddr::V4(v4) || ip == IpAddr::V6(ipv4_to_mapped(v4)),
            IpAddr::V6(v6) => ip == IpAddr::V6(v6),
        })
        .map(|entry| entry.label.as_str())
}
