//! Mapping between [`Interface`] records and libvirt `<interface>` elements.

use std::collections::BTreeMap;

use crate::bandwidth::{INBOUND, OUTBOUND, RateLimit, bandwidth_xml};
use crate::bridge::BridgeResolver;
use crate::device::{DeviceKind, FilterParameter, Interface, InterfaceConfig, InterfaceKind};
use crate::error::{Error, Result};
use crate::hostdev::PciAddress;
use crate::xml::Element;

const VFIO_DRIVER_NAME: &str = "vfio";

impl Interface {
    /// Build the libvirt `<interface>` element for this NIC.
    ///
    /// Bridge networks are looked up in `bridges`; OVS-backed networks get
    /// a `virtualport` and the network's VLAN tag.
    pub fn to_xml(&self, bridges: &dyn BridgeResolver) -> Element {
        let mut iface = Element::new("interface").with_attr("type", self.device_kind().as_str());

        if !self.address.is_empty() {
            let address = iface.append_child(Element::new("address"));
            for (key, value) in &self.address {
                address.set_attr(key, value);
            }
        }

        iface.append_child(Element::new("mac").with_attr("address", &self.mac_addr));

        if let Some(model) = &self.model {
            iface.append_child(Element::new("model").with_attr("type", model));
        }

        match &self.kind {
            InterfaceKind::Hostdev(nic) => {
                iface.set_attr("managed", "no");
                let mut address = Element::new("address").with_attr("type", "pci");
                for (key, value) in nic.host_address.xml_attributes() {
                    address.set_attr(key, value);
                }
                iface.append_child(Element::new("source").with_child(address));
                if let Some(vlan) = nic.vlan_id {
                    iface.append_child(vlan_xml(vlan));
                }
            }
            InterfaceKind::Bridge { network } => match bridges.ovs_bridge(network) {
                Some(ovs) => {
                    iface.append_child(Element::new("source").with_attr("bridge", ovs.name));
                    iface.append_child(
                        Element::new("virtualport").with_attr("type", "openvswitch"),
                    );
                    if let Some(vlan) = bridges.vlan_for_network(network) {
                        iface.append_child(vlan_xml(vlan));
                    }
                }
                None => {
                    iface.append_child(Element::new("source").with_attr("bridge", network));
                }
            },
        }

        if let Some(filter) = &self.filter {
            let filterref = iface.append_child(Element::new("filterref").with_attr("filter", filter));
            for param in &self.filter_parameters {
                if let (Some(name), Some(value)) = (&param.name, &param.value) {
                    filterref.append_child(
                        Element::new("parameter")
                            .with_attr("name", name)
                            .with_attr("value", value),
                    );
                }
            }
        }

        if let Some(active) = self.link_active {
            let state = if active { "up" } else { "down" };
            iface.append_child(Element::new("link").with_attr("state", state));
        }

        if let Some(order) = self.boot_order {
            iface.append_child(Element::new("boot").with_attr("order", order.to_string()));
        }

        if !self.driver.is_empty() {
            let driver = iface.append_child(Element::new("driver"));
            if let Some(name) = &self.driver.name {
                driver.set_attr("name", name);
            }
            if let Some(queues) = self.driver.queues {
                driver.set_attr("queues", queues.to_string());
            }
        } else if self.device_kind() == DeviceKind::Hostdev {
            iface.append_child(Element::new("driver").with_attr("name", VFIO_DRIVER_NAME));
        }

        if let Some(sndbuf) = &self.sndbuf {
            iface.append_child(
                Element::new("tune").with_child(Element::new("sndbuf").with_text(sndbuf)),
            );
        }

        if self.bandwidth.is_set() {
            iface.append_child(bandwidth_xml(&self.bandwidth, None));
        }

        iface
    }

    /// Whether a domain document lists an interface with exactly our MAC.
    pub fn is_attached_to(&self, domain_xml: &str) -> Result<bool> {
        let domain = Element::parse(domain_xml)?;
        Ok(domain
            .find_all("devices/interface/mac")
            .iter()
            .any(|mac| mac.attr("address") == Some(self.mac_addr.as_str())))
    }
}

fn vlan_xml(tag: u16) -> Element {
    Element::new("vlan").with_child(Element::new("tag").with_attr("id", tag.to_string()))
}

/// Guest address from the first direct `<address>` child.
pub(crate) fn guest_address(iface: &Element) -> BTreeMap<String, String> {
    iface
        .child("address")
        .map(|address| {
            address
                .attributes()
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Recover a stored configuration from a persisted `<interface>` element.
///
/// `network` overrides the bridge named by `source/@bridge`. Bridge
/// interfaces with neither are rejected.
pub fn config_from_xml(iface: &Element, network: Option<&str>) -> Result<InterfaceConfig> {
    if iface.name() != "interface" {
        return Err(Error::Configuration(format!(
            "expected <interface>, found <{}>",
            iface.name()
        )));
    }

    let device = match iface.attr("type") {
        Some(kind) => DeviceKind::parse(kind).ok_or_else(|| {
            Error::Configuration(format!("unsupported interface type {kind}"))
        })?,
        None => DeviceKind::Bridge,
    };

    let mac_addr = iface
        .find_attr("mac", "address")
        .ok_or_else(|| Error::Configuration("interface has no MAC address".to_string()))?
        .to_string();

    let mut config = InterfaceConfig {
        device,
        mac_addr,
        nic_model: iface.find_attr("model", "type").map(str::to_string),
        boot_order: iface
            .find_attr("boot", "order")
            .and_then(|order| order.trim().parse().ok()),
        alias: iface.find_attr("alias", "name").map(str::to_string),
        address: guest_address(iface),
        ..Default::default()
    };

    if let Some(filterref) = iface.find_first("filterref") {
        config.filter = filterref.attr("filter").map(str::to_string);
        config.filter_parameters = filterref
            .children_named("parameter")
            .map(|param| FilterParameter {
                name: param.attr("name").map(str::to_string),
                value: param.attr("value").map(str::to_string),
            })
            .collect();
    }

    if let Some(driver) = iface.find_first("driver") {
        config.custom.queues = driver.attr("queues").and_then(|q| q.trim().parse().ok());
    }

    if let Some(sndbuf) = iface.find_all("tune/sndbuf").first() {
        config.vm_custom.sndbuf = Some(sndbuf.text().unwrap_or_default().to_string());
    }

    if let Some(bandwidth) = iface.find_first("bandwidth") {
        let limits = &mut config.spec_params.bandwidth;
        limits.inbound = bandwidth.find_first(INBOUND).map(RateLimit::from_element);
        limits.outbound = bandwidth.find_first(OUTBOUND).map(RateLimit::from_element);
    }

    config.spec_params.vlanid = iface
        .find_all("vlan/tag")
        .first()
        .and_then(|tag| tag.attr("id"))
        .and_then(|id| id.trim().parse().ok());

    match device {
        DeviceKind::Bridge => {
            let network = network
                .filter(|n| !n.is_empty())
                .or_else(|| iface.find_attr("source", "bridge"))
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "could not detect the network to join for {}",
                        config.mac_addr
                    ))
                })?;
            config.network = Some(network.to_string());
        }
        DeviceKind::Hostdev => {
            let source = iface.child("source").and_then(|s| s.child("address"));
            if let Some(address) = source {
                config.hostdev = Some(host_address_from_xml(address)?.libvirt_name());
            }
        }
    }

    Ok(config)
}

fn host_address_from_xml(address: &Element) -> Result<PciAddress> {
    let field = |key: &str| address.attr(key).unwrap_or("0x0");
    PciAddress::from_bdf(&format!(
        "{}:{}:{}.{}",
        field("domain"),
        field("bus"),
        field("slot"),
        field("function")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::BandwidthSpec;
    use crate::bridge::{LinuxBridges, StaticBridge, StaticBridges};
    use crate::device::tests::{FakeHostdevs, bridge_config, hostdev_config};

    fn bridge_nic() -> Interface {
        let mut config = bridge_config("52:54:00:00:00:01", "br0");
        config.boot_order = Some(2);
        config.filter = Some("clean-traffic".to_string());
        config.filter_parameters = vec![
            FilterParameter::new("IP", "10.0.0.1"),
            FilterParameter {
                name: Some("CTRL_IP_LEARNING".to_string()),
                value: None,
            },
        ];
        config.custom.queues = Some(4);
        config.vm_custom.sndbuf = Some("0".to_string());
        config.spec_params.bandwidth = BandwidthSpec {
            inbound: Some(RateLimit::new().with("average", 1000).with("burst", 1024)),
            outbound: None,
        };
        Interface::new(config, &FakeHostdevs::default()).unwrap()
    }

    #[test]
    fn test_encode_bridge() {
        let xml = bridge_nic().to_xml(&LinuxBridges).to_xml_string().unwrap();
        assert_eq!(
            xml,
            concat!(
                r#"<interface type="bridge">"#,
                r#"<mac address="52:54:00:00:00:01"/>"#,
                r#"<model type="virtio"/>"#,
                r#"<source bridge="br0"/>"#,
                r#"<filterref filter="clean-traffic"><parameter name="IP" value="10.0.0.1"/></filterref>"#,
                r#"<boot order="2"/>"#,
                r#"<driver name="vhost" queues="4"/>"#,
                r#"<tune><sndbuf>0</sndbuf></tune>"#,
                r#"<bandwidth><inbound average="1000" burst="1024"/></bandwidth>"#,
                r#"</interface>"#,
            )
        );
    }

    #[test]
    fn test_encode_ovs_bridge() {
        let mut bridges = StaticBridges::default();
        bridges.insert(
            "br0",
            StaticBridge {
                bridge: "ovsbr0".to_string(),
                vlan: Some(42),
            },
        );

        let iface = bridge_nic().to_xml(&bridges);
        let sources: Vec<_> = iface.children_named("source").collect();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].attr("bridge"), Some("ovsbr0"));
        assert_eq!(iface.find_attr("virtualport", "type"), Some("openvswitch"));
        assert_eq!(iface.find_attr("tag", "id"), Some("42"));
    }

    #[test]
    fn test_encode_link_state_only_when_set() {
        let mut nic = bridge_nic();
        assert!(nic.to_xml(&LinuxBridges).child("link").is_none());

        nic.link_active = Some(false);
        assert_eq!(nic.to_xml(&LinuxBridges).find_attr("link", "state"), Some("down"));
        nic.link_active = Some(true);
        assert_eq!(nic.to_xml(&LinuxBridges).find_attr("link", "state"), Some("up"));
    }

    #[test]
    fn test_encode_guest_address_first() {
        let mut nic = bridge_nic();
        nic.address.insert("type".to_string(), "pci".to_string());
        nic.address.insert("slot".to_string(), "0x03".to_string());

        let iface = nic.to_xml(&LinuxBridges);
        assert_eq!(iface.children()[0].name(), "address");
        assert_eq!(iface.children()[0].attr("slot"), Some("0x03"));
    }

    #[test]
    fn test_encode_hostdev() {
        let mut config = hostdev_config("52:54:00:00:00:02");
        config.spec_params.vlanid = Some(7);
        let nic = Interface::new(config, &FakeHostdevs::default()).unwrap();

        let xml = nic.to_xml(&LinuxBridges).to_xml_string().unwrap();
        assert_eq!(
            xml,
            concat!(
                r#"<interface type="hostdev" managed="no">"#,
                r#"<mac address="52:54:00:00:00:02"/>"#,
                r#"<source><address type="pci" domain="0x0000" bus="0x00" slot="0x07" function="0x0"/></source>"#,
                r#"<vlan><tag id="7"/></vlan>"#,
                r#"<driver name="vfio"/>"#,
                r#"</interface>"#,
            )
        );
    }

    #[test]
    fn test_is_attached_to() {
        let nic = bridge_nic();
        let domain = r#"<domain><devices><interface type="bridge"><mac address="52:54:00:00:00:01"/></interface></devices></domain>"#;
        assert!(nic.is_attached_to(domain).unwrap());

        let upper = domain.replace("52:54:00:00:00:01", "52:54:00:00:00:0A");
        assert!(!nic.is_attached_to(&upper).unwrap());
        assert!(nic.is_attached_to("<domain").is_err());
    }

    #[test]
    fn test_config_from_xml() {
        let iface = Element::parse(
            r#"<interface type="bridge">
                 <address type="pci" domain="0x0000" bus="0x00" slot="0x03" function="0x0"/>
                 <mac address="52:54:00:00:00:01"/>
                 <model type="virtio"/>
                 <source bridge="br0"/>
                 <filterref filter="clean-traffic"><parameter name="IP" value="10.0.0.1"/></filterref>
                 <boot order="1"/>
                 <driver name="vhost" queues="2"/>
                 <tune><sndbuf>1024</sndbuf></tune>
                 <bandwidth><outbound average="10" peak="20"/></bandwidth>
                 <alias name="net0"/>
               </interface>"#,
        )
        .unwrap();

        let config = config_from_xml(&iface, None).unwrap();
        assert_eq!(config.device, DeviceKind::Bridge);
        assert_eq!(config.network.as_deref(), Some("br0"));
        assert_eq!(config.boot_order, Some(1));
        assert_eq!(config.custom.queues, Some(2));
        assert_eq!(config.vm_custom.sndbuf.as_deref(), Some("1024"));
        assert_eq!(config.filter_parameters, vec![FilterParameter::new("IP", "10.0.0.1")]);
        assert_eq!(config.spec_params.bandwidth.inbound, None);
        assert_eq!(
            config.spec_params.bandwidth.outbound,
            Some(RateLimit::new().with("average", 10).with("peak", 20))
        );
        assert_eq!(config.address["slot"], "0x03");
        assert_eq!(config.alias.as_deref(), Some("net0"));

        let overridden = config_from_xml(&iface, Some("red")).unwrap();
        assert_eq!(overridden.network.as_deref(), Some("red"));
    }

    #[test]
    fn test_config_from_xml_requires_network() {
        let iface = Element::parse(
            r#"<interface type="bridge"><mac address="52:54:00:00:00:01"/></interface>"#,
        )
        .unwrap();
        assert!(matches!(
            config_from_xml(&iface, None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_hostdev_xml_roundtrip_keeps_device() {
        let nic = Interface::new(hostdev_config("52:54:00:00:00:02"), &FakeHostdevs::default())
            .unwrap();
        let config = config_from_xml(&nic.to_xml(&LinuxBridges), None).unwrap();
        assert_eq!(config.device, DeviceKind::Hostdev);
        assert_eq!(config.hostdev.as_deref(), Some("pci_0000_00_07_0"));
    }

    #[test]
    fn test_stored_bandwidth_keeps_unknown_attributes() {
        let iface = Element::parse(
            r#"<interface type="bridge">
                 <mac address="52:54:00:00:00:01"/>
                 <source bridge="br0"/>
                 <bandwidth><inbound average="1000" floor="200"/></bandwidth>
               </interface>"#,
        )
        .unwrap();

        let config = config_from_xml(&iface, None).unwrap();
        let nic = Interface::new(config, &FakeHostdevs::default()).unwrap();
        let encoded = nic.to_xml(&LinuxBridges);

        assert_eq!(
            encoded.child("bandwidth").unwrap().to_xml_string().unwrap(),
            r#"<bandwidth><inbound average="1000" floor="200"/></bandwidth>"#
        );
    }
}
