//! Reconcile NIC records with the live domain XML reported by libvirt.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::bridge::libvirt_network_to_bridge;
use crate::device::{DriverOptions, Interface};
use crate::error::Result;
use crate::interface_xml::guest_address;
use crate::xml::Element;

/// Model reported for passthrough NICs.
pub const PASSTHROUGH_MODEL: &str = "passthrough";

/// A live interface no record knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredNic {
    /// libvirt interface type as reported (`bridge`, `hostdev`, `network`, ...).
    pub device: String,
    pub mac_addr: String,
    pub nic_model: Option<String>,
    pub address: BTreeMap<String, String>,
    pub alias: Option<String>,
    pub name: Option<String>,
    pub link_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug)]
struct LiveInterface {
    device: String,
    mac_addr: String,
    model: Option<String>,
    alias: Option<String>,
    name: Option<String>,
    link_active: bool,
    network: Option<String>,
    address: BTreeMap<String, String>,
    driver: Option<DriverOptions>,
}

impl LiveInterface {
    fn read(iface: &Element) -> Option<Self> {
        let mac_addr = iface.find_attr("mac", "address")?.to_string();
        let device = iface.attr("type").unwrap_or_default().to_string();
        let alias = iface.find_attr("alias", "name").map(str::to_string);

        let (name, model) = if device == "hostdev" {
            (alias.clone(), Some(PASSTHROUGH_MODEL.to_string()))
        } else {
            (
                iface.find_attr("target", "dev").map(str::to_string),
                iface.find_attr("model", "type").map(str::to_string),
            )
        };

        let network = iface.find_first("source").and_then(|source| {
            match source.attr("bridge").filter(|b| !b.is_empty()) {
                Some(bridge) => Some(bridge.to_string()),
                None => source.attr("network").map(libvirt_network_to_bridge),
            }
        });

        let driver = iface.find_first("driver").map(|driver| DriverOptions {
            name: driver.attr("name").map(str::to_string),
            queues: driver.attr("queues").and_then(|q| q.trim().parse().ok()),
        });

        Some(Self {
            device,
            mac_addr,
            model,
            alias,
            name,
            link_active: iface.find_attr("link", "state") != Some("down"),
            network,
            address: guest_address(iface),
            driver,
        })
    }
}

/// Copy runtime facts from `domain_xml` into the matching records.
///
/// Records are matched by MAC, ignoring case. Interfaces with no matching
/// record are returned for the caller to add. Unparsable XML is an error;
/// anything else unexpected just fails to match.
pub fn update_device_info(domain_xml: &str, nics: &mut [Interface]) -> Result<Vec<DiscoveredNic>> {
    let domain = Element::parse(domain_xml)?;
    let mut discovered = Vec::new();

    for element in domain.find_all("devices/interface") {
        let Some(live) = LiveInterface::read(element) else {
            debug!("Skipping interface without MAC address");
            continue;
        };

        let mut known = false;
        for nic in nics.iter_mut().filter(|nic| nic.matches_mac(&live.mac_addr)) {
            nic.name = live.name.clone();
            nic.alias = live.alias.clone();
            nic.address = live.address.clone();
            nic.link_active = Some(live.link_active);
            if let Some(driver) = &live.driver {
                nic.driver = driver.clone();
            }
            debug!(mac = %nic.mac_addr, name = ?nic.name, "Updated interface from domain XML");
            known = true;
        }

        if !known {
            info!(mac = %live.mac_addr, device = %live.device, "Found unknown interface in domain XML");
            discovered.push(DiscoveredNic {
                device: live.device,
                mac_addr: live.mac_addr,
                nic_model: live.model,
                address: live.address,
                alias: live.alias,
                name: live.name,
                link_active: live.link_active,
                network: live.network,
            });
        }
    }

    Ok(discovered)
}
