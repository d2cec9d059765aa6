//! Bridge resolution for bridge-type interfaces.
//!
//! A network name normally is the name of a Linux bridge. Networks backed by
//! Open vSwitch are fake bridges: the guest port has to be plugged into the
//! parent OVS bridge with a `virtualport` element, and tagged with the
//! network's VLAN.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Prefix of libvirt networks that wrap one of our bridges.
pub const LIBVIRT_NETWORK_PREFIX: &str = "mvirt-";

/// An OVS bridge a network is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvsBridge {
    pub name: String,
}

/// Looks up how a network is realised on this host.
pub trait BridgeResolver {
    /// The OVS bridge backing `network`, or `None` for a Linux bridge.
    fn ovs_bridge(&self, network: &str) -> Option<OvsBridge>;

    /// VLAN tag of an OVS-backed network.
    fn vlan_for_network(&self, network: &str) -> Option<u16>;
}

/// Map a libvirt network name to the bridge it wraps.
pub fn libvirt_network_to_bridge(name: &str) -> String {
    name.strip_prefix(LIBVIRT_NETWORK_PREFIX)
        .unwrap_or(name)
        .to_string()
}

/// Every network is a plain Linux bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxBridges;

impl BridgeResolver for LinuxBridges {
    fn ovs_bridge(&self, _network: &str) -> Option<OvsBridge> {
        None
    }

    fn vlan_for_network(&self, _network: &str) -> Option<u16> {
        None
    }
}

/// One entry of a static bridge map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBridge {
    pub bridge: String,
    #[serde(default)]
    pub vlan: Option<u16>,
}

/// OVS networks declared up front, e.g. from a JSON file:
///
/// ```json
/// { "mgmt": { "bridge": "ovsbr0", "vlan": 100 } }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticBridges {
    networks: HashMap<String, StaticBridge>,
}

impl StaticBridges {
    pub fn new(networks: HashMap<String, StaticBridge>) -> Self {
        Self { networks }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json(&json)
    }

    pub fn insert(&mut self, network: impl Into<String>, bridge: StaticBridge) {
        self.networks.insert(network.into(), bridge);
    }
}

impl BridgeResolver for StaticBridges {
    fn ovs_bridge(&self, network: &str) -> Option<OvsBridge> {
        self.networks.get(network).map(|b| OvsBridge {
            name: b.bridge.clone(),
        })
    }

    fn vlan_for_network(&self, network: &str) -> Option<u16> {
        self.networks.get(network).and_then(|b| b.vlan)
    }
}

/// Query the local Open vSwitch database through `ovs-vsctl`.
///
/// Any failure to run the tool is treated as "not an OVS network".
#[derive(Debug, Clone)]
pub struct OvsVsctl {
    binary: PathBuf,
}

impl Default for OvsVsctl {
    fn default() -> Self {
        Self::new("ovs-vsctl")
    }
}

impl OvsVsctl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn query(&self, args: &[&str]) -> Option<String> {
        let output = match Command::new(&self.binary).args(args).output() {
            Ok(output) => output,
            Err(e) => {
                debug!(binary = %self.binary.display(), error = %e, "Failed to run ovs-vsctl");
                return None;
            }
        };
        if !output.status.success() {
            // br-exists exits with 2 for unknown bridges
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn is_ovs_network(&self, network: &str) -> bool {
        self.query(&["br-exists", network]).is_some()
    }
}

impl BridgeResolver for OvsVsctl {
    fn ovs_bridge(&self, network: &str) -> Option<OvsBridge> {
        if !self.is_ovs_network(network) {
            return None;
        }
        let parent = self
            .query(&["br-to-parent", network])
            .filter(|p| !p.is_empty())?;
        debug!(network = %network, bridge = %parent, "Resolved OVS bridge");
        Some(OvsBridge { name: parent })
    }

    fn vlan_for_network(&self, network: &str) -> Option<u16> {
        if !self.is_ovs_network(network) {
            return None;
        }
        self.query(&["br-to-vlan", network])
            .and_then(|out| parse_vlan(&out))
    }
}

/// `br-to-vlan` prints 0 for untagged bridges.
fn parse_vlan(output: &str) -> Option<u16> {
    output.trim().parse::<u16>().ok().filter(|tag| *tag != 0)
}
