//! Virtual NIC device records.
//!
//! [`InterfaceConfig`] is the flat form the engine stores and sends us.
//! [`Interface`] is the validated record: the backing (bridge network or
//! host PCI device) is a closed variant, and driver options are derived
//! once at construction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info, warn};

use crate::bandwidth::BandwidthSpec;
use crate::error::{Error, Result};
use crate::hostdev::{HostdevLifecycle, PciAddress};

/// Network joined by interfaces configured without one.
pub const DUMMY_BRIDGE: &str = ";mvirtdummy;";

/// Canonical name for the paravirtual NIC model.
pub const VIRTIO_MODEL: &str = "virtio";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Bridge,
    Hostdev,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Bridge => "bridge",
            DeviceKind::Hostdev => "hostdev",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bridge" => Some(DeviceKind::Bridge),
            "hostdev" => Some(DeviceKind::Hostdev),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `<filterref>` parameter. Entries missing either half are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParameter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl FilterParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value.into()),
        }
    }
}

/// Attributes of the `<driver>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queues: Option<u32>,
}

impl DriverOptions {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.queues.is_none()
    }
}

/// Packet processing backend for virtio NICs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhostBackend {
    /// In-kernel vhost-net.
    Vhost,
    /// Userspace emulation inside QEMU.
    Qemu,
}

impl VhostBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            VhostBackend::Vhost => "vhost",
            VhostBackend::Qemu => "qemu",
        }
    }
}

/// Parse a per-network vhost override list such as `br0:true,br1:false`.
///
/// Malformed entries are logged and skipped.
pub fn parse_vhost_settings(spec: &str) -> HashMap<String, VhostBackend> {
    let mut vhosts = HashMap::new();
    if spec.is_empty() {
        return vhosts;
    }

    for entry in spec.split(',') {
        let backend = entry.split_once(':').and_then(|(bridge, status)| {
            match status.to_ascii_lowercase().as_str() {
                "true" => Some((bridge, VhostBackend::Vhost)),
                "false" => Some((bridge, VhostBackend::Qemu)),
                _ => None,
            }
        });
        match backend {
            Some((bridge, backend)) => {
                vhosts.insert(bridge.to_string(), backend);
            }
            None => warn!(entry = %entry, "Unknown vhost format"),
        }
    }
    vhosts
}

/// Compute `<driver>` attributes from the vhost overrides and requested
/// queue count. Multiqueue needs vhost, so queues imply it unless an
/// override already chose a backend.
pub fn derive_driver(network: Option<&str>, queues: Option<u32>, vhost_spec: &str) -> DriverOptions {
    let mut driver = DriverOptions::default();

    let vhosts = parse_vhost_settings(vhost_spec);
    if let Some(network) = network
        && let Some(backend) = vhosts.get(network)
    {
        driver.name = Some(backend.as_str().to_string());
    }

    if let Some(queues) = queues {
        driver.queues = Some(queues);
        if driver.name.is_none() {
            driver.name = Some(VhostBackend::Vhost.as_str().to_string());
        }
    }
    driver
}

/// Normalise model aliases.
pub fn normalize_model(model: &str) -> String {
    match model {
        "pv" => VIRTIO_MODEL.to_string(),
        other => other.to_string(),
    }
}

/// Validate a colon separated MAC address.
pub fn validate_mac(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidMac(mac.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecParams {
    #[serde(flatten)]
    pub bandwidth: BandwidthSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlanid: Option<u16>,
}

/// Engine-level custom properties of the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCustom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queues: Option<u32>,
}

/// VM-level custom properties relevant to NICs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCustom {
    /// Per-network vhost overrides, `bridge:true|false,...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,
    /// Socket send buffer size. Engines send it as a string or a number.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_number"
    )]
    pub sndbuf: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Unsigned(n) => n.to_string(),
        Raw::Signed(n) => n.to_string(),
    }))
}

/// Stored NIC configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub device: DeviceKind,
    pub mac_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// libvirt node device name of the passthrough device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostdev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_parameters: Vec<FilterParameter>,
    #[serde(default)]
    pub spec_params: SpecParams,
    #[serde(default)]
    pub custom: DeviceCustom,
    #[serde(default)]
    pub vm_custom: VmCustom,
    /// Guest-side device address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub address: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Host side of a passthrough NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostdevNic {
    pub hostdev: String,
    pub host_address: PciAddress,
    pub vlan_id: Option<u16>,
    pub numa_node: Option<u32>,
    pub iommu_group: Option<u32>,
}

/// What the NIC is plugged into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "device", rename_all = "lowercase")]
pub enum InterfaceKind {
    Bridge { network: String },
    Hostdev(HostdevNic),
}

/// A guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    pub mac_addr: String,
    pub model: Option<String>,
    #[serde(flatten)]
    pub kind: InterfaceKind,
    pub boot_order: Option<u32>,
    /// `None` means never set; the link is up and no `<link>` is emitted.
    pub link_active: Option<bool>,
    pub filter: Option<String>,
    pub filter_parameters: Vec<FilterParameter>,
    pub sndbuf: Option<String>,
    pub driver: DriverOptions,
    pub bandwidth: BandwidthSpec,

    // Reported by the hypervisor once the guest runs.
    pub name: Option<String>,
    pub alias: Option<String>,
    pub address: BTreeMap<String, String>,
}

impl Interface {
    /// Validate a stored configuration.
    ///
    /// Passthrough NICs look up their host PCI address through `hostdevs`
    /// without touching the device.
    pub fn new(config: InterfaceConfig, hostdevs: &dyn HostdevLifecycle) -> Result<Self> {
        validate_mac(&config.mac_addr)?;

        let kind = match config.device {
            DeviceKind::Bridge => {
                let network = match config.network {
                    Some(network) if network.is_empty() => DUMMY_BRIDGE.to_string(),
                    Some(network) => network,
                    None => {
                        return Err(Error::Configuration(format!(
                            "could not detect the network to join for {}",
                            config.mac_addr
                        )));
                    }
                };
                InterfaceKind::Bridge { network }
            }
            DeviceKind::Hostdev => {
                let hostdev = config.hostdev.ok_or_else(|| {
                    Error::Configuration(format!(
                        "hostdev interface {} has no host device",
                        config.mac_addr
                    ))
                })?;
                let params = hostdevs.device_params(&hostdev)?;
                InterfaceKind::Hostdev(HostdevNic {
                    hostdev,
                    host_address: params.address,
                    vlan_id: config.spec_params.vlanid,
                    numa_node: params.numa_node,
                    iommu_group: params.iommu_group,
                })
            }
        };

        let network = match &kind {
            InterfaceKind::Bridge { network } => Some(network.as_str()),
            InterfaceKind::Hostdev(_) => None,
        };
        let driver = derive_driver(
            network,
            config.custom.queues,
            config.vm_custom.vhost.as_deref().unwrap_or(""),
        );

        Ok(Self {
            mac_addr: config.mac_addr,
            model: config.nic_model.as_deref().map(normalize_model),
            kind,
            boot_order: config.boot_order,
            link_active: config.link_active,
            filter: config.filter,
            filter_parameters: config.filter_parameters,
            sndbuf: config.vm_custom.sndbuf.filter(|s| !s.is_empty()),
            driver,
            bandwidth: config.spec_params.bandwidth,
            name: config.name,
            alias: config.alias,
            address: config.address,
        })
    }

    /// Stored form of the record. [`Interface::new`] turns it back into an
    /// equal record.
    pub fn to_config(&self) -> InterfaceConfig {
        let (network, hostdev, vlanid) = match &self.kind {
            InterfaceKind::Bridge { network } => (Some(network.clone()), None, None),
            InterfaceKind::Hostdev(nic) => (None, Some(nic.hostdev.clone()), nic.vlan_id),
        };

        // only backends the queue count does not already imply need an override
        let implied = derive_driver(network.as_deref(), self.driver.queues, "");
        let vhost = match (&network, self.driver.name.as_deref()) {
            (Some(network), Some(name))
                if implied.name.as_deref() != Some(name) && !network.contains([':', ',']) =>
            {
                match name {
                    "vhost" => Some(format!("{network}:true")),
                    "qemu" => Some(format!("{network}:false")),
                    _ => None,
                }
            }
            _ => None,
        };

        InterfaceConfig {
            device: self.device_kind(),
            mac_addr: self.mac_addr.clone(),
            nic_model: self.model.clone(),
            network,
            hostdev,
            boot_order: self.boot_order,
            link_active: self.link_active,
            filter: self.filter.clone(),
            filter_parameters: self.filter_parameters.clone(),
            spec_params: SpecParams {
                bandwidth: self.bandwidth.clone(),
                vlanid,
            },
            custom: DeviceCustom {
                queues: self.driver.queues,
            },
            vm_custom: VmCustom {
                vhost,
                sndbuf: self.sndbuf.clone(),
            },
            address: self.address.clone(),
            alias: self.alias.clone(),
            name: self.name.clone(),
        }
    }

    pub fn device_kind(&self) -> DeviceKind {
        match self.kind {
            InterfaceKind::Bridge { .. } => DeviceKind::Bridge,
            InterfaceKind::Hostdev(_) => DeviceKind::Hostdev,
        }
    }

    pub fn network(&self) -> Option<&str> {
        match &self.kind {
            InterfaceKind::Bridge { network } => Some(network),
            InterfaceKind::Hostdev(_) => None,
        }
    }

    pub fn hostdev(&self) -> Option<&HostdevNic> {
        match &self.kind {
            InterfaceKind::Hostdev(nic) => Some(nic),
            InterfaceKind::Bridge { .. } => None,
        }
    }

    pub fn link_active(&self) -> bool {
        self.link_active.unwrap_or(true)
    }

    /// MACs are compared case-insensitively.
    pub fn matches_mac(&self, mac: &str) -> bool {
        self.mac_addr.eq_ignore_ascii_case(mac)
    }

    /// Detach a passthrough device from the host before the guest starts.
    pub fn setup(&mut self, hostdevs: &dyn HostdevLifecycle) -> Result<()> {
        let InterfaceKind::Hostdev(nic) = &mut self.kind else {
            return Ok(());
        };

        info!(hostdev = %nic.hostdev, "Detaching device from the host");
        let params = hostdevs.acquire(&nic.hostdev)?;
        nic.host_address = params.address;
        nic.numa_node = params.numa_node;
        nic.iommu_group = params.iommu_group;
        Ok(())
    }

    /// Give a passthrough device back to the host.
    ///
    /// Missing IOMMU support and a failed group release are logged only;
    /// the device may then stay bound to vfio-pci.
    pub fn teardown(&self, hostdevs: &dyn HostdevLifecycle) -> Result<()> {
        let InterfaceKind::Hostdev(nic) = &self.kind else {
            return Ok(());
        };

        info!(hostdev = %nic.hostdev, "Reattaching device to host");
        match hostdevs.release(&nic.hostdev) {
            Ok(()) => {}
            Err(Error::IsolationUnsupported(_)) => {
                error!(
                    hostdev = %nic.hostdev,
                    "Could not reattach device back to host due to missing IOMMU support"
                );
            }
            Err(e) => return Err(e),
        }

        if let Some(group) = nic.iommu_group
            && let Err(e) = hostdevs.release_isolation_group(group)
        {
            warn!(hostdev = %nic.hostdev, iommu_group = group, error = %e, "Failed to release IOMMU group");
        }
        Ok(())
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Interface name={}, type={}, mac={}>",
            self.name.as_deref().unwrap_or("None"),
            self.device_kind(),
            self.mac_addr
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bandwidth::RateLimit;
    use crate::hostdev::HostdevParams;
    use std::cell::RefCell;

    /// Records lifecycle calls; fails release with a configured error.
    #[derive(Default)]
    pub(crate) struct FakeHostdevs {
        pub calls: RefCell<Vec<String>>,
        pub release_error: Option<fn(&str) -> Error>,
        pub group_error: bool,
    }

    impl FakeHostdevs {
        pub fn params() -> HostdevParams {
            HostdevParams {
                address: PciAddress {
                    domain: 0,
                    bus: 0,
                    slot: 7,
                    function: 0,
                },
                numa_node: Some(0),
                iommu_group: Some(12),
            }
        }
    }

    impl HostdevLifecycle for FakeHostdevs {
        fn device_params(&self, hostdev: &str) -> Result<HostdevParams> {
            self.calls.borrow_mut().push(format!("params {hostdev}"));
            Ok(Self::params())
        }

        fn acquire(&self, hostdev: &str) -> Result<HostdevParams> {
            self.calls.borrow_mut().push(format!("acquire {hostdev}"));
            let mut params = Self::params();
            params.numa_node = Some(1);
            Ok(params)
        }

        fn release(&self, hostdev: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("release {hostdev}"));
            match self.release_error {
                Some(make) => Err(make(hostdev)),
                None => Ok(()),
            }
        }

        fn release_isolation_group(&self, iommu_group: u32) -> Result<()> {
            self.calls.borrow_mut().push(format!("release-group {iommu_group}"));
            if self.group_error {
                return Err(Error::Helper("chown failed".to_string()));
            }
            Ok(())
        }
    }

    fn no_iommu(hostdev: &str) -> Error {
        Error::IsolationUnsupported(hostdev.to_string())
    }

    fn helper_failed(_hostdev: &str) -> Error {
        Error::Helper("boom".to_string())
    }

    pub(crate) fn bridge_config(mac: &str, network: &str) -> InterfaceConfig {
        InterfaceConfig {
            mac_addr: mac.to_string(),
            nic_model: Some("virtio".to_string()),
            network: Some(network.to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn hostdev_config(mac: &str) -> InterfaceConfig {
        InterfaceConfig {
            device: DeviceKind::Hostdev,
            mac_addr: mac.to_string(),
            hostdev: Some("pci_0000_00_07_0".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_vhost_settings() {
        let vhosts = parse_vhost_settings("br0:true,br1:FALSE,garbage,br2:maybe");
        assert_eq!(vhosts.len(), 2);
        assert_eq!(vhosts["br0"], VhostBackend::Vhost);
        assert_eq!(vhosts["br1"], VhostBackend::Qemu);
        assert!(parse_vhost_settings("").is_empty());
    }

    #[test]
    fn test_derive_driver() {
        let spec = "br0:true,br1:false,garbage";
        assert_eq!(derive_driver(Some("br0"), None, spec).name.as_deref(), Some("vhost"));
        assert_eq!(derive_driver(Some("br1"), None, spec).name.as_deref(), Some("qemu"));
        assert!(derive_driver(Some("br9"), None, spec).is_empty());
        assert!(derive_driver(None, None, spec).is_empty());
    }

    #[test]
    fn test_queues_default_to_vhost() {
        let driver = derive_driver(Some("br9"), Some(4), "");
        assert_eq!(driver.name.as_deref(), Some("vhost"));
        assert_eq!(driver.queues, Some(4));

        // an explicit override wins
        let driver = derive_driver(Some("br1"), Some(4), "br1:false");
        assert_eq!(driver.name.as_deref(), Some("qemu"));
        assert_eq!(driver.queues, Some(4));
    }

    #[test]
    fn test_validate_mac() {
        assert!(validate_mac("52:54:00:AA:bb:01").is_ok());
        assert!(validate_mac("52:54:00:aa:bb").is_err());
        assert!(validate_mac("52-54-00-aa-bb-01").is_err());
        assert!(validate_mac("52:54:00:aa:bb:zz").is_err());
        assert!(validate_mac("").is_err());
    }

    #[test]
    fn test_bridge_interface() {
        let mut config = bridge_config("52:54:00:00:00:01", "br0");
        config.nic_model = Some("pv".to_string());
        config.custom.queues = Some(2);
        config.vm_custom.sndbuf = Some("0".to_string());
        config.spec_params.bandwidth.inbound = Some(RateLimit::new().with("average", 1000));

        let nic = Interface::new(config, &FakeHostdevs::default()).unwrap();
        assert_eq!(nic.device_kind(), DeviceKind::Bridge);
        assert_eq!(nic.network(), Some("br0"));
        assert_eq!(nic.model.as_deref(), Some("virtio"));
        assert_eq!(nic.driver.name.as_deref(), Some("vhost"));
        assert_eq!(nic.sndbuf.as_deref(), Some("0"));
        assert!(nic.bandwidth.is_set());
        assert!(nic.link_active());
    }

    #[test]
    fn test_empty_network_joins_dummy_bridge() {
        let nic = Interface::new(bridge_config("52:54:00:00:00:01", ""), &FakeHostdevs::default())
            .unwrap();
        assert_eq!(nic.network(), Some(DUMMY_BRIDGE));
    }

    #[test]
    fn test_missing_network_is_configuration_error() {
        let mut config = bridge_config("52:54:00:00:00:01", "br0");
        config.network = None;
        let err = Interface::new(config, &FakeHostdevs::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_invalid_mac_rejected() {
        let err = Interface::new(bridge_config("nope", "br0"), &FakeHostdevs::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMac(_)));
    }

    #[test]
    fn test_hostdev_interface() {
        let mut config = hostdev_config("52:54:00:00:00:02");
        config.spec_params.vlanid = Some(100);
        let hostdevs = FakeHostdevs::default();

        let nic = Interface::new(config, &hostdevs).unwrap();
        let hostdev = nic.hostdev().unwrap();
        assert_eq!(hostdev.host_address.bdf(), "0000:00:07.0");
        assert_eq!(hostdev.vlan_id, Some(100));
        assert_eq!(hostdev.iommu_group, Some(12));
        assert!(nic.network().is_none());
        assert!(nic.driver.is_empty());
        assert_eq!(*hostdevs.calls.borrow(), vec!["params pci_0000_00_07_0"]);
    }

    #[test]
    fn test_hostdev_without_device_is_configuration_error() {
        let mut config = hostdev_config("52:54:00:00:00:02");
        config.hostdev = None;
        let err = Interface::new(config, &FakeHostdevs::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_setup_and_teardown() {
        let hostdevs = FakeHostdevs::default();
        let mut nic = Interface::new(hostdev_config("52:54:00:00:00:02"), &hostdevs).unwrap();

        nic.setup(&hostdevs).unwrap();
        assert_eq!(nic.hostdev().unwrap().numa_node, Some(1));
        nic.teardown(&hostdevs).unwrap();

        assert_eq!(
            *hostdevs.calls.borrow(),
            vec![
                "params pci_0000_00_07_0",
                "acquire pci_0000_00_07_0",
                "release pci_0000_00_07_0",
                "release-group 12",
            ]
        );
    }

    #[test]
    fn test_teardown_tolerates_missing_iommu() {
        let hostdevs = FakeHostdevs {
            release_error: Some(no_iommu),
            group_error: true,
            ..Default::default()
        };
        let nic = Interface::new(hostdev_config("52:54:00:00:00:02"), &hostdevs).unwrap();

        nic.teardown(&hostdevs).unwrap();
        assert!(hostdevs.calls.borrow().contains(&"release-group 12".to_string()));
    }

    #[test]
    fn test_teardown_propagates_other_failures() {
        let hostdevs = FakeHostdevs {
            release_error: Some(helper_failed),
            ..Default::default()
        };
        let nic = Interface::new(hostdev_config("52:54:00:00:00:02"), &hostdevs).unwrap();

        assert!(matches!(nic.teardown(&hostdevs), Err(Error::Helper(_))));
        assert!(!hostdevs.calls.borrow().contains(&"release-group 12".to_string()));
    }

    #[test]
    fn test_bridge_setup_is_noop() {
        let hostdevs = FakeHostdevs::default();
        let mut nic = Interface::new(bridge_config("52:54:00:00:00:01", "br0"), &hostdevs).unwrap();
        nic.setup(&hostdevs).unwrap();
        nic.teardown(&hostdevs).unwrap();
        assert!(hostdevs.calls.borrow().is_empty());
    }

    #[test]
    fn test_config_from_json() {
        let config: InterfaceConfig = serde_json::from_str(
            r#"{
                "device": "bridge",
                "mac_addr": "52:54:00:00:00:01",
                "nic_model": "virtio",
                "network": "br0",
                "filter": "clean-traffic",
                "filter_parameters": [{"name": "IP", "value": "10.0.0.1"}, {"name": "CTRL_IP_LEARNING"}],
                "spec_params": {"inbound": {"average": 1000}, "outbound": {}},
                "vm_custom": {"vhost": "br0:false"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.filter_parameters.len(), 2);
        assert_eq!(config.spec_params.bandwidth.outbound, Some(RateLimit::default()));

        let nic = Interface::new(config, &FakeHostdevs::default()).unwrap();
        assert_eq!(nic.driver.name.as_deref(), Some("qemu"));
    }

    #[test]
    fn test_sndbuf_string_or_number() {
        for json in [r#"{"sndbuf": 0}"#, r#"{"sndbuf": "0"}"#] {
            let custom: VmCustom = serde_json::from_str(json).unwrap();
            assert_eq!(custom.sndbuf.as_deref(), Some("0"), "{json}");
        }
        let custom: VmCustom = serde_json::from_str(r#"{"sndbuf": null}"#).unwrap();
        assert_eq!(custom.sndbuf, None);
        assert!(serde_json::from_str::<VmCustom>(r#"{"sndbuf": [1]}"#).is_err());

        let config: InterfaceConfig = serde_json::from_str(
            r#"{"mac_addr": "52:54:00:00:00:01", "network": "br0", "vm_custom": {"sndbuf": 4096}}"#,
        )
        .unwrap();
        let nic = Interface::new(config, &FakeHostdevs::default()).unwrap();
        assert_eq!(nic.sndbuf.as_deref(), Some("4096"));
    }

    #[test]
    fn test_to_config_rebuilds_record() {
        let hostdevs = FakeHostdevs::default();
        let rebuild = |nic: &Interface| {
            let json = serde_json::to_string(&nic.to_config()).unwrap();
            let config: InterfaceConfig = serde_json::from_str(&json).unwrap();
            Interface::new(config, &hostdevs).unwrap()
        };

        let mut config = bridge_config("52:54:00:00:00:01", "br0");
        config.custom.queues = Some(4);
        config.vm_custom.sndbuf = Some("0".to_string());
        config.link_active = Some(false);
        config.spec_params.bandwidth.outbound = Some(RateLimit::new().with("average", 10));
        let queued = Interface::new(config, &hostdevs).unwrap();
        assert_eq!(rebuild(&queued), queued);
        assert_eq!(queued.to_config().vm_custom.vhost, None);

        let mut config = bridge_config("52:54:00:00:00:02", "br1");
        config.custom.queues = Some(2);
        config.vm_custom.vhost = Some("br0:true,br1:false".to_string());
        let userspace = Interface::new(config, &hostdevs).unwrap();
        assert_eq!(userspace.driver.name.as_deref(), Some("qemu"));
        assert_eq!(rebuild(&userspace), userspace);

        let mut config = hostdev_config("52:54:00:00:00:03");
        config.spec_params.vlanid = Some(7);
        let hostdev = Interface::new(config, &hostdevs).unwrap();
        assert_eq!(rebuild(&hostdev), hostdev);
    }

    #[test]
    fn test_display() {
        let mut nic = Interface::new(bridge_config("52:54:00:00:00:01", "br0"), &FakeHostdevs::default())
            .unwrap();
        assert_eq!(nic.to_string(), "<Interface name=None, type=bridge, mac=52:54:00:00:00:01>");
        nic.name = Some("vnet0".to_string());
        assert_eq!(nic.to_string(), "<Interface name=vnet0, type=bridge, mac=52:54:00:00:00:01>");
    }
}
