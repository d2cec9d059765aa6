//! mvirt-vnic - virtual NIC layer.
//!
//! Translates NIC device records to and from libvirt `<interface>` XML and
//! tunes per-device network sysctls. Host integration (OVS lookups, PCI
//! passthrough) sits behind the [`BridgeResolver`] and [`HostdevLifecycle`]
//! traits.

pub mod addresses;
pub mod bandwidth;
pub mod bridge;
pub mod device;
pub mod device_info;
pub mod error;
pub mod hostdev;
pub mod interface_xml;
pub mod placeholder;
pub mod sysctl;
pub mod xml;

pub use bandwidth::{BandwidthSpec, RateLimit, bandwidth_xml, update_bandwidth_xml};
pub use bridge::{BridgeResolver, LinuxBridges, OvsBridge, OvsVsctl, StaticBridges};
pub use device::{DeviceKind, Interface, InterfaceConfig, InterfaceKind};
pub use device_info::{DiscoveredNic, update_device_info};
pub use error::{Error, Result};
pub use hostdev::{HelperProcess, HostdevLifecycle, HostdevParams, PciAddress, SysfsHostdevs};
pub use interface_xml::config_from_xml;
pub use placeholder::resolve_bridge_placeholders;
pub use sysctl::{RpFilter, Sysctl};
pub use xml::Element;
