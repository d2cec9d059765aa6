//! Host PCI devices handed to guests as SR-IOV / passthrough NICs.
//!
//! Acquiring a device detaches it from its host driver, binds it to
//! `vfio-pci` and hands the VFIO group node to the hypervisor user. Release
//! reverses that. All of this needs root, so the daemon normally reaches it
//! through [`HelperProcess`], which runs the `mvirt-vnic hostdev`
//! subcommand (backed by [`SysfsHostdevs`]) with elevated privileges.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::{Gid, Uid, chown};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Exit status used by the helper subcommand for [`Error::IsolationUnsupported`].
pub const ISOLATION_UNSUPPORTED_EXIT: i32 = 3;

const VFIO_DRIVER: &str = "vfio-pci";

/// PCI address of a host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    /// Parse a libvirt node device name such as `pci_0000_00_07_0`.
    pub fn from_libvirt_name(name: &str) -> Result<Self> {
        let invalid = || Error::InvalidPciAddress(name.to_string());
        let rest = name.strip_prefix("pci_").ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('_').collect();
        let [domain, bus, slot, function] = parts.as_slice() else {
            return Err(invalid());
        };
        Self::from_parts(domain, bus, slot, function).ok_or_else(invalid)
    }

    /// Parse a sysfs BDF such as `0000:00:07.0`.
    pub fn from_bdf(bdf: &str) -> Result<Self> {
        let invalid = || Error::InvalidPciAddress(bdf.to_string());
        let (domain, rest) = bdf.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (slot, function) = rest.split_once('.').ok_or_else(invalid)?;
        Self::from_parts(domain, bus, slot, function).ok_or_else(invalid)
    }

    fn from_parts(domain: &str, bus: &str, slot: &str, function: &str) -> Option<Self> {
        let address = Self {
            domain: u16::from_str_radix(hex(domain), 16).ok()?,
            bus: u8::from_str_radix(hex(bus), 16).ok()?,
            slot: u8::from_str_radix(hex(slot), 16).ok()?,
            function: u8::from_str_radix(hex(function), 16).ok()?,
        };
        // slot is 5 bits, function 3 bits
        (address.slot < 32 && address.function < 8).then_some(address)
    }

    pub fn bdf(&self) -> String {
        format!(
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }

    pub fn libvirt_name(&self) -> String {
        format!(
            "pci_{:04x}_{:02x}_{:02x}_{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }

    /// Attributes for a libvirt `<address type="pci" .../>` element.
    pub fn xml_attributes(&self) -> [(&'static str, String); 4] {
        [
            ("domain", format!("{:#06x}", self.domain)),
            ("bus", format!("{:#04x}", self.bus)),
            ("slot", format!("{:#04x}", self.slot)),
            ("function", format!("{:#x}", self.function)),
        ]
    }
}

fn hex(s: &str) -> &str {
    s.trim_start_matches("0x")
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bdf())
    }
}

/// Host-side facts about a passthrough device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevParams {
    pub address: PciAddress,
    pub numa_node: Option<u32>,
    pub iommu_group: Option<u32>,
}

/// Acquire and release host devices for guest passthrough.
///
/// Devices are identified by their libvirt node device name.
pub trait HostdevLifecycle {
    /// Read device parameters without changing host state.
    fn device_params(&self, hostdev: &str) -> Result<HostdevParams>;

    /// Detach the device from the host and claim its isolation group.
    fn acquire(&self, hostdev: &str) -> Result<HostdevParams>;

    /// Reattach the device to its host driver.
    fn release(&self, hostdev: &str) -> Result<()>;

    /// Hand the isolation group node back to root.
    fn release_isolation_group(&self, iommu_group: u32) -> Result<()>;
}

/// Direct sysfs implementation. Requires root.
#[derive(Debug, Clone)]
pub struct SysfsHostdevs {
    sysfs: PathBuf,
    dev: PathBuf,
    owner: (u32, u32),
}

impl Default for SysfsHostdevs {
    fn default() -> Self {
        Self::new("/sys", "/dev", (107, 107))
    }
}

impl SysfsHostdevs {
    /// `owner` is the uid/gid the hypervisor runs as; acquired VFIO group
    /// nodes are chowned to it.
    pub fn new(sysfs: impl Into<PathBuf>, dev: impl Into<PathBuf>, owner: (u32, u32)) -> Self {
        Self {
            sysfs: sysfs.into(),
            dev: dev.into(),
            owner,
        }
    }

    fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.sysfs.join("bus/pci/devices").join(address.bdf())
    }

    fn group_node(&self, iommu_group: u32) -> PathBuf {
        self.dev.join("vfio").join(iommu_group.to_string())
    }

    fn isolated_params(&self, hostdev: &str) -> Result<(HostdevParams, u32)> {
        let params = self.device_params(hostdev)?;
        match params.iommu_group {
            Some(group) => Ok((params, group)),
            None => Err(Error::IsolationUnsupported(hostdev.to_string())),
        }
    }

    /// Unbind from the current driver (if any) and let the kernel reprobe,
    /// honouring whatever `driver_override` now says.
    fn rebind(&self, address: &PciAddress, driver_override: &str) -> Result<()> {
        let dir = self.device_dir(address);
        let bdf = address.bdf();

        write_sysfs(&dir.join("driver_override"), driver_override)?;
        if dir.join("driver").exists() {
            write_sysfs(&dir.join("driver/unbind"), &bdf)?;
        }
        write_sysfs(&self.sysfs.join("bus/pci/drivers_probe"), &bdf)
    }

    fn chown_group(&self, iommu_group: u32, uid: u32, gid: u32) -> Result<()> {
        let node = self.group_node(iommu_group);
        chown(&node, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| Error::io(&node, io::Error::from(e)))
    }
}

impl HostdevLifecycle for SysfsHostdevs {
    fn device_params(&self, hostdev: &str) -> Result<HostdevParams> {
        let address = PciAddress::from_libvirt_name(hostdev)?;
        let dir = self.device_dir(&address);
        if !dir.exists() {
            return Err(Error::Configuration(format!(
                "host device {hostdev} not found at {}",
                dir.display()
            )));
        }

        let numa_node = fs::read_to_string(dir.join("numa_node"))
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .and_then(|n| u32::try_from(n).ok());

        let iommu_group = fs::read_link(dir.join("iommu_group"))
            .ok()
            .and_then(|link| link.file_name().map(|n| n.to_string_lossy().into_owned()))
            .and_then(|n| n.parse::<u32>().ok());

        Ok(HostdevParams {
            address,
            numa_node,
            iommu_group,
        })
    }

    fn acquire(&self, hostdev: &str) -> Result<HostdevParams> {
        let (params, group) = self.isolated_params(hostdev)?;
        info!(hostdev = %hostdev, address = %params.address, iommu_group = group, "Detaching device from host");

        self.rebind(&params.address, VFIO_DRIVER)?;
        let (uid, gid) = self.owner;
        self.chown_group(group, uid, gid)?;
        Ok(params)
    }

    fn release(&self, hostdev: &str) -> Result<()> {
        let (params, group) = self.isolated_params(hostdev)?;
        info!(hostdev = %hostdev, address = %params.address, iommu_group = group, "Reattaching device to host");

        // an empty override lets the kernel pick the native driver again
        self.rebind(&params.address, "\n")
    }

    fn release_isolation_group(&self, iommu_group: u32) -> Result<()> {
        debug!(iommu_group, "Returning VFIO group to root");
        self.chown_group(iommu_group, 0, 0)
    }
}

fn write_sysfs(path: &Path, value: &str) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .and_then(|mut f| f.write_all(value.as_bytes()))
        .map_err(|e| Error::io(path, e))
}

/// Client side of the privileged helper.
///
/// Runs `<program> hostdev <op> <arg>` and reads JSON from stdout.
#[derive(Debug, Clone)]
pub struct HelperProcess {
    program: PathBuf,
    prefix: Vec<String>,
}

impl HelperProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    /// Arguments inserted before `hostdev`, e.g. global flags or a `sudo` target.
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix = args.into_iter().map(Into::into).collect();
        self
    }

    fn run(&self, op: &str, arg: &str) -> Result<Vec<u8>> {
        let output = Command::new(&self.program)
            .args(&self.prefix)
            .args(["hostdev", op, arg])
            .output()
            .map_err(|e| Error::io(&self.program, e))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(ISOLATION_UNSUPPORTED_EXIT) {
            return Err(Error::IsolationUnsupported(arg.to_string()));
        }
        Err(Error::Helper(format!("hostdev {op} {arg} failed: {stderr}")))
    }
}

impl HostdevLifecycle for HelperProcess {
    fn device_params(&self, hostdev: &str) -> Result<HostdevParams> {
        let stdout = self.run("params", hostdev)?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    fn acquire(&self, hostdev: &str) -> Result<HostdevParams> {
        let stdout = self.run("acquire", hostdev)?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    fn release(&self, hostdev: &str) -> Result<()> {
        self.run("release", hostdev).map(|_| ())
    }

    fn release_isolation_group(&self, iommu_group: u32) -> Result<()> {
        self.run("release-group", &iommu_group.to_string()).map(|_| ())
    }
}
