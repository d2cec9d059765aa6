//! Per-device network sysctl access.
//!
//! Every operation is a single blocking read or write of one file under
//! `/proc/sys/net`. Nothing is cached and nothing is retried: errors are
//! returned to the caller exactly as the kernel reported them. The only
//! exception is [`Sysctl::is_ipv6_autoconf_active`], which reports `false`
//! for devices whose IPv6 control files do not exist.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

const PROC_SYS: &str = "/proc/sys";

/// Reverse path filtering mode (`rp_filter`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpFilter {
    /// Drop packets whose source is not reachable via the ingress device.
    Strict,
    /// Drop packets whose source is not reachable via any device.
    Loose,
}

impl RpFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpFilter::Strict => "1",
            RpFilter::Loose => "2",
        }
    }
}

/// Handle on the kernel sysctl tree.
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new(PROC_SYS)
    }
}

impl Sysctl {
    /// Device name for the defaults applied to newly created devices.
    pub const DEFAULT_DEVICE: &'static str = "default";

    /// Create a handle rooted at `root` (normally `/proc/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ipv4_conf(&self, dev: &str, key: &str) -> PathBuf {
        self.root.join("net/ipv4/conf").join(dev).join(key)
    }

    fn ipv6_conf(&self, dev: &str, key: &str) -> PathBuf {
        self.root.join("net/ipv6/conf").join(dev).join(key)
    }

    // === IPv4 ===

    pub fn set_rp_filter(&self, dev: &str, mode: RpFilter) -> io::Result<()> {
        debug!(dev = %dev, mode = mode.as_str(), "Setting rp_filter");
        write_value(&self.ipv4_conf(dev, "rp_filter"), mode.as_str())
    }

    pub fn set_rp_filter_strict(&self, dev: &str) -> io::Result<()> {
        self.set_rp_filter(dev, RpFilter::Strict)
    }

    pub fn set_rp_filter_loose(&self, dev: &str) -> io::Result<()> {
        self.set_rp_filter(dev, RpFilter::Loose)
    }

    // === IPv6 ===

    pub fn set_ipv6_disabled(&self, dev: &str, disabled: bool) -> io::Result<()> {
        debug!(dev = %dev, disabled, "Setting disable_ipv6");
        write_value(&self.ipv6_conf(dev, "disable_ipv6"), flag(disabled))
    }

    pub fn enable_ipv6(&self, dev: &str) -> io::Result<()> {
        self.set_ipv6_disabled(dev, false)
    }

    pub fn disable_ipv6(&self, dev: &str) -> io::Result<()> {
        self.set_ipv6_disabled(dev, true)
    }

    /// Whether IPv6 is disabled on `dev`.
    ///
    /// Use [`Sysctl::DEFAULT_DEVICE`] to query the system default.
    pub fn get_ipv6_disabled(&self, dev: &str) -> io::Result<bool> {
        read_flag(&self.ipv6_conf(dev, "disable_ipv6"))
    }

    /// Whether `dev` is doing IPv6 stateless autoconfiguration.
    ///
    /// True only if IPv6 is enabled and `autoconf`, `accept_ra` and
    /// `accept_redirects` are all set. A missing control file means the
    /// device has no IPv6 support and yields `false`.
    pub fn is_ipv6_autoconf_active(&self, dev: &str) -> io::Result<bool> {
        match self.read_autoconf_state(dev) {
            Ok(active) => Ok(active),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_autoconf_state(&self, dev: &str) -> io::Result<bool> {
        if self.get_ipv6_disabled(dev)? {
            return Ok(false);
        }
        for key in ["autoconf", "accept_ra", "accept_redirects"] {
            if !read_flag(&self.ipv6_conf(dev, key))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Toggle IPv6 stateless autoconfiguration on `dev`.
    ///
    /// Enabling re-enables IPv6 first if it is disabled. Disabling is a
    /// no-op when IPv6 is already disabled.
    pub fn set_ipv6_autoconf(&self, dev: &str, enable: bool) -> io::Result<()> {
        if self.get_ipv6_disabled(dev)? {
            if !enable {
                return Ok(());
            }
            self.enable_ipv6(dev)?;
        }

        debug!(dev = %dev, enable, "Setting IPv6 autoconf");
        for key in ["autoconf", "accept_ra", "accept_redirects"] {
            write_value(&self.ipv6_conf(dev, key), flag(enable))?;
        }
        Ok(())
    }

    pub fn enable_ipv6_autoconf(&self, dev: &str) -> io::Result<()> {
        self.set_ipv6_autoconf(dev, true)
    }

    pub fn disable_ipv6_autoconf(&self, dev: &str) -> io::Result<()> {
        self.set_ipv6_autoconf(dev, false)
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Write to an existing control file. procfs entries cannot be created, so
/// neither can we.
fn write_value(path: &Path, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())
}

fn read_flag(path: &Path) -> io::Result<bool> {
    let raw = fs::read_to_string(path)?;
    let value: i64 = raw.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected value {:?} in {}", raw.trim(), path.display()),
        )
    })?;
    Ok(value != 0)
}
