use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use mvirt_vnic::hostdev::ISOLATION_UNSUPPORTED_EXIT;
use mvirt_vnic::{
    BandwidthSpec, BridgeResolver, DiscoveredNic, Element, Error, HostdevLifecycle, Interface,
    InterfaceConfig, OvsVsctl, RpFilter, StaticBridges, Sysctl, SysfsHostdevs,
    resolve_bridge_placeholders, update_bandwidth_xml, update_device_info,
};

#[derive(Parser)]
#[command(name = "mvirt-vnic")]
#[command(about = "mvirt virtual NIC tool: libvirt interface XML and network sysctls")]
struct Args {
    /// Root of the sysctl tree
    #[arg(long, global = true, default_value = "/proc/sys")]
    proc_sys: PathBuf,

    /// Root of sysfs, used for PCI passthrough devices
    #[arg(long, global = true, default_value = "/sys")]
    sysfs: PathBuf,

    /// Root of devfs, used for VFIO group nodes
    #[arg(long, global = true, default_value = "/dev")]
    dev: PathBuf,

    /// uid:gid that acquired VFIO group nodes are handed to
    #[arg(long, global = true, default_value = "107:107", value_parser = parse_owner)]
    vfio_owner: (u32, u32),

    /// JSON map of OVS-backed networks; queries ovs-vsctl when omitted
    #[arg(long, global = true)]
    bridges: Option<PathBuf>,

    /// ovs-vsctl binary
    #[arg(long, global = true, default_value = "ovs-vsctl")]
    ovs_vsctl: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the <interface> XML for a NIC configuration (JSON)
    Encode {
        /// Configuration file, `-` for stdin
        #[arg(default_value = "-")]
        config: PathBuf,
    },
    /// Update NIC configurations (JSON list) from live domain XML
    UpdateInfo {
        /// Domain XML as reported by libvirt
        #[arg(long)]
        domain: PathBuf,
        /// NIC configurations, `-` for stdin
        #[arg(default_value = "-")]
        nics: PathBuf,
    },
    /// Replace the bandwidth of an <interface> element
    UpdateBandwidth {
        /// Interface XML, `-` for stdin
        #[arg(default_value = "-")]
        interface: PathBuf,
        /// Bandwidth as JSON, e.g. '{"inbound": {"average": 1000}}'
        #[arg(long)]
        spec: String,
    },
    /// Resolve NIC-BRIDGE placeholders in domain XML
    FixNetworks {
        /// Domain XML, `-` for stdin
        #[arg(default_value = "-")]
        domain: PathBuf,
    },
    /// Per-device network sysctls
    Sysctl {
        #[command(subcommand)]
        command: SysctlCommand,
    },
    /// Privileged PCI passthrough helper; prints JSON
    Hostdev {
        #[command(subcommand)]
        command: HostdevCommand,
    },
}

#[derive(Subcommand)]
enum SysctlCommand {
    /// Set reverse path filtering
    RpFilter {
        device: String,
        #[arg(value_enum)]
        mode: RpFilterMode,
    },
    /// Enable, disable or query IPv6
    Ipv6 {
        device: String,
        #[arg(value_enum, default_value = "status")]
        action: Toggle,
    },
    /// Enable, disable or query IPv6 autoconfiguration
    Autoconf {
        device: String,
        #[arg(value_enum, default_value = "status")]
        action: Toggle,
    },
}

#[derive(Subcommand)]
enum HostdevCommand {
    /// Read device parameters
    Params { hostdev: String },
    /// Detach from the host driver and claim the IOMMU group
    Acquire { hostdev: String },
    /// Reattach to the host driver
    Release { hostdev: String },
    /// Give an IOMMU group node back to root
    ReleaseGroup { iommu_group: u32 },
}

#[derive(Clone, Copy, ValueEnum)]
enum RpFilterMode {
    Strict,
    Loose,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    Enable,
    Disable,
    Status,
}

/// `interfaces` is in the same form `update-info` reads.
#[derive(Serialize)]
struct DeviceInfo {
    interfaces: Vec<InterfaceConfig>,
    discovered: Vec<DiscoveredNic>,
}

fn parse_owner(s: &str) -> Result<(u32, u32), String> {
    let (uid, gid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected uid:gid, got {s}"))?;
    let uid = uid.parse().map_err(|e| format!("invalid uid {uid}: {e}"))?;
    let gid = gid.parse().map_err(|e| format!("invalid gid {gid}: {e}"))?;
    Ok((uid, gid))
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read stdin")?;
        return Ok(input);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn bridge_resolver(args: &Args) -> anyhow::Result<Box<dyn BridgeResolver>> {
    match &args.bridges {
        Some(path) => Ok(Box::new(StaticBridges::from_file(path)?)),
        None => Ok(Box::new(OvsVsctl::new(&args.ovs_vsctl))),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let hostdevs = SysfsHostdevs::new(&args.sysfs, &args.dev, args.vfio_owner);
    let sysctl = Sysctl::new(&args.proc_sys);

    match &args.command {
        Commands::Encode { config } => {
            let config: InterfaceConfig = serde_json::from_str(&read_input(config)?)
                .context("Invalid interface configuration")?;
            let nic = Interface::new(config, &hostdevs)?;
            let bridges = bridge_resolver(&args)?;
            println!("{}", nic.to_xml(bridges.as_ref()).to_pretty_string()?);
        }
        Commands::UpdateInfo { domain, nics } => {
            let configs: Vec<InterfaceConfig> = serde_json::from_str(&read_input(nics)?)
                .context("Invalid interface configurations")?;
            let mut interfaces = configs
                .into_iter()
                .map(|config| Interface::new(config, &hostdevs))
                .collect::<Result<Vec<_>, Error>>()?;
            let discovered = update_device_info(&read_input(domain)?, &mut interfaces)?;
            print_json(&DeviceInfo {
                interfaces: interfaces.iter().map(Interface::to_config).collect(),
                discovered,
            })?;
        }
        Commands::UpdateBandwidth { interface, spec } => {
            let spec: BandwidthSpec =
                serde_json::from_str(spec).context("Invalid bandwidth specification")?;
            let mut element = Element::parse(&read_input(interface)?)?;
            if element.name() != "interface" {
                bail!("expected an <interface> element, found <{}>", element.name());
            }
            update_bandwidth_xml(&mut element, &spec);
            println!("{}", element.to_pretty_string()?);
        }
        Commands::FixNetworks { domain } => {
            let xml = read_input(domain)?;
            let bridges = bridge_resolver(&args)?;
            print!("{}", resolve_bridge_placeholders(&xml, bridges.as_ref()));
        }
        Commands::Sysctl { command } => run_sysctl(&sysctl, command)?,
        Commands::Hostdev { command } => run_hostdev(&hostdevs, command)?,
    }
    Ok(())
}

fn run_sysctl(sysctl: &Sysctl, command: &SysctlCommand) -> anyhow::Result<()> {
    match command {
        SysctlCommand::RpFilter { device, mode } => {
            let mode = match mode {
                RpFilterMode::Strict => RpFilter::Strict,
                RpFilterMode::Loose => RpFilter::Loose,
            };
            sysctl
                .set_rp_filter(device, mode)
                .with_context(|| format!("Failed to set rp_filter on {device}"))?;
            info!(device = %device, mode = mode.as_str(), "Set rp_filter");
        }
        SysctlCommand::Ipv6 { device, action } => match action {
            Toggle::Enable => sysctl.enable_ipv6(device)?,
            Toggle::Disable => sysctl.disable_ipv6(device)?,
            Toggle::Status => println!("{}", !sysctl.get_ipv6_disabled(device)?),
        },
        SysctlCommand::Autoconf { device, action } => match action {
            Toggle::Enable => sysctl.enable_ipv6_autoconf(device)?,
            Toggle::Disable => sysctl.disable_ipv6_autoconf(device)?,
            Toggle::Status => println!("{}", sysctl.is_ipv6_autoconf_active(device)?),
        },
    }
    Ok(())
}

fn run_hostdev(hostdevs: &dyn HostdevLifecycle, command: &HostdevCommand) -> anyhow::Result<()> {
    match command {
        HostdevCommand::Params { hostdev } => print_json(&hostdevs.device_params(hostdev)?)?,
        HostdevCommand::Acquire { hostdev } => {
            let params = hostdevs.acquire(hostdev)?;
            info!(hostdev = %hostdev, address = %params.address, "Acquired device");
            print_json(&params)?;
        }
        HostdevCommand::Release { hostdev } => {
            hostdevs.release(hostdev)?;
            info!(hostdev = %hostdev, "Released device");
        }
        HostdevCommand::ReleaseGroup { iommu_group } => {
            hostdevs.release_isolation_group(*iommu_group)?;
            info!(iommu_group = iommu_group, "Released IOMMU group");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            "mvirt_vnic=info"
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        ))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            match e.downcast_ref::<Error>() {
                Some(Error::IsolationUnsupported(_)) => {
                    ExitCode::from(ISOLATION_UNSUPPORTED_EXIT as u8)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}
