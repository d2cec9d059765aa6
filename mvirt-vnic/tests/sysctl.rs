//! Sysctl tuning against a fake /proc/sys tree.

use std::fs;
use std::path::Path;

use mvirt_vnic::{RpFilter, Sysctl};
use tempfile::TempDir;

const IPV6_FLAGS: [&str; 3] = ["autoconf", "accept_ra", "accept_redirects"];

fn proc_sys(devices: &[&str]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    for dev in devices {
        let v4 = tmp.path().join("net/ipv4/conf").join(dev);
        let v6 = tmp.path().join("net/ipv6/conf").join(dev);
        fs::create_dir_all(&v4).unwrap();
        fs::create_dir_all(&v6).unwrap();
        fs::write(v4.join("rp_filter"), "0\n").unwrap();
        fs::write(v6.join("disable_ipv6"), "0\n").unwrap();
        for key in IPV6_FLAGS {
            fs::write(v6.join(key), "1\n").unwrap();
        }
    }
    tmp
}

fn ipv6(root: &Path, dev: &str, key: &str) -> String {
    fs::read_to_string(root.join("net/ipv6/conf").join(dev).join(key))
        .unwrap()
        .trim()
        .to_string()
}

#[test]
fn test_disabled_ipv6_means_no_autoconf() {
    let tmp = proc_sys(&["eth0"]);
    let sysctl = Sysctl::new(tmp.path());
    let v6 = tmp.path().join("net/ipv6/conf/eth0");
    fs::write(v6.join("disable_ipv6"), "1\n").unwrap();

    for mask in 0..8u8 {
        for (bit, key) in IPV6_FLAGS.iter().enumerate() {
            let value = if mask & (1 << bit) != 0 { "1" } else { "0" };
            fs::write(v6.join(key), value).unwrap();
        }
        assert!(!sysctl.is_ipv6_autoconf_active("eth0").unwrap(), "mask {mask}");
    }
}

#[test]
fn test_vnic_tuning_workflow() {
    let tmp = proc_sys(&["default", "vnet0", "vnet1"]);
    let sysctl = Sysctl::new(tmp.path());

    sysctl.set_rp_filter("vnet0", RpFilter::Loose).unwrap();
    sysctl.set_rp_filter_strict("vnet1").unwrap();
    assert_eq!(
        fs::read_to_string(tmp.path().join("net/ipv4/conf/vnet0/rp_filter")).unwrap(),
        "2"
    );
    assert_eq!(
        fs::read_to_string(tmp.path().join("net/ipv4/conf/vnet1/rp_filter")).unwrap(),
        "1"
    );

    sysctl.disable_ipv6_autoconf("vnet0").unwrap();
    sysctl.disable_ipv6("vnet0").unwrap();
    assert!(sysctl.get_ipv6_disabled("vnet0").unwrap());
    assert!(!sysctl.get_ipv6_disabled(Sysctl::DEFAULT_DEVICE).unwrap());
    assert!(sysctl.is_ipv6_autoconf_active("vnet1").unwrap());

    sysctl.enable_ipv6_autoconf("vnet0").unwrap();
    assert_eq!(ipv6(tmp.path(), "vnet0", "disable_ipv6"), "0");
    for key in IPV6_FLAGS {
        assert_eq!(ipv6(tmp.path(), "vnet0", key), "1");
    }
    assert!(sysctl.is_ipv6_autoconf_active("vnet0").unwrap());
}

#[test]
fn test_unknown_device() {
    let tmp = proc_sys(&["default"]);
    let sysctl = Sysctl::new(tmp.path());

    assert!(!sysctl.is_ipv6_autoconf_active("vnet9").unwrap());
    assert_eq!(
        sysctl.set_rp_filter_loose("vnet9").unwrap_err().kind(),
        std::io::ErrorKind::NotFound
    );
    assert!(sysctl.enable_ipv6_autoconf("vnet9").is_err());
}
