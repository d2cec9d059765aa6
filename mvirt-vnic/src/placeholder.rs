//! `NIC-BRIDGE:<network>` placeholders in domain XML written by older
//! engines.
//!
//! This works on the raw text so everything around the placeholders is
//! kept byte for byte.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::bridge::{BridgeResolver, OvsBridge};

pub const PLACEHOLDER_PREFIX: &str = "NIC-BRIDGE:";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<source bridge="NIC-BRIDGE:([\w:-]+)"/>|NIC-BRIDGE:([\w:-]+)"#)
        .expect("placeholder pattern is valid")
});

/// Replace bridge placeholders in `xml`.
///
/// A `<source bridge="NIC-BRIDGE:x"/>` tag for an OVS-backed network
/// becomes a source, virtualport and optional VLAN fragment. For any other
/// network the prefix is stripped. Bare OVS placeholders outside a source
/// tag are left alone.
pub fn resolve_bridge_placeholders<'a>(xml: &'a str, bridges: &dyn BridgeResolver) -> Cow<'a, str> {
    let mut lookups: HashMap<String, Option<(OvsBridge, Option<u16>)>> = HashMap::new();

    PLACEHOLDER.replace_all(xml, |caps: &Captures<'_>| {
        let (network, in_source) = match (caps.get(1), caps.get(2)) {
            (Some(network), _) => (network.as_str(), true),
            (None, Some(network)) => (network.as_str(), false),
            (None, None) => return caps[0].to_string(),
        };

        let ovs = lookups
            .entry(network.to_string())
            .or_insert_with(|| {
                let ovs = bridges.ovs_bridge(network)?;
                let vlan = bridges.vlan_for_network(network);
                debug!(network = %network, bridge = %ovs.name, vlan = ?vlan, "Resolved placeholder to OVS");
                Some((ovs, vlan))
            })
            .clone();

        match (ovs, in_source) {
            (Some((ovs, vlan)), true) => ovs_fragment(&ovs.name, vlan),
            (Some(_), false) => caps[0].to_string(),
            (None, true) => format!(r#"<source bridge="{network}"/>"#),
            (None, false) => network.to_string(),
        }
    })
}

fn ovs_fragment(bridge: &str, vlan: Option<u16>) -> String {
    let mut fragment =
        format!("<source bridge='{bridge}'/><virtualport type='openvswitch'/>");
    if let Some(tag) = vlan {
        fragment.push_str(&format!("<vlan><tag id='{tag}'/></vlan>"));
    }
    fragment
}
