//! Traffic shaping (`<bandwidth>`) for interfaces.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::xml::Element;

pub const INBOUND: &str = "inbound";
pub const OUTBOUND: &str = "outbound";

/// Shaping for one direction: the attributes of an `<inbound>` or
/// `<outbound>` element. `average`, `peak` and `floor` are in KiB/s, `burst`
/// in KiB. Attributes libvirt adds later are carried as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RateLimit {
    attributes: BTreeMap<String, String>,
}

impl RateLimit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.attributes.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn average(&self) -> Option<u64> {
        self.numeric("average")
    }

    pub fn burst(&self) -> Option<u64> {
        self.numeric("burst")
    }

    pub fn peak(&self) -> Option<u64> {
        self.numeric("peak")
    }

    fn numeric(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn to_element(&self, direction: &str) -> Element {
        let mut element = Element::new(direction);
        for (key, value) in self.attributes() {
            element.set_attr(key, value);
        }
        element
    }

    /// Copy every attribute of an `inbound`/`outbound` element.
    pub fn from_element(element: &Element) -> Self {
        Self {
            attributes: element
                .attributes()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Numbers and strings are stringified as they will appear in the XML.
/// `null` fields count as absent.
impl<'de> Deserialize<'de> for RateLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut limit = RateLimit::new();
        for (key, value) in raw {
            match value {
                Value::Null => {}
                Value::String(s) => limit.set(key, s),
                Value::Number(n) => limit.set(key, n),
                Value::Bool(b) => limit.set(key, b),
                other => {
                    return Err(de::Error::custom(format!(
                        "unsupported value for {key}: {other}"
                    )));
                }
            }
        }
        Ok(limit)
    }
}

/// Requested shaping for both directions.
///
/// Per direction: `None` keeps whatever the interface had, an empty
/// [`RateLimit`] clears it, anything else replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<RateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<RateLimit>,
}

impl BandwidthSpec {
    /// Whether either direction is mentioned at all.
    pub fn is_set(&self) -> bool {
        self.inbound.is_some() || self.outbound.is_some()
    }

    fn direction(&self, direction: &str) -> Option<&RateLimit> {
        match direction {
            INBOUND => self.inbound.as_ref(),
            _ => self.outbound.as_ref(),
        }
    }
}

/// Build a `<bandwidth>` element, carrying over directions `spec` leaves
/// unset from `previous` verbatim.
pub fn bandwidth_xml(spec: &BandwidthSpec, previous: Option<&Element>) -> Element {
    let mut bandwidth = Element::new("bandwidth");
    for direction in [INBOUND, OUTBOUND] {
        match spec.direction(direction) {
            None => {
                if let Some(old) = previous.and_then(|p| p.children_named(direction).last()) {
                    bandwidth.append_child(old.clone());
                }
            }
            Some(limit) if limit.is_empty() => {}
            Some(limit) => {
                bandwidth.append_child(limit.to_element(direction));
            }
        }
    }
    bandwidth
}

/// Replace the `<bandwidth>` of an `<interface>` element in place.
///
/// Does nothing unless `spec` mentions at least one direction.
pub fn update_bandwidth_xml(interface: &mut Element, spec: &BandwidthSpec) {
    if !spec.is_set() {
        return;
    }
    let updated = bandwidth_xml(spec, interface.child("bandwidth"));
    interface.remove_children_named("bandwidth");
    interface.append_child(updated);
}
