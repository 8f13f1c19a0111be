//! Port state model: one arena of ports per kind, keyed by device-local id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The four port kinds a Videohub exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// Video input.
    Input,
    /// Video output.
    Output,
    /// Monitoring output.
    Monitor,
    /// RS-422 serial port.
    Serial,
}

/// Lock state of a destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lock {
    /// Not locked (`U`).
    #[default]
    Unlocked,
    /// Locked by this controller (`L`).
    Locked,
    /// Locked by another controller (`O`).
    Owned,
}

impl Lock {
    /// Maps a wire code to a lock state. Unknown codes read as unlocked.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "L" => Self::Locked,
            "O" => Self::Owned,
            _ => Self::Unlocked,
        }
    }

    /// The single-letter wire code.
    pub const fn wire(self) -> &'static str {
        match self {
            Self::Unlocked => "U",
            Self::Locked => "L",
            Self::Owned => "O",
        }
    }
}

/// One physical connector on a device.
///
/// `route` holds peer port ids: for a destination port at most one entry
/// (its current source), for an input every destination it currently feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Device-local, stable numeric id.
    pub id: u32,
    /// Operator-assigned name; used for lookup and cross-device linking.
    pub label: String,
    /// Current lock state.
    pub lock: Lock,
    /// Peer port ids currently connected to this port.
    pub route: Vec<u32>,
}

impl Port {
    /// A fresh port with no label and no connections.
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            label: String::new(),
            lock: Lock::Unlocked,
            route: Vec::new(),
        }
    }

    /// The current source id, for destination ports.
    pub fn source(&self) -> Option<u32> {
        self.route.first().copied()
    }
}

/// Device descriptor from the `VIDEOHUB DEVICE` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Model name string.
    pub model: String,
    /// Declared video input count.
    pub inputs: u32,
    /// Declared video output count.
    pub outputs: u32,
    /// Declared monitoring output count.
    pub monitors: u32,
    /// Declared serial port count.
    pub serials: u32,
}

/// A derived source-to-destination view for one destination port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteView {
    /// The destination port.
    pub to: Port,
    /// The source currently feeding it, if any.
    pub from: Option<Port>,
}

/// Selects a port by numeric id or by label.
///
/// Label matching returns the first match; label uniqueness is not
/// enforced by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    /// Match on `Port::id`.
    Id(u32),
    /// Match on `Port::label` (exact, first hit wins).
    Label(String),
}

impl From<u32> for PortSelector {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for PortSelector {
    fn from(label: &str) -> Self {
        Self::Label(label.to_owned())
    }
}

impl From<String> for PortSelector {
    fn from(label: String) -> Self {
        Self::Label(label)
    }
}

/// Ports of one kind, keyed by id.
///
/// Ports are created lazily the first time the device mentions an id, and
/// wiped wholesale on reconnect or when the device reports itself absent.
pub(crate) type PortMap = BTreeMap<u32, Port>;

/// Finds a port by selector in a kind's arena.
pub(crate) fn find(ports: &PortMap, sel: &PortSelector) -> Option<Port> {
    match sel {
        PortSelector::Id(id) => ports.get(id).cloned(),
        PortSelector::Label(label) => ports.values().find(|p| &p.label == label).cloned(),
    }
}

/// Looks up a port by id, creating it on first mention.
pub(crate) fn entry(ports: &mut PortMap, id: u32) -> &mut Port {
    ports.entry(id).or_insert_with(|| Port::new(id))
}
