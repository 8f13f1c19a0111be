//! Protocol block types: verbs, values, and data entries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default TCP port of the Videohub control interface.
pub const DEFAULT_PORT: u16 = 9990;

/// The fixed verb table of the control protocol.
///
/// Wire strings must match byte-for-byte; the device rejects anything else
/// and firmware never extends the table mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Command accepted.
    Ack,
    /// Command rejected.
    Nak,
    /// Keep-alive no-op.
    Ping,
    /// Protocol version preamble sent on connect.
    ProtocolPreamble,
    /// Device descriptor (model, port counts, presence).
    VideohubDevice,
    /// Input port labels.
    InputLabels,
    /// Output port labels.
    OutputLabels,
    /// Monitoring output port labels.
    MonitoringOutputLabels,
    /// Serial port labels.
    SerialPortLabels,
    /// Output routing table (`<dest> <src>` per line).
    VideoOutputRouting,
    /// Monitoring output routing table.
    VideoMonitoringOutputRouting,
    /// Serial port routing table.
    SerialPortRouting,
    /// Output lock states.
    VideoOutputLocks,
    /// Monitoring output lock states.
    MonitoringOutputLocks,
    /// Serial port lock states.
    SerialPortLocks,
}

impl Verb {
    /// All verbs, for table lookups.
    const ALL: [Self; 15] = [
        Self::Ack,
        Self::Nak,
        Self::Ping,
        Self::ProtocolPreamble,
        Self::VideohubDevice,
        Self::InputLabels,
        Self::OutputLabels,
        Self::MonitoringOutputLabels,
        Self::SerialPortLabels,
        Self::VideoOutputRouting,
        Self::VideoMonitoringOutputRouting,
        Self::SerialPortRouting,
        Self::VideoOutputLocks,
        Self::MonitoringOutputLocks,
        Self::SerialPortLocks,
    ];

    /// Exact wire representation of this verb.
    pub const fn wire(self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Ping => "PING",
            Self::ProtocolPreamble => "PROTOCOL PREAMBLE",
            Self::VideohubDevice => "VIDEOHUB DEVICE",
            Self::InputLabels => "INPUT LABELS",
            Self::OutputLabels => "OUTPUT LABELS",
            Self::MonitoringOutputLabels => "MONITORING OUTPUT LABELS",
            Self::SerialPortLabels => "SERIAL PORT LABELS",
            Self::VideoOutputRouting => "VIDEO OUTPUT ROUTING",
            Self::VideoMonitoringOutputRouting => "VIDEO MONITORING OUTPUT ROUTING",
            Self::SerialPortRouting => "SERIAL PORT ROUTING",
            Self::VideoOutputLocks => "VIDEO OUTPUT LOCKS",
            Self::MonitoringOutputLocks => "MONITORING OUTPUT LOCKS",
            Self::SerialPortLocks => "SERIAL PORT LOCKS",
        }
    }

    /// Looks up a verb by its exact wire string.
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.wire() == s)
    }

    /// True for the `ACK`/`NAK` reply verbs.
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Ack | Self::Nak)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire())
    }
}

/// A normalized data-line value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// `true` / `false`.
    Bool(bool),
    /// A value that parsed as an integer with no residue.
    Int(i64),
    /// Anything else, verbatim.
    Text(String),
}

impl Value {
    /// Normalizes a raw wire value.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            other => other
                .parse::<i64>()
                .map_or_else(|_| Self::Text(other.to_owned()), Self::Int),
        }
    }

    /// The boolean payload, if this is a [`Value::Bool`].
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer payload, if this is a [`Value::Int`].
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The textual payload, if this is a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// One data line of a block.
///
/// Entries are kept as an ordered list, not a map: routing and label blocks
/// are indexed batch updates where arrival order matters and duplicate
/// indices are legal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    /// `"<index> <value>"` — a per-port update.
    Indexed {
        /// Device-local port id.
        index: u32,
        /// Updated value (label text, peer id, lock code).
        value: Value,
    },
    /// `"<Key Name>: <value>"` — a named descriptor field.
    ///
    /// Keys are normalized on parse: lowercased, spaces become underscores.
    Named {
        /// Normalized field key (e.g. `model_name`).
        key: String,
        /// Field value.
        value: Value,
    },
}

/// A complete protocol block: a verb plus its ordered data entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// The verb of the leading line.
    pub verb: Verb,
    /// Data lines in arrival order.
    pub entries: Vec<Entry>,
}

impl Block {
    /// A block with no data lines.
    pub const fn bare(verb: Verb) -> Self {
        Self {
            verb,
            entries: Vec::new(),
        }
    }

    /// A keep-alive `PING` block.
    pub const fn ping() -> Self {
        Self::bare(Verb::Ping)
    }

    /// A block carrying a single indexed entry.
    pub fn single(verb: Verb, index: u32, value: impl Into<Value>) -> Self {
        Self {
            verb,
            entries: vec![Entry::Indexed {
                index,
                value: value.into(),
            }],
        }
    }

    /// True for `ACK`/`NAK` blocks.
    pub const fn is_reply(&self) -> bool {
        self.verb.is_reply()
    }

    /// Looks up the first named field with the given (normalized) key.
    pub fn find(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find_map(|e| match e {
            Entry::Named { key: k, value } if k == key => Some(value),
            _ => None,
        })
    }

    /// Iterates over the indexed entries in arrival order.
    pub fn indexed(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Indexed { index, value } => Some((*index, value)),
            _ => None,
        })
    }
}
