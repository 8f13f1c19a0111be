//! Block parser and serializer.
//!
//! Grammar: `"<VERB>:\n"` followed by data lines, terminated by a blank
//! line. Data lines are either `"<index> <value>"` (per-port update) or
//! `"<Key Name>: <value>"` (descriptor field). `ACK` and `NAK` arrive as
//! bare one-line blocks without the colon.

use crate::message::{Block, Entry, Value, Verb};

/// Parses one complete block (without its trailing blank line).
///
/// Returns `None` for empty input, unknown verbs, and malformed verb
/// lines. Data lines that match neither form are skipped; the device is
/// free to send fields this client does not know about.
pub fn parse(block: &str) -> Option<Block> {
    let block = block.trim();
    if block.is_empty() {
        return None;
    }

    // Replies are bare words, not verb lines.
    if block == Verb::Ack.wire() {
        return Some(Block::bare(Verb::Ack));
    }
    if block == Verb::Nak.wire() {
        return Some(Block::bare(Verb::Nak));
    }

    let mut lines = block.lines();
    let verb = lines.next()?.strip_suffix(':')?;
    let verb = Verb::from_wire(verb)?;

    let entries = lines.filter_map(parse_line).collect();
    Some(Block { verb, entries })
}

/// Parses a single data line into an entry.
fn parse_line(line: &str) -> Option<Entry> {
    // Indexed form first: "<digits> <rest>".
    if let Some((index, rest)) = line.split_once(' ')
        && !index.is_empty()
        && index.bytes().all(|b| b.is_ascii_digit())
        && let Ok(index) = index.parse::<u32>()
    {
        return Some(Entry::Indexed {
            index,
            value: Value::from_wire(rest.trim()),
        });
    }

    // Named form: "<Key Name>: <value>".
    let (key, value) = line.split_once(':')?;
    Some(Entry::Named {
        key: normalize_key(key),
        value: Value::from_wire(value.trim()),
    })
}

/// Lowercases a field key and replaces spaces with underscores.
fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace(' ', "_")
}

/// Serializes a block into its wire form, trailing blank line included.
pub fn serialize(block: &Block) -> String {
    let mut out = String::new();
    out.push_str(block.verb.wire());
    out.push_str(":\n");
    for entry in &block.entries {
        match entry {
            Entry::Indexed { index, value } => {
                out.push_str(&format!("{index} {value}\n"));
            }
            Entry::Named { key, value } => {
                out.push_str(&format!("{key}: {value}\n"));
            }
        }
    }
    out.push('\n');
    out
}
