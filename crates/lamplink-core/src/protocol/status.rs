//! Status frame parsing
//!
//! The supply answers `FS` with a block like:
//!
//! ```text
//! START
//! SN=A1234
//! COOL=1
//! LAMP=0
//! SHUTTER=0
//! END
//! ```
//!
//! Anything before `START` (command echo, stale acknowledgements) and after
//! `END` is ignored. A block that never reaches `END` still yields the pairs
//! read so far.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;

/// Frame start marker
pub const FRAME_START: &str = "START";

/// Frame end marker
pub const FRAME_END: &str = "END";

/// A single status value, coerced from its text form
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    /// Integral value (`"3"` and `"3.0"` both land here)
    Int(i64),
    /// Non-integral number
    Float(f64),
    /// Anything that isn't numeric, kept verbatim
    Text(String),
}

impl StatusValue {
    /// Coerce the trimmed text of a status value
    pub fn coerce(text: &str) -> Self {
        if let Ok(f) = text.parse::<f64>() {
            if f.is_finite() {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    return StatusValue::Int(f as i64);
                }
                return StatusValue::Float(f);
            }
        }
        match text.parse::<i64>() {
            Ok(i) => StatusValue::Int(i),
            Err(_) => StatusValue::Text(text.to_string()),
        }
    }

    /// Get as integer, returning None if not integral
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatusValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret as a switch flag
    ///
    /// Numbers are true when non-zero. Text accepts ON/OFF and TRUE/FALSE in
    /// any case; other text has no boolean reading.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StatusValue::Int(v) => Some(*v != 0),
            StatusValue::Float(v) => Some(*v != 0.0),
            StatusValue::Text(s) => match s.to_ascii_uppercase().as_str() {
                "ON" | "TRUE" => Some(true),
                "OFF" | "FALSE" => Some(false),
                _ => None,
            },
        }
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Int(v) => write!(f, "{}", v),
            StatusValue::Float(v) => write!(f, "{}", v),
            StatusValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StatusEntry {
    key: String,
    value: StatusValue,
    raw: String,
}

/// Key/value pairs reported in one status frame, in device order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    entries: Vec<StatusEntry>,
}

impl StatusSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair from its raw text. A repeated key keeps its original
    /// position and takes the new value.
    pub fn insert(&mut self, key: &str, raw: &str) {
        let value = StatusValue::coerce(raw);
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value;
                entry.raw = raw.to_string();
            }
            None => self.entries.push(StatusEntry {
                key: key.to_string(),
                value,
                raw: raw.to_string(),
            }),
        }
    }

    /// Look up a value by exact key
    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Look up a value ignoring key case
    pub fn get_ignore_case(&self, key: &str) -> Option<&StatusValue> {
        self.entry_ignore_case(key).map(|e| &e.value)
    }

    /// The trimmed text the device sent for `key` (case-insensitive)
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.entry_ignore_case(key).map(|e| e.raw.as_str())
    }

    /// Boolean reading of a flag key (case-insensitive)
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get_ignore_case(key).and_then(StatusValue::as_bool)
    }

    fn entry_ignore_case(&self, key: &str) -> Option<&StatusEntry> {
        self.entries
            .iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
    }

    /// Iterate pairs in device order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatusValue)> {
        self.entries.iter().map(|e| (e.key.as_str(), &e.value))
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the frame carried no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render back into a `START…END` frame using the raw values
    pub fn render(&self) -> String {
        let mut out = String::from(FRAME_START);
        out.push('\n');
        for entry in &self.entries {
            out.push_str(&entry.key);
            out.push('=');
            out.push_str(&entry.raw);
            out.push('\n');
        }
        out.push_str(FRAME_END);
        out
    }
}

impl Serialize for StatusSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.key, &entry.value)?;
        }
        map.end()
    }
}

/// Result of parsing a status block
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Pairs collected
    pub snapshot: StatusSnapshot,
    /// Whether `END` was seen
    pub complete: bool,
}

/// Parse a status block and report whether it was terminated
pub fn parse_status_frame(raw: &str) -> ParsedFrame {
    let cleaned = raw.replace('\0', "");
    let mut snapshot = StatusSnapshot::new();
    let mut inside = false;
    let mut complete = false;

    for line in cleaned.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !inside {
            inside = line.eq_ignore_ascii_case(FRAME_START);
            continue;
        }
        if line.eq_ignore_ascii_case(FRAME_END) {
            complete = true;
            break;
        }
        if let Some((key, value)) = line.split_once('=') {
            snapshot.insert(key.trim(), value.trim());
        }
    }

    ParsedFrame { snapshot, complete }
}

/// Parse a status block into a snapshot
///
/// No `START` gives an empty snapshot; a missing `END` gives whatever was
/// collected.
pub fn parse_status_block(raw: &str) -> StatusSnapshot {
    parse_status_frame(raw).snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_basic_frame() {
        let snap = parse_status_block("START\nCOOL=1\nLAMP=0\nSHUTTER=0\nEND");
        let pairs: Vec<(&str, &StatusValue)> = snap.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("COOL", &StatusValue::Int(1)),
                ("LAMP", &StatusValue::Int(0)),
                ("SHUTTER", &StatusValue::Int(0)),
            ]
        );
    }

    #[test]
    fn test_noise_before_start_and_after_end() {
        let raw = "FS\r\nOK\r\nstart\r\nSN=ABC-7\r\nPOWER=0150\r\nend\r\nLAMP=1\r\n";
        let parsed = parse_status_frame(raw);
        assert!(parsed.complete);
        assert_eq!(parsed.snapshot.len(), 2);
        assert_eq!(parsed.snapshot.get("SN"), Some(&StatusValue::Text("ABC-7".into())));
        assert_eq!(parsed.snapshot.get("POWER"), Some(&StatusValue::Int(150)));
        assert_eq!(parsed.snapshot.raw("power"), Some("0150"));
        assert!(parsed.snapshot.get("LAMP").is_none());
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(StatusValue::coerce("3"), StatusValue::Int(3));
        assert_eq!(StatusValue::coerce("3.0"), StatusValue::Int(3));
        assert_eq!(StatusValue::coerce("-2.000"), StatusValue::Int(-2));
        assert_eq!(StatusValue::coerce("3.5"), StatusValue::Float(3.5));
        assert_eq!(StatusValue::coerce("ON"), StatusValue::Text("ON".into()));
        assert_eq!(StatusValue::coerce("nan"), StatusValue::Text("nan".into()));
        assert_eq!(StatusValue::coerce("inf"), StatusValue::Text("inf".into()));
        assert_eq!(StatusValue::coerce(""), StatusValue::Text(String::new()));
    }

    #[test]
    fn test_no_start_is_empty() {
        let parsed = parse_status_frame("COOL=1\nLAMP=1\nEND\n");
        assert!(parsed.snapshot.is_empty());
        assert!(!parsed.complete);
    }

    #[test]
    fn test_missing_end_keeps_partial_pairs() {
        let parsed = parse_status_frame("START\nCOOL=1\nLAMP=");
        assert!(!parsed.complete);
        assert_eq!(parsed.snapshot.len(), 2);
        assert_eq!(parsed.snapshot.get("COOL"), Some(&StatusValue::Int(1)));
        assert_eq!(parsed.snapshot.get("LAMP"), Some(&StatusValue::Text(String::new())));
    }

    #[test]
    fn test_duplicate_keys_take_last_value() {
        let snap = parse_status_block("START\nLAMP=0\nCOOL=1\nLAMP=1\nEND");
        let keys: Vec<&str> = snap.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["LAMP", "COOL"]);
        assert_eq!(snap.get("LAMP"), Some(&StatusValue::Int(1)));
    }

    #[test]
    fn test_null_bytes_and_lines_without_equals() {
        let snap = parse_status_block("\0\0START\0\nREADY\nMODE = a=b \nEND\n");
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("MODE"), Some(&StatusValue::Text("a=b".into())));
    }

    #[test]
    fn test_keys_are_case_preserved() {
        let snap = parse_status_block("START\nCool=1\nEND");
        assert!(snap.get("COOL").is_none());
        assert_eq!(snap.get_ignore_case("COOL"), Some(&StatusValue::Int(1)));
        assert_eq!(snap.flag("cool"), Some(true));
    }

    #[test]
    fn test_render_then_reparse_is_stable() {
        let frames = [
            "START\nSN=00042\nCOOL=1\nLAMP=0\nSHUTTER=1\nEND",
            "START\nTEMP=31.25\nMODE=STANDBY\nEND",
            "START\nEND",
        ];
        for frame in frames {
            let first = parse_status_block(frame);
            let second = parse_status_block(&first.render());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_as_bool() {
        assert_eq!(StatusValue::Int(2).as_bool(), Some(true));
        assert_eq!(StatusValue::Int(0).as_bool(), Some(false));
        assert_eq!(StatusValue::Text("off".into()).as_bool(), Some(false));
        assert_eq!(StatusValue::Text("maybe".into()).as_bool(), None);
    }

    #[test]
    fn test_serializes_in_device_order() {
        let snap = parse_status_block("START\nSN=X9\nCOOL=1\nTEMP=30.5\nEND");
        assert_eq!(
            serde_json::to_string(&snap).unwrap_or_default(),
            r#"{"SN":"X9","COOL":1,"TEMP":30.5}"#
        );
    }
}
