//! Records of intercepted calls, written one JSON object per line.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::identity::TargetIdentity;

/// Summary of a single argument or return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),

    /// Flags and codes, shown in hexadecimal.
    #[serde(with = "hex")]
    Hex(u64),

    /// An address. Only its value is recorded, never what it points to.
    #[serde(with = "hex")]
    Ptr(u64),

    Text(Cow<'static, str>),
    List(Vec<Value>),
}

impl Value {
    #[inline]
    pub fn ptr<T>(ptr: *const T) -> Self {
        Self::Ptr(ptr as usize as u64)
    }

    #[inline]
    pub const fn name(name: &'static str) -> Self {
        Self::Text(Cow::Borrowed(name))
    }
}

/// A named argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: Cow<'static, str>,
    pub value: Value,
}

impl Argument {
    #[inline]
    pub const fn new(name: &'static str, value: Value) -> Self {
        Self {
            name: Cow::Borrowed(name),
            value,
        }
    }
}

/// Arguments captured at entry, before any rewrite.
pub type ArgumentSnapshot = Vec<Argument>;

/// One intercepted invocation.
///
/// Records of one thread are ordered by `sequence`, which is assigned when the
/// call enters the interceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Microseconds since the Unix epoch at entry.
    pub timestamp_micros: u64,
    pub target: TargetIdentity,
    pub thread_id: u64,
    pub sequence: u64,
    pub arguments: ArgumentSnapshot,

    /// Arguments actually forwarded, when a rewrite replaced them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_arguments: Option<ArgumentSnapshot>,

    /// Value returned by the original function.
    pub return_value: Value,

    /// Value returned to the caller, when a rewrite replaced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_return: Option<Value>,

    pub duration_micros: u64,
}

mod hex {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("{value:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        let digits = text
            .strip_prefix("0x")
            .ok_or_else(|| de::Error::custom("expected 0x prefix"))?;
        u64::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord {
            timestamp_micros: 1_700_000_000_000_000,
            target: TargetIdentity::vtable_slot("ID3D11Device", 5),
            thread_id: 4242,
            sequence: 7,
            arguments: vec![
                Argument::new("width", Value::U64(1920)),
                Argument::new("format", Value::name("NV12")),
                Argument::new("misc_flags", Value::Hex(0x900)),
                Argument::new("desc", Value::Ptr(0x7ff6_1234_0000)),
            ],
            rewritten_arguments: None,
            return_value: Value::Hex(0),
            rewritten_return: None,
            duration_micros: 85,
        }
    }

    #[test]
    fn serializes_as_single_json_line() {
        let line = serde_json::to_string(&record()).unwrap();
        assert!(!line.contains('\n'));

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["target"], "ID3D11Device#5");
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["arguments"][0]["value"]["u64"], 1920);
        assert_eq!(json["arguments"][2]["value"]["hex"], "0x900");
        assert_eq!(json["arguments"][3]["value"]["ptr"], "0x7ff612340000");
        assert!(json.get("rewritten_arguments").is_none());
    }

    #[test]
    fn rewritten_fields_appear_when_set() {
        let mut record = record();
        record.rewritten_arguments = Some(vec![Argument::new("misc_flags", Value::Hex(0x2))]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["rewritten_arguments"][0]["value"]["hex"], "0x2");

        let back: CallRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
