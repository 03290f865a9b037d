//! JSON integer handling for inconsistent upstream encodings.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unsigned 64-bit value that decodes from a JSON number or a decimal
/// string.
///
/// Pools and wallets disagree on whether numeric fields are sent as JSON
/// numbers or strings; both forms decode to the same value here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlexU64(pub u64);

impl FlexU64 {
    /// The plain integer value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for FlexU64 {
    fn from(v: u64) -> Self {
        FlexU64(v)
    }
}

impl From<FlexU64> for u64 {
    fn from(v: FlexU64) -> Self {
        v.0
    }
}

impl fmt::Display for FlexU64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for FlexU64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for FlexU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FlexVisitor)
    }
}

struct FlexVisitor;

impl Visitor<'_> for FlexVisitor {
    type Value = FlexU64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(FlexU64(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(FlexU64)
            .map_err(|_| E::custom("negative value for unsigned field"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse::<u64>().map(FlexU64).map_err(E::custom)
    }
}
