//! Entity and operation identifiers.

use crate::error::TypesError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Prefix of every client-generated placeholder id.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Identifier of a cached entity.
///
/// Entities created offline carry a `Temp` id (`temp_<uuid>`) until the server
/// confirms the create and assigns a `Canonical` id. On the wire a canonical id
/// is a JSON number and a temp id is a JSON string, matching the server's own
/// resource shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Canonical(i64),
    Temp(String),
}

impl EntityId {
    /// Generates a fresh temp id.
    pub fn new_temp() -> Self {
        Self::Temp(format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    pub fn as_canonical(&self) -> Option<i64> {
        match self {
            Self::Canonical(id) => Some(*id),
            Self::Temp(_) => None,
        }
    }

    pub fn as_temp(&self) -> Option<&str> {
        match self {
            Self::Canonical(_) => None,
            Self::Temp(id) => Some(id),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self::Canonical(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical(id) => write!(f, "{id}"),
            Self::Temp(id) => f.write_str(id),
        }
    }
}

impl FromStr for EntityId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(TEMP_ID_PREFIX) && s.len() > TEMP_ID_PREFIX.len() {
            return Ok(Self::Temp(s.to_string()));
        }
        s.parse::<i64>()
            .map(Self::Canonical)
            .map_err(|_| TypesError::InvalidEntityId(s.to_string()))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Canonical(id) => serializer.serialize_i64(*id),
            Self::Temp(id) => serializer.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntityIdVisitor;

        impl<'de> Visitor<'de> for EntityIdVisitor {
            type Value = EntityId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an integer id or a temp_ string id")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<EntityId, E> {
                Ok(EntityId::Canonical(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<EntityId, E> {
                i64::try_from(v)
                    .map(EntityId::Canonical)
                    .map_err(|_| E::custom(format!("entity id out of range: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<EntityId, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(EntityIdVisitor)
    }
}

/// Stable identifier of a queued operation. Also sent as the server
/// idempotency key, so a replayed attempt never creates a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TypesError::InvalidOperationId(s.to_string()))
    }
}

/// Replaces every JSON string equal to `temp_id` with the canonical number.
/// Returns how many occurrences were rewritten.
pub fn replace_id_in_json(value: &mut serde_json::Value, temp_id: &str, server_id: i64) -> usize {
    use serde_json::Value;

    if value.as_str() == Some(temp_id) {
        *value = Value::from(server_id);
        return 1;
    }
    match value {
        Value::Array(items) => items
            .iter_mut()
            .map(|v| replace_id_in_json(v, temp_id, server_id))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|v| replace_id_in_json(v, temp_id, server_id))
            .sum(),
        _ => 0,
    }
}
