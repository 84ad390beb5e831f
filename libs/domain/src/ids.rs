//! Entity identifiers
//!
//! One generic [`Id`] type covers every entity; the kind parameter pins the
//! tag used in the text form (`inst:018f2a3360c17b1c9b2e4a5c6d7e8f90`) so an
//! id of one kind can never parse as another. The payload is a UUID v7,
//! which keeps ids sortable by creation time.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Marker supplying the text-form tag of an entity kind
pub trait EntityKind {
    const TAG: &'static str;
}

/// Kind markers for every identifiable entity
pub mod kind {
    use super::EntityKind;

    macro_rules! entity_kinds {
        ($($name:ident => $tag:literal),* $(,)?) => {
            $(
                pub struct $name;

                impl EntityKind for $name {
                    const TAG: &'static str = $tag;
                }
            )*
        };
    }

    entity_kinds! {
        Workflow => "wf",
        Instance => "inst",
        UserTask => "utask",
        Variable => "var",
    }
}

pub type WorkflowId = Id<kind::Workflow>;
pub type InstanceId = Id<kind::Instance>;
pub type UserTaskId = Id<kind::UserTask>;
pub type VariableId = Id<kind::Variable>;

/// The string failed to parse as an id of the expected kind
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("'{raw}' is not a valid {expected} id")]
pub struct InvalidId {
    pub expected: &'static str,
    pub raw: String,
}

/// A kind-tagged, time-ordered entity id
pub struct Id<K> {
    value: Uuid,
    kind: PhantomData<fn() -> K>,
}

impl<K: EntityKind> Id<K> {
    /// Mint a fresh id; v7 payloads sort by creation time
    #[must_use]
    pub fn new() -> Self {
        Self::from_uuid(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub const fn from_uuid(value: Uuid) -> Self {
        Self {
            value,
            kind: PhantomData,
        }
    }

    /// The untagged UUID payload
    #[must_use]
    pub const fn raw(&self) -> Uuid {
        self.value
    }
}

impl<K: EntityKind> Default for Id<K> {
    fn default() -> Self {
        Self::new()
    }
}

// The kind parameter is phantom; none of these may demand anything of K
// beyond its tag, so the usual derives (which would bound K) are spelled
// out by hand.

impl<K> Clone for Id<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Id<K> {}

impl<K> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<K> Eq for Id<K> {}

impl<K> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<K> PartialOrd for Id<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Id<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<K: EntityKind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", K::TAG, self.value.simple())
    }
}

impl<K: EntityKind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<K: EntityKind> FromStr for Id<K> {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidId {
            expected: K::TAG,
            raw: s.to_string(),
        };

        let payload = s
            .strip_prefix(K::TAG)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(invalid)?;
        let value = Uuid::try_parse(payload).map_err(|_| invalid())?;
        Ok(Self::from_uuid(value))
    }
}

impl<K: EntityKind> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, K: EntityKind> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
