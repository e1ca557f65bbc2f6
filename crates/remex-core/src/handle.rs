//! Opaque handles for server-resident objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit identifier of an object living in the server's registry.
///
/// The all-zero value is the sentinel for "no target object" and is what a
/// static command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(Uuid);

impl ObjectHandle {
    /// The "no object" handle.
    pub const SENTINEL: ObjectHandle = ObjectHandle(Uuid::nil());

    /// Generate a fresh random handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_sentinel(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ObjectHandle {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
