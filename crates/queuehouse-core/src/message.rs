//! Message Identifiers
//!
//! Every message stored by Queuehouse is addressed by a fixed 16-byte
//! identifier. The id is assigned by the publisher (or generated with
//! [`MessageId::random`]) and is globally unique: publishing the same id a
//! second time bumps the reference count of the already-stored payload
//! instead of writing a second copy.
//!
//! Ids are stored as `BLOB`s in the durable queue-entry table and embedded
//! verbatim in segment records, so the representation is a plain byte array
//! with no internal structure.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed-size message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Generate a fresh random id (UUID v4 bytes).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a byte slice, rejecting anything that is not
    /// exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidMessageId(bytes.len()))?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// Debug renders the same hex string as Display; the raw array form is
// useless in logs.
impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}
