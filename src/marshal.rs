//! Marshalling support for stored records.
//!
//! This module defines the codec boundary between the pool and its
//! backends: a [`StoredRecord`] is what a backend persists per item, and a
//! [`Marshaller`] turns batches of records into bytes and back. Encoding is
//! batch-shaped so a codec failure on one record never aborts the rest of a
//! save; the ids that could not be encoded are reported back to the caller
//! as failed.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

/// The structured record a backend persists per item.
///
/// Tag-operation metadata (adds, removes) is never part of this record; it
/// is derived at commit time and passed sideband to the backend save hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// The opaque application payload.
    pub value: Vec<u8>,
    /// The tag names attached to the item at the time it was stored.
    pub tags: HashSet<String>,
}

/// Trait for marshalling and unmarshalling stored records.
pub trait Marshaller: Send + Sync + Debug {
    /// Encodes a batch of records.
    ///
    /// Returns the encoded bytes by id, plus the ids whose records could
    /// not be encoded.
    fn encode(
        &self,
        records: HashMap<String, StoredRecord>,
    ) -> (HashMap<String, Vec<u8>>, Vec<String>);

    /// Decodes a single stored record.
    fn decode(&self, bytes: &[u8]) -> Result<StoredRecord>;
}

/// Bincode marshaller implementation.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMarshaller;

#[cfg(feature = "bincode")]
impl BincodeMarshaller {
    /// Create a new BincodeMarshaller.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "bincode")]
impl Marshaller for BincodeMarshaller {
    fn encode(
        &self,
        records: HashMap<String, StoredRecord>,
    ) -> (HashMap<String, Vec<u8>>, Vec<String>) {
        let mut encoded = HashMap::with_capacity(records.len());
        let mut failed = Vec::new();
        for (id, record) in records {
            match bincode::serialize(&record) {
                Ok(bytes) => {
                    encoded.insert(id, bytes);
                }
                Err(_) => failed.push(id),
            }
        }
        (encoded, failed)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredRecord> {
        bincode::deserialize(bytes).map_err(crate::error::Error::codec)
    }
}

/// JSON marshaller implementation.
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

#[cfg(feature = "json")]
impl JsonMarshaller {
    /// Create a new JsonMarshaller.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "json")]
impl Marshaller for JsonMarshaller {
    fn encode(
        &self,
        records: HashMap<String, StoredRecord>,
    ) -> (HashMap<String, Vec<u8>>, Vec<String>) {
        let mut encoded = HashMap::with_capacity(records.len());
        let mut failed = Vec::new();
        for (id, record) in records {
            match serde_json::to_vec(&record) {
                Ok(bytes) => {
                    encoded.insert(id, bytes);
                }
                Err(_) => failed.push(id),
            }
        }
        (encoded, failed)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredRecord> {
        serde_json::from_slice(bytes).map_err(crate::error::Error::codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StoredRecord {
        StoredRecord {
            value: b"payload".to_vec(),
            tags: ["a", "b"].into_iter().map(String::from).collect(),
        }
    }

    #[test]
    #[cfg(feature = "bincode")]
    fn test_bincode_marshaller() {
        let marshaller = BincodeMarshaller::new();
        let (encoded, failed) =
            marshaller.encode(HashMap::from([("id1".to_string(), record())]));
        assert!(failed.is_empty());
        let decoded = marshaller.decode(&encoded["id1"]).unwrap();
        assert_eq!(decoded, record());
    }

    #[test]
    #[cfg(feature = "json")]
    fn test_json_marshaller() {
        let marshaller = JsonMarshaller::new();
        let (encoded, failed) =
            marshaller.encode(HashMap::from([("id1".to_string(), record())]));
        assert!(failed.is_empty());
        let decoded = marshaller.decode(&encoded["id1"]).unwrap();
        assert_eq!(decoded, record());
    }

    #[test]
    #[cfg(feature = "bincode")]
    fn test_decode_garbage_is_a_codec_error() {
        let marshaller = BincodeMarshaller::new();
        assert!(matches!(
            marshaller.decode(&[0xff, 0xfe, 0x01]),
            Err(crate::error::Error::Codec(_))
        ));
    }
}
