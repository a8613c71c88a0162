//! Wire bytes to typed domain values.

use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors produced while turning a payload into a domain value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeserializeError {
    /// Record carried no payload
    #[error("Record at offset {offset} has no payload")]
    EmptyPayload {
        /// Offset of the offending record
        offset: i64,
    },

    /// Payload did not decode into the target type
    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Converts one record payload into a typed value.
pub trait Deserializer: Send + Sync {
    /// The domain type produced.
    type Output: Send;

    /// Decode `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`DeserializeError::Invalid`] if the bytes are not a valid
    /// encoding of [`Self::Output`].
    fn deserialize(&self, payload: &[u8]) -> Result<Self::Output, DeserializeError>;
}

/// JSON payloads decoded with `serde_json`.
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializer<T> {
    /// Create a deserializer for `T`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonDeserializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send> Deserializer for JsonDeserializer<T> {
    type Output = T;

    fn deserialize(&self, payload: &[u8]) -> Result<T, DeserializeError> {
        serde_json::from_slice(payload).map_err(|e| DeserializeError::Invalid(e.to_string()))
    }
}

/// Compact binary payloads decoded with `bincode`.
pub struct BincodeDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeDeserializer<T> {
    /// Create a deserializer for `T`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeDeserializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send> Deserializer for BincodeDeserializer<T> {
    type Output = T;

    fn deserialize(&self, payload: &[u8]) -> Result<T, DeserializeError> {
        bincode::deserialize(payload).map_err(|e| DeserializeError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PageView {
        url: String,
        user_id: u64,
    }

    #[test]
    fn json_decodes_domain_type() {
        let deserializer = JsonDeserializer::<PageView>::new();
        let view = deserializer
            .deserialize(br#"{"url":"/home","user_id":7}"#)
            .unwrap();
        assert_eq!(
            view,
            PageView {
                url: "/home".to_string(),
                user_id: 7
            }
        );
    }

    #[test]
    fn json_rejects_missing_field() {
        let deserializer = JsonDeserializer::<PageView>::new();
        let err = deserializer.deserialize(br#"{"url":"/home"}"#).unwrap_err();
        assert!(matches!(err, DeserializeError::Invalid(_)));
    }

    #[test]
    fn bincode_decodes_domain_type() {
        let view = PageView {
            url: "/cart".to_string(),
            user_id: 42,
        };
        let bytes = bincode::serialize(&view).unwrap();
        let decoded = BincodeDeserializer::<PageView>::new()
            .deserialize(&bytes)
            .unwrap();
        assert_eq!(decoded, view);
    }
}
