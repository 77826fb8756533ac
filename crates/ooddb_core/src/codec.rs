//! CBOR helpers mapping failures into [`CoreError::Codec`].

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes a value to CBOR bytes.
pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::Codec(e.to_string()))?;
    Ok(out)
}

/// Deserializes a value from CBOR bytes.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::Codec(e.to_string()))
}
