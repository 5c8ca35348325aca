//! Value-set encoding.
//!
//! A `BTreeSet<String>` serialized as a JSON array: sorted and deduplicated,
//! so equal sets always encode to identical bytes.

use super::Values;
use crate::error::{CacheError, Result};

pub fn encode_values(values: &Values) -> Result<Vec<u8>> {
    serde_json::to_vec(values).map_err(|e| CacheError::Internal(format!("encode: {}", e)))
}

pub fn decode_values(cache: &str, bytes: &[u8]) -> Result<Values> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::corrupt(cache, e))
}
