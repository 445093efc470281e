// Item Codec Port
//
// The worker pool is generic over `T`, backends only store bytes.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub trait ItemCodec<T>: Send + Sync {
    fn encode(&self, item: &T) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<T>;
}

/// JSON codec (default)
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ItemCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(item)?)
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_codec_string_payload() {
        let codec = JsonCodec::<String>::new();
        let bytes = codec.encode(&"42".to_string()).unwrap();
        assert_eq!(bytes, b"\"42\"");
        assert!(codec.decode(b"not json").is_err());
    }
}
