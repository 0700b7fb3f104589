//! Value codecs translating between node payloads and application values.
//!
//! A node payload is `Option<Vec<u8>>`: `None` is a node that exists with no
//! content. Codecs map that null payload to a null value instead of failing,
//! so "present but null" survives the round trip. Absence of the node itself is
//! handled by the watcher, never by a codec.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CodecError;


pub trait ValueCodec: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn encode(
        &self,
        value: Option<&Self::Value>,
    ) -> Result<Option<Vec<u8>>, CodecError>;

    fn decode(
        &self,
        payload: Option<&[u8]>,
    ) -> Result<Option<Self::Value>, CodecError>;
}

/// Pass-through codec for callers that already work with raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    type Value = Vec<u8>;

    fn encode(
        &self,
        value: Option<&Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        Ok(value.cloned())
    }

    fn decode(
        &self,
        payload: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        Ok(payload.map(<[u8]>::to_vec))
    }
}

/// UTF-8 text payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl ValueCodec for StringCodec {
    type Value = String;

    fn encode(
        &self,
        value: Option<&String>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        Ok(value.map(|v| v.as_bytes().to_vec()))
    }

    fn decode(
        &self,
        payload: Option<&[u8]>,
    ) -> Result<Option<String>, CodecError> {
        payload
            .map(|bytes| String::from_utf8(bytes.to_vec()).map_err(CodecError::from))
            .transpose()
    }
}

/// Any serde type, stored in bincode form.
#[derive(Debug)]
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> ValueCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Value = T;

    fn encode(
        &self,
        value: Option<&T>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        value.map(|v| bincode::serialize(v).map_err(CodecError::from)).transpose()
    }

    fn decode(
        &self,
        payload: Option<&[u8]>,
    ) -> Result<Option<T>, CodecError> {
        payload
            .map(|bytes| bincode::deserialize(bytes).map_err(CodecError::from))
            .transpose()
    }
}
