use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// The serialization collaborator used for both cached payloads and the manifest.
///
/// The file cache does not care about the concrete byte format. Any failure is forwarded to
/// the caller as [`CacheError::Serialization`](super::CacheError::Serialization) unmodified.
pub trait Codec: Send + Sync + 'static {
    /// The error raised when encoding or decoding fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encodes `value` into `sink`.
    fn encode<W, T>(&self, sink: W, value: &T) -> Result<(), Self::Error>
    where
        W: Write,
        T: Serialize + ?Sized;

    /// Decodes a value of type `T` from `source`.
    fn decode<R, T>(&self, source: R) -> Result<T, Self::Error>
    where
        R: Read,
        T: DeserializeOwned;
}

/// Stores values as JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn encode<W, T>(&self, sink: W, value: &T) -> Result<(), Self::Error>
    where
        W: Write,
        T: Serialize + ?Sized,
    {
        serde_json::to_writer(sink, value)
    }

    fn decode<R, T>(&self, source: R) -> Result<T, Self::Error>
    where
        R: Read,
        T: DeserializeOwned,
    {
        serde_json::from_reader(source)
    }
}

/// Stores values as YAML documents, which is handy when cache files are inspected by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    type Error = serde_yaml::Error;

    fn encode<W, T>(&self, sink: W, value: &T) -> Result<(), Self::Error>
    where
        W: Write,
        T: Serialize + ?Sized,
    {
        serde_yaml::to_writer(sink, value)
    }

    fn decode<R, T>(&self, source: R) -> Result<T, Self::Error>
    where
        R: Read,
        T: DeserializeOwned,
    {
        serde_yaml::from_reader(source)
    }
}
