//! gzip helpers for the cache-write and result-write paths.
//!
//! Objects are compressed before hitting the blob store and tagged with
//! `content-encoding: gzip`; readers decompress transparently.

use crate::blob::BlobObject;
use crate::StoreError;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const CONTENT_ENCODING: &str = "content-encoding";
pub const GZIP: &str = "gzip";

pub fn gzip(data: &[u8]) -> Result<Bytes, StoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| StoreError::Backend(format!("gzip: {}", e)))
}

pub fn gunzip(data: &[u8]) -> Result<Bytes, StoreError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map(|_| Bytes::from(out))
        .map_err(|e| StoreError::Corrupt(format!("gunzip: {}", e)))
}

/// Compress an object's body in place and tag the encoding.
pub fn compress_object(mut object: BlobObject) -> Result<BlobObject, StoreError> {
    object.body = gzip(&object.body)?;
    object
        .metadata
        .insert(CONTENT_ENCODING.to_string(), GZIP.to_string());
    Ok(object)
}

/// Decompress an object's body if it is tagged `content-encoding: gzip`.
pub fn decompress_object(mut object: BlobObject) -> Result<BlobObject, StoreError> {
    if object
        .metadata
        .get(CONTENT_ENCODING)
        .map(|v| v == GZIP)
        .unwrap_or(false)
    {
        object.body = gunzip(&object.body)?;
        object.metadata.remove(CONTENT_ENCODING);
    }
    Ok(object)
}
