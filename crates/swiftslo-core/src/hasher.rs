use md5::{Digest, Md5};

use crate::error::UploadError;
use crate::pipeline::{map, ChunkReceiver, ErrorSink};

/// Lowercase hex MD5, the ETag form the object store understands.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Set `hash` on every chunk from its `data`. Chunks routed here without a
/// body are a wiring bug upstream; they are reported and dropped. `data` is
/// left in place because the uploader still needs it.
pub fn hash_data(input: ChunkReceiver, errors: ErrorSink) -> ChunkReceiver {
    map(input, errors, |mut chunk| match chunk.data {
        Some(ref data) => {
            chunk.hash = md5_hex(data);
            Ok(chunk)
        }
        None => Err(UploadError::chunk(
            chunk.number,
            &chunk.object,
            "no data to hash",
        )),
    })
}
