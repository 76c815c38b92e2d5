use std::sync::Arc;

use swiftslo_storage::ObjectStore;

use crate::error::UploadError;
use crate::pipeline::{map, ChunkReceiver, ErrorSink};

/// Upload each chunk's body as an independent object, forwarding the chunk on
/// success. Retry and re-auth live inside the store; whatever error surfaces
/// here is final for the chunk, which is reported to the sink and dropped.
///
/// Run one instance per stream from `divide` for K-way parallelism; there is
/// no semaphore, the instance count is the bound.
pub fn upload_data(
    input: ChunkReceiver,
    errors: ErrorSink,
    store: Arc<dyn ObjectStore>,
) -> ChunkReceiver {
    map(input, errors, move |chunk| {
        let Some(data) = chunk.data.as_deref() else {
            return Err(UploadError::chunk(
                chunk.number,
                &chunk.object,
                "no data to upload",
            ));
        };
        match store.put_object(&chunk.container, &chunk.object, data, &chunk.hash) {
            Ok(()) => {
                tracing::debug!(
                    "uploaded chunk {} ({} bytes) to {}",
                    chunk.number,
                    chunk.size,
                    chunk.path(),
                );
                Ok(chunk)
            }
            Err(e) => Err(UploadError::chunk(
                chunk.number,
                &chunk.object,
                format!("upload failed: {e}"),
            )),
        }
    })
}

/// Drop chunk bodies so the buffers can be reclaimed. Placed immediately
/// after the upload join, before any stage that would hold chunks in bulk.
pub fn clear_data(input: ChunkReceiver, errors: ErrorSink) -> ChunkReceiver {
    map(input, errors, |mut chunk| {
        chunk.data = None;
        Ok(chunk)
    })
}

/// Upload manifest chunks with SLO manifest PUT semantics, forwarding each
/// descriptor (body included) so a higher tier can reference or re-upload it.
pub fn upload_manifests(
    input: ChunkReceiver,
    errors: ErrorSink,
    store: Arc<dyn ObjectStore>,
) -> ChunkReceiver {
    map(input, errors, move |chunk| {
        let Some(body) = chunk.data.as_deref() else {
            return Err(UploadError::chunk(
                chunk.number,
                &chunk.object,
                "manifest chunk has no body",
            ));
        };
        match store.put_manifest(&chunk.container, &chunk.object, body) {
            Ok(()) => {
                tracing::info!("uploaded manifest {}", chunk.path());
                Ok(chunk)
            }
            Err(e) => Err(UploadError::chunk(
                chunk.number,
                &chunk.object,
                format!("manifest upload failed: {e}"),
            )),
        }
    })
}
