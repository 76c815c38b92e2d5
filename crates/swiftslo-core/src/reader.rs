use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::bounded;

use crate::error::UploadError;
use crate::pipeline::{ChunkReceiver, ErrorSink, STAGE_DEPTH};

/// Fill each chunk's `data` from the source file.
///
/// One thread owns the file handle, so reads are serialized in plan order;
/// concurrent seeks against a spinning disk would only hurt. Backpressure
/// comes from the depth-1 output channel: the next read does not start until
/// downstream has accepted the current chunk, bounding buffered memory no
/// matter how many uploaders run.
pub fn read_data(input: ChunkReceiver, errors: ErrorSink, mut file: File) -> ChunkReceiver {
    let (tx, rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        for mut chunk in input {
            let mut buf = vec![0u8; chunk.size as usize];
            let result = file
                .seek(SeekFrom::Start(chunk.offset))
                .and_then(|_| file.read_exact(&mut buf));
            match result {
                Ok(()) => {
                    chunk.data = Some(Bytes::from(buf));
                    if tx.send(chunk).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = errors.send(UploadError::chunk(
                        chunk.number,
                        &chunk.object,
                        format!("read of {} bytes at offset {} failed: {e}", chunk.size, chunk.offset),
                    ));
                }
            }
        }
    });
    rx
}
