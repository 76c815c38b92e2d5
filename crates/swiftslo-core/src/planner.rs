use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use crate::chunk::FileChunk;
use crate::error::{Result, UploadError};
use crate::pipeline::{map, ChunkReceiver, ErrorSink, STAGE_DEPTH};

/// Lay out the chunk plan for a file: `ceil(file_size / chunk_size)` chunks,
/// all of `chunk_size` bytes except a possibly-short last one.
///
/// Returns the lazy descriptor stream plus the total chunk count. The stream
/// stops early (and closes) if `shutdown` is set. This is the pipeline's
/// single cancellation point: nothing new enters the graph after an
/// interrupt, while chunks already in flight drain normally.
pub fn build_chunks(
    file_size: u64,
    chunk_size: u64,
    shutdown: Arc<AtomicBool>,
) -> Result<(ChunkReceiver, u64)> {
    if file_size == 0 || chunk_size == 0 {
        return Err(UploadError::EmptyPlan {
            file_size,
            chunk_size,
        });
    }

    let count = file_size.div_ceil(chunk_size);
    let (tx, rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        for number in 0..count {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("interrupt: chunk planner stopping at chunk {number}/{count}");
                return;
            }
            let offset = number * chunk_size;
            let size = if number == count - 1 {
                file_size - offset
            } else {
                chunk_size
            };
            let chunk = FileChunk {
                number,
                offset,
                size,
                ..Default::default()
            };
            if tx.send(chunk).is_err() {
                return;
            }
        }
    });
    Ok((rx, count))
}

/// Name every chunk from a printf-style template. A malformed template fails
/// each chunk to the error sink rather than silently passing it through.
pub fn object_namer(input: ChunkReceiver, errors: ErrorSink, template: String) -> ChunkReceiver {
    map(input, errors, move |mut chunk| {
        match format_name(&template, chunk.number, chunk.size) {
            Ok(name) => {
                chunk.object = name;
                Ok(chunk)
            }
            Err(e) => Err(UploadError::chunk(chunk.number, "", e.to_string())),
        }
    })
}

/// Set the target container on every chunk.
pub fn containerizer(input: ChunkReceiver, errors: ErrorSink, container: String) -> ChunkReceiver {
    map(input, errors, move |mut chunk| {
        chunk.container = container.clone();
        Ok(chunk)
    })
}

/// Render a name template. The template may contain up to two `%d` / `%0Nd`
/// directives, filled positionally with the chunk number then the chunk size;
/// `%%` renders a literal percent sign.
pub(crate) fn format_name(template: &str, number: u64, size: u64) -> Result<String> {
    let malformed = |message: &str| UploadError::NameTemplate {
        template: template.to_string(),
        message: message.to_string(),
    };

    let fields = [number, size];
    let mut next_field = 0usize;
    let mut out = String::with_capacity(template.len() + 8);
    let mut rest = template.chars().peekable();

    while let Some(c) = rest.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if rest.peek() == Some(&'%') {
            rest.next();
            out.push('%');
            continue;
        }
        let mut width = 0usize;
        let mut zero_pad = false;
        if rest.peek() == Some(&'0') {
            zero_pad = true;
            rest.next();
            while let Some(d) = rest.peek().and_then(|c| c.to_digit(10)) {
                width = width * 10 + d as usize;
                rest.next();
            }
        }
        match rest.next() {
            Some('d') => {}
            Some(other) => return Err(malformed(&format!("unsupported directive '%{other}'"))),
            None => return Err(malformed("dangling '%' at end of template")),
        }
        let value = *fields
            .get(next_field)
            .ok_or_else(|| malformed("more than two directives"))?;
        next_field += 1;
        if zero_pad {
            out.push_str(&format!("{value:0width$}"));
        } else {
            out.push_str(&value.to_string());
        }
    }
    Ok(out)
}
