use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use swiftslo_core::{Count, UploadEvent};
use tracing_subscriber::fmt::MakeWriter;

use crate::color::Painter;
use crate::format::{format_bytes, rate_kib};

const PROGRESS_REDRAW_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Terminal coordination
// ---------------------------------------------------------------------------

/// Whether a status line currently occupies the bottom of the terminal.
static LINE_VISIBLE: AtomicBool = AtomicBool::new(false);

/// Only one writer at a time touches stderr, whether that is the renderer
/// repainting its line or tracing emitting a log event.
static TERM: Mutex<()> = Mutex::new(());

fn term_lock() -> MutexGuard<'static, ()> {
    TERM.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracing writer that cooperates with the status line.
///
/// Each log event accumulates in a buffer and reaches stderr in a single
/// locked write on drop, with the status line wiped first. Buffering whole
/// events keeps a log message from landing inside a half-painted progress
/// line no matter how tracing splits its writes.
pub(crate) struct LogWriter;

pub(crate) struct LogEvent {
    buf: Vec<u8>,
}

impl Write for LogEvent {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogEvent {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let _guard = term_lock();
        let mut stderr = io::stderr();
        if LINE_VISIBLE.load(Relaxed) && stderr.is_terminal() {
            let _ = stderr.write_all(b"\r\x1b[2K");
        }
        let _ = stderr.write_all(&self.buf);
        let _ = stderr.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogEvent;

    fn make_writer(&'a self) -> Self::Writer {
        LogEvent { buf: Vec::new() }
    }
}

// ---------------------------------------------------------------------------
// Upload progress renderer
// ---------------------------------------------------------------------------

/// Consumes [`UploadEvent`]s and keeps one stderr line current with combined
/// hash and upload progress; manifest lifecycle messages print above it.
pub(crate) struct ProgressRenderer {
    painter: Painter,
    total_chunks: u64,
    hashed: Option<Count>,
    uploaded: Option<Count>,
    last_draw: Instant,
    rendered_any: bool,
}

impl ProgressRenderer {
    pub(crate) fn new(painter: Painter) -> Self {
        Self {
            painter,
            total_chunks: 0,
            hashed: None,
            uploaded: None,
            last_draw: Instant::now(),
            rendered_any: false,
        }
    }

    pub(crate) fn on_event(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Planned { chunks, bytes } => {
                self.total_chunks = chunks;
                let line = self.painter.cyan(&format!(
                    "Uploading {chunks} chunk(s), {} total",
                    format_bytes(bytes)
                ));
                self.announce(&line);
            }
            UploadEvent::HashProgress(count) => {
                self.hashed = Some(count);
                self.render(false);
            }
            UploadEvent::UploadProgress(count) => {
                self.uploaded = Some(count);
                self.render(false);
            }
            UploadEvent::ManifestStarted { path } => {
                let line = self.painter.cyan(&format!("Uploading manifest: {path}"));
                self.announce(&line);
            }
            UploadEvent::ManifestUploaded { .. } => {}
            UploadEvent::TopManifestUploaded { path } => {
                let line = self.painter.green(&format!("Upload succeeded for {path}"));
                self.announce(&line);
            }
            UploadEvent::ChunkError(message) => {
                let line = self.painter.yellow(&message);
                self.announce(&line);
            }
        }
    }

    /// Print a full line above the progress line, then repaint it.
    fn announce(&mut self, line: &str) {
        {
            let _guard = term_lock();
            eprint!("{}{line}\n", self.painter.clear_line());
        }
        self.rendered_any = false;
        self.render(true);
    }

    pub(crate) fn finish(&mut self) {
        if self.rendered_any {
            self.render(true);
            let _guard = term_lock();
            eprintln!();
        }
        LINE_VISIBLE.store(false, Relaxed);
    }

    fn percent(&self, count: &Option<Count>) -> f64 {
        match (count, self.total_chunks) {
            (Some(c), total) if total > 0 => c.chunks as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    fn rate(count: &Option<Count>) -> f64 {
        count.map_or(0.0, |c| rate_kib(c.bytes, c.elapsed))
    }

    fn render(&mut self, force: bool) {
        if !force && self.rendered_any && self.last_draw.elapsed() < PROGRESS_REDRAW_INTERVAL {
            return;
        }
        self.last_draw = Instant::now();

        let line = format!(
            "{:06.2}% hashed ({:.2} KiB/s) {:06.2}% uploaded ({:.2} KiB/s)",
            self.percent(&self.hashed),
            Self::rate(&self.hashed),
            self.percent(&self.uploaded),
            Self::rate(&self.uploaded),
        );

        {
            let _guard = term_lock();
            eprint!("{}{}", self.painter.clear_line(), self.painter.cyan(&line));
            let _ = io::stderr().flush();
        }
        LINE_VISIBLE.store(true, Relaxed);
        self.rendered_any = true;
    }
}
