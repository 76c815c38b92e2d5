use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use swiftslo_storage::ObjectStore;

use crate::chunk::FileChunk;
use crate::error::{Result, UploadError};
use crate::hasher;
use crate::manifest::{self, DEFAULT_MANIFEST_CAPACITY};
use crate::pipeline::{self, ChunkReceiver, Count, ErrorSink, ERROR_SINK_DEPTH, STAGE_DEPTH};
use crate::planner;
use crate::reader;
use crate::uploader;

/// Everything the driver needs to run one upload.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub source: PathBuf,
    pub container: String,
    pub object: String,
    pub chunk_size: u64,
    /// Parallel upload workers (K).
    pub max_uploads: usize,
    /// Entries per manifest (M).
    pub manifest_capacity: usize,
    /// Chunk numbers to skip reading/uploading. Their descriptors still flow
    /// into the manifest, which the store will then refuse to validate.
    pub excluded_chunks: Vec<u64>,
    /// Sidecar-preloaded `"<container>/<object>"` → hex MD5.
    pub known_hashes: HashMap<String, String>,
    /// Object names already present server-side (`only-missing` mode);
    /// chunks matching by name skip the upload stage.
    pub serverside_objects: Vec<String>,
}

impl UploadConfig {
    pub fn new(source: PathBuf, container: String, object: String) -> Self {
        Self {
            source,
            container,
            object,
            chunk_size: 1_000_000_000,
            max_uploads: thread::available_parallelism().map_or(4, |n| n.get()),
            manifest_capacity: DEFAULT_MANIFEST_CAPACITY,
            excluded_chunks: Vec::new(),
            known_hashes: HashMap::new(),
            serverside_objects: Vec::new(),
        }
    }
}

/// Out-of-band notifications for the terminal layer.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Planned { chunks: u64, bytes: u64 },
    HashProgress(Count),
    UploadProgress(Count),
    /// A manifest PUT is about to start.
    ManifestStarted { path: String },
    ManifestUploaded { path: String },
    TopManifestUploaded { path: String },
    ChunkError(String),
}

/// What a run produced, on every exit path.
#[derive(Debug)]
pub struct UploadReport {
    /// All `"<container>/<object>"` → hash pairs observed on the sidecar tap.
    pub hashes: HashMap<String, String>,
    /// Non-fatal per-chunk failures reported to the error sink.
    pub chunk_errors: u64,
    /// The run stopped because of an interrupt; the top manifest was not
    /// written.
    pub interrupted: bool,
    /// First manifest-contiguity bug detected, if any. The caller should
    /// treat this as fatal with a distinct exit code.
    pub invariant_violation: Option<String>,
}

/// Build the stage graph, run it to completion, and report.
///
/// Setup failures (source file, zero sizes) return `Err` before any stage
/// starts. Once the pipeline is running the error sink is purely
/// informative: per-chunk failures are counted, logged, and surfaced as
/// events, but only an interrupt stops the run early.
pub fn run(
    config: UploadConfig,
    store: Arc<dyn ObjectStore>,
    events: Sender<UploadEvent>,
    shutdown: Arc<AtomicBool>,
) -> Result<UploadReport> {
    let file = File::open(&config.source)?;
    let file_size = file.metadata()?.len();
    let (chunks, total_chunks) =
        planner::build_chunks(file_size, config.chunk_size, shutdown.clone())?;
    let _ = events.send(UploadEvent::Planned {
        chunks: total_chunks,
        bytes: file_size,
    });

    let (errors_tx, errors_rx) = bounded(ERROR_SINK_DEPTH);

    // The drain task must exist before any stage can block on the sink. It
    // ends when the last stage drops its sender clone.
    let chunk_errors = Arc::new(AtomicU64::new(0));
    let invariant = Arc::new(Mutex::new(None::<String>));
    let drain = {
        let chunk_errors = Arc::clone(&chunk_errors);
        let invariant = Arc::clone(&invariant);
        let events = events.clone();
        thread::spawn(move || {
            for err in errors_rx {
                if let UploadError::InvariantViolation(message) = &err {
                    let mut slot = invariant.lock().unwrap_or_else(|e| e.into_inner());
                    slot.get_or_insert_with(|| message.clone());
                } else {
                    chunk_errors.fetch_add(1, Ordering::Relaxed);
                }
                tracing::warn!("{err}");
                let _ = events.send(UploadEvent::ChunkError(err.to_string()));
            }
        })
    };

    // ------------------------------------------------------------------
    // Data chunk path
    // ------------------------------------------------------------------
    let chunk_template = format!("{}-chunk-%04d-size-%d", config.object);
    let chunks = planner::object_namer(chunks, errors_tx.clone(), chunk_template);
    let chunks = planner::containerizer(chunks, errors_tx.clone(), config.container.clone());

    let mut excluded_numbers = config.excluded_chunks.clone();
    excluded_numbers.sort_unstable();
    let allow_gaps = !excluded_numbers.is_empty();
    let (excluded, chunks) = pipeline::separate(chunks, errors_tx.clone(), move |c| {
        Ok(excluded_numbers.binary_search(&c.number).is_ok())
    });

    // Excluded chunks never touch the reader; a sidecar hash is the only one
    // they can carry into the manifest.
    let known = Arc::new(config.known_hashes);
    let excluded = hash_associate(excluded, errors_tx.clone(), Arc::clone(&known));

    let chunks = reader::read_data(chunks, errors_tx.clone(), file);

    // Chunks whose hash the sidecar already knows bypass the hasher.
    let lookup = Arc::clone(&known);
    let (prehashed, chunks) = pipeline::separate(chunks, errors_tx.clone(), move |c| {
        Ok(lookup.contains_key(&c.path()))
    });
    let prehashed = hash_associate(prehashed, errors_tx.clone(), Arc::clone(&known));
    let chunks = hasher::hash_data(chunks, errors_tx.clone());
    let chunks = pipeline::join(vec![prehashed, chunks]);

    let (chunks, hash_counts) = pipeline::counter(chunks);
    forward_counts(hash_counts, events.clone(), UploadEvent::HashProgress);

    // Sideband tap: remember every hash seen so the sidecar can be written
    // on any exit path, including interrupt. The map is shared (not joined
    // on) so an early return still sees everything collected so far.
    let (chunks, sidecar_tap) = pipeline::fork(chunks);
    let observed: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    {
        let observed = Arc::clone(&observed);
        thread::spawn(move || {
            for chunk in sidecar_tap {
                if !chunk.hash.is_empty() {
                    observed
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(chunk.path(), chunk.hash);
                }
            }
        });
    }

    let serverside: HashSet<String> = config.serverside_objects.into_iter().collect();
    let (already_stored, chunks) = pipeline::separate(chunks, errors_tx.clone(), move |c| {
        Ok(serverside.contains(&c.object))
    });

    let workers = config.max_uploads.max(1);
    let uploaded = {
        let outs: Vec<ChunkReceiver> = pipeline::divide(chunks, workers)
            .into_iter()
            .map(|stream| uploader::upload_data(stream, errors_tx.clone(), Arc::clone(&store)))
            .collect();
        pipeline::join(outs)
    };
    let uploaded = uploader::clear_data(uploaded, errors_tx.clone());
    let (uploaded, upload_counts) = pipeline::counter(uploaded);
    forward_counts(upload_counts, events.clone(), UploadEvent::UploadProgress);

    let all = pipeline::join(vec![uploaded, already_stored, excluded]);

    // ------------------------------------------------------------------
    // Manifest tier 1
    // ------------------------------------------------------------------
    let manifests =
        manifest::manifest_builder(all, errors_tx.clone(), config.manifest_capacity, allow_gaps);
    // After an interrupt the data path still drains, but no further
    // manifests may reach the store.
    let manifests = shutdown_gate(manifests, Arc::clone(&shutdown));
    let manifest_template = format!("{}-manifest-%04d", config.object);
    let manifests = planner::object_namer(manifests, errors_tx.clone(), manifest_template);
    let manifests = planner::containerizer(manifests, errors_tx.clone(), config.container.clone());
    let manifests = announce(manifests, errors_tx.clone(), events.clone());
    let manifests = uploader::upload_manifests(manifests, errors_tx.clone(), Arc::clone(&store));

    // Blocks until the whole data path has drained: uploads already in
    // flight at interrupt time run to completion here.
    let mut tier1: Vec<FileChunk> = Vec::new();
    for chunk in manifests {
        let _ = events.send(UploadEvent::ManifestUploaded { path: chunk.path() });
        tier1.push(chunk);
    }

    let interrupted = shutdown.load(Ordering::Relaxed);

    // ------------------------------------------------------------------
    // Top manifest
    // ------------------------------------------------------------------
    if !interrupted && !tier1.is_empty() {
        if tier1.len() > config.manifest_capacity {
            tracing::warn!(
                "{} tier-1 manifests exceed the {}-entry manifest capacity; \
                 the top manifest will be oversized",
                tier1.len(),
                config.manifest_capacity,
            );
        }

        let (top_tx, top_rx) = bounded(STAGE_DEPTH);
        let top_manifests = if tier1.len() == 1 {
            // A single tier-1 manifest is already the complete segment list;
            // re-upload it as-is under the user-visible object name.
            let mut top = tier1.pop().unwrap_or_default();
            top.number = 0;
            top.object = config.object.clone();
            let _ = top_tx.send(top);
            drop(top_tx);
            let rx = announce(top_rx, errors_tx.clone(), events.clone());
            uploader::upload_manifests(rx, errors_tx.clone(), Arc::clone(&store))
        } else {
            thread::spawn(move || {
                for m in tier1 {
                    if top_tx.send(m).is_err() {
                        return;
                    }
                }
            });
            let rx = manifest::manifest_builder(
                top_rx,
                errors_tx.clone(),
                config.manifest_capacity,
                false,
            );
            let rx = planner::object_namer(rx, errors_tx.clone(), config.object.clone());
            let rx = planner::containerizer(rx, errors_tx.clone(), config.container.clone());
            let rx = announce(rx, errors_tx.clone(), events.clone());
            uploader::upload_manifests(rx, errors_tx.clone(), Arc::clone(&store))
        };

        for top in top_manifests {
            let _ = events.send(UploadEvent::TopManifestUploaded { path: top.path() });
        }
    }

    // All producer stages have terminated once the final receivers close;
    // dropping our sink sender lets the drain task see disconnect.
    drop(errors_tx);
    let _ = drain.join();

    let hashes = observed
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let invariant_violation = invariant
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    Ok(UploadReport {
        hashes,
        chunk_errors: chunk_errors.load(Ordering::Relaxed),
        interrupted,
        invariant_violation,
    })
}

/// Attach a sidecar-known hash to chunks that bypass the hasher.
fn hash_associate(
    input: ChunkReceiver,
    errors: ErrorSink,
    known: Arc<HashMap<String, String>>,
) -> ChunkReceiver {
    pipeline::map(input, errors, move |mut chunk| {
        if let Some(hash) = known.get(&chunk.path()) {
            chunk.hash = hash.clone();
        }
        Ok(chunk)
    })
}

/// Emit a `ManifestStarted` event as each manifest heads for the store.
fn announce(
    input: ChunkReceiver,
    errors: ErrorSink,
    events: Sender<UploadEvent>,
) -> ChunkReceiver {
    pipeline::map(input, errors, move |chunk| {
        let _ = events.send(UploadEvent::ManifestStarted { path: chunk.path() });
        Ok(chunk)
    })
}

/// Pass chunks through until shutdown is requested, then keep the stream
/// draining while dropping everything (cancellation, not an error).
fn shutdown_gate(input: ChunkReceiver, shutdown: Arc<AtomicBool>) -> ChunkReceiver {
    let (tx, rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        for chunk in input {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("interrupt: discarding manifest {}", chunk.number);
                continue;
            }
            if tx.send(chunk).is_err() {
                return;
            }
        }
    });
    rx
}

fn forward_counts(
    counts: crossbeam_channel::Receiver<Count>,
    events: Sender<UploadEvent>,
    wrap: fn(Count) -> UploadEvent,
) {
    thread::spawn(move || {
        for count in counts {
            if events.send(wrap(count)).is_err() {
                return;
            }
        }
    });
}
