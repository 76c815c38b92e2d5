//! Stage combinators for the chunk pipeline.
//!
//! Every stage consumes a lazy stream of [`FileChunk`]s from a channel and
//! produces one on a new channel, closing it when the input closes and its
//! in-flight work has drained. Channels are bounded at depth 1 so a slow
//! consumer backpressures all the way to the file reader. Non-fatal per-chunk
//! failures go to a shared error sink; a stage that reports an error for a
//! chunk drops that chunk (it never both reports and forwards).
//!
//! The error sink is never closed by a stage. It disconnects on its own once
//! the last stage holding a sender clone exits, which is the signal the
//! driver's drain loop ends on.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::chunk::FileChunk;
use crate::error::{Result, UploadError};

/// Depth of every inter-stage data channel. Depth 1 keeps peak memory at
/// roughly one buffered chunk per stage regardless of worker count.
pub const STAGE_DEPTH: usize = 1;

/// Buffer on the shared error sink. Errors are drained continuously by the
/// driver; the buffer only smooths bursts.
pub const ERROR_SINK_DEPTH: usize = 100;

pub type ChunkReceiver = Receiver<FileChunk>;
pub type ErrorSink = Sender<UploadError>;

/// A cumulative progress sample emitted by [`counter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    pub chunks: u64,
    pub bytes: u64,
    /// Measured from the first chunk through the counter, so rates exclude
    /// pipeline setup time.
    pub elapsed: Duration,
}

/// Time source for [`counter`], injectable so tests control elapsed time.
pub trait Clock: Send + 'static {
    fn now(&self) -> Instant;
}

/// Production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Apply `f` to every chunk. Errors go to the sink and drop the chunk.
pub fn map<F>(input: ChunkReceiver, errors: ErrorSink, mut f: F) -> ChunkReceiver
where
    F: FnMut(FileChunk) -> Result<FileChunk> + Send + 'static,
{
    let (tx, rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        for chunk in input {
            match f(chunk) {
                Ok(out) => {
                    if tx.send(out).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = errors.send(e);
                }
            }
        }
    });
    rx
}

/// Route every chunk to exactly one of two outputs by `pred`. A predicate
/// error drops the chunk; it reaches neither output.
pub fn separate<F>(
    input: ChunkReceiver,
    errors: ErrorSink,
    mut pred: F,
) -> (ChunkReceiver, ChunkReceiver)
where
    F: FnMut(&FileChunk) -> Result<bool> + Send + 'static,
{
    let (match_tx, match_rx) = bounded(STAGE_DEPTH);
    let (rest_tx, rest_rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        for chunk in input {
            match pred(&chunk) {
                Ok(true) => {
                    if match_tx.send(chunk).is_err() {
                        return;
                    }
                }
                Ok(false) => {
                    if rest_tx.send(chunk).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = errors.send(e);
                }
            }
        }
    });
    (match_rx, rest_rx)
}

/// Fan-in merge. Ordering between inputs is unspecified; the output closes
/// once every input has closed.
pub fn join(inputs: Vec<ChunkReceiver>) -> ChunkReceiver {
    let (tx, rx) = bounded(STAGE_DEPTH);
    for input in inputs {
        let tx = tx.clone();
        thread::spawn(move || {
            for chunk in input {
                if tx.send(chunk).is_err() {
                    return;
                }
            }
        });
    }
    rx
}

/// Duplicate every chunk to both outputs. The descriptor is cloned; a `data`
/// buffer is shared (`Bytes` is reference-counted), so nothing downstream of
/// a fork may mutate bytes in place.
pub fn fork(input: ChunkReceiver) -> (ChunkReceiver, ChunkReceiver) {
    let (a_tx, a_rx) = bounded(STAGE_DEPTH);
    let (b_tx, b_rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        for chunk in input {
            let dup = chunk.clone();
            let a_open = a_tx.send(chunk).is_ok();
            let b_open = b_tx.send(dup).is_ok();
            if !a_open && !b_open {
                return;
            }
        }
    });
    (a_rx, b_rx)
}

/// Distribute chunks across `workers` consumers. Receivers are mpmc, so the
/// clones steal work from the shared input: every chunk lands on exactly one
/// output, and all outputs disconnect when the input closes.
pub fn divide(input: ChunkReceiver, workers: usize) -> Vec<ChunkReceiver> {
    (0..workers).map(|_| input.clone()).collect()
}

/// Passthrough that publishes a running [`Count`] after each chunk.
pub fn counter(input: ChunkReceiver) -> (ChunkReceiver, Receiver<Count>) {
    counter_with_clock(input, SystemClock)
}

/// [`counter`] with an explicit time source.
///
/// Samples ride an unbounded channel so a slow progress consumer can never
/// backpressure the data path.
pub fn counter_with_clock<C: Clock>(
    input: ChunkReceiver,
    clock: C,
) -> (ChunkReceiver, Receiver<Count>) {
    let (tx, rx) = bounded(STAGE_DEPTH);
    let (sample_tx, sample_rx) = unbounded();
    thread::spawn(move || {
        let mut chunks = 0u64;
        let mut bytes = 0u64;
        let mut started: Option<Instant> = None;
        for chunk in input {
            let start = *started.get_or_insert_with(|| clock.now());
            chunks += 1;
            bytes += chunk.size;
            let sample = Count {
                chunks,
                bytes,
                elapsed: clock.now().saturating_duration_since(start),
            };
            if tx.send(chunk).is_err() {
                return;
            }
            let _ = sample_tx.send(sample);
        }
    });
    (rx, sample_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn numbered(n: u64) -> Vec<FileChunk> {
        (0..n)
            .map(|number| FileChunk {
                number,
                size: 10,
                ..Default::default()
            })
            .collect()
    }

    fn feed(chunks: Vec<FileChunk>) -> ChunkReceiver {
        let (tx, rx) = bounded(STAGE_DEPTH);
        thread::spawn(move || {
            for chunk in chunks {
                if tx.send(chunk).is_err() {
                    return;
                }
            }
        });
        rx
    }

    fn sink() -> (ErrorSink, Receiver<UploadError>) {
        bounded(ERROR_SINK_DEPTH)
    }

    #[test]
    fn map_transforms_every_chunk() {
        let (errors, error_rx) = sink();
        let out = map(feed(numbered(5)), errors, |mut c| {
            c.object = format!("obj-{}", c.number);
            Ok(c)
        });
        let collected: Vec<_> = out.iter().collect();
        assert_eq!(collected.len(), 5);
        assert_eq!(collected[3].object, "obj-3");
        assert_eq!(error_rx.try_iter().count(), 0);
    }

    #[test]
    fn map_drops_errored_chunks() {
        let (errors, error_rx) = sink();
        let out = map(feed(numbered(4)), errors, |c| {
            if c.number % 2 == 0 {
                Err(UploadError::chunk(c.number, "x", "boom"))
            } else {
                Ok(c)
            }
        });
        assert_eq!(out.iter().count(), 2);
        assert_eq!(error_rx.try_iter().count(), 2);
    }

    #[test]
    fn separate_partitions_exactly() {
        let (errors, error_rx) = sink();
        let (evens, odds) = separate(feed(numbered(10)), errors, |c| Ok(c.number % 2 == 0));
        let evens_handle = thread::spawn(move || evens.iter().count());
        let odds: Vec<_> = odds.iter().collect();
        assert_eq!(evens_handle.join().unwrap(), 5);
        assert_eq!(odds.len(), 5);
        assert!(odds.iter().all(|c| c.number % 2 == 1));
        assert_eq!(error_rx.try_iter().count(), 0);
    }

    #[test]
    fn separate_predicate_error_reaches_neither_output() {
        let (errors, error_rx) = sink();
        let (matched, rest) = separate(feed(numbered(6)), errors, |c| {
            if c.number == 2 {
                Err(UploadError::chunk(c.number, "x", "bad predicate"))
            } else {
                Ok(c.number < 3)
            }
        });
        let matched_handle = thread::spawn(move || matched.iter().count());
        let rest_count = rest.iter().count();
        // 6 in = 2 matched (0,1) + 3 rest (3,4,5) + 1 error.
        assert_eq!(matched_handle.join().unwrap(), 2);
        assert_eq!(rest_count, 3);
        assert_eq!(error_rx.try_iter().count(), 1);
    }

    #[test]
    fn join_conserves_the_multiset() {
        let out = join(vec![feed(numbered(3)), feed(numbered(4)), feed(numbered(5))]);
        let mut numbers: Vec<u64> = out.iter().map(|c| c.number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 4]);
    }

    #[test]
    fn fork_duplicates_exactly() {
        let (a, b) = fork(feed(numbered(7)));
        let a_handle = thread::spawn(move || a.iter().count());
        let b_count = b.iter().count();
        assert_eq!(a_handle.join().unwrap(), 7);
        assert_eq!(b_count, 7);
    }

    #[test]
    fn fork_shares_data_buffers() {
        let mut chunk = FileChunk::default();
        chunk.data = Some(bytes::Bytes::from(vec![1u8, 2, 3]));
        let (a, b) = fork(feed(vec![chunk]));
        let left = a.recv().unwrap().data.unwrap();
        let right = b.recv().unwrap().data.unwrap();
        assert_eq!(left.as_ptr(), right.as_ptr());
    }

    #[test]
    fn divide_delivers_each_chunk_once() {
        let outputs = divide(feed(numbered(20)), 4);
        let handles: Vec<_> = outputs
            .into_iter()
            .map(|rx| thread::spawn(move || rx.iter().map(|c| c.number).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }

    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    #[test]
    fn counter_accumulates_chunks_and_bytes() {
        let (out, samples) = counter(feed(numbered(3)));
        assert_eq!(out.iter().count(), 3);
        let collected: Vec<_> = samples.iter().collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[2].chunks, 3);
        assert_eq!(collected[2].bytes, 30);
    }

    #[test]
    fn counter_elapsed_starts_at_first_chunk() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        // Time passes before any chunk arrives; it must not count.
        handle.advance(Duration::from_secs(100));

        let (tx, rx) = bounded(STAGE_DEPTH);
        let (out, samples) = counter_with_clock(rx, clock);

        tx.send(numbered(1).pop().unwrap()).unwrap();
        let first = out.recv().unwrap();
        assert_eq!(first.number, 0);
        let s1 = samples.recv().unwrap();
        assert_eq!(s1.elapsed, Duration::ZERO);

        handle.advance(Duration::from_secs(2));
        tx.send(numbered(1).pop().unwrap()).unwrap();
        drop(tx);
        out.recv().unwrap();
        let s2 = samples.recv().unwrap();
        assert_eq!(s2.elapsed, Duration::from_secs(2));
        assert_eq!(s2.chunks, 2);
    }

    #[test]
    fn samples_channel_closes_with_output() {
        let (out, samples) = counter(feed(numbered(2)));
        drop(out.iter().count());
        // Stage thread has exited; the sample sender is gone.
        assert_eq!(samples.iter().count(), 2);
    }
}
