use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};

use crate::chunk::FileChunk;
use crate::error::{Result, UploadError};
use crate::hasher::md5_hex;
use crate::pipeline::{ChunkReceiver, ErrorSink, STAGE_DEPTH};

/// Default entries-per-manifest cap, matching the segment limit common Swift
/// deployments enforce.
pub const DEFAULT_MANIFEST_CAPACITY: usize = 1000;

/// One segment reference in the SLO manifest wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub etag: String,
    pub size_bytes: u64,
}

impl ManifestEntry {
    pub fn from_chunk(chunk: &FileChunk) -> Self {
        Self {
            path: chunk.path(),
            etag: chunk.hash.clone(),
            size_bytes: chunk.size,
        }
    }
}

/// Group an arbitrary-order stream of uploaded chunks into manifest chunks.
///
/// Chunk `number / capacity` picks the manifest a chunk belongs to, so
/// manifest `i` always covers exactly the numbers `[i*capacity,
/// (i+1)*capacity)` no matter what order uploads finish in. A group is sealed
/// the moment it is full; partial groups wait for input close. Emission order
/// across groups is arrival-driven; downstream re-establishes canonical
/// order the same way this stage does.
///
/// At close the builder verifies the groups cover `0..N` contiguously. A gap
/// means a chunk was dropped upstream: with `allow_gaps` (the operator
/// explicitly excluded chunks, already warned that the store will reject the
/// result) the short group is still emitted; otherwise it is an invariant
/// violation and the group is dropped with the error reported.
pub fn manifest_builder(
    input: ChunkReceiver,
    errors: ErrorSink,
    capacity: usize,
    allow_gaps: bool,
) -> ChunkReceiver {
    debug_assert!(capacity > 0, "manifest capacity must be non-zero");
    let (tx, rx) = bounded(STAGE_DEPTH);
    thread::spawn(move || {
        let cap = capacity as u64;
        let mut pending: BTreeMap<u64, Vec<FileChunk>> = BTreeMap::new();
        let mut sealed: BTreeSet<u64> = BTreeSet::new();

        for chunk in input {
            let idx = chunk.number / cap;
            let group = pending.entry(idx).or_default();
            group.push(chunk);
            if group.len() == capacity {
                let group = pending.remove(&idx).unwrap_or_default();
                sealed.insert(idx);
                match seal_group(idx, group, cap, true, allow_gaps) {
                    Ok(manifest) => {
                        if tx.send(manifest).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = errors.send(e);
                    }
                }
            }
        }

        // Input closed: flush partial groups. Only the highest group overall
        // may legitimately be short (the file's tail).
        let max_idx = pending
            .keys()
            .last()
            .copied()
            .max(sealed.iter().last().copied());
        let leftover: Vec<u64> = pending.keys().copied().collect();
        for idx in leftover {
            let group = pending.remove(&idx).unwrap_or_default();
            sealed.insert(idx);
            let expect_full = Some(idx) != max_idx;
            match seal_group(idx, group, cap, expect_full, allow_gaps) {
                Ok(manifest) => {
                    if tx.send(manifest).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = errors.send(e);
                }
            }
        }

        // Every group index up to the highest seen must exist; a missing
        // group means all of its chunks were dropped.
        if let Some(max_idx) = max_idx {
            let missing: Vec<u64> = (0..=max_idx).filter(|i| !sealed.contains(i)).collect();
            if !missing.is_empty() {
                let message = format!("manifest groups {missing:?} are entirely absent");
                if allow_gaps {
                    tracing::warn!("{message}");
                } else {
                    let _ = errors.send(UploadError::InvariantViolation(message));
                }
            }
        }
    });
    rx
}

/// Sort, validate, and serialize one manifest group into a manifest chunk.
fn seal_group(
    idx: u64,
    mut group: Vec<FileChunk>,
    capacity: u64,
    expect_full: bool,
    allow_gaps: bool,
) -> Result<FileChunk> {
    group.sort_by_key(|c| c.number);

    let start = idx * capacity;
    let expected_len = if expect_full {
        capacity
    } else {
        group.len() as u64
    };
    let contiguous = group.len() as u64 == expected_len
        && group
            .iter()
            .zip(start..)
            .all(|(chunk, expected)| chunk.number == expected);
    if !contiguous {
        let numbers: Vec<u64> = group.iter().map(|c| c.number).collect();
        let message = format!(
            "manifest {idx} expects chunks {start}..{} but holds {numbers:?}",
            start + expected_len,
        );
        if !allow_gaps {
            return Err(UploadError::InvariantViolation(message));
        }
        tracing::warn!("{message} (gap permitted by explicit exclusion)");
    }

    let unready = group.iter().filter(|c| !c.ready_for_manifest()).count();
    if unready > 0 {
        tracing::warn!(
            "manifest {idx}: {unready} entries lack a name or etag; \
             the object store will reject this manifest"
        );
    }

    let entries: Vec<ManifestEntry> = group.iter().map(ManifestEntry::from_chunk).collect();
    let body = serde_json::to_vec(&entries).map_err(|e| {
        UploadError::InvariantViolation(format!("manifest {idx} failed to serialize: {e}"))
    })?;
    let hash = md5_hex(&body);
    Ok(FileChunk {
        number: idx,
        offset: 0,
        size: body.len() as u64,
        object: String::new(),
        container: String::new(),
        hash,
        data: Some(Bytes::from(body)),
        manifest: Some(entries),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ERROR_SINK_DEPTH;
    use crossbeam_channel::Receiver;

    fn uploaded_chunk(number: u64) -> FileChunk {
        FileChunk {
            number,
            offset: number * 10,
            size: 10,
            object: format!("o-chunk-{number:04}-size-10"),
            container: "cont".into(),
            hash: format!("{number:032x}"),
            data: None,
            manifest: None,
        }
    }

    fn sink() -> (ErrorSink, Receiver<UploadError>) {
        bounded(ERROR_SINK_DEPTH)
    }

    fn run_builder(
        numbers: Vec<u64>,
        capacity: usize,
        allow_gaps: bool,
    ) -> (Vec<FileChunk>, Vec<UploadError>) {
        let (tx, rx) = bounded(STAGE_DEPTH);
        let (errors, error_rx) = sink();
        let out = manifest_builder(rx, errors, capacity, allow_gaps);
        let feeder = thread::spawn(move || {
            for n in numbers {
                if tx.send(uploaded_chunk(n)).is_err() {
                    return;
                }
            }
        });
        let manifests: Vec<_> = out.iter().collect();
        feeder.join().unwrap();
        (manifests, error_rx.try_iter().collect())
    }

    #[test]
    fn groups_are_capacity_sized_with_short_tail() {
        let (mut manifests, errors) = run_builder((0..25).collect(), 10, false);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        manifests.sort_by_key(|m| m.number);
        assert_eq!(manifests.len(), 3);
        let lens: Vec<usize> = manifests
            .iter()
            .map(|m| m.manifest.as_ref().unwrap().len())
            .collect();
        assert_eq!(lens, vec![10, 10, 5]);
        assert_eq!(
            manifests.iter().map(|m| m.number).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn arrival_order_does_not_change_group_membership() {
        let mut numbers: Vec<u64> = (0..25).collect();
        numbers.reverse();
        let (mut manifests, errors) = run_builder(numbers, 10, false);
        assert!(errors.is_empty());
        manifests.sort_by_key(|m| m.number);
        let first = manifests[0].manifest.as_ref().unwrap();
        let expected: Vec<u64> = (0..10).collect();
        let got: Vec<u64> = first
            .iter()
            .map(|e| e.path.rsplit("-chunk-").next().unwrap()[..4].parse().unwrap())
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn entries_are_strictly_ascending_within_each_group() {
        let (manifests, _) = run_builder(vec![7, 3, 9, 1, 5, 0, 8, 2, 6, 4], 10, false);
        assert_eq!(manifests.len(), 1);
        let sizes_path: Vec<String> = manifests[0]
            .manifest
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.path.clone())
            .collect();
        let mut sorted = sizes_path.clone();
        sorted.sort();
        assert_eq!(sizes_path, sorted);
    }

    #[test]
    fn full_group_is_sealed_before_input_closes() {
        let (tx, rx) = bounded(STAGE_DEPTH);
        let (errors, _error_rx) = sink();
        let out = manifest_builder(rx, errors, 3, false);
        let feeder = thread::spawn(move || {
            for n in 0..3u64 {
                tx.send(uploaded_chunk(n)).unwrap();
            }
            // Hold the channel open: the manifest must arrive anyway.
            tx
        });
        let manifest = out.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(manifest.number, 0);
        assert_eq!(manifest.manifest.as_ref().unwrap().len(), 3);
        drop(feeder.join().unwrap());
        assert_eq!(out.iter().count(), 0);
    }

    #[test]
    fn gap_is_an_invariant_violation_by_default() {
        // Chunk 1 was dropped upstream.
        let (manifests, errors) = run_builder(vec![0, 2], 10, false);
        assert!(manifests.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], UploadError::InvariantViolation(_)));
    }

    #[test]
    fn gap_is_permitted_when_exclusions_were_used() {
        let (manifests, errors) = run_builder(vec![0, 2], 10, true);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].manifest.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn absent_middle_group_is_detected() {
        // Capacity 2, chunks 0,1 and 4 present: group 1 (chunks 2,3) never
        // materializes at all.
        let (manifests, errors) = run_builder(vec![0, 1, 4], 2, false);
        assert_eq!(manifests.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("entirely absent"), "{}", errors[0]);
    }

    #[test]
    fn manifest_body_is_the_slo_wire_format() {
        let (manifests, _) = run_builder(vec![0, 1], 10, false);
        let body = manifests[0].data.as_ref().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([
                {
                    "path": "cont/o-chunk-0000-size-10",
                    "etag": format!("{:032x}", 0),
                    "size_bytes": 10,
                },
                {
                    "path": "cont/o-chunk-0001-size-10",
                    "etag": format!("{:032x}", 1),
                    "size_bytes": 10,
                },
            ])
        );
        assert_eq!(manifests[0].hash, md5_hex(body));
        assert_eq!(manifests[0].size, body.len() as u64);
    }
}
