use bytes::Bytes;

use crate::manifest::ManifestEntry;

/// The one record that flows through every pipeline stage.
///
/// A chunk starts as plan metadata (`number`/`offset`/`size`), accumulates a
/// name, container, data and hash on its way down the graph, and sheds its
/// `data` right after upload so the buffer can be reclaimed. Manifest chunks
/// reuse the same shape: `data` holds the serialized manifest body and
/// `manifest` the structured entries a higher tier references.
#[derive(Debug, Clone, Default)]
pub struct FileChunk {
    /// 0-based ordinal within the logical object (or within the manifest tier).
    pub number: u64,
    /// Byte offset in the source file.
    pub offset: u64,
    /// Byte length of this chunk's body.
    pub size: u64,
    /// Object name in the store; set by the namer.
    pub object: String,
    /// Target container; set by the containerizer.
    pub container: String,
    /// Lowercase hex MD5 of the body; set by the hasher, the sidecar
    /// short-circuit, or the manifest builder.
    pub hash: String,
    /// In-memory body. `Bytes` so a fork shares rather than copies the buffer.
    pub data: Option<Bytes>,
    /// For manifest chunks: the ordered child references.
    pub manifest: Option<Vec<ManifestEntry>>,
}

impl FileChunk {
    /// Canonical store key, `"<container>/<object>"`. This is the sidecar map
    /// key and the path a manifest entry records.
    pub fn path(&self) -> String {
        format!("{}/{}", self.container, self.object)
    }

    /// Whether this chunk carries everything a manifest entry needs.
    pub fn ready_for_manifest(&self) -> bool {
        !self.object.is_empty() && !self.container.is_empty() && !self.hash.is_empty()
    }
}
