//! Streaming upload of one large file to a Swift-compatible object store as
//! a static large object.
//!
//! The file is split into fixed-size chunks, each uploaded as an independent
//! object; manifests describing the reassembly are uploaded last, two tiers
//! deep when one manifest cannot reference every chunk. Work flows through a
//! DAG of channel-connected stages built by [`driver::run`]; the combinators
//! in [`pipeline`] are the vocabulary the graph is wired in.

pub mod chunk;
pub mod driver;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod reader;
pub mod state;
pub mod uploader;

pub use chunk::FileChunk;
pub use driver::{UploadConfig, UploadEvent, UploadReport};
pub use error::{Result, UploadError};
pub use manifest::{ManifestEntry, DEFAULT_MANIFEST_CAPACITY};
pub use pipeline::Count;
