#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod loader;
pub mod pipeline;

pub use chunker::PreparedChunk;
pub use loader::{DocumentLoader, FileLoader, TextSegment};
pub use pipeline::{
    DefaultIngestionServices, IngestionManifest, IngestionPipeline, IngestionServices,
    IngestionTuning,
};
