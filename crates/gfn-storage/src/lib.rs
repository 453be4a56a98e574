//! Storage collaborators for the GFN pipeline: keyed tables, staged artifacts
//! and the paced HTTP fetcher used by extraction sources.

pub mod artifact;
pub mod http;
pub mod table;

pub use artifact::{ArtifactStore, StagedArtifact, StagingLayer};
pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RatePacing,
};
pub use table::memory::MemoryTable;
pub use table::sqlite::SqliteTable;
pub use table::{FootprintTable, TableCounts, TableError, TableResult};

pub const CRATE_NAME: &str = "gfn-storage";
