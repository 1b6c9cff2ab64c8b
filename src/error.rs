use thiserror::Error;

/// Failures reported by a destination store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Access rejected: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Fatal: no resolution is possible without a title index
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("Title search failed after {fetched} documents: {source}")]
    Search {
        fetched: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Failed to fetch blocks of {block_id}: {source}")]
    Fetch {
        block_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Update of block {block_id} failed: {source}")]
    Update {
        block_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Run {run_index} of block {block_id} no longer holds the extracted reference")]
    StaleRun { block_id: String, run_index: usize },

    #[error("Run {run_index} of block {block_id} is not a text run")]
    UnsupportedRun { block_id: String, run_index: usize },

    #[error("Block {block_id} would hold {count} rich-text runs (max {max})")]
    TooManyRuns {
        block_id: String,
        count: usize,
        max: usize,
    },
}

/// Anything that keeps one document from reaching `done`
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("{failed} block rewrite(s) failed, first: {first}")]
    Rewrite { failed: usize, first: RewriteError },

    #[error("Progress update failed: {0:#}")]
    Progress(anyhow::Error),
}
