/// Scheme used by the source system when none is given on the command line
pub const DEFAULT_SCHEME: &str = "evernote";

/// Default concurrent units of work; the destination API saturates at a handful
pub const DEFAULT_WORKERS: usize = 3;

/// Upper bound for `--workers`
pub const MAX_WORKERS: usize = 16;

/// Minimum pause between two API requests, shared by every worker (~3 req/s)
pub const DEFAULT_REQUEST_INTERVAL_MS: u64 = 350;

/// HTTP timeout for a single destination API call
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Page size for search and block-children pagination (API maximum)
pub const API_PAGE_SIZE: usize = 100;

/// Maximum characters in a single text run
pub const MAX_RICH_TEXT_LENGTH: usize = 2000;

/// Maximum runs in one block's rich-text list
pub const MAX_RUNS_PER_BLOCK: usize = 100;

/// Maximum blocks per append call
pub const MAX_APPEND_BLOCKS: usize = 100;

/// Minimum Jaro-Winkler score for a fuzzy candidate to qualify
pub const FUZZY_THRESHOLD: f64 = 0.92;

/// Minimum score for a "did you mean" suggestion on unmatched references
pub const SUGGESTION_THRESHOLD: f64 = 0.75;

/// Bump when the on-disk title index cache layout changes
pub const CACHE_VERSION: u32 = 1;

/// Default maximum age of the title index cache
pub const DEFAULT_CACHE_MAX_AGE_HOURS: u64 = 24;

/// Default directory for progress files, caches and local reports
pub const DEFAULT_STATE_DIR: &str = "relink-state";

/// Title of the report document created in the destination tree
pub const REPORT_TITLE: &str = "Link Resolution Exceptions";

pub const DEFAULT_API_BASE: &str = "https://api.notion.com/v1";

pub const NOTION_VERSION: &str = "2022-06-28";
