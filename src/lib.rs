//! Relink: repairs legacy cross-references left behind in migrated documents
//!
//! Documents imported from an older note-taking system keep their internal links in the old
//! system's URI scheme (`evernote:///view/...` by default). Those links point nowhere in the
//! destination workspace. This crate finds them, resolves each one to a destination document
//! by title, and rewrites the block in place with a native page mention.
//!
//! # Pipeline
//!
//! 1. **Index** -- List every document in the destination workspace once and build a
//!    normalized-title index (cached on disk between runs)
//! 2. **Extract** -- Walk each document's block tree and yield every legacy reference, either
//!    embedded as markdown link text or carried as a run's link target
//! 3. **Match** -- Resolve each reference label with the run's strategy (exact,
//!    case-insensitive or fuzzy); ambiguous labels are never resolved
//! 4. **Rewrite** -- Replace matched references with page mentions, one atomic update per block
//! 5. **Report** -- Collect unmatched, ambiguous and failed references in an exception ledger,
//!    written locally and optionally published as a destination document
//!
//! Documents are processed by a bounded pool of async workers. Progress (scope, pending, done)
//! is persisted after every document, so an interrupted run resumes where it stopped.
//!
//! # Key Modules
//!
//! - [`store`] -- The destination store trait and block-tree retrieval
//! - [`notion`] -- HTTP implementation of the store with a shared rate limiter
//! - [`snapshot`] -- In-memory store backed by a JSON snapshot file
//! - [`index`] -- Normalized title index
//! - [`cache`] -- Title index persistence
//! - [`extract`] -- Legacy reference extraction
//! - [`matcher`] -- Title matching strategies and suggestions
//! - [`rewrite`] -- Rich-text rewriting
//! - [`progress`] -- Resumable progress store
//! - [`ledger`] -- Exception ledger and reports
//! - [`pipeline`] -- Worker pool and per-document unit of work
//! - [`stats`] -- Thread-safe atomic counters
//! - [`config`] -- Constants
//!
//! # Example Usage
//!
//! ```bash
//! # Preview what would change
//! relink resolve --dry-run -v
//!
//! # Resolve everything, then resume after an interruption
//! relink resolve --full
//! relink resolve
//!
//! # Work on a local snapshot instead of the live API
//! relink --snapshot workspace.json resolve --strategy fuzzy
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod ledger;
pub mod matcher;
pub mod models;
pub mod notion;
pub mod pipeline;
pub mod progress;
pub mod rewrite;
pub mod snapshot;
pub mod stats;
pub mod store;
