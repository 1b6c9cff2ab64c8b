use crate::config::CACHE_VERSION;
use crate::index::{TitleIndex, TitleIndexEntry};
use crate::store::DocumentStore;
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    pub source_key: String,
    /// Seconds since the Unix epoch
    pub created_at: u64,
    pub entry_count: usize,
}

#[derive(Deserialize)]
struct IndexCacheDe {
    metadata: CacheMetadata,
    entries: Vec<TitleIndexEntry>,
    untitled: Vec<String>,
}

#[derive(Serialize)]
struct IndexCacheSer<'a> {
    metadata: CacheMetadata,
    entries: &'a [TitleIndexEntry],
    untitled: &'a [String],
}

pub fn cache_path(state_dir: &Path) -> PathBuf {
    state_dir.join("title_index.cache")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns `Ok(Some(index))` if the cache is valid, `Ok(None)` if missing, stale or corrupt.
pub fn try_load_index(
    cache_path: &Path,
    source_key: &str,
    max_age: Duration,
) -> Result<Option<TitleIndex>> {
    if !cache_path.exists() {
        return Ok(None);
    }

    let file_size = fs::metadata(cache_path).map(|m| m.len()).unwrap_or(0);

    let file = File::open(cache_path).context("Failed to open cache file")?;
    let reader = BufReader::with_capacity(256 * 1024, file);

    let options = bincode::options().with_limit(file_size.saturating_add(1024));

    let cache: IndexCacheDe = match options.deserialize_from(reader) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Cache file is corrupt or unreadable");
            return Ok(None);
        }
    };

    if cache.metadata.version != CACHE_VERSION {
        info!(
            cached = cache.metadata.version,
            current = CACHE_VERSION,
            "Cache version mismatch"
        );
        return Ok(None);
    }

    if cache.metadata.source_key != source_key {
        info!(
            cached = cache.metadata.source_key,
            current = source_key,
            "Cache belongs to a different workspace"
        );
        return Ok(None);
    }

    let age = now_secs().saturating_sub(cache.metadata.created_at);
    if age > max_age.as_secs() {
        info!(
            age_secs = age,
            max_age_secs = max_age.as_secs(),
            "Cache is older than the allowed age"
        );
        return Ok(None);
    }

    info!(
        titles = cache.metadata.entry_count,
        age_secs = age,
        "Title index loaded from cache"
    );

    Ok(Some(TitleIndex::from_entries(cache.entries, cache.untitled)))
}

/// Writes the index in its flat form, atomically via rename.
pub fn save_index(index: &TitleIndex, source_key: &str, state_dir: &Path) -> Result<()> {
    let path = cache_path(state_dir);

    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create directory: {:?}", state_dir))?;

    let entries = index.entries();
    let untitled = index.untitled();

    let cache = IndexCacheSer {
        metadata: CacheMetadata {
            version: CACHE_VERSION,
            source_key: source_key.to_string(),
            created_at: now_secs(),
            entry_count: entries.len(),
        },
        entries: &entries,
        untitled: &untitled,
    };

    let tmp_path = path.with_extension("cache.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp cache file: {:?}", tmp_path))?;
    let writer = BufWriter::new(file);

    bincode::DefaultOptions::new()
        .serialize_into(writer, &cache)
        .context("Failed to serialize index cache")?;

    fs::rename(&tmp_path, &path)
        .with_context(|| format!("Failed to rename temp cache file to: {:?}", path))?;

    info!(titles = entries.len(), path = ?path, "Title index cache saved");

    Ok(())
}

/// Loads the cached index when allowed and fresh, otherwise searches the store and refreshes
/// the cache. A failed search is fatal.
pub async fn load_or_build(
    store: &dyn DocumentStore,
    state_dir: &Path,
    use_cache: bool,
    max_age: Duration,
) -> Result<TitleIndex> {
    let source_key = store.source_key();
    let path = cache_path(state_dir);

    if use_cache {
        if let Some(index) = try_load_index(&path, &source_key, max_age)? {
            return Ok(index);
        }
    }

    let index = TitleIndex::build(store)
        .await
        .context("Failed to build the title index")?;

    if let Err(e) = save_index(&index, &source_key, state_dir) {
        warn!(error = %format!("{:#}", e), "Could not save title index cache");
    }

    Ok(index)
}
