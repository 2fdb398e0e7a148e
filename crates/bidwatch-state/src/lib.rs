//! Durable incremental crawl state: seen URLs/hashes, session history, and
//! the staleness decision that drives incremental re-crawls.
//!
//! The durable form is a JSON snapshot (`state.json`, written with an
//! atomic temp-file + rename) plus an append-only `sessions.jsonl`.
//! In-memory URL/hash caches are explicit: they can be invalidated and are
//! lazily rebuilt from disk on the next use.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bidwatch_core::{CrawlSession, CrawlStateEntry, CrawlType, RunCounters, SessionStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

mod logs;

pub use logs::{OpsLog, RecordSink};

pub const CRATE_NAME: &str = "bidwatch-state";

const STATE_FILE: &str = "state.json";
const SESSIONS_FILE: &str = "sessions.jsonl";

/// Mutations buffered in memory before the snapshot is rewritten.
const FLUSH_THRESHOLD: usize = 128;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

/// What `mark_crawled` did with the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Inserted,
    Updated,
}

/// Read-only aggregate over one spider's session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiderStatistics {
    pub spider: String,
    pub runs: u32,
    pub completed: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub total_items: u32,
    pub new_items: u32,
    pub last_run: Option<DateTime<Utc>>,
}

/// Explicit cache over the durable snapshot. `None` means "not loaded";
/// rebuild cost is one full read of `state.json`.
#[derive(Debug, Default)]
struct CacheState {
    entries: Option<HashMap<String, CrawlStateEntry>>,
    hashes: Option<HashSet<String>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    cache: CacheState,
    /// Finalized session history, newest last. `None` until first loaded.
    history: Option<Vec<CrawlSession>>,
    /// Sessions currently bracketed by start/end.
    running: HashMap<Uuid, CrawlSession>,
    dirty: usize,
}

pub struct StateStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load entries, hashes, and session history from disk now rather than
    /// on first use.
    pub async fn warm(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_entries(&mut inner).await?;
        self.ensure_history(&mut inner).await?;
        info!(dir = %self.dir.display(), "state caches warmed");
        Ok(())
    }

    /// Drop the in-memory caches; they are lazily rebuilt from the durable
    /// store on the next use.
    pub async fn invalidate_caches(&self) {
        let mut inner = self.inner.lock().await;
        inner.cache.entries = None;
        inner.cache.hashes = None;
        inner.history = None;
        debug!("state caches invalidated");
    }

    /// A URL is stale when it has never been seen, or when its last visit is
    /// older than `max_age_days`.
    pub async fn is_stale(&self, url: &str, max_age_days: i64) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().await;
        let entries = self.ensure_entries(&mut inner).await?;
        Ok(match entries.get(url) {
            None => true,
            Some(entry) => Utc::now() - entry.last_seen > Duration::days(max_age_days),
        })
    }

    pub async fn is_url_seen(&self, url: &str) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().await;
        let entries = self.ensure_entries(&mut inner).await?;
        Ok(entries.contains_key(url))
    }

    pub async fn is_hash_seen(&self, hash: &str) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_entries(&mut inner).await?;
        let hashes = self.ensure_hashes(&mut inner);
        Ok(hashes.contains(hash))
    }

    /// Snapshot of every URL currently known, used to seed the dedup
    /// engine's exact-match set.
    pub async fn seen_urls(&self) -> Result<Vec<String>, StateError> {
        let mut inner = self.inner.lock().await;
        let entries = self.ensure_entries(&mut inner).await?;
        Ok(entries.keys().cloned().collect())
    }

    /// Snapshot of every content hash currently known, for the dedup
    /// engine's exact-content set.
    pub async fn seen_hashes(&self) -> Result<Vec<String>, StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_entries(&mut inner).await?;
        Ok(self.ensure_hashes(&mut inner).iter().cloned().collect())
    }

    pub async fn entry(&self, url: &str) -> Result<Option<CrawlStateEntry>, StateError> {
        let mut inner = self.inner.lock().await;
        let entries = self.ensure_entries(&mut inner).await?;
        Ok(entries.get(url).cloned())
    }

    /// Upsert the crawl record for a URL. New URLs start with
    /// `crawl_count = 1`; re-visits take the new hash, bump `last_seen`,
    /// increment the count, and set the `updated` flag.
    pub async fn mark_crawled(
        &self,
        url: &str,
        hash: &str,
        spider: &str,
    ) -> Result<MarkOutcome, StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_entries(&mut inner).await?;
        let now = Utc::now();

        let entries = inner.cache.entries.get_or_insert_with(HashMap::new);
        let outcome = match entries.get_mut(url) {
            Some(entry) => {
                entry.content_hash = hash.to_string();
                entry.last_seen = now;
                entry.crawl_count += 1;
                entry.updated = true;
                MarkOutcome::Updated
            }
            None => {
                entries.insert(
                    url.to_string(),
                    CrawlStateEntry {
                        url: url.to_string(),
                        content_hash: hash.to_string(),
                        spider: spider.to_string(),
                        first_seen: now,
                        last_seen: now,
                        crawl_count: 1,
                        updated: false,
                    },
                );
                MarkOutcome::Inserted
            }
        };

        if let Some(hashes) = inner.cache.hashes.as_mut() {
            hashes.insert(hash.to_string());
        }

        inner.dirty += 1;
        if inner.dirty >= FLUSH_THRESHOLD {
            self.flush_locked(&mut inner).await?;
        }
        Ok(outcome)
    }

    /// Record a re-visit whose content did not change: bump `last_seen` and
    /// the crawl count, leaving the hash and `updated` flag alone. Returns
    /// false for URLs the store has never seen.
    pub async fn touch(&self, url: &str) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_entries(&mut inner).await?;
        let entries = inner.cache.entries.get_or_insert_with(HashMap::new);
        let Some(entry) = entries.get_mut(url) else {
            return Ok(false);
        };
        entry.last_seen = Utc::now();
        entry.crawl_count += 1;
        inner.dirty += 1;
        if inner.dirty >= FLUSH_THRESHOLD {
            self.flush_locked(&mut inner).await?;
        }
        Ok(true)
    }

    /// Rewrite the durable snapshot from the in-memory entries.
    pub async fn flush(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        if inner.cache.entries.is_some() {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    pub async fn start_session(
        &self,
        spider: &str,
        crawl_type: CrawlType,
    ) -> Result<Uuid, StateError> {
        let session = CrawlSession {
            id: Uuid::new_v4(),
            spider: spider.to_string(),
            crawl_type,
            started_at: Utc::now(),
            finished_at: None,
            counters: RunCounters::default(),
            status: SessionStatus::Running,
            error: None,
        };
        let id = session.id;
        let mut inner = self.inner.lock().await;
        inner.running.insert(id, session);
        Ok(id)
    }

    /// Finalize a session with its terminal status and persist it to the
    /// append-only history.
    pub async fn end_session(
        &self,
        id: Uuid,
        counters: RunCounters,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<CrawlSession, StateError> {
        let mut inner = self.inner.lock().await;
        let mut session = inner
            .running
            .remove(&id)
            .ok_or(StateError::UnknownSession(id))?;
        session.finished_at = Some(Utc::now());
        session.counters = counters;
        session.status = status;
        session.error = error;

        self.append_session_line(&session).await?;
        self.ensure_history(&mut inner).await?;
        if let Some(history) = inner.history.as_mut() {
            history.push(session.clone());
        }
        Ok(session)
    }

    /// Most recent finalized sessions, newest first, optionally filtered by
    /// spider.
    pub async fn recent_sessions(
        &self,
        spider: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CrawlSession>, StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_history(&mut inner).await?;
        let history = inner.history.get_or_insert_with(Vec::new);
        Ok(history
            .iter()
            .rev()
            .filter(|s| spider.map_or(true, |name| s.spider == name))
            .take(limit)
            .cloned()
            .collect())
    }

    pub async fn statistics(&self, spider: &str) -> Result<SpiderStatistics, StateError> {
        let mut inner = self.inner.lock().await;
        self.ensure_history(&mut inner).await?;
        let history = inner.history.get_or_insert_with(Vec::new);

        let mut stats = SpiderStatistics {
            spider: spider.to_string(),
            runs: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            total_items: 0,
            new_items: 0,
            last_run: None,
        };
        for session in history.iter().filter(|s| s.spider == spider) {
            stats.runs += 1;
            match session.status {
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::TimedOut => stats.timed_out += 1,
                SessionStatus::Running => {}
            }
            stats.total_items += session.counters.total_items;
            stats.new_items += session.counters.new_items;
            stats.last_run = stats.last_run.max(Some(session.started_at));
        }
        Ok(stats)
    }

    async fn ensure_entries<'a>(
        &self,
        inner: &'a mut StoreInner,
    ) -> Result<&'a mut HashMap<String, CrawlStateEntry>, StateError> {
        if inner.cache.entries.is_none() {
            let path = self.dir.join(STATE_FILE);
            let entries = match fs::read(&path).await {
                Ok(bytes) => {
                    let list: Vec<CrawlStateEntry> = serde_json::from_slice(&bytes)?;
                    list.into_iter().map(|e| (e.url.clone(), e)).collect()
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => return Err(err.into()),
            };
            debug!(entries = entries.len(), "state snapshot loaded");
            inner.cache.entries = Some(entries);
        }
        Ok(inner.cache.entries.get_or_insert_with(HashMap::new))
    }

    fn ensure_hashes<'a>(&self, inner: &'a mut StoreInner) -> &'a HashSet<String> {
        if inner.cache.hashes.is_none() {
            let hashes = inner
                .cache
                .entries
                .as_ref()
                .map(|entries| {
                    entries
                        .values()
                        .map(|e| e.content_hash.clone())
                        .collect::<HashSet<_>>()
                })
                .unwrap_or_default();
            inner.cache.hashes = Some(hashes);
        }
        inner.cache.hashes.get_or_insert_with(HashSet::new)
    }

    async fn ensure_history(&self, inner: &mut StoreInner) -> Result<(), StateError> {
        if inner.history.is_some() {
            return Ok(());
        }
        let path = self.dir.join(SESSIONS_FILE);
        let history = match fs::read_to_string(&path).await {
            Ok(text) => {
                let mut sessions = Vec::new();
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    sessions.push(serde_json::from_str(line)?);
                }
                sessions
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        inner.history = Some(history);
        Ok(())
    }

    async fn flush_locked(&self, inner: &mut StoreInner) -> Result<(), StateError> {
        let bytes = {
            let entries = inner.cache.entries.get_or_insert_with(HashMap::new);
            let mut list: Vec<&CrawlStateEntry> = entries.values().collect();
            list.sort_by(|a, b| a.url.cmp(&b.url));
            serde_json::to_vec_pretty(&list)?
        };

        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(STATE_FILE);
        let tmp = self.dir.join(format!(".{}.{STATE_FILE}.tmp", Uuid::new_v4()));
        fs::write(&tmp, &bytes).await?;
        match fs::rename(&tmp, &path).await {
            Ok(()) => {}
            Err(err) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(err.into());
            }
        }
        inner.dirty = 0;
        debug!(bytes = bytes.len(), "state snapshot flushed");
        Ok(())
    }

    async fn append_session_line(&self, session: &CrawlSession) -> Result<(), StateError> {
        use tokio::io::AsyncWriteExt;

        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(SESSIONS_FILE);
        let mut line = serde_json::to_string(session)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
