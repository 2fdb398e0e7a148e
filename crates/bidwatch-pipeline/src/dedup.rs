//! Cross-platform duplicate detection: exact URL/content-hash membership
//! plus fuzzy title comparison against a bounded recent window.
//!
//! The window is capped FIFO rather than the full historical corpus. That
//! bounds memory at the cost of missing duplicates of very old records;
//! callers seed the exact-match sets from the durable state store instead.

use std::collections::{HashSet, VecDeque};

use bidwatch_core::{DuplicateReason, NormalizedRecord};
use strsim::{jaro, jaro_winkler};
use tracing::debug;

pub const DEFAULT_WINDOW_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Similarity at or above which matching budgets make a duplicate.
    pub title_budget_threshold: f64,
    /// Similarity at or above which a missing budget still makes a duplicate.
    pub title_only_threshold: f64,
    /// Maximum relative budget difference still counted as "same budget".
    pub budget_tolerance: f64,
    pub window_cap: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_budget_threshold: 0.85,
            title_only_threshold: 0.95,
            budget_tolerance: 0.05,
            window_cap: DEFAULT_WINDOW_CAP,
        }
    }
}

#[derive(Debug)]
struct WindowEntry {
    title_key: String,
    budget: Option<f64>,
}

pub struct DedupEngine {
    config: DedupConfig,
    seen_urls: HashSet<String>,
    seen_hashes: HashSet<String>,
    window: VecDeque<WindowEntry>,
}

/// Comparison key: case-insensitive, whitespace-stripped.
fn title_key(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn budgets_close(a: f64, b: f64, tolerance: f64) -> bool {
    let larger = a.max(b);
    if larger <= 0.0 {
        return true;
    }
    (a - b).abs() / larger <= tolerance
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen_urls: HashSet::new(),
            seen_hashes: HashSet::new(),
            window: VecDeque::new(),
        }
    }

    /// Seed the exact-match URL set, typically from the durable state store.
    pub fn seed_urls<I>(&mut self, urls: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.seen_urls.extend(urls);
    }

    pub fn seed_hashes<I>(&mut self, hashes: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.seen_hashes.extend(hashes);
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Classify without mutating. `None` means the record is new.
    pub fn check(&self, record: &NormalizedRecord) -> Option<DuplicateReason> {
        if self.seen_urls.contains(&record.url) {
            return Some(DuplicateReason::UrlRepeat);
        }
        if self.seen_hashes.contains(&record.content_hash) {
            return Some(DuplicateReason::HashRepeat);
        }

        let candidate_key = title_key(&record.title);
        for entry in &self.window {
            let similarity = jaro_winkler(&candidate_key, &entry.title_key);
            if similarity >= self.config.title_budget_threshold {
                if let (Some(a), Some(b)) = (record.budget, entry.budget) {
                    if budgets_close(a, b, self.config.budget_tolerance) {
                        return Some(DuplicateReason::TitleAndBudget);
                    }
                }
            }
            // Without a budget to corroborate, the title must match on its
            // own merits. Plain Jaro here: the Winkler prefix boost would
            // merge distinct projects sharing long boilerplate prefixes.
            if (record.budget.is_none() || entry.budget.is_none())
                && jaro(&candidate_key, &entry.title_key) >= self.config.title_only_threshold
            {
                return Some(DuplicateReason::TitleOnly);
            }
        }
        None
    }

    /// Record an accepted record in the URL set, hash set, and title window.
    pub fn accept(&mut self, record: &NormalizedRecord) {
        self.seen_urls.insert(record.url.clone());
        self.seen_hashes.insert(record.content_hash.clone());
        self.window.push_back(WindowEntry {
            title_key: title_key(&record.title),
            budget: record.budget,
        });
        while self.window.len() > self.config.window_cap {
            self.window.pop_front();
        }
    }

    /// Check, then accept when new. The common one-call path.
    pub fn evaluate(&mut self, record: &NormalizedRecord) -> Option<DuplicateReason> {
        match self.check(record) {
            Some(reason) => {
                debug!(url = %record.url, %reason, "duplicate record dropped");
                Some(reason)
            }
            None => {
                self.accept(record);
                None
            }
        }
    }
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
