//! Normalization pipeline and deduplication engine.
//!
//! Raw fragments flow in from spiders; canonical records flow out, with
//! duplicates classified and dropped before they ever reach a sink.

pub mod dedup;
pub mod normalize;

use bidwatch_core::{DuplicateReason, NormalizedRecord, RawFragment};
use tracing::info;

pub use dedup::{DedupConfig, DedupEngine};
pub use normalize::normalize_fragment;

pub const CRATE_NAME: &str = "bidwatch-pipeline";

/// A record the dedup engine refused, with the reason attached.
#[derive(Debug)]
pub struct RejectedRecord {
    pub record: NormalizedRecord,
    pub reason: DuplicateReason,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub accepted: Vec<NormalizedRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl PipelineReport {
    pub fn total(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }
}

/// Stateful ingest front: normalizes each fragment, then routes it through
/// the dedup engine. The engine's window and seen-sets persist across calls
/// so duplicates are caught across batches and platforms.
pub struct IngestPipeline {
    dedup: DedupEngine,
}

impl IngestPipeline {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            dedup: DedupEngine::new(config),
        }
    }

    /// Seed exact-match state from the durable store before the first batch.
    pub fn seed(
        &mut self,
        urls: impl IntoIterator<Item = String>,
        hashes: impl IntoIterator<Item = String>,
    ) {
        self.dedup.seed_urls(urls);
        self.dedup.seed_hashes(hashes);
    }

    pub fn process(&mut self, fragments: &[RawFragment]) -> PipelineReport {
        let mut report = PipelineReport::default();
        for fragment in fragments {
            let record = normalize_fragment(fragment);
            match self.dedup.evaluate(&record) {
                None => report.accepted.push(record),
                Some(reason) => report.rejected.push(RejectedRecord { record, reason }),
            }
        }
        info!(
            total = report.total(),
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "batch processed"
        );
        report
    }
}

impl Default for IngestPipeline {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
