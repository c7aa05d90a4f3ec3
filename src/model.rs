use std::collections::BTreeMap;

use serde::Serialize;

/// Warning categories tracked by the validation summary. Recoverable
/// per-record issues land here; they never abort a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningCategory {
    MalformedRecord,
    MissingRun,
    DuplicateDocId,
    CanonicalizationCollision,
    NullDocId,
    NullCitation,
    HighNullCitationRate,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarningCounts {
    pub malformed_record: usize,
    pub missing_run: usize,
    pub duplicate_doc_id: usize,
    pub canonicalization_collision: usize,
    pub null_doc_id: usize,
    pub null_citation: usize,
    pub high_null_citation_rate: usize,
}

/// Ordered warning accumulator threaded through the load/compare passes.
/// Messages keep their generation order, which is deterministic because
/// files, runs, and queries are always iterated sorted.
#[derive(Debug, Default)]
pub struct WarningLog {
    pub counts: WarningCounts,
    pub messages: Vec<String>,
}

impl WarningLog {
    pub fn record(&mut self, category: WarningCategory, message: String) {
        self.bump(category);
        self.messages.push(message);
    }

    /// Increments a category count without a per-occurrence message.
    /// Used for high-volume categories (null citations) that are
    /// summarized per run instead.
    pub fn count_only(&mut self, category: WarningCategory) {
        self.bump(category);
    }

    fn bump(&mut self, category: WarningCategory) {
        match category {
            WarningCategory::MalformedRecord => self.counts.malformed_record += 1,
            WarningCategory::MissingRun => self.counts.missing_run += 1,
            WarningCategory::DuplicateDocId => self.counts.duplicate_doc_id += 1,
            WarningCategory::CanonicalizationCollision => {
                self.counts.canonicalization_collision += 1
            }
            WarningCategory::NullDocId => self.counts.null_doc_id += 1,
            WarningCategory::NullCitation => self.counts.null_citation += 1,
            WarningCategory::HighNullCitationRate => self.counts.high_null_citation_rate += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CanonicalizationStats {
    pub mapped_count: usize,
    pub unmapped_count: usize,
    pub collision_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub manifest_version: u32,
    pub generated_at: String,
    pub runs: usize,
    pub run_ids: Vec<String>,
    pub union_queries: usize,
    pub intersection_queries: usize,
    pub allow_missing: bool,
    pub topk: Option<usize>,
    pub warning_counts: WarningCounts,
    pub warnings: Vec<String>,
    pub canonicalization: CanonicalizationStats,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    pub manifest_version: u32,
    pub generated_at: String,
    pub runs_dir: String,
    pub out_dir: String,
    pub run_ids: Vec<String>,
    pub query_count: usize,
    pub flip_threshold: f64,
    pub min_overlap: f64,
    pub baseline: Option<String>,
    pub allow_missing: bool,
    pub topk: Option<usize>,
    pub pairwise_rows: usize,
    pub avg_overlap: f64,
    pub flip_rate: f64,
    pub null_citation_rate: f64,
    pub warning_counts: WarningCounts,
    pub canonicalization: CanonicalizationStats,
    pub warnings: Vec<String>,
}
