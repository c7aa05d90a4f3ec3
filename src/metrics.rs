use std::collections::{BTreeMap, BTreeSet};

pub type DocSet = BTreeSet<String>;
/// query_id -> canonical cited-doc set.
pub type QueryMap = BTreeMap<String, DocSet>;
/// run_id -> per-query doc sets. BTreeMap keeps run and query iteration
/// sorted, which the deterministic-output requirement depends on.
pub type RunMap = BTreeMap<String, QueryMap>;

#[derive(Debug, Clone)]
pub struct StabilityConfig {
    pub flip_threshold: f64,
    pub allow_missing: bool,
    pub baseline: Option<String>,
    /// Also compute the top-1 primary-doc stability proxy per run pair.
    pub include_top1: bool,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            flip_threshold: 0.5,
            allow_missing: false,
            baseline: None,
            include_top1: false,
        }
    }
}

/// Jaccard overlap. Two empty sets are vacuously stable, so J = 1.0
/// rather than undefined.
pub fn jaccard(a: &DocSet, b: &DocSet) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

pub fn is_flip(j: f64, flip_threshold: f64) -> bool {
    j < flip_threshold
}

/// One unordered run pair for one query. `run_a < run_b`
/// lexicographically; `added`/`removed` are oriented A -> B.
#[derive(Debug, Clone)]
pub struct PairwiseComparison {
    pub run_a: String,
    pub run_b: String,
    pub query_id: String,
    pub jaccard: f64,
    pub flip: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PerQueryStability {
    pub query_id: String,
    pub min_overlap: f64,
    /// None means "N/A": either no pair represents instability
    /// (min overlap is exactly 1.0) or there were no pairs at all.
    pub worst_pair: Option<(String, String)>,
    pub flip: bool,
    pub comparisons: Vec<PairwiseComparison>,
}

/// Corpus-level summary for one run pair across all evaluated queries.
#[derive(Debug, Clone)]
pub struct PairSummary {
    pub run_a: String,
    pub run_b: String,
    pub evaluated_queries: usize,
    pub avg_overlap: f64,
    pub flip_rate: f64,
    pub null_rate_a: f64,
    pub null_rate_b: f64,
    /// A cited something, B cited nothing.
    pub null_loss_a_to_b: f64,
    /// A cited nothing, B cited something.
    pub null_gain_a_to_b: f64,
    /// Fraction of queries whose primary doc (minimum canonical id, a
    /// deterministic stand-in until runs log an explicit primary)
    /// matches across the pair. Only computed on request.
    pub top1_doc_stability: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunQuality {
    pub run_id: String,
    pub citation_rate: f64,
    pub null_rate: f64,
    pub avg_cited_docs: f64,
    pub median_cited_docs: f64,
    pub p95_cited_docs: f64,
    pub skipped_records: usize,
}

#[derive(Debug, Clone)]
pub struct CorpusSummary {
    pub query_count: usize,
    pub comparison_count: usize,
    pub avg_overlap: f64,
    pub flip_rate: f64,
    pub null_citation_rate: f64,
}

/// Unordered run pairs in deterministic order. With a baseline, only
/// pairs involving the baseline are produced; each pair is still stored
/// lexicographically.
pub fn run_pairs(run_ids: &[String], baseline: Option<&str>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    match baseline {
        Some(base) => {
            for rid in run_ids {
                if rid == base {
                    continue;
                }
                let (a, b) = if base < rid.as_str() {
                    (base.to_string(), rid.clone())
                } else {
                    (rid.clone(), base.to_string())
                };
                pairs.push((a, b));
            }
        }
        None => {
            for (i, a) in run_ids.iter().enumerate() {
                for b in run_ids.iter().skip(i + 1) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
    }
    pairs
}

fn doc_set_for<'a>(
    runs: &'a RunMap,
    run_id: &str,
    query_id: &str,
    empty: &'a DocSet,
) -> &'a DocSet {
    runs.get(run_id)
        .and_then(|qmap| qmap.get(query_id))
        .unwrap_or(empty)
}

fn sorted_difference(a: &DocSet, b: &DocSet) -> Vec<String> {
    a.difference(b).cloned().collect()
}

/// All pairwise comparisons plus the min-overlap/worst-pair summary for
/// one query. In default mode a run lacking the query is excluded from
/// the pairs; with `allow_missing` it contributes the empty set.
pub fn compare_query(query_id: &str, runs: &RunMap, config: &StabilityConfig) -> PerQueryStability {
    let participating: Vec<String> = runs
        .iter()
        .filter(|(_, qmap)| config.allow_missing || qmap.contains_key(query_id))
        .map(|(run_id, _)| run_id.clone())
        .collect();

    // In default mode a baseline that lacks this query has nothing to
    // be compared against.
    let baseline = config.baseline.as_deref();
    let baseline_participates = baseline
        .map(|base| participating.iter().any(|run_id| run_id == base))
        .unwrap_or(true);

    let empty = DocSet::new();
    let mut comparisons = Vec::new();
    let mut min_overlap = 1.0_f64;
    let mut worst_pair: Option<(String, String)> = None;

    let pairs = if baseline_participates {
        run_pairs(&participating, baseline)
    } else {
        Vec::new()
    };

    for (run_a, run_b) in pairs {
        let set_a = doc_set_for(runs, &run_a, query_id, &empty);
        let set_b = doc_set_for(runs, &run_b, query_id, &empty);
        let j = jaccard(set_a, set_b);

        // Strict `<` keeps the first-encountered pair on ties; pair
        // iteration is already lexicographic, so ties resolve
        // deterministically.
        if worst_pair.is_none() || j < min_overlap {
            min_overlap = j;
            worst_pair = Some((run_a.clone(), run_b.clone()));
        }

        comparisons.push(PairwiseComparison {
            jaccard: j,
            flip: is_flip(j, config.flip_threshold),
            added: sorted_difference(set_b, set_a),
            removed: sorted_difference(set_a, set_b),
            query_id: query_id.to_string(),
            run_a,
            run_b,
        });
    }

    if comparisons.is_empty() {
        min_overlap = 1.0;
    }
    // No pair represents instability when every pair overlaps fully.
    if min_overlap == 1.0 {
        worst_pair = None;
    }

    PerQueryStability {
        query_id: query_id.to_string(),
        min_overlap,
        worst_pair,
        flip: is_flip(min_overlap, config.flip_threshold),
        comparisons,
    }
}

/// Per-query stability for every query, in sorted query-id order.
pub fn compute_per_query(
    runs: &RunMap,
    query_ids: &BTreeSet<String>,
    config: &StabilityConfig,
) -> Vec<PerQueryStability> {
    query_ids
        .iter()
        .map(|query_id| compare_query(query_id, runs, config))
        .collect()
}

/// Reorders per-query results most unstable first (min overlap
/// ascending, query id as tiebreak).
pub fn sort_most_unstable_first(results: &mut [PerQueryStability]) {
    results.sort_by(|a, b| {
        a.min_overlap
            .total_cmp(&b.min_overlap)
            .then_with(|| a.query_id.cmp(&b.query_id))
    });
}

/// Corpus-level per-pair summaries across all evaluated queries.
pub fn compute_pair_summaries(
    runs: &RunMap,
    query_ids: &BTreeSet<String>,
    config: &StabilityConfig,
) -> Vec<PairSummary> {
    let run_ids: Vec<String> = runs.keys().cloned().collect();
    let empty = DocSet::new();
    let mut summaries = Vec::new();

    for (run_a, run_b) in run_pairs(&run_ids, config.baseline.as_deref()) {
        let mut js = Vec::new();
        let mut flips = 0_usize;
        let mut null_a = 0_usize;
        let mut null_b = 0_usize;
        let mut null_loss = 0_usize;
        let mut null_gain = 0_usize;
        let mut top1_matches = 0_usize;

        for query_id in query_ids {
            let present_a = runs
                .get(&run_a)
                .is_some_and(|qmap| qmap.contains_key(query_id));
            let present_b = runs
                .get(&run_b)
                .is_some_and(|qmap| qmap.contains_key(query_id));
            if !config.allow_missing && !(present_a && present_b) {
                continue;
            }

            let set_a = doc_set_for(runs, &run_a, query_id, &empty);
            let set_b = doc_set_for(runs, &run_b, query_id, &empty);

            if set_a.is_empty() {
                null_a += 1;
            }
            if set_b.is_empty() {
                null_b += 1;
            }
            if !set_a.is_empty() && set_b.is_empty() {
                null_loss += 1;
            }
            if set_a.is_empty() && !set_b.is_empty() {
                null_gain += 1;
            }

            let j = jaccard(set_a, set_b);
            if is_flip(j, config.flip_threshold) {
                flips += 1;
            }
            js.push(j);

            // Primary doc = minimum canonical id. Two empty sets agree
            // vacuously, like the both-empty Jaccard case.
            if config.include_top1 && set_a.iter().next() == set_b.iter().next() {
                top1_matches += 1;
            }
        }

        let n = js.len();
        let rate = |count: usize| if n > 0 { count as f64 / n as f64 } else { 0.0 };
        summaries.push(PairSummary {
            evaluated_queries: n,
            avg_overlap: mean(&js),
            flip_rate: rate(flips),
            null_rate_a: rate(null_a),
            null_rate_b: rate(null_b),
            null_loss_a_to_b: rate(null_loss),
            null_gain_a_to_b: rate(null_gain),
            top1_doc_stability: if config.include_top1 && n > 0 {
                Some(top1_matches as f64 / n as f64)
            } else {
                None
            },
            run_a,
            run_b,
        });
    }

    summaries
}

/// Per-run citation behavior, for interpreting "stable but empty" runs.
pub fn compute_run_quality(
    runs: &RunMap,
    skipped_by_run: &BTreeMap<String, usize>,
) -> Vec<RunQuality> {
    runs.iter()
        .map(|(run_id, qmap)| {
            let sizes: Vec<usize> = qmap.values().map(BTreeSet::len).collect();
            let non_empty = sizes.iter().filter(|size| **size > 0).count();
            let total = sizes.len();
            let citation_rate = if total > 0 {
                non_empty as f64 / total as f64
            } else {
                0.0
            };

            RunQuality {
                run_id: run_id.clone(),
                citation_rate,
                null_rate: if total > 0 { 1.0 - citation_rate } else { 0.0 },
                avg_cited_docs: mean(&sizes.iter().map(|s| *s as f64).collect::<Vec<_>>()),
                median_cited_docs: median(&sizes),
                p95_cited_docs: percentile_nearest_rank(&sizes, 95.0),
                skipped_records: skipped_by_run.get(run_id).copied().unwrap_or(0),
            }
        })
        .collect()
}

/// Folds per-query results into corpus aggregates.
pub fn aggregate(
    per_query: &[PerQueryStability],
    runs: &RunMap,
    config: &StabilityConfig,
) -> CorpusSummary {
    let all_j: Vec<f64> = per_query
        .iter()
        .flat_map(|result| result.comparisons.iter().map(|c| c.jaccard))
        .collect();

    let flipped = per_query
        .iter()
        .filter(|result| is_flip(result.min_overlap, config.flip_threshold))
        .count();

    let mut cells = 0_usize;
    let mut null_cells = 0_usize;
    if config.allow_missing {
        // Every (run, query) cell participates in the comparisons, so
        // absent cells count as null alongside present-but-empty ones.
        for qmap in runs.values() {
            for result in per_query {
                cells += 1;
                if qmap
                    .get(&result.query_id)
                    .is_none_or(BTreeSet::is_empty)
                {
                    null_cells += 1;
                }
            }
        }
    } else {
        for qmap in runs.values() {
            for set in qmap.values() {
                cells += 1;
                if set.is_empty() {
                    null_cells += 1;
                }
            }
        }
    }

    CorpusSummary {
        query_count: per_query.len(),
        comparison_count: all_j.len(),
        avg_overlap: mean(&all_j),
        flip_rate: if per_query.is_empty() {
            0.0
        } else {
            flipped as f64 / per_query.len() as f64
        },
        null_citation_rate: if cells > 0 {
            null_cells as f64 / cells as f64
        } else {
            0.0
        },
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[usize]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    }
}

/// Nearest-rank percentile, `p` in [0, 100].
fn percentile_nearest_rank(values: &[usize], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    if p <= 0.0 {
        return sorted[0] as f64;
    }
    if p >= 100.0 {
        return sorted[sorted.len() - 1] as f64;
    }
    let k = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[k] as f64
}
