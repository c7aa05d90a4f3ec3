use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::canonicalize::{CanonReport, CanonicalizeOptions, Canonicalizer};
use crate::cli::{CommonArgs, ValidateArgs};
use crate::extract::extract_record;
use crate::metrics::{DocSet, QueryMap, RunMap};
use crate::model::{CanonicalizationStats, ValidationSummary, WarningCategory, WarningLog};
use crate::util::{now_utc_string, write_json_pretty};

/// One parsed run log, already canonicalized at doc-id level.
#[derive(Debug)]
pub struct RunData {
    pub run_id: String,
    pub file: String,
    pub queries: QueryMap,
    pub skipped_records: usize,
    pub null_citations: usize,
}

#[derive(Debug)]
pub struct LoadedRuns {
    pub runs: BTreeMap<String, RunData>,
    pub union_queries: BTreeSet<String>,
    pub intersection_queries: BTreeSet<String>,
    pub warnings: WarningLog,
    pub canon: CanonReport,
}

impl LoadedRuns {
    pub fn run_map(&self) -> RunMap {
        self.runs
            .iter()
            .map(|(run_id, data)| (run_id.clone(), data.queries.clone()))
            .collect()
    }

    pub fn skipped_by_run(&self) -> BTreeMap<String, usize> {
        self.runs
            .iter()
            .map(|(run_id, data)| (run_id.clone(), data.skipped_records))
            .collect()
    }

    pub fn canonicalization_stats(&self) -> CanonicalizationStats {
        CanonicalizationStats {
            mapped_count: self.canon.mapped_count,
            unmapped_count: self.canon.unmapped_count,
            collision_count: self.canon.collisions.len(),
        }
    }
}

pub fn run(args: ValidateArgs) -> Result<()> {
    let common = &args.common;
    check_common(common)?;

    let canonicalizer = build_canonicalizer(common)?;
    let loaded = load_runs(common, &canonicalizer)?;

    for message in &loaded.warnings.messages {
        warn!(warning = %message, "validation warning");
    }

    let summary = build_summary(common, &loaded);
    let summary_path = common.out.join("validation_summary.json");
    write_json_pretty(&summary_path, &summary)?;
    info!(path = %summary_path.display(), "wrote validation summary");

    info!(
        runs = summary.runs,
        union_queries = summary.union_queries,
        intersection_queries = summary.intersection_queries,
        warnings = summary.warnings.len(),
        allow_missing = summary.allow_missing,
        "validation complete"
    );

    Ok(())
}

pub fn check_common(common: &CommonArgs) -> Result<()> {
    if common.topk == Some(0) {
        bail!("--topk must be positive if provided");
    }
    Ok(())
}

pub fn build_canonicalizer(common: &CommonArgs) -> Result<Canonicalizer> {
    let opts = CanonicalizeOptions {
        case_sensitive: common.case_sensitive,
        collapse_internal_whitespace: common.collapse_internal_whitespace,
    };

    match &common.docid_map {
        Some(path) => Canonicalizer::from_map_csv(path, opts),
        None => Canonicalizer::new(opts),
    }
}

pub fn build_summary(common: &CommonArgs, loaded: &LoadedRuns) -> ValidationSummary {
    ValidationSummary {
        manifest_version: 1,
        generated_at: now_utc_string(),
        runs: loaded.runs.len(),
        run_ids: loaded.runs.keys().cloned().collect(),
        union_queries: loaded.union_queries.len(),
        intersection_queries: loaded.intersection_queries.len(),
        allow_missing: common.allow_missing,
        topk: common.topk,
        warning_counts: loaded.warnings.counts.clone(),
        warnings: loaded.warnings.messages.clone(),
        canonicalization: loaded.canonicalization_stats(),
        files: loaded
            .runs
            .iter()
            .map(|(run_id, data)| (run_id.clone(), data.file.clone()))
            .collect(),
    }
}

/// Loads every `*.jsonl` file in the runs folder, one run per file.
/// Per-record issues become warnings; structural issues (duplicate run
/// ids, no overlapping queries) are fatal.
pub fn load_runs(common: &CommonArgs, canonicalizer: &Canonicalizer) -> Result<LoadedRuns> {
    let run_files = discover_run_files(&common.runs)?;

    let mut warnings = WarningLog::default();
    let mut canon = CanonReport::default();
    let mut runs: BTreeMap<String, RunData> = BTreeMap::new();

    for path in &run_files {
        let data = ingest_file(path, canonicalizer, common.topk, &mut warnings, &mut canon)?;
        if runs.contains_key(&data.run_id) {
            bail!(
                "duplicate run_id across files: '{}' (run_id must be unique per run file)",
                data.run_id
            );
        }
        runs.insert(data.run_id.clone(), data);
    }

    let union_queries: BTreeSet<String> = runs
        .values()
        .flat_map(|data| data.queries.keys().cloned())
        .collect();
    if union_queries.is_empty() {
        bail!("no query_ids found across runs");
    }

    let intersection_queries: BTreeSet<String> = union_queries
        .iter()
        .filter(|query_id| runs.values().all(|data| data.queries.contains_key(*query_id)))
        .cloned()
        .collect();
    if intersection_queries.is_empty() {
        bail!("no overlapping query_ids across runs (cannot compare)");
    }

    if !common.allow_missing {
        for query_id in &union_queries {
            for (run_id, data) in &runs {
                if !data.queries.contains_key(query_id) {
                    warnings.record(
                        WarningCategory::MissingRun,
                        format!(
                            "query '{query_id}' missing from run '{run_id}'; run excluded from \
                             that query's comparisons (use --allow-missing to compare against \
                             the empty set)"
                        ),
                    );
                }
            }
        }
    }

    for (run_id, data) in &runs {
        let total = data.queries.len();
        if total > 0 {
            let null_rate = data.null_citations as f64 / total as f64;
            if null_rate >= 0.05 {
                warnings.record(
                    WarningCategory::HighNullCitationRate,
                    format!(
                        "run '{run_id}' null-citation rate is {:.1}% ({}/{} queries have an \
                         empty cited-doc set)",
                        null_rate * 100.0,
                        data.null_citations,
                        total
                    ),
                );
            }
        }
    }

    for collision in &canon.collisions {
        warnings.record(
            WarningCategory::CanonicalizationCollision,
            format!(
                "raw ids '{}' and '{}' both canonicalize to '{}'; first-seen mapping wins",
                collision.first_raw, collision.second_raw, collision.canonical
            ),
        );
    }

    Ok(LoadedRuns {
        runs,
        union_queries,
        intersection_queries,
        warnings,
        canon,
    })
}

fn discover_run_files(runs_dir: &Path) -> Result<Vec<PathBuf>> {
    if !runs_dir.is_dir() {
        bail!("--runs must be an existing directory: {}", runs_dir.display());
    }

    let entries = fs::read_dir(runs_dir)
        .with_context(|| format!("failed to read {}", runs_dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", runs_dir.display()))?;
        let path = entry.path();

        let is_jsonl = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
                .unwrap_or(false);
        if is_jsonl {
            files.push(path);
        }
    }

    files.sort();
    if files.is_empty() {
        bail!("no .jsonl files found in: {}", runs_dir.display());
    }

    Ok(files)
}

fn ingest_file(
    path: &Path,
    canonicalizer: &Canonicalizer,
    topk: Option<usize>,
    warnings: &mut WarningLog,
    canon: &mut CanonReport,
) -> Result<RunData> {
    let display = path.display().to_string();
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read run log: {display}"))?;

    let mut run_id: Option<String> = None;
    let mut queries = QueryMap::new();
    let mut skipped_records = 0_usize;
    let mut null_citations = 0_usize;

    for (lineno, line) in content.lines().enumerate().map(|(i, l)| (i + 1, l)) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                skipped_records += 1;
                warnings.record(
                    WarningCategory::MalformedRecord,
                    format!("{display} line {lineno}: invalid JSON: {err}"),
                );
                continue;
            }
        };

        let extracted = match extract_record(&record, topk) {
            Ok(extracted) => extracted,
            Err(err) => {
                skipped_records += 1;
                warnings.record(
                    WarningCategory::MalformedRecord,
                    format!("{display} line {lineno}: {err}"),
                );
                continue;
            }
        };

        // One run per file. A second run id in the same file is a
        // structural problem, not a per-record one.
        match &run_id {
            None => run_id = Some(extracted.run_id.clone()),
            Some(existing) if existing != &extracted.run_id => {
                bail!(
                    "{display} line {lineno}: found run_id '{}' but file already carries '{}' \
                     (expected exactly one run per file)",
                    extracted.run_id,
                    existing
                );
            }
            Some(_) => {}
        }

        if queries.contains_key(&extracted.query_id) {
            skipped_records += 1;
            warnings.record(
                WarningCategory::MalformedRecord,
                format!(
                    "{display} line {lineno}: duplicate query_id '{}' within the same run; \
                     record skipped",
                    extracted.query_id
                ),
            );
            continue;
        }

        if extracted.had_duplicates {
            warnings.record(
                WarningCategory::DuplicateDocId,
                format!(
                    "{display} line {lineno}: duplicate doc ids in citation list for query \
                     '{}'; deduplicated for set comparison",
                    extracted.query_id
                ),
            );
        }

        let mut docs = DocSet::new();
        for raw in &extracted.raw_doc_ids {
            match canonicalizer.canonicalize(raw, canon) {
                Some(canonical) => {
                    docs.insert(canonical);
                }
                None => {
                    warnings.record(
                        WarningCategory::NullDocId,
                        format!(
                            "{display} line {lineno}: empty doc id in citation list for query \
                             '{}'; id excluded",
                            extracted.query_id
                        ),
                    );
                }
            }
        }

        if docs.is_empty() {
            null_citations += 1;
            warnings.count_only(WarningCategory::NullCitation);
        }

        queries.insert(extracted.query_id, docs);
    }

    let Some(run_id) = run_id else {
        bail!("{display}: no valid records found (cannot determine run_id)");
    };

    Ok(RunData {
        run_id,
        file: display,
        queries,
        skipped_records,
        null_citations,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::{build_canonicalizer, check_common, load_runs};
    use crate::cli::CommonArgs;

    fn common_args(runs: &Path) -> CommonArgs {
        CommonArgs {
            runs: runs.to_path_buf(),
            out: PathBuf::from("out_report"),
            allow_missing: false,
            docid_map: None,
            case_sensitive: false,
            collapse_internal_whitespace: false,
            topk: None,
        }
    }

    fn write_run(dir: &Path, name: &str, lines: &[&str]) {
        fs::write(dir.join(name), lines.join("\n")).expect("run file should write");
    }

    #[test]
    fn loads_two_well_formed_runs() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[
                r#"{"run_id":"runA","query_id":"q1","docs":[{"doc_id":"D1"},{"doc_id":"D2"}]}"#,
                r#"{"run_id":"runA","query_id":"q2","docs":["D3"]}"#,
            ],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[
                r#"{"run_id":"runB","query_id":"q1","docs":[{"doc_id":"D1"}]}"#,
                r#"{"run_id":"runB","query_id":"q2","docs":["D3"]}"#,
            ],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");

        assert_eq!(loaded.runs.len(), 2);
        assert_eq!(loaded.union_queries.len(), 2);
        assert_eq!(loaded.intersection_queries.len(), 2);
        assert!(loaded.warnings.messages.is_empty());

        let run_a = &loaded.runs["runA"];
        assert_eq!(run_a.queries["q1"].len(), 2);
        assert!(run_a.queries["q1"].contains("d1"), "ids are case-folded");
    }

    #[test]
    fn malformed_lines_are_skipped_with_warnings_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[
                r#"{"run_id":"runA","query_id":"q1","docs":["D1"]}"#,
                "this is not json",
                r#"{"query_id":"q2","docs":["D2"]}"#,
            ],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runB","query_id":"q1","docs":["D1"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");

        assert_eq!(loaded.warnings.counts.malformed_record, 2);
        assert_eq!(loaded.runs["runA"].skipped_records, 2);
        assert_eq!(loaded.runs["runA"].queries.len(), 1);
    }

    #[test]
    fn duplicate_doc_ids_warn_once_per_query() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[r#"{"run_id":"runA","query_id":"q1","docs":["D1","D1","D2"]}"#],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runB","query_id":"q1","docs":["D1"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");

        assert_eq!(loaded.warnings.counts.duplicate_doc_id, 1);
        assert_eq!(loaded.runs["runA"].queries["q1"].len(), 2);
    }

    #[test]
    fn empty_doc_ids_are_warned_and_excluded() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[r#"{"run_id":"runA","query_id":"q1","docs":["", "D1"]}"#],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runB","query_id":"q1","docs":["D1"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");

        assert_eq!(loaded.warnings.counts.null_doc_id, 1);
        assert_eq!(loaded.runs["runA"].queries["q1"].len(), 1);
        assert!(loaded.runs["runA"].queries["q1"].contains("d1"));
    }

    #[test]
    fn case_fold_collision_across_runs_is_warned_once() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[r#"{"run_id":"runA","query_id":"q1","docs":["docX"]}"#],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runB","query_id":"q1","docs":["docx"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");

        assert_eq!(loaded.warnings.counts.canonicalization_collision, 1);
        assert_eq!(loaded.canonicalization_stats().collision_count, 1);
    }

    #[test]
    fn missing_queries_warn_in_default_mode_only() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[
                r#"{"run_id":"runA","query_id":"q1","docs":["D1"]}"#,
                r#"{"run_id":"runA","query_id":"q2","docs":["D2"]}"#,
            ],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runB","query_id":"q1","docs":["D1"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");
        assert_eq!(loaded.warnings.counts.missing_run, 1);
        assert_eq!(loaded.intersection_queries.len(), 1);

        let permissive = CommonArgs {
            allow_missing: true,
            ..common
        };
        let loaded = load_runs(&permissive, &canonicalizer).expect("runs should load");
        assert_eq!(loaded.warnings.counts.missing_run, 0);
    }

    #[test]
    fn null_citations_are_counted_without_per_record_messages() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[
                r#"{"run_id":"runA","query_id":"q1","docs":[]}"#,
                r#"{"run_id":"runA","query_id":"q2","docs":["D1"]}"#,
            ],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[
                r#"{"run_id":"runB","query_id":"q1","docs":[]}"#,
                r#"{"run_id":"runB","query_id":"q2","docs":["D1"]}"#,
            ],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let loaded = load_runs(&common, &canonicalizer).expect("runs should load");

        assert_eq!(loaded.warnings.counts.null_citation, 2);
        // 50% null rate per run produces one counted summary warning
        // per run; every message maps to a warning-count bucket.
        assert_eq!(loaded.warnings.counts.high_null_citation_rate, 2);
        assert_eq!(loaded.warnings.messages.len(), 2);
    }

    #[test]
    fn duplicate_run_id_across_files_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[r#"{"run_id":"runA","query_id":"q1","docs":["D1"]}"#],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runA","query_id":"q1","docs":["D1"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let error = load_runs(&common, &canonicalizer).expect_err("load should fail");
        assert!(error.to_string().contains("duplicate run_id"));
    }

    #[test]
    fn disjoint_query_sets_are_fatal() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        write_run(
            dir.path(),
            "a.jsonl",
            &[r#"{"run_id":"runA","query_id":"q1","docs":["D1"]}"#],
        );
        write_run(
            dir.path(),
            "b.jsonl",
            &[r#"{"run_id":"runB","query_id":"q2","docs":["D1"]}"#],
        );

        let common = common_args(dir.path());
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let error = load_runs(&common, &canonicalizer).expect_err("load should fail");
        assert!(error.to_string().contains("no overlapping query_ids"));
    }

    #[test]
    fn topk_zero_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let common = CommonArgs {
            topk: Some(0),
            ..common_args(dir.path())
        };
        assert!(check_common(&common).is_err());
    }

    #[test]
    fn missing_runs_directory_is_fatal() {
        let common = common_args(Path::new("/nonexistent/citecheck-runs"));
        let canonicalizer = build_canonicalizer(&common).expect("canonicalizer should build");
        let error = load_runs(&common, &canonicalizer).expect_err("load should fail");
        assert!(error.to_string().contains("existing directory"));
    }
}
