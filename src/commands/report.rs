use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::ReportArgs;
use crate::commands::validate::{LoadedRuns, build_canonicalizer, build_summary, check_common, load_runs};
use crate::metrics::{
    PairwiseComparison, PerQueryStability, RunMap, StabilityConfig, aggregate,
    compute_pair_summaries, compute_per_query, compute_run_quality, sort_most_unstable_first,
};
use crate::model::ReportMeta;
use crate::util::{now_utc_string, write_csv, write_json_pretty, write_markdown};

pub fn run(args: ReportArgs) -> Result<()> {
    let common = &args.common;
    check_common(common)?;
    if !(0.0..=1.0).contains(&args.flip_threshold) {
        bail!("--flip-threshold must be in [0,1]");
    }
    if !(0.0..=1.0).contains(&args.min_overlap) {
        bail!("--min-overlap must be in [0,1]");
    }

    let canonicalizer = build_canonicalizer(common)?;
    let loaded = load_runs(common, &canonicalizer)?;
    let runs = loaded.run_map();

    if let Some(baseline) = &args.baseline {
        if !runs.contains_key(baseline) {
            bail!(
                "--baseline '{}' not found among runs: {:?}",
                baseline,
                runs.keys().collect::<Vec<_>>()
            );
        }
    }

    for message in &loaded.warnings.messages {
        warn!(warning = %message, "validation warning");
    }

    let config = StabilityConfig {
        flip_threshold: args.flip_threshold,
        allow_missing: common.allow_missing,
        baseline: args.baseline.clone(),
        include_top1: args.include_top1,
    };

    let mut per_query = compute_per_query(&runs, &loaded.union_queries, &config);
    let pair_summaries = compute_pair_summaries(&runs, &loaded.union_queries, &config);
    let run_quality = compute_run_quality(&runs, &loaded.skipped_by_run());
    let corpus = aggregate(&per_query, &runs, &config);
    sort_most_unstable_first(&mut per_query);

    let out = &common.out;

    let summary = build_summary(common, &loaded);
    write_artifact(&out.join("validation_summary.json"), |path| {
        write_json_pretty(path, &summary)
    })?;

    write_artifact(&out.join("run_quality.csv"), |path| {
        write_csv(
            path,
            &[
                "run_id",
                "citation_rate",
                "null_rate",
                "avg_cited_docs",
                "median_cited_docs",
                "p95_cited_docs",
                "skipped_records",
            ],
            &run_quality
                .iter()
                .map(|rq| {
                    vec![
                        rq.run_id.clone(),
                        format!("{:.6}", rq.citation_rate),
                        format!("{:.6}", rq.null_rate),
                        format!("{:.6}", rq.avg_cited_docs),
                        format!("{:.3}", rq.median_cited_docs),
                        format!("{:.3}", rq.p95_cited_docs),
                        rq.skipped_records.to_string(),
                    ]
                })
                .collect::<Vec<_>>(),
        )
    })?;

    write_artifact(&out.join("pairwise_stability.csv"), |path| {
        let mut header = vec![
            "run_a",
            "run_b",
            "evaluated_queries",
            "avg_overlap",
            "flip_rate",
            "null_rate_a",
            "null_rate_b",
            "null_loss_a_to_b",
            "null_gain_a_to_b",
        ];
        if args.include_top1 {
            header.push("top1_doc_stability");
        }
        write_csv(
            path,
            &header,
            &pair_summaries
                .iter()
                .map(|ps| {
                    let mut row = vec![
                        ps.run_a.clone(),
                        ps.run_b.clone(),
                        ps.evaluated_queries.to_string(),
                        format!("{:.6}", ps.avg_overlap),
                        format!("{:.6}", ps.flip_rate),
                        format!("{:.6}", ps.null_rate_a),
                        format!("{:.6}", ps.null_rate_b),
                        format!("{:.6}", ps.null_loss_a_to_b),
                        format!("{:.6}", ps.null_gain_a_to_b),
                    ];
                    if args.include_top1 {
                        row.push(
                            ps.top1_doc_stability
                                .map(|v| format!("{v:.6}"))
                                .unwrap_or_default(),
                        );
                    }
                    row
                })
                .collect::<Vec<_>>(),
        )
    })?;

    write_artifact(&out.join("per_query_stability.csv"), |path| {
        write_csv(
            path,
            &[
                "query_id",
                "min_overlap_across_pairs",
                "worst_pair",
                "flip",
                "stable_at_min_overlap",
            ],
            &per_query
                .iter()
                .map(|pq| {
                    vec![
                        pq.query_id.clone(),
                        format!("{:.6}", pq.min_overlap),
                        worst_pair_label(&pq.worst_pair),
                        if pq.flip { "1" } else { "0" }.to_string(),
                        if pq.min_overlap >= args.min_overlap { "1" } else { "0" }.to_string(),
                    ]
                })
                .collect::<Vec<_>>(),
        )
    })?;

    write_artifact(&out.join("per_query_pairwise.csv"), |path| {
        let mut rows = Vec::new();
        // Restore sorted query order for the exhaustive pairwise dump.
        let mut by_query: Vec<&PerQueryStability> = per_query.iter().collect();
        by_query.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        for pq in by_query {
            for c in &pq.comparisons {
                rows.push(vec![
                    c.query_id.clone(),
                    c.run_a.clone(),
                    c.run_b.clone(),
                    format!("{:.6}", c.jaccard),
                    if c.flip { "1" } else { "0" }.to_string(),
                    c.added.join(";"),
                    c.removed.join(";"),
                ]);
            }
        }
        write_csv(
            path,
            &["query_id", "run_a", "run_b", "jaccard", "flip", "added", "removed"],
            &rows,
        )
    })?;

    let markdown = render_examples_markdown(&args, &loaded, &runs, &per_query);
    write_artifact(&out.join("instability_examples.md"), |path| {
        write_markdown(path, &markdown)
    })?;

    let meta = ReportMeta {
        manifest_version: 1,
        generated_at: now_utc_string(),
        runs_dir: common.runs.display().to_string(),
        out_dir: out.display().to_string(),
        run_ids: runs.keys().cloned().collect(),
        query_count: loaded.union_queries.len(),
        flip_threshold: args.flip_threshold,
        min_overlap: args.min_overlap,
        baseline: args.baseline.clone(),
        allow_missing: common.allow_missing,
        topk: common.topk,
        pairwise_rows: pair_summaries.len(),
        avg_overlap: corpus.avg_overlap,
        flip_rate: corpus.flip_rate,
        null_citation_rate: corpus.null_citation_rate,
        warning_counts: loaded.warnings.counts.clone(),
        canonicalization: loaded.canonicalization_stats(),
        warnings: loaded.warnings.messages.clone(),
    };
    write_artifact(&out.join("report_meta.json"), |path| {
        write_json_pretty(path, &meta)
    })?;

    info!(
        runs = runs.len(),
        queries = corpus.query_count,
        comparisons = corpus.comparison_count,
        avg_overlap = corpus.avg_overlap,
        flip_rate = corpus.flip_rate,
        null_citation_rate = corpus.null_citation_rate,
        "report complete"
    );

    Ok(())
}

fn write_artifact(path: &Path, writer: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    writer(path)?;
    info!(path = %path.display(), "wrote report artifact");
    Ok(())
}

fn worst_pair_label(worst_pair: &Option<(String, String)>) -> String {
    match worst_pair {
        Some((a, b)) => format!("{a} vs {b}"),
        None => "N/A".to_string(),
    }
}

fn worst_pair_comparison(pq: &PerQueryStability) -> Option<&PairwiseComparison> {
    let (a, b) = pq.worst_pair.as_ref()?;
    pq.comparisons
        .iter()
        .find(|c| &c.run_a == a && &c.run_b == b)
}

fn render_examples_markdown(
    args: &ReportArgs,
    loaded: &LoadedRuns,
    runs: &RunMap,
    per_query: &[PerQueryStability],
) -> String {
    let run_ids: Vec<&str> = runs.keys().map(String::as_str).collect();
    let mut lines: Vec<String> = Vec::new();

    lines.push("# Citation stability examples\n".to_string());
    lines.push(format!("- Runs: {}", run_ids.join(", ")));
    lines.push(format!("- Queries evaluated: {}", loaded.union_queries.len()));
    lines.push(format!("- Flip threshold: J < {}", args.flip_threshold));
    lines.push(format!("- Min-overlap (stability): {}", args.min_overlap));
    lines.push(format!("- allow_missing: {}", args.common.allow_missing));
    lines.push(format!(
        "- topk: {}\n",
        args.common
            .topk
            .map(|k| k.to_string())
            .unwrap_or_else(|| "none".to_string())
    ));

    for pq in per_query.iter().take(args.topn_examples) {
        lines.push(format!("## {}", pq.query_id));
        lines.push(format!(
            "- min_overlap_across_pairs: **{:.3}**",
            pq.min_overlap
        ));
        lines.push(format!(
            "- worst_pair: **{}**\n",
            worst_pair_label(&pq.worst_pair)
        ));

        lines.push("| run_id | cited_docs (doc_id set) |".to_string());
        lines.push("|---|---|".to_string());
        for run_id in &run_ids {
            let docs: Vec<&str> = runs[*run_id]
                .get(&pq.query_id)
                .map(|set| set.iter().map(String::as_str).collect())
                .unwrap_or_default();
            let cell = if docs.is_empty() {
                "(empty)".to_string()
            } else {
                docs.join(", ")
            };
            lines.push(format!("| {run_id} | {cell} |"));
        }
        lines.push(String::new());

        if let Some(c) = worst_pair_comparison(pq) {
            lines.push(format!(
                "- worst-pair diff `{}` → `{}`: J={:.3}, flip={}, +[{}] -[{}]",
                c.run_a,
                c.run_b,
                c.jaccard,
                if c.flip { "yes" } else { "no" },
                c.added.join(", "),
                c.removed.join(", ")
            ));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}
