use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "citecheck",
    version,
    about = "Citation-stability checker for RAG run logs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate run logs and write a validation summary.
    Validate(ValidateArgs),
    /// Generate the full stability report.
    Report(ReportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Folder containing one JSONL run log per run.
    #[arg(long)]
    pub runs: PathBuf,

    /// Output folder for report artifacts.
    #[arg(long, default_value = "out_report")]
    pub out: PathBuf,

    /// Treat a run missing a query as citing the empty set instead of
    /// excluding it from that query's comparisons.
    #[arg(long, default_value_t = false)]
    pub allow_missing: bool,

    /// Optional CSV alias table with headers raw,canonical.
    #[arg(long)]
    pub docid_map: Option<PathBuf>,

    /// Treat doc ids as case-sensitive.
    #[arg(long, default_value_t = false)]
    pub case_sensitive: bool,

    /// Collapse internal whitespace runs in doc ids to single spaces.
    #[arg(long, default_value_t = false)]
    pub collapse_internal_whitespace: bool,

    /// Truncate each query's doc list to the first k entries before
    /// dedup and comparison.
    #[arg(long)]
    pub topk: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Mark a pair as a flip when its overlap is strictly below this.
    #[arg(long, default_value_t = 0.5)]
    pub flip_threshold: f64,

    /// Stability cut applied to min-overlap in the per-query CSV.
    #[arg(long, default_value_t = 0.5)]
    pub min_overlap: f64,

    /// Compare all runs only against this baseline run id.
    #[arg(long)]
    pub baseline: Option<String>,

    /// How many per-query examples to include in the Markdown report.
    #[arg(long, default_value_t = 20)]
    pub topn_examples: usize,

    /// Add a top1_doc_stability column to pairwise_stability.csv using
    /// the minimum canonical id as each query's primary doc.
    #[arg(long, default_value_t = false)]
    pub include_top1: bool,
}
