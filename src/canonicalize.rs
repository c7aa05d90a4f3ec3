use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;

/// Controls doc-id normalization. Defaults lower-case and trim;
/// internal-whitespace collapsing is opt-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalizeOptions {
    pub case_sensitive: bool,
    pub collapse_internal_whitespace: bool,
}

/// Collision between two distinct raw ids that normalize to the same
/// canonical id. The first-seen raw id keeps the mapping; the collision
/// is surfaced as a warning, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub canonical: String,
    pub first_raw: String,
    pub second_raw: String,
}

/// Per-invocation canonicalization bookkeeping, threaded mutably through
/// the load pass so the `Canonicalizer` itself stays immutable.
#[derive(Debug, Default)]
pub struct CanonReport {
    pub mapped_count: usize,
    pub unmapped_count: usize,
    pub collisions: Vec<Collision>,
    first_raw_by_canonical: BTreeMap<String, String>,
    recorded_pairs: BTreeSet<(String, String, String)>,
}

impl CanonReport {
    fn observe(&mut self, raw: &str, canonical: &str) {
        match self.first_raw_by_canonical.get(canonical) {
            None => {
                self.first_raw_by_canonical
                    .insert(canonical.to_string(), raw.to_string());
            }
            Some(first) if first != raw => {
                let first_raw = first.clone();
                let (lo, hi) = if first_raw.as_str() <= raw {
                    (first_raw.clone(), raw.to_string())
                } else {
                    (raw.to_string(), first_raw.clone())
                };
                let key = (lo, hi, canonical.to_string());
                if self.recorded_pairs.insert(key) {
                    self.collisions.push(Collision {
                        canonical: canonical.to_string(),
                        first_raw,
                        second_raw: raw.to_string(),
                    });
                }
            }
            Some(_) => {}
        }
    }
}

#[derive(Debug, Deserialize)]
struct AliasRow {
    raw: String,
    canonical: String,
}

/// Normalizes doc ids and resolves them through an optional alias map.
/// Map keys and values are normalized under the same options at load
/// time so lookups always compare like with like.
#[derive(Debug)]
pub struct Canonicalizer {
    opts: CanonicalizeOptions,
    alias_map: BTreeMap<String, String>,
    whitespace: Regex,
}

impl Canonicalizer {
    pub fn new(opts: CanonicalizeOptions) -> Result<Self> {
        let whitespace = Regex::new(r"\s+").context("failed to compile whitespace regex")?;
        Ok(Self {
            opts,
            alias_map: BTreeMap::new(),
            whitespace,
        })
    }

    /// Loads a two-column alias CSV with headers `raw,canonical`.
    /// An unreadable or misheaded file is a fatal configuration error.
    pub fn from_map_csv(path: &Path, opts: CanonicalizeOptions) -> Result<Self> {
        let mut canonicalizer = Self::new(opts)?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("failed to open docid map: {}", path.display()))?;

        let headers = reader
            .headers()
            .with_context(|| format!("failed to read docid map headers: {}", path.display()))?;
        let has = |name: &str| headers.iter().any(|h| h == name);
        if !has("raw") || !has("canonical") {
            bail!(
                "docid map must have headers raw,canonical (got {:?}): {}",
                headers.iter().collect::<Vec<_>>(),
                path.display()
            );
        }

        for (idx, row) in reader.deserialize::<AliasRow>().enumerate() {
            let row = row.with_context(|| {
                format!("failed to parse docid map row {}: {}", idx + 2, path.display())
            })?;
            let raw = canonicalizer.normalize(&row.raw);
            let canonical = canonicalizer.normalize(&row.canonical);
            if !raw.is_empty() && !canonical.is_empty() {
                canonicalizer.alias_map.insert(raw, canonical);
            }
        }

        Ok(canonicalizer)
    }

    /// Normalization order: trim, optional whitespace collapse, path
    /// separator normalization, optional case fold.
    pub fn normalize(&self, raw: &str) -> String {
        let mut s = raw.trim().to_string();
        if self.opts.collapse_internal_whitespace {
            s = self.whitespace.replace_all(&s, " ").trim().to_string();
        }
        s = s.replace('\\', "/");
        if !self.opts.case_sensitive {
            s = s.to_lowercase();
        }
        s
    }

    /// Canonicalizes one raw id. Returns `None` for ids that are empty
    /// after normalization (the caller records a null-doc-id warning and
    /// excludes the id from the set).
    pub fn canonicalize(&self, raw: &str, report: &mut CanonReport) -> Option<String> {
        let normalized = self.normalize(raw);
        if normalized.is_empty() {
            return None;
        }

        let canonical = if self.alias_map.is_empty() {
            normalized
        } else if let Some(mapped) = self.alias_map.get(&normalized) {
            report.mapped_count += 1;
            mapped.clone()
        } else {
            report.unmapped_count += 1;
            normalized
        };

        report.observe(raw.trim(), &canonical);
        Some(canonical)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{CanonReport, CanonicalizeOptions, Canonicalizer};

    fn default_canonicalizer() -> Canonicalizer {
        Canonicalizer::new(CanonicalizeOptions::default()).expect("canonicalizer should build")
    }

    #[test]
    fn canonicalizing_an_already_canonical_id_is_idempotent() {
        let canonicalizer = default_canonicalizer();
        let mut report = CanonReport::default();

        let once = canonicalizer
            .canonicalize("doc-1", &mut report)
            .expect("id should canonicalize");
        let twice = canonicalizer
            .canonicalize(&once, &mut report)
            .expect("id should canonicalize");
        assert_eq!(once, twice);
        assert_eq!(once, "doc-1");
    }

    #[test]
    fn case_fold_is_applied_unless_case_sensitive() {
        let folded = default_canonicalizer();
        let mut report = CanonReport::default();
        assert_eq!(
            folded.canonicalize("DocX", &mut report),
            Some("docx".to_string())
        );

        let sensitive = Canonicalizer::new(CanonicalizeOptions {
            case_sensitive: true,
            ..CanonicalizeOptions::default()
        })
        .expect("canonicalizer should build");
        assert_eq!(
            sensitive.canonicalize("DocX", &mut report),
            Some("DocX".to_string())
        );
    }

    #[test]
    fn internal_whitespace_collapses_when_enabled() {
        let canonicalizer = Canonicalizer::new(CanonicalizeOptions {
            collapse_internal_whitespace: true,
            ..CanonicalizeOptions::default()
        })
        .expect("canonicalizer should build");

        let mut report = CanonReport::default();
        assert_eq!(
            canonicalizer.canonicalize("  doc \t  one  ", &mut report),
            Some("doc one".to_string())
        );
    }

    #[test]
    fn backslash_paths_normalize_to_forward_slashes() {
        let canonicalizer = default_canonicalizer();
        let mut report = CanonReport::default();
        assert_eq!(
            canonicalizer.canonicalize(r"corpus\part1\doc.md", &mut report),
            Some("corpus/part1/doc.md".to_string())
        );
    }

    #[test]
    fn empty_id_is_rejected_not_canonicalized() {
        let canonicalizer = default_canonicalizer();
        let mut report = CanonReport::default();
        assert_eq!(canonicalizer.canonicalize("   ", &mut report), None);
    }

    #[test]
    fn case_fold_collision_is_recorded_exactly_once() {
        let canonicalizer = default_canonicalizer();
        let mut report = CanonReport::default();

        canonicalizer.canonicalize("docX", &mut report);
        canonicalizer.canonicalize("docx", &mut report);
        // Repeats of the same pair must not add more collisions.
        canonicalizer.canonicalize("docX", &mut report);
        canonicalizer.canonicalize("docx", &mut report);

        assert_eq!(report.collisions.len(), 1);
        let collision = &report.collisions[0];
        assert_eq!(collision.canonical, "docx");
        assert_eq!(collision.first_raw, "docX");
        assert_eq!(collision.second_raw, "docx");
    }

    #[test]
    fn repeated_identical_raw_id_is_not_a_collision() {
        let canonicalizer = default_canonicalizer();
        let mut report = CanonReport::default();

        canonicalizer.canonicalize("doc1", &mut report);
        canonicalizer.canonicalize("doc1", &mut report);
        assert!(report.collisions.is_empty());
    }

    #[test]
    fn alias_map_resolves_and_counts_lookups() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should create");
        writeln!(file, "raw,canonical").expect("write should succeed");
        writeln!(file, "Doc-Alpha,doc-1").expect("write should succeed");
        writeln!(file, "doc-beta,doc-2").expect("write should succeed");

        let canonicalizer =
            Canonicalizer::from_map_csv(file.path(), CanonicalizeOptions::default())
                .expect("map should load");

        let mut report = CanonReport::default();
        assert_eq!(
            canonicalizer.canonicalize("doc-alpha", &mut report),
            Some("doc-1".to_string())
        );
        assert_eq!(
            canonicalizer.canonicalize("unmapped", &mut report),
            Some("unmapped".to_string())
        );
        assert_eq!(report.mapped_count, 1);
        assert_eq!(report.unmapped_count, 1);
    }

    #[test]
    fn alias_map_without_required_headers_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should create");
        writeln!(file, "from,to").expect("write should succeed");
        writeln!(file, "a,b").expect("write should succeed");

        let error = Canonicalizer::from_map_csv(file.path(), CanonicalizeOptions::default())
            .expect_err("misheaded map should fail");
        assert!(error.to_string().contains("raw,canonical"));
    }
}
