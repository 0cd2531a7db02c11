//! Ingestion of local files into the document store.
//!
//! Walks a file or directory and upserts one document per text file, or one
//! per page for PDFs. Markdown and text files may start with TOML front
//! matter between `+++` lines:
//!
//! ```text
//! +++
//! title = "The Treasure Fleet"
//! author = "Ma Huan"
//! year = 1433
//! type = "book"
//! tags = ["voyages"]
//! +++
//! Body text...
//! ```
//!
//! Ingestion never touches the vector index; run a reindex afterwards.
//! A file that cannot be read or parsed, or a document the store rejects,
//! is logged, counted as failed and skipped. An unreachable store ends the run.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::error::StoreError;
use crate::models::{DocumentType, NewDocument, UpsertStatus};
use crate::store::DocumentStore;

/// Values applied to every ingested document, taking precedence over front matter.
#[derive(Debug, Clone, Default)]
pub struct IngestOverrides {
    pub doc_type: Option<DocumentType>,
    pub author: Option<String>,
    pub year: Option<i32>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub files: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    title: Option<String>,
    author: Option<String>,
    year: Option<i32>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

pub async fn ingest_path(
    store: &dyn DocumentStore,
    config: &IngestConfig,
    path: &Path,
    overrides: &IngestOverrides,
) -> Result<IngestReport> {
    if !path.exists() {
        bail!("Path does not exist: {}", path.display());
    }
    let default_type = match config.default_type {
        Some(ref t) => t.parse::<DocumentType>().map_err(anyhow::Error::msg)?,
        None => DocumentType::Unknown,
    };

    let files = discover(config, path)?;
    let mut report = IngestReport {
        files: files.len(),
        ..IngestReport::default()
    };

    for (file, source_file) in files {
        let docs = match read_documents(&file, &source_file, default_type, overrides) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "skipping file");
                report.failed += 1;
                continue;
            }
        };
        if docs.is_empty() {
            report.skipped += 1;
            continue;
        }
        for doc in docs {
            let outcome = match store.upsert(doc).await {
                Ok(outcome) => outcome,
                Err(e @ StoreError::Unavailable(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "document rejected by store");
                    report.failed += 1;
                    continue;
                }
            };
            match outcome.status {
                UpsertStatus::Inserted => report.inserted += 1,
                UpsertStatus::Unchanged => report.unchanged += 1,
                UpsertStatus::Replaced => report.replaced += 1,
            }
        }
    }

    tracing::info!(
        files = report.files,
        inserted = report.inserted,
        unchanged = report.unchanged,
        replaced = report.replaced,
        "ingest complete"
    );
    Ok(report)
}

/// Files to ingest with their stable source keys, sorted by key.
fn discover(config: &IngestConfig, path: &Path) -> Result<Vec<(std::path::PathBuf, String)>> {
    if path.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        return Ok(vec![(path.to_path_buf(), name)]);
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file = entry.path();
        let relative = file.strip_prefix(path).unwrap_or(file);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((file.to_path_buf(), rel_str));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn read_documents(
    file: &Path,
    source_file: &str,
    default_type: DocumentType,
    overrides: &IngestOverrides,
) -> Result<Vec<NewDocument>> {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_default();
    let is_pdf = file
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    if is_pdf {
        let bytes = std::fs::read(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
            .map_err(|e| anyhow::anyhow!("PDF extraction failed: {}", e))?;
        let docs = pages
            .iter()
            .enumerate()
            .filter_map(|(i, page)| {
                let content = clean_text(page);
                if content.is_empty() {
                    return None;
                }
                Some(build(
                    FrontMatter::default(),
                    format!("{} (page {})", stem, i + 1),
                    content,
                    source_file,
                    Some(i as i64 + 1),
                    default_type,
                    overrides,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(docs);
    }

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let (front, body) = split_front_matter(&raw)?;
    let content = clean_text(body);
    if content.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![build(front, stem, content, source_file, None, default_type, overrides)?])
}

fn build(
    front: FrontMatter,
    fallback_title: String,
    content: String,
    source_file: &str,
    page_number: Option<i64>,
    default_type: DocumentType,
    overrides: &IngestOverrides,
) -> Result<NewDocument> {
    let front_type = match front.doc_type {
        Some(ref t) => Some(t.parse::<DocumentType>().map_err(anyhow::Error::msg)?),
        None => None,
    };
    let mut tags = front.tags;
    tags.extend(overrides.tags.iter().cloned());

    Ok(NewDocument {
        title: front
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(fallback_title),
        author: overrides.author.clone().or(front.author),
        year: overrides
            .year
            .or(front.year)
            .or_else(|| infer_year(&content)),
        doc_type: overrides.doc_type.or(front_type).unwrap_or(default_type),
        tags,
        source_file: source_file.to_string(),
        page_number,
        content,
    })
}

/// Split `+++`-delimited TOML front matter from the body.
fn split_front_matter(raw: &str) -> Result<(FrontMatter, &str)> {
    let text = raw.trim_start_matches('\u{feff}');
    let Some(rest) = text
        .strip_prefix("+++\n")
        .or_else(|| text.strip_prefix("+++\r\n"))
    else {
        return Ok((FrontMatter::default(), text));
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "+++" {
            let front: FrontMatter =
                toml::from_str(&rest[..offset]).context("Invalid front matter")?;
            return Ok((front, &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    bail!("Unterminated front matter")
}

static YEAR_REGEX: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"\b(1[3-9]\d{2}|20[0-2]\d)\b") {
    Ok(regex) => regex,
    Err(err) => panic!("Year regex is invalid: {err}"),
});

static LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"(?im)^\s*(title|author|source)\s*:.*$") {
    Ok(regex) => regex,
    Err(err) => panic!("Label regex is invalid: {err}"),
});

/// First year-like token between 1300 and 2029.
pub fn infer_year(text: &str) -> Option<i32> {
    YEAR_REGEX
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

/// Drop metadata label lines and collapse runs of whitespace.
pub fn clean_text(text: &str) -> String {
    let without_labels = LABEL_REGEX.replace_all(text, "");
    let mut out = String::with_capacity(without_labels.len());
    let mut blank_run = 0;
    for line in without_labels.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        out.push_str(&line);
        blank_run = 0;
    }
    out
}
