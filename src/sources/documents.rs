//! Markdown knowledge-document source.
//!
//! Walks `[sources.documents] root` and reads every file matching the
//! include globs (default `**/*.md`). A file may open with a front matter
//! block:
//!
//! ```text
//! ---
//! title: Plazos de envío
//! type: policy
//! id: doc_envios
//! ---
//! ```
//!
//! Missing fields are inferred:
//!
//! - **type**: from the relative path (`faq`, `polit*`/`polic*`,
//!   `empresa`/`company`/`about`, `categor*`), else `general`;
//! - **title**: the first `# ` heading, else the file stem;
//! - **id**: `doc_<slug of the relative path>`.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::json;
use serde_yaml::Value as YamlValue;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use voltline_core::analyze::fold;
use voltline_core::models::ContentType;

use crate::config::Config;
use crate::models::SourceDocument;

#[derive(Debug, Default, PartialEq, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    title: Option<YamlValue>,
    #[serde(default, rename = "type")]
    content_type: Option<YamlValue>,
    #[serde(default)]
    id: Option<YamlValue>,
}

impl FrontMatter {
    fn parse(block: &str) -> Result<Self, serde_yaml::Error> {
        if block.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(block)
    }
}

/// A scalar front matter value as text; `id: 42` is as good as `id: "42"`.
fn scalar(value: Option<YamlValue>) -> Option<String> {
    let text = match value? {
        YamlValue::String(s) => s,
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub fn scan_documents(config: &Config) -> Result<Vec<SourceDocument>> {
    let docs_config = config
        .sources
        .documents
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Documents source not configured"))?;

    let root = &docs_config.root;
    if !root.exists() {
        bail!("Documents source root does not exist: {}", root.display());
    }

    let include_set = build_globset(&docs_config.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
    default_excludes.extend(docs_config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs = Vec::new();

    let walker = WalkDir::new(root).follow_links(docs_config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable document");
                continue;
            }
        };
        docs.push(parse_document(&rel_str, &raw));
    }

    // Sort for deterministic ordering
    docs.sort_by(|a, b| a.external_id.cmp(&b.external_id));

    Ok(docs)
}

/// Turn one markdown file into a source document.
pub fn parse_document(relative_path: &str, raw: &str) -> SourceDocument {
    let (block, body) = split_front_matter(raw);
    let front = match block.map(FrontMatter::parse).transpose() {
        Ok(front) => front.unwrap_or_default(),
        Err(e) => {
            warn!(path = relative_path, error = %e, "invalid front matter, ignoring it");
            FrontMatter::default()
        }
    };
    let declared_type = scalar(front.content_type);

    let content_type = match declared_type.as_deref() {
        Some(tag) => tag.parse().unwrap_or_else(|_| {
            warn!(path = relative_path, tag, "unknown document type, inferring from path");
            type_from_path(relative_path)
        }),
        None => type_from_path(relative_path),
    };

    let title = scalar(front.title)
        .or_else(|| first_heading(body))
        .unwrap_or_else(|| file_stem(relative_path));

    let external_id = scalar(front.id)
        .unwrap_or_else(|| format!("doc_{}", slugify(relative_path)));

    SourceDocument {
        external_id,
        content_type,
        title,
        body: body.trim().to_string(),
        metadata: json!({ "source_path": relative_path }),
    }
}

/// Split a leading `---` block off the body. An unterminated block is body.
fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return (None, raw);
    };
    if let Some(after) = rest.strip_prefix("---") {
        let body = after.split_once('\n').map(|(_, b)| b).unwrap_or("");
        return (Some(""), body);
    }
    let Some(end) = rest.find("\n---") else {
        return (None, raw);
    };

    let after = &rest[end + "\n---".len()..];
    let body = after.split_once('\n').map(|(_, b)| b).unwrap_or("");
    (Some(&rest[..end]), body)
}

fn type_from_path(relative_path: &str) -> ContentType {
    let p = fold(relative_path);
    if p.contains("faq") {
        ContentType::Faq
    } else if p.contains("polit") || p.contains("polic") {
        ContentType::Policy
    } else if p.contains("empresa") || p.contains("company") || p.contains("about") {
        ContentType::CompanyInfo
    } else if p.contains("categor") {
        ContentType::Category
    } else {
        ContentType::General
    }
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn file_stem(relative_path: &str) -> String {
    Path::new(relative_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string())
}

/// `politicas/Envíos y Devoluciones.md` → `politicas_envios_y_devoluciones`.
fn slugify(relative_path: &str) -> String {
    let without_ext = match relative_path.rfind('.') {
        Some(dot) if !relative_path[dot..].contains('/') => &relative_path[..dot],
        _ => relative_path,
    };
    let folded = fold(without_ext);
    let mut slug = String::with_capacity(folded.len());
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
