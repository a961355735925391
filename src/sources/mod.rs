//! Ingestion sources.
//!
//! | Source | Module | Produces |
//! |--------|--------|----------|
//! | `products` | [`products`] | `product` items from a WooCommerce export |
//! | `documents` | [`documents`] | knowledge items from a markdown directory |
//!
//! Each source owns a fixed set of content types. A full sync retires every
//! active item of those types that the source no longer produces.

pub mod documents;
pub mod products;

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

use voltline_core::models::ContentType;

use crate::config::Config;
use crate::models::SourceDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Products,
    Documents,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Products, SourceKind::Documents];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Products => "products",
            SourceKind::Documents => "documents",
        }
    }

    /// Content types whose items this source is responsible for.
    pub fn owned_types(&self) -> Vec<ContentType> {
        match self {
            SourceKind::Products => vec![ContentType::Product],
            SourceKind::Documents => ContentType::ALL
                .into_iter()
                .filter(|ct| *ct != ContentType::Product)
                .collect(),
        }
    }

    pub fn is_configured(&self, config: &Config) -> bool {
        match self {
            SourceKind::Products => config.sources.products.is_some(),
            SourceKind::Documents => config.sources.documents.is_some(),
        }
    }

    /// Read every document the source currently offers.
    pub fn scan(&self, config: &Config) -> Result<Vec<SourceDocument>> {
        match self {
            SourceKind::Products => products::scan_products(config),
            SourceKind::Documents => documents::scan_documents(config),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "products" => Ok(SourceKind::Products),
            "documents" => Ok(SourceKind::Documents),
            other => bail!(
                "Unknown source: '{}'. Available: products, documents, all",
                other
            ),
        }
    }
}

/// Resolve a CLI source specifier (`all`, `products`, `documents`).
///
/// `all` expands to every configured source.
pub fn resolve(name: &str, config: &Config) -> Result<Vec<SourceKind>> {
    if name == "all" {
        let kinds: Vec<SourceKind> = SourceKind::ALL
            .into_iter()
            .filter(|k| k.is_configured(config))
            .collect();
        if kinds.is_empty() {
            bail!("No sources configured. Add [sources.products] or [sources.documents].");
        }
        return Ok(kinds);
    }
    let kind: SourceKind = name.parse()?;
    if !kind.is_configured(config) {
        bail!("Source '{}' is not configured. Add [sources.{}].", kind, kind);
    }
    Ok(vec![kind])
}

/// Print every source with its configuration status.
pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<12} {:<40} STATUS", "SOURCE", "LOCATION");
    for kind in SourceKind::ALL {
        let (location, status) = match kind {
            SourceKind::Products => match &config.sources.products {
                Some(p) => (p.path.display().to_string(), path_status(p.path.exists())),
                None => ("-".to_string(), "NOT CONFIGURED"),
            },
            SourceKind::Documents => match &config.sources.documents {
                Some(d) => (d.root.display().to_string(), path_status(d.root.exists())),
                None => ("-".to_string(), "NOT CONFIGURED"),
            },
        };
        println!("{:<12} {:<40} {}", kind, location, status);
    }
    Ok(())
}

fn path_status(exists: bool) -> &'static str {
    if exists {
        "OK"
    } else {
        "MISSING"
    }
}
