//! WooCommerce product export source.
//!
//! Reads the JSON array returned by `GET /wp-json/wc/v3/products` (saved to
//! disk). Only products with `status = "publish"` are indexed; drafts,
//! private and trashed products are treated as gone and get retired on the
//! next full sync.
//!
//! Each product becomes one item with external id `product_<id>`. The
//! indexed content is the name, the HTML-stripped short and long
//! descriptions, categories, attributes and SKU, one per line. Prices,
//! stock status and permalink go into the metadata bag.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use voltline_core::models::ContentType;

use crate::config::Config;
use crate::models::SourceDocument;

static SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid pattern"));
static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid pattern"));

#[derive(Debug, Deserialize)]
struct WooProduct {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    sku: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    short_description: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    price: Value,
    #[serde(default)]
    regular_price: Value,
    #[serde(default)]
    sale_price: Value,
    #[serde(default)]
    stock_status: String,
    #[serde(default)]
    categories: Vec<WooCategory>,
    #[serde(default)]
    attributes: Vec<WooAttribute>,
}

#[derive(Debug, Deserialize)]
struct WooCategory {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WooAttribute {
    #[serde(default)]
    name: String,
    #[serde(default)]
    options: Vec<String>,
}

pub fn scan_products(config: &Config) -> Result<Vec<SourceDocument>> {
    let products_config = config
        .sources
        .products
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Products source not configured"))?;

    let raw = std::fs::read_to_string(&products_config.path).with_context(|| {
        format!(
            "Failed to read product export: {}",
            products_config.path.display()
        )
    })?;
    parse_products(&raw)
}

/// Parse a WooCommerce export into published product documents, sorted by
/// external id.
pub fn parse_products(raw: &str) -> Result<Vec<SourceDocument>> {
    let products: Vec<WooProduct> =
        serde_json::from_str(raw).context("Product export is not a JSON array of products")?;

    let total = products.len();
    let mut docs: Vec<SourceDocument> = products
        .into_iter()
        .filter(|p| p.status == "publish")
        .filter(|p| !p.name.trim().is_empty())
        .map(product_to_document)
        .collect();
    docs.sort_by(|a, b| a.external_id.cmp(&b.external_id));

    debug!(total, published = docs.len(), "parsed product export");
    Ok(docs)
}

fn product_to_document(p: WooProduct) -> SourceDocument {
    let name = clean_text(&p.name);
    let categories: Vec<String> = p
        .categories
        .iter()
        .map(|c| clean_text(&c.name))
        .filter(|c| !c.is_empty())
        .collect();

    let mut lines = vec![name.clone()];
    for html in [&p.short_description, &p.description] {
        let text = strip_html(html);
        if !text.is_empty() {
            lines.push(text);
        }
    }
    if !categories.is_empty() {
        lines.push(format!("Categorías: {}", categories.join(", ")));
    }
    for attr in &p.attributes {
        if !attr.name.is_empty() && !attr.options.is_empty() {
            lines.push(format!("{}: {}", attr.name, attr.options.join(", ")));
        }
    }
    if !p.sku.is_empty() {
        lines.push(format!("SKU: {}", p.sku));
    }

    let mut metadata = Map::new();
    for (key, value) in [
        ("price", &p.price),
        ("regular_price", &p.regular_price),
        ("sale_price", &p.sale_price),
    ] {
        if !is_blank(value) {
            metadata.insert(key.to_string(), value.clone());
        }
    }
    if !p.sku.is_empty() {
        metadata.insert("sku".into(), json!(p.sku));
    }
    if !p.stock_status.is_empty() {
        metadata.insert("stock_status".into(), json!(p.stock_status));
    }
    if !p.permalink.is_empty() {
        metadata.insert("permalink".into(), json!(p.permalink));
    }
    metadata.insert("categories".into(), json!(categories));
    metadata.insert("product_id".into(), json!(p.id));

    SourceDocument {
        external_id: format!("product_{}", p.id),
        content_type: ContentType::Product,
        title: name,
        body: lines.join("\n"),
        metadata: Value::Object(metadata),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn clean_text(text: &str) -> String {
    SPACE_RE
        .replace_all(&html_text(text), " ")
        .trim()
        .to_string()
}

/// Elements that end a line of text.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6",
    "blockquote", "section",
];

/// Text content of an HTML fragment, entities decoded, one line per block.
fn html_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    collect_text(fragment.root_element(), &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child.value().name();
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                let block = BLOCK_ELEMENTS.contains(&name);
                if block {
                    out.push('\n');
                }
                collect_text(child, out);
                if block {
                    out.push_str("\n\n");
                } else if name == "td" || name == "th" {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

/// Drop tags, keep paragraph breaks, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let text = html_text(html);
    let lines: Vec<String> = text
        .lines()
        .map(|l| SPACE_RE.replace_all(l, " ").trim().to_string())
        .collect();
    BLANK_LINES_RE
        .replace_all(lines.join("\n").trim(), "\n\n")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltline_core::models::{ItemMetadata, StockStatus};

    const EXPORT: &str = r#"[
        {
            "id": 812,
            "name": "Diferencial DPN 2P 25A 30mA",
            "status": "publish",
            "sku": "SCH-A9D31625",
            "permalink": "https://tienda.example/producto/diferencial-dpn",
            "short_description": "<p>Interruptor diferencial <strong>DPN</strong> para vivienda.</p>",
            "description": "<p>Curva C.</p><p>Poder de corte 6kA&nbsp;&amp; clase AC.</p>",
            "price": "48.90",
            "regular_price": "54.00",
            "sale_price": "48.90",
            "stock_status": "instock",
            "categories": [{ "id": 3, "name": "Protección" }],
            "attributes": [{ "name": "Polos", "options": ["2P"] }]
        },
        {
            "id": 900,
            "name": "Borrador",
            "status": "draft"
        },
        {
            "id": 13,
            "name": "Bombilla LED E27 10W",
            "status": "publish",
            "price": 3.5
        }
    ]"#;

    #[test]
    fn only_published_products_are_indexed() {
        let docs = parse_products(EXPORT).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.external_id.as_str()).collect();
        assert_eq!(ids, vec!["product_13", "product_812"]);
        assert!(docs.iter().all(|d| d.content_type == ContentType::Product));
    }

    #[test]
    fn product_content_and_metadata() {
        let docs = parse_products(EXPORT).unwrap();
        let dpn = docs.iter().find(|d| d.external_id == "product_812").unwrap();
        assert_eq!(dpn.title, "Diferencial DPN 2P 25A 30mA");
        assert!(dpn.body.contains("Interruptor diferencial DPN para vivienda."));
        assert!(dpn.body.contains("Poder de corte 6kA & clase AC."));
        assert!(dpn.body.contains("Categorías: Protección"));
        assert!(dpn.body.contains("Polos: 2P"));
        assert!(dpn.body.contains("SKU: SCH-A9D31625"));
        assert!(!dpn.body.contains('<'));

        let meta = ItemMetadata::from_value(&dpn.metadata);
        assert_eq!(meta.price, Some(48.90));
        assert_eq!(meta.regular_price, Some(54.0));
        assert_eq!(meta.stock_status, Some(StockStatus::InStock));
        assert_eq!(meta.categories, vec!["Protección"]);
        assert!(meta.on_sale());
    }

    #[test]
    fn numeric_prices_are_kept() {
        let docs = parse_products(EXPORT).unwrap();
        let led = docs.iter().find(|d| d.external_id == "product_13").unwrap();
        assert_eq!(ItemMetadata::from_value(&led.metadata).price, Some(3.5));
        assert_eq!(led.body, "Bombilla LED E27 10W");
    }

    #[test]
    fn strip_html_keeps_paragraphs() {
        assert_eq!(
            strip_html("<p>Uno</p>\n<p>Dos <em>tres</em></p>"),
            "Uno\n\nDos tres"
        );
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn strip_html_decodes_entities() {
        assert_eq!(
            strip_html("<p>Magnetot&eacute;rmico 2&nbsp;polos &ndash; curva&nbsp;C &#243;ptimo</p>"),
            "Magnetotérmico 2 polos – curva C óptimo"
        );
        assert_eq!(
            strip_html("<ul><li>IP65</li><li>Luz c&aacute;lida<br>3000K</li></ul>"),
            "IP65\n\nLuz cálida\n3000K"
        );
    }

    #[test]
    fn product_names_are_decoded() {
        let export = r#"[{
            "id": 5,
            "name": "Magnetot&eacute;rmico 1P+N 16A &#8211; curva C",
            "status": "publish",
            "categories": [{ "name": "Protecci&oacute;n" }]
        }]"#;
        let docs = parse_products(export).unwrap();
        assert_eq!(docs[0].title, "Magnetotérmico 1P+N 16A – curva C");
        assert!(docs[0].body.contains("Categorías: Protección"));
    }

    #[test]
    fn malformed_export_is_an_error() {
        assert!(parse_products("{\"id\": 1}").is_err());
    }
}
