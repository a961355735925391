use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn voltline_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_voltline"))
}

const PRODUCTS: &str = r#"[
    {
        "id": 812,
        "name": "Diferencial DPN 2P 25A 30mA",
        "status": "publish",
        "sku": "SCH-A9D31625",
        "short_description": "<p>Interruptor diferencial para vivienda.</p>",
        "price": "48.90",
        "regular_price": "54.00",
        "sale_price": "48.90",
        "stock_status": "instock",
        "categories": [{ "name": "Protección" }]
    },
    {
        "id": 813,
        "name": "Magnetotérmico 2P 16A curva C",
        "status": "publish",
        "short_description": "<p>Protección contra sobrecargas y cortocircuitos.</p>",
        "price": "12.40"
    },
    {
        "id": 900,
        "name": "Foco LED borrador",
        "status": "draft"
    }
]"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(root.join("data/products.json"), PRODUCTS).unwrap();

    let knowledge = root.join("knowledge");
    fs::create_dir_all(knowledge.join("faq")).unwrap();
    fs::create_dir_all(knowledge.join("politicas")).unwrap();
    fs::write(
        knowledge.join("faq/pagos.md"),
        "# Formas de pago\n\nAceptamos tarjeta, transferencia y Bizum.",
    )
    .unwrap();
    fs::write(
        knowledge.join("politicas/envios.md"),
        "---\ntitle: Plazos de envío\nid: doc_envios\n---\nEnviamos a toda la península en 48 horas laborables.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/voltline.sqlite"

[sources.products]
path = "{root}/data/products.json"

[sources.documents]
root = "{root}/knowledge"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("voltline.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_voltline(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = voltline_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run voltline binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn ingested_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, ok) = run_voltline(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (stdout, stderr, ok) = run_voltline(&config_path, &["ingest", "all"]);
    assert!(ok, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_voltline(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_voltline(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_lists_configured_sources() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_voltline(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("products"));
    assert!(stdout.contains("documents"));
}

#[test]
fn test_ingest_products_and_documents() {
    let (_tmp, config_path) = setup_test_env();
    run_voltline(&config_path, &["init"]);

    let (stdout, stderr, success) = run_voltline(&config_path, &["ingest", "products"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("fetched: 2 documents"));
    assert!(stdout.contains("items created: 2"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_voltline(&config_path, &["ingest", "documents"]);
    assert!(success);
    assert!(stdout.contains("items created: 2"));
}

#[test]
fn test_ingest_twice_changes_nothing() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_voltline(&config_path, &["ingest", "all"]);
    assert!(success);
    assert!(stdout.contains("items created: 0"));
    assert!(stdout.contains("items updated: 0"));
    assert!(stdout.contains("items retired: 0"));
}

#[test]
fn test_removed_document_is_retired() {
    let (tmp, config_path) = ingested_env();
    fs::remove_file(tmp.path().join("knowledge/faq/pagos.md")).unwrap();

    let (stdout, _, success) = run_voltline(&config_path, &["ingest", "documents"]);
    assert!(success);
    assert!(stdout.contains("items retired: 1"));

    let (_, stderr, success) = run_voltline(&config_path, &["get", "doc_faq_pagos"]);
    assert!(!success);
    assert!(stderr.contains("item not found"));
}

#[test]
fn test_ingest_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();
    run_voltline(&config_path, &["init"]);

    let (stdout, _, success) = run_voltline(&config_path, &["ingest", "documents", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("documents found: 2"));

    let (stdout, _, _) = run_voltline(&config_path, &["stats"]);
    assert!(stdout.contains("Items:       0"));
}

#[test]
fn test_search_exact_title_first() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, stderr, success) =
        run_voltline(&config_path, &["search", "necesito un diferencial DPN"]);
    assert!(success, "search failed: {}", stderr);
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.starts_with("1. [exact:"), "got: {}", stdout);
    assert!(first.contains("Diferencial DPN 2P 25A 30mA"));
    assert!(stdout.contains("price: 48.90 (oferta)"));
}

#[test]
fn test_search_is_deterministic() {
    let (_tmp, config_path) = ingested_env();

    let (stdout1, _, _) = run_voltline(&config_path, &["search", "protección 2P"]);
    let (stdout2, _, _) = run_voltline(&config_path, &["search", "protección 2P"]);
    assert_eq!(stdout1, stdout2);
}

#[test]
fn test_text_search_with_type_filter() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_voltline(
        &config_path,
        &["search", "península", "--mode", "text", "--type", "policy"],
    );
    assert!(success);
    assert!(stdout.contains("Plazos de envío"));

    let (stdout, _, success) = run_voltline(
        &config_path,
        &["search", "península", "--mode", "text", "--type", "product"],
    );
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_rejects_bad_input() {
    let (_tmp, config_path) = ingested_env();

    let (_, stderr, success) = run_voltline(&config_path, &["search", ""]);
    assert!(!success, "empty query should be rejected");
    assert!(stderr.contains("malformed query"));

    let (_, _, success) = run_voltline(&config_path, &["search", "x", "--mode", "fuzzy"]);
    assert!(!success);

    let (_, stderr, success) = run_voltline(&config_path, &["search", "x", "--mode", "vector"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_get_and_stats() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_voltline(&config_path, &["get", "product_812"]);
    assert!(success);
    assert!(stdout.contains("Diferencial DPN 2P 25A 30mA"));
    assert!(stdout.contains("content_type: product"));

    let (stdout, _, success) = run_voltline(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Active:      4"));
    assert!(stdout.contains("product"));
}

#[test]
fn test_terms_command() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_voltline(&config_path, &["terms", "quiero un diferencial DPN"]);
    assert!(success);
    assert!(stdout.contains("1. diferencial"));
    assert!(stdout.contains("2. DPN"));
}

#[test]
fn test_purge_after_retirement() {
    let (tmp, config_path) = ingested_env();
    fs::write(tmp.path().join("data/products.json"), "[]").unwrap();

    let (stdout, _, _) = run_voltline(&config_path, &["ingest", "products"]);
    assert!(stdout.contains("items retired: 2"));

    let (stdout, _, success) = run_voltline(&config_path, &["purge"]);
    assert!(success);
    assert!(stdout.contains("items removed: 2"));

    let (stdout, _, _) = run_voltline(&config_path, &["stats"]);
    assert!(stdout.contains("Items:       2"));
}
