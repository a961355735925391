//! Paragraph-aware text chunker and chunk identifiers.
//!
//! Long knowledge documents are split into several corpus items that share
//! the document title and a base external id. Each chunk is embedded and
//! searched on its own.
//!
//! # Algorithm
//!
//! 1. Text that fits in `target_chars` is returned as a single chunk.
//! 2. Otherwise split on `\n\n` paragraph boundaries.
//! 3. A paragraph longer than `target_chars` is split into sentences.
//! 4. A sentence longer than `target_chars` is hard-split at the last
//!    whitespace inside the window (or at the window edge when there is none).
//! 5. The pieces are packed greedily into chunks of at most `target_chars`.
//!
//! Sizes are measured in characters, not bytes. At least one chunk is always
//! returned, even for empty text.
//!
//! # Example
//!
//! ```rust
//! use voltline_core::chunk::{chunk_text, chunk_external_id};
//!
//! let chunks = chunk_text("Envíos.\n\nDevoluciones.", 1500);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunk_external_id("doc_faq", 0, 1), "doc_faq");
//! assert_eq!(chunk_external_id("doc_faq", 1, 2), "doc_faq_chunk_1");
//! ```

use sha2::{Digest, Sha256};

/// Default chunk size in characters.
pub const DEFAULT_TARGET_CHARS: usize = 1500;

const CHUNK_MARKER: &str = "_chunk_";

/// Split `text` into chunks of at most `target_chars` characters.
pub fn chunk_text(text: &str, target_chars: usize) -> Vec<String> {
    let target = target_chars.max(1);
    let text = text.trim();

    if char_len(text) <= target {
        return vec![text.to_string()];
    }

    let mut pieces: Vec<(&str, &'static str)> = Vec::new();
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(para) <= target {
            pieces.push((para, "\n\n"));
            continue;
        }
        let mut joiner = "\n\n";
        for sentence in split_sentences(para) {
            if char_len(sentence) <= target {
                pieces.push((sentence, joiner));
            } else {
                for part in hard_split(sentence, target) {
                    pieces.push((part, joiner));
                    joiner = " ";
                }
            }
            joiner = " ";
        }
    }

    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_len = 0usize;

    for (piece, joiner) in pieces {
        let piece_len = char_len(piece);
        if buf.is_empty() {
            buf.push_str(piece);
            buf_len = piece_len;
        } else if buf_len + char_len(joiner) + piece_len <= target {
            buf.push_str(joiner);
            buf.push_str(piece);
            buf_len += char_len(joiner) + piece_len;
        } else {
            chunks.push(std::mem::take(&mut buf));
            buf.push_str(piece);
            buf_len = piece_len;
        }
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }

    chunks
}

/// External id of chunk `index` out of `total`.
///
/// Single-chunk documents keep the bare base id.
pub fn chunk_external_id(base: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        base.to_string()
    } else {
        format!("{}{}{}", base, CHUNK_MARKER, index)
    }
}

/// Strip a `_chunk_<n>` suffix, returning the document's base id.
pub fn base_external_id(external_id: &str) -> &str {
    match external_id.rfind(CHUNK_MARKER) {
        Some(pos) => {
            let suffix = &external_id[pos + CHUNK_MARKER.len()..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                &external_id[..pos]
            } else {
                external_id
            }
        }
        None => external_id,
    }
}

/// True when `external_id` is `base` itself or one of its chunks.
pub fn belongs_to_document(external_id: &str, base: &str) -> bool {
    base_external_id(external_id) == base
}

/// SHA-256 over the given parts, separated so that `("ab", "c")` and
/// `("a", "bc")` hash differently.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split after `.`, `!`, `?` or `…` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | '…') {
            if let Some(&(next_i, next_c)) = chars.peek() {
                if next_c.is_whitespace() {
                    let sentence = text[start..next_i].trim();
                    if !sentence.is_empty() {
                        out.push(sentence);
                    }
                    start = next_i;
                }
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn hard_split(text: &str, target: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text.trim();
    while !remaining.is_empty() {
        if char_len(remaining) <= target {
            out.push(remaining);
            break;
        }
        let window_end = remaining
            .char_indices()
            .nth(target)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let cut = remaining[..window_end]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(window_end);
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = remaining[cut..].trim_start();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("Horario de atención: 9 a 14h.", 1500);
        assert_eq!(chunks, vec!["Horario de atención: 9 a 14h."]);
    }

    #[test]
    fn empty_text_still_yields_one_chunk() {
        assert_eq!(chunk_text("", 1500), vec![String::new()]);
        assert_eq!(chunk_text("  \n\n ", 1500), vec![String::new()]);
    }

    #[test]
    fn paragraphs_are_packed_up_to_target() {
        let text = "Primer párrafo.\n\nSegundo párrafo.\n\nTercer párrafo.";
        let chunks = chunk_text(text, 35);
        assert_eq!(
            chunks,
            vec!["Primer párrafo.\n\nSegundo párrafo.", "Tercer párrafo."]
        );
    }

    #[test]
    fn long_paragraph_falls_back_to_sentences() {
        let para = "Los pedidos salen en 24 horas. El envío es gratuito desde 60 euros. \
                    Las devoluciones se aceptan durante 30 días.";
        let chunks = chunk_text(para, 70);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with("60 euros."));
        assert!(chunks[1].starts_with("Las devoluciones"));
        for c in &chunks {
            assert!(c.chars().count() <= 70, "chunk too long: {:?}", c);
        }
    }

    #[test]
    fn oversized_sentence_is_hard_split_on_whitespace() {
        let sentence = "palabra ".repeat(40);
        let chunks = chunk_text(&sentence, 50);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 50);
            assert!(!c.starts_with(' ') && !c.ends_with(' '));
            assert!(c.split(' ').all(|w| w == "palabra"));
        }
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_char() {
        let text = "ñ".repeat(120);
        let chunks = chunk_text(&text, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = (0..40)
            .map(|i| format!("Párrafo número {} con algo de texto.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        assert_eq!(chunk_text(&text, 200), chunk_text(&text, 200));
    }

    #[test]
    fn chunk_ids_round_trip_to_base() {
        assert_eq!(chunk_external_id("doc_faq", 0, 1), "doc_faq");
        assert_eq!(chunk_external_id("doc_faq", 1, 3), "doc_faq_chunk_1");
        assert_eq!(base_external_id("doc_faq_chunk_12"), "doc_faq");
        assert_eq!(base_external_id("doc_faq"), "doc_faq");
        assert_eq!(base_external_id("doc_faq_chunk_x"), "doc_faq_chunk_x");
        assert!(belongs_to_document("doc_faq_chunk_0", "doc_faq"));
        assert!(belongs_to_document("doc_faq", "doc_faq"));
        assert!(!belongs_to_document("doc_faq_extra_chunk_0", "doc_faq"));
    }

    #[test]
    fn content_hash_separates_parts() {
        assert_ne!(content_hash(&["ab", "c"]), content_hash(&["a", "bc"]));
        assert_eq!(content_hash(&["x", "y"]), content_hash(&["x", "y"]));
        assert_eq!(content_hash(&["x"]).len(), 64);
    }
}
