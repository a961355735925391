//! Technical term extraction for product queries.
//!
//! Customers type short, decisive codes ("DPN", "C16", "2P", "30mA") wrapped
//! in conversational filler. [`TermExtractor::extract`] pulls those codes out
//! so the ranker can look them up verbatim in item titles.
//!
//! The domain tables (vocabulary, stopwords, synonym clusters) are data, not
//! code: see [`Vocabulary`] and `data/vocabulary.toml`. Only the code-shape
//! patterns are fixed here.
//!
//! # Algorithm
//!
//! All steps contribute, in this order:
//!
//! 1. Words found in the vocabulary (case and accent insensitive), kept as typed.
//! 2. Code-shaped matches over the original-case query (acronyms, hyphenated
//!    codes, magnitudes, milliamp ratings, wire sections, socket codes,
//!    breaker curves, pole counts).
//! 3. Any standalone all-uppercase word of two or more characters.
//! 4. Synonyms of the terms found so far, when the synonym is itself a
//!    vocabulary term or a pole-count code.
//!
//! Stopwords are dropped at every step and duplicates are removed
//! case-insensitively, keeping the first spelling seen.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::analyze::fold;

const BUILTIN_VOCABULARY: &str = include_str!("../data/vocabulary.toml");

#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("failed to parse vocabulary: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid vocabulary: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    version: String,
    #[serde(default)]
    terms: Vec<String>,
    #[serde(default)]
    stopwords: Vec<String>,
    #[serde(default)]
    synonyms: Vec<SynonymCluster>,
}

#[derive(Debug, Deserialize)]
struct SynonymCluster {
    terms: Vec<String>,
}

/// Versioned term tables driving the extractor.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    version: String,
    terms: HashSet<String>,
    stopwords: HashSet<String>,
    synonyms: Vec<Vec<String>>,
}

impl Vocabulary {
    /// Parse a vocabulary document.
    ///
    /// Rejects an empty version, synonym clusters with fewer than two
    /// members, and words listed both as a term and as a stopword.
    pub fn from_toml_str(source: &str) -> Result<Self, VocabularyError> {
        let file: VocabularyFile = toml::from_str(source)?;

        if file.version.trim().is_empty() {
            return Err(VocabularyError::Invalid("version must not be empty".into()));
        }

        let terms: HashSet<String> = file.terms.iter().map(|t| fold(t.trim())).collect();
        let stopwords: HashSet<String> = file.stopwords.iter().map(|t| fold(t.trim())).collect();

        if let Some(clash) = terms.intersection(&stopwords).next() {
            return Err(VocabularyError::Invalid(format!(
                "{:?} is listed as both a term and a stopword",
                clash
            )));
        }

        let mut synonyms = Vec::with_capacity(file.synonyms.len());
        for cluster in file.synonyms {
            let members: Vec<String> = cluster
                .terms
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if members.len() < 2 {
                return Err(VocabularyError::Invalid(format!(
                    "synonym cluster {:?} needs at least two members",
                    members
                )));
            }
            synonyms.push(members);
        }

        Ok(Self {
            version: file.version.trim().to_string(),
            terms,
            stopwords,
            synonyms,
        })
    }

    /// The vocabulary shipped with the crate.
    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN_VOCABULARY).expect("bundled vocabulary.toml is valid")
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// True when `word` is a known domain term.
    pub fn contains_term(&self, word: &str) -> bool {
        self.terms.contains(&fold(word))
    }

    pub fn is_stopword(&self, word: &str) -> bool {
        self.stopwords.contains(&fold(word))
    }

    /// Members of every cluster containing `term`, `term` itself included.
    fn synonyms_of<'a>(&'a self, term: &str) -> impl Iterator<Item = &'a str> + 'a {
        let key = fold(term);
        self.synonyms
            .iter()
            .filter(move |cluster| cluster.iter().any(|m| fold(m) == key))
            .flat_map(|cluster| cluster.iter().map(String::as_str))
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::builtin()
    }
}

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+(?:[.\-][\p{L}\p{N}]+)*").expect("valid pattern"));

static PLAIN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid pattern"));

static POLE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+P$").expect("valid pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeShape {
    Acronym,
    HyphenCode,
    Magnitude,
    Milliamps,
    WireSection,
    SocketCode,
    CurveCode,
    PoleCount,
    PoleWords,
}

static CODE_PATTERNS: LazyLock<Vec<(CodeShape, Regex)>> = LazyLock::new(|| {
    [
        (CodeShape::Acronym, r"\b[A-Z]{2,}\d*\b"),
        (CodeShape::HyphenCode, r"\b[\p{L}\p{N}]+(?:-[\p{L}\p{N}]+)+\b"),
        (CodeShape::Magnitude, r"\b\d+(?:[.,]\d+)?k?[WVA]\b"),
        (CodeShape::Milliamps, r"\b\d+mA\b"),
        (CodeShape::WireSection, r"\b\d+(?:[.,]\d+)?\s?mm(?:²|2\b)"),
        (CodeShape::SocketCode, r"\b[A-Z]\d{1,3}\b"),
        (CodeShape::CurveCode, r"\b[Cc]\d{1,3}\b"),
        (CodeShape::PoleCount, r"\b\d+P\b"),
        (CodeShape::PoleWords, r"(?i)\b\d+\s+polos\b"),
    ]
    .into_iter()
    .map(|(shape, pattern)| (shape, Regex::new(pattern).expect("valid pattern")))
    .collect()
});

impl CodeShape {
    fn accepts(self, matched: &str) -> bool {
        match self {
            // Plain hyphenated words ("auto-ajustable") are not codes.
            CodeShape::HyphenCode => matched
                .chars()
                .any(|c| c.is_ascii_digit() || c.is_uppercase()),
            _ => true,
        }
    }
}

/// Pulls technical terms out of free-text queries. Pure and total.
#[derive(Debug, Clone, Default)]
pub struct TermExtractor {
    vocabulary: Vocabulary,
}

impl TermExtractor {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Extract the ordered, deduplicated technical terms of `query`.
    pub fn extract(&self, query: &str) -> Vec<String> {
        let mut found = TermSet::new(&self.vocabulary);

        for m in WORD_RE.find_iter(query) {
            let word = m.as_str();
            if self.vocabulary.contains_term(word) {
                found.push(word);
            } else if word.contains(['-', '.']) {
                for part in word.split(['-', '.']) {
                    if self.vocabulary.contains_term(part) {
                        found.push(part);
                    }
                }
            }
        }

        for (shape, re) in CODE_PATTERNS.iter() {
            for m in re.find_iter(query) {
                let code = m.as_str().trim();
                if shape.accepts(code) {
                    found.push(code);
                }
            }
        }

        for m in PLAIN_WORD_RE.find_iter(query) {
            if looks_like_code(m.as_str()) {
                found.push(m.as_str());
            }
        }

        let primary = found.terms.clone();
        for term in &primary {
            for synonym in self.vocabulary.synonyms_of(term) {
                if self.vocabulary.contains_term(synonym) || POLE_CODE_RE.is_match(synonym) {
                    found.push(synonym);
                }
            }
        }

        found.terms
    }
}

/// All-caps words of at least two characters that are not purely numeric.
fn looks_like_code(word: &str) -> bool {
    word.chars().count() >= 2
        && word.chars().any(char::is_alphabetic)
        && !word.chars().any(char::is_lowercase)
}

struct TermSet<'v> {
    vocabulary: &'v Vocabulary,
    seen: HashSet<String>,
    terms: Vec<String>,
}

impl<'v> TermSet<'v> {
    fn new(vocabulary: &'v Vocabulary) -> Self {
        Self {
            vocabulary,
            seen: HashSet::new(),
            terms: Vec::new(),
        }
    }

    fn push(&mut self, term: &str) {
        let term = term.trim();
        if term.is_empty() || self.vocabulary.is_stopword(term) {
            return;
        }
        if self.seen.insert(fold(term)) {
            self.terms.push(term.to_string());
        }
    }
}
