//! Spanish-aware text analysis for the lexical surfaces.
//!
//! Both the indexed side (item title and content) and the query side of
//! full-text search go through [`analyze`], so the two always agree on
//! folding, stopwords, and stems. [`fold`] alone backs the accent-insensitive
//! exact-title surface.

/// Lowercase `text` and strip Spanish diacritics.
///
/// Superscript digits fold to plain digits so `mm²` and `mm2` compare equal.
pub fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' | 'Á' | 'À' | 'Â' | 'Ä' | 'Ã' => out.push('a'),
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => out.push('e'),
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => out.push('i'),
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => out.push('o'),
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => out.push('u'),
            'ñ' | 'Ñ' => out.push('n'),
            'ç' | 'Ç' => out.push('c'),
            '¹' => out.push('1'),
            '²' => out.push('2'),
            '³' => out.push('3'),
            _ => out.extend(c.to_lowercase()),
        }
    }
    out
}

/// Split folded text into alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    fold(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

const STOPWORDS: &[&str] = &[
    "a", "al", "algo", "algun", "alguna", "ante", "como", "con", "contra", "cual", "cuando",
    "de", "del", "desde", "donde", "e", "el", "ella", "ellos", "en", "entre", "era", "es", "esa",
    "ese", "eso", "esta", "estas", "este", "esto", "estos", "fue", "ha", "hay", "la", "las", "le",
    "les", "lo", "los", "mas", "me", "mi", "mis", "muy", "ni", "no", "nos", "o", "os", "para",
    "pero", "por", "porque", "que", "se", "sea", "si", "sin", "sobre", "son", "su", "sus", "te",
    "ti", "tu", "tus", "u", "un", "una", "unas", "uno", "unos", "y", "ya", "yo",
];

/// True for Spanish function words excluded from the full-text index.
pub fn is_stopword(folded: &str) -> bool {
    STOPWORDS.binary_search(&folded).is_ok()
}

// Longest first. A suffix is only removed when at least three characters remain.
const DERIVATIONAL: &[&str] = &[
    "amientos", "imientos", "amiento", "imiento", "aciones", "uciones", "idades", "mente",
    "acion", "ucion", "ables", "ibles", "ismos", "istas", "idad", "able", "ible", "ismo",
    "ista", "icos", "icas", "ico", "ica",
];

/// Light Spanish stemmer.
///
/// Removes one derivational suffix, then a plural ending (`-ces` becomes
/// `-z`), then a final gender vowel. Singular and plural forms of the same
/// noun end up on the same stem: `cables`/`cable` → `cabl`,
/// `luces`/`luz` → `luz`. Tokens containing digits are codes and are
/// returned untouched.
pub fn stem(token: &str) -> String {
    if token.chars().count() <= 3 || token.chars().any(|c| c.is_ascii_digit()) {
        return token.to_string();
    }

    let mut word = token.to_string();

    if let Some(suffix) = DERIVATIONAL
        .iter()
        .find(|s| word.ends_with(*s) && word.len() - s.len() >= 3)
    {
        word.truncate(word.len() - suffix.len());
    }

    if word.ends_with("ces") && word.len() >= 5 {
        word.truncate(word.len() - 3);
        word.push('z');
    } else if word.ends_with("es") && word.len() >= 5 {
        word.truncate(word.len() - 2);
    } else if word.ends_with('s') && word.len() >= 4 {
        word.pop();
    }

    if word.len() > 4 && (word.ends_with('a') || word.ends_with('o') || word.ends_with('e')) {
        word.pop();
    }

    word
}

/// Fold, tokenize, drop stopwords, and stem.
pub fn analyze(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .map(|t| stem(&t))
        .collect()
}
