//! Plagiarism Detector - static token-based similarity against peer code
//!
//! Sources are reduced to a token stream that survives renaming and
//! reformatting: comments and whitespace are dropped, identifiers collapse to
//! `ID`, literals to `STR` / `NUM`, while keywords and punctuation stay
//! verbatim. Streams are compared by the Dice coefficient over multisets of
//! k-gram hashes.
//!
//! No code is executed here and no sandbox capacity is consumed; cost is
//! linear in the number of peers times the source size.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use assay_common::config::EngineSettings;
use assay_common::types::{ComparisonFailure, PeerSubmission, PlagiarismMatch, PlagiarismReport};
use tracing::debug;

use crate::registry::CommentStyle;

/// Keywords kept verbatim across the supported languages
const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "case", "catch", "class", "const",
    "continue", "def", "default", "del", "do", "elif", "else", "enum", "except", "extends",
    "false", "False", "finally", "fn", "for", "from", "function", "global", "if", "impl",
    "import", "in", "instanceof", "interface", "lambda", "let", "loop", "match", "mod", "mut",
    "new", "None", "nonlocal", "not", "null", "or", "pass", "private", "protected", "pub",
    "public", "raise", "return", "self", "static", "struct", "super", "switch", "this",
    "throw", "throws", "trait", "true", "True", "try", "typedef", "typeof", "union", "unsafe",
    "use", "var", "void", "where", "while", "with", "yield",
];

/// Longest escape accepted inside a char literal, e.g. `'\u{10FFFF}'`
const MAX_CHAR_LITERAL: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token<'a> {
    Keyword(&'a str),
    Ident,
    Str,
    Num,
    Punct(char),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlagiarismConfig {
    pub threshold: f64,
    pub report_floor: f64,
    pub kgram: usize,
    pub max_source_bytes: usize,
}

impl PlagiarismConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            threshold: settings.plagiarism_threshold,
            report_floor: settings.plagiarism_report_floor,
            kgram: settings.plagiarism_kgram.max(1),
            max_source_bytes: settings.max_source_bytes,
        }
    }
}

impl Default for PlagiarismConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

pub fn tokenize(source: &str, style: CommentStyle) -> Vec<Token<'_>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        if c.is_ascii_whitespace() {
            i += 1;
        } else if style == CommentStyle::Hash && c == b'#' {
            i = skip_line(bytes, i);
        } else if style.has_slash_comments() && c == b'/' && next == Some(b'/') {
            i = skip_line(bytes, i);
        } else if style.has_slash_comments() && c == b'/' && next == Some(b'*') {
            i = match source[i + 2..].find("*/") {
                Some(end) => i + 2 + end + 2,
                None => bytes.len(),
            };
        } else if c == b'"' || c == b'`' || (c == b'\'' && style.single_quote_strings()) {
            i = skip_string(source, i);
            tokens.push(Token::Str);
        } else if c == b'\'' {
            match char_literal_end(source, i) {
                Some(end) => {
                    i = end;
                    tokens.push(Token::Str);
                }
                None => {
                    i += 1;
                    tokens.push(Token::Punct('\''));
                }
            }
        } else if c.is_ascii_digit() {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Token::Num);
        } else if c.is_ascii_alphabetic() || c == b'_' || !c.is_ascii() {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || !bytes[i].is_ascii())
            {
                i += 1;
            }
            let word = &source[start..i];
            if KEYWORDS.contains(&word) {
                tokens.push(Token::Keyword(word));
            } else {
                tokens.push(Token::Ident);
            }
        } else {
            tokens.push(Token::Punct(c as char));
            i += 1;
        }
    }

    tokens
}

fn skip_line(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |offset| from + offset + 1)
}

/// End of the string literal opening at `start`; triple quotes span lines
fn skip_string(source: &str, start: usize) -> usize {
    let bytes = source.as_bytes();
    let quote = bytes[start];

    if bytes.get(start + 1) == Some(&quote) && bytes.get(start + 2) == Some(&quote) {
        let fence = &source[start..start + 3];
        return match source[start + 3..].find(fence) {
            Some(end) => start + 3 + end + 3,
            None => bytes.len(),
        };
    }

    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' if quote != b'`' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// End of a char literal: one character or one escape between quotes
fn char_literal_end(source: &str, start: usize) -> Option<usize> {
    let rest = &source[start + 1..];
    match rest.chars().next()? {
        '\\' => rest
            .bytes()
            .enumerate()
            .skip(2)
            .take(MAX_CHAR_LITERAL)
            .take_while(|&(_, b)| b != b'\n')
            .find(|&(_, b)| b == b'\'')
            .map(|(offset, _)| start + 1 + offset + 1),
        '\'' => None,
        c => {
            let after = start + 1 + c.len_utf8();
            (source.as_bytes().get(after) == Some(&b'\'')).then_some(after + 1)
        }
    }
}

/// Multiset of k-gram hashes; a stream shorter than `k` is a single gram
fn fingerprint(tokens: &[Token<'_>], k: usize) -> HashMap<u64, usize> {
    let mut grams = HashMap::new();
    if tokens.is_empty() {
        return grams;
    }
    let width = k.clamp(1, tokens.len());
    for window in tokens.windows(width) {
        let mut hasher = DefaultHasher::new();
        window.hash(&mut hasher);
        *grams.entry(hasher.finish()).or_insert(0) += 1;
    }
    grams
}

fn dice(a: &HashMap<u64, usize>, b: &HashMap<u64, usize>) -> f64 {
    let total: usize = a.values().sum::<usize>() + b.values().sum::<usize>();
    if total == 0 {
        return 1.0;
    }
    let shared: usize = a
        .iter()
        .filter_map(|(gram, count)| b.get(gram).map(|other| (*count).min(*other)))
        .sum();
    2.0 * shared as f64 / total as f64
}

/// Pre-tokenized side of a comparison
struct Fingerprinted<'a> {
    tokens: Vec<Token<'a>>,
    grams: HashMap<u64, usize>,
}

impl<'a> Fingerprinted<'a> {
    fn new(source: &'a str, style: CommentStyle, k: usize) -> Self {
        let tokens = tokenize(source, style);
        let grams = fingerprint(&tokens, k);
        Self { tokens, grams }
    }

    fn similarity(&self, other: &Fingerprinted<'_>) -> f64 {
        if self.tokens == other.tokens {
            return 1.0;
        }
        dice(&self.grams, &other.grams)
    }
}

/// Similarity in [0, 1] between two sources of the same language
pub fn similarity(a: &str, b: &str, style: CommentStyle, kgram: usize) -> f64 {
    let k = kgram.max(1);
    Fingerprinted::new(a, style, k).similarity(&Fingerprinted::new(b, style, k))
}

pub fn detect(
    candidate: &str,
    peers: &[PeerSubmission],
    style: CommentStyle,
    config: &PlagiarismConfig,
) -> PlagiarismReport {
    let mut report = PlagiarismReport::empty(config.threshold);
    if peers.is_empty() {
        return report;
    }

    let k = config.kgram.max(1);
    let reference = Fingerprinted::new(candidate, style, k);

    for peer in peers {
        if peer.code.len() > config.max_source_bytes {
            report.failures.push(ComparisonFailure {
                peer_id: peer.submission_id.clone(),
                message: format!("peer source exceeds {} bytes", config.max_source_bytes),
            });
            continue;
        }

        let score = reference.similarity(&Fingerprinted::new(&peer.code, style, k));
        debug!(peer_id = %peer.submission_id, similarity = score, "Peer compared");

        report.max_similarity = report.max_similarity.max(score);
        if score >= config.report_floor {
            report.matches.push(PlagiarismMatch {
                peer_id: peer.submission_id.clone(),
                user_id: peer.user_id.clone(),
                similarity: score,
                flagged: score >= config.threshold,
            });
        }
    }

    // Stable: equal scores keep peer order
    report
        .matches
        .sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    report.flagged = report.max_similarity >= config.threshold;
    report
}
