//! Answer normalization and parsing.
//!
//! A parse failure is never an error: callers turn `None` into a re-prompt.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use super::step::Choice;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@.]{2,}$").unwrap());

/// Characters trimmed from both ends of a normalized answer.
const EDGE_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '¡', '¿', ')', '(', '*', '-'];

/// Keywords shorter than this are only matched exactly, never as substrings.
const MIN_SUBSTRING_KEYWORD_LEN: usize = 3;

/// Lower-cases, strips diacritics, collapses whitespace and trims edge
/// punctuation: `"  ¡Cotización! "` becomes `"cotizacion"`.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();

    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| EDGE_PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_owned()
}

/// Collapses internal whitespace and trims.
pub fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Maps an answer onto one of `options`.
///
/// In order: a 1-based index (`"2"`), an exact match on the label or a
/// keyword, then the single option whose label or keyword appears inside the
/// answer. Ambiguous or unknown answers yield `None`.
pub fn parse_choice<'c>(input: &str, options: &'c [Choice]) -> Option<&'c Choice> {
    let answer = normalize(input);
    if answer.is_empty() {
        return None;
    }

    if let Ok(index) = answer.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| options.get(i));
    }

    if let Some(exact) = options
        .iter()
        .find(|option| option.terms().any(|term| term == answer))
    {
        return Some(exact);
    }

    let mut contained = options.iter().filter(|option| {
        option
            .terms()
            .any(|term| term.chars().count() >= MIN_SUBSTRING_KEYWORD_LEN && answer.contains(&term))
    });
    match (contained.next(), contained.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// Accepts free text of at least `min_len` characters after trimming.
pub fn parse_text(input: &str, min_len: usize) -> Option<String> {
    let text = clean(input);
    (text.chars().count() >= min_len.max(1)).then_some(text)
}

/// Keeps only the digits; accepts when at least `min_digits` remain.
/// `"55-1234-5678"` becomes `"5512345678"`.
pub fn parse_phone(input: &str, min_digits: usize) -> Option<String> {
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    (digits.len() >= min_digits).then_some(digits)
}

/// Accepts a `local@domain.tld` shaped address, returned lower-cased.
pub fn parse_email(input: &str) -> Option<String> {
    let email = input.trim().to_lowercase();
    EMAIL_RE.is_match(&email).then_some(email)
}
