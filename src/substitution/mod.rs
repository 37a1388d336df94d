//! Token substitution over SQL text.
//!
//! Literal expansion of parameters and merge-time renames both rewrite marker
//! tokens inside already-authored SQL. The rewriting sits behind
//! [`TokenSubstituter`] so callers never depend on how string literals are
//! detected.

use std::borrow::Cow;
use std::collections::HashMap;

use regex::{Captures, Regex};

use crate::marker::{MarkerStyle, name_key};

mod scanner;

use scanner::{State, step, token_at};

/// Replaces standalone occurrences of a marker token outside string literals.
pub trait TokenSubstituter: Send + Sync {
    fn substitute<'a>(&self, text: &'a str, token: &str, replacement: &str) -> Cow<'a, str>;
}

/// Regex heuristic: a match counts as outside a literal when an even number of
/// single quotes follows it in the remaining text.
///
/// Doubled (`''`) quotes keep the parity intact, but quotes inside comments or
/// double-quoted identifiers throw the count off. [`LexicalSubstituter`] does
/// not have that weakness; switching the default would change the text that
/// existing callers produce.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuoteParitySubstituter;

impl TokenSubstituter for QuoteParitySubstituter {
    fn substitute<'a>(&self, text: &'a str, token: &str, replacement: &str) -> Cow<'a, str> {
        let pattern = format!(r"(?i){}\b", regex::escape(token));
        let Ok(re) = Regex::new(&pattern) else {
            return Cow::Borrowed(text);
        };
        re.replace_all(text, |caps: &Captures<'_>| match caps.get(0) {
            Some(m) if outside_literal(&text[m.end()..]) => replacement.to_string(),
            Some(m) => m.as_str().to_string(),
            None => String::new(),
        })
    }
}

fn outside_literal(rest: &str) -> bool {
    rest.bytes().filter(|b| *b == b'\'').count() % 2 == 0
}

/// State-machine substitution that skips quoted strings, quoted identifiers and comments.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSubstituter;

impl TokenSubstituter for LexicalSubstituter {
    fn substitute<'a>(&self, text: &'a str, token: &str, replacement: &str) -> Cow<'a, str> {
        let bytes = text.as_bytes();
        let token_bytes = token.as_bytes();
        if token_bytes.is_empty() {
            return Cow::Borrowed(text);
        }

        let mut out: Option<String> = None;
        let mut copied = 0;
        let mut state = State::Normal;
        let mut idx = 0;

        while idx < bytes.len() {
            if matches!(state, State::Normal) && token_at(bytes, idx, token_bytes) {
                let buf = out.get_or_insert_with(|| String::with_capacity(text.len()));
                buf.push_str(&text[copied..idx]);
                buf.push_str(replacement);
                idx += token_bytes.len();
                copied = idx;
                continue;
            }
            idx += step(&mut state, bytes, idx) + 1;
        }

        match out {
            Some(mut buf) => {
                buf.push_str(&text[copied..]);
                Cow::Owned(buf)
            }
            None => Cow::Borrowed(text),
        }
    }
}

/// Rewrite marker tokens in one pass according to `renames` (old name to new name).
///
/// A single pass keeps chained renames (`@p` to `@p1` while `@p1` becomes `@p2`)
/// from cascading into each other.
///
/// Unlike [`QuoteParitySubstituter`], this is a plain token-level regex and is
/// not quote-aware: a marker spelled inside a string literal (`'@p'`) is
/// renamed as well.
#[must_use]
pub fn rename_tokens<'a>(
    text: &'a str,
    style: MarkerStyle,
    renames: &[(String, String)],
) -> Cow<'a, str> {
    if renames.is_empty() {
        return Cow::Borrowed(text);
    }
    let lookup: HashMap<String, &str> = renames
        .iter()
        .map(|(old, new)| (name_key(old), new.as_str()))
        .collect();
    style
        .token_pattern()
        .replace_all(text, |caps: &Captures<'_>| {
            let token = caps.get(0).map_or("", |m| m.as_str());
            lookup
                .get(&name_key(token))
                .map_or_else(|| token.to_string(), |new| (*new).to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_skips_inside_string_literals() {
        let sql = "SELECT '@id' AS label, @id AS id FROM t WHERE x = '@id'";
        let out = QuoteParitySubstituter.substitute(sql, "@id", "42");
        assert_eq!(out, "SELECT '@id' AS label, 42 AS id FROM t WHERE x = '@id'");
    }

    #[test]
    fn parity_requires_word_boundary() {
        let sql = "WHERE a = @id AND b = @id2";
        let out = QuoteParitySubstituter.substitute(sql, "@id", "7");
        assert_eq!(out, "WHERE a = 7 AND b = @id2");
    }

    #[test]
    fn parity_is_case_insensitive_and_handles_doubled_quotes() {
        let sql = "SELECT 'it''s', @ID";
        let out = QuoteParitySubstituter.substitute(sql, "@id", "1");
        assert_eq!(out, "SELECT 'it''s', 1");
    }

    #[test]
    fn parity_is_fooled_by_quotes_in_comments() {
        // Known weakness of the heuristic: the apostrophe in the comment flips parity.
        let sql = "SELECT @id -- don't\nFROM t";
        let out = QuoteParitySubstituter.substitute(sql, "@id", "1");
        assert_eq!(out, sql);
        let lexical = LexicalSubstituter.substitute(sql, "@id", "1");
        assert_eq!(lexical, "SELECT 1 -- don't\nFROM t");
    }

    #[test]
    fn lexical_skips_literals_comments_and_identifiers() {
        let sql = "select '@a', \"@a\", @a /* @a */ -- @a\n, @a, @ab";
        let out = LexicalSubstituter.substitute(sql, "@a", "9");
        assert_eq!(out, "select '@a', \"@a\", 9 /* @a */ -- @a\n, 9, @ab");
    }

    #[test]
    fn lexical_borrows_when_nothing_matches() {
        let out = LexicalSubstituter.substitute("select 1", "@a", "9");
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn rename_is_single_pass() {
        let renames = vec![
            ("@p".to_string(), "@p1".to_string()),
            ("@p1".to_string(), "@p2".to_string()),
        ];
        let out = rename_tokens("a = @p OR b = @P1 OR c = @px", MarkerStyle::At, &renames);
        assert_eq!(out, "a = @p1 OR b = @p2 OR c = @px");
    }

    #[test]
    fn renames_also_apply_inside_literals() {
        let renames = vec![("@p".to_string(), "@p1".to_string())];
        let out = rename_tokens("SELECT '@p', @p, @pp", MarkerStyle::At, &renames);
        assert_eq!(out, "SELECT '@p1', @p1, @pp");
    }
}
