use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ComposerError;

static AT_TOKEN: LazyLock<Regex> = LazyLock::new(|| token_regex('@'));
static COLON_TOKEN: LazyLock<Regex> = LazyLock::new(|| token_regex(':'));
static DOLLAR_TOKEN: LazyLock<Regex> = LazyLock::new(|| token_regex('$'));

fn token_regex(prefix: char) -> Regex {
    let pattern = format!(r"{}[A-Za-z_][A-Za-z0-9_]*", regex::escape(&prefix.to_string()));
    Regex::new(&pattern).unwrap_or_else(|e| panic!("invalid marker token pattern: {e}"))
}

/// How bound parameters are spelled in query text.
///
/// SQLite accepts all three forms natively, so a set written with any of them
/// binds by name without rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MarkerStyle {
    /// `@name` (SQL Server style)
    #[default]
    At,
    /// `:name`
    Colon,
    /// `$name`
    Dollar,
}

impl MarkerStyle {
    #[must_use]
    pub fn prefix(self) -> char {
        match self {
            MarkerStyle::At => '@',
            MarkerStyle::Colon => ':',
            MarkerStyle::Dollar => '$',
        }
    }

    /// Turn a bare or already-prefixed identifier into the canonical marker token.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` if the name is empty or not a valid identifier.
    pub fn canonical(self, name: &str) -> Result<String, ComposerError> {
        let trimmed = name.trim();
        let bare = trimmed.strip_prefix(self.prefix()).unwrap_or(trimmed);
        if !is_identifier(bare) {
            return Err(ComposerError::ParameterError(format!(
                "invalid parameter name {name:?}"
            )));
        }
        let mut out = String::with_capacity(bare.len() + 1);
        out.push(self.prefix());
        out.push_str(bare);
        Ok(out)
    }

    /// Regex matching one whole marker token of this style.
    #[must_use]
    pub fn token_pattern(self) -> &'static Regex {
        match self {
            MarkerStyle::At => &AT_TOKEN,
            MarkerStyle::Colon => &COLON_TOKEN,
            MarkerStyle::Dollar => &DOLLAR_TOKEN,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lower-cased lookup key for case-insensitive name comparison.
pub(crate) fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Split a trailing run of digits off a name: `@p12` becomes `@p`.
pub(crate) fn strip_numeric_suffix(name: &str) -> &str {
    let stripped = name.trim_end_matches(|c: char| c.is_ascii_digit());
    // Never strip down to the bare prefix.
    if stripped.len() <= 1 { name } else { stripped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_prefixes_bare_names() {
        assert_eq!(MarkerStyle::At.canonical("id").unwrap(), "@id");
        assert_eq!(MarkerStyle::At.canonical("@id").unwrap(), "@id");
        assert_eq!(MarkerStyle::Colon.canonical("user_id").unwrap(), ":user_id");
    }

    #[test]
    fn canonical_rejects_empty_and_invalid() {
        assert!(MarkerStyle::At.canonical("").is_err());
        assert!(MarkerStyle::At.canonical("@").is_err());
        assert!(MarkerStyle::At.canonical("1abc").is_err());
        assert!(MarkerStyle::At.canonical("a b").is_err());
    }

    #[test]
    fn token_pattern_matches_whole_tokens() {
        let found: Vec<&str> = MarkerStyle::At
            .token_pattern()
            .find_iter("a=@p and b=@p1 or c=@p_x")
            .map(|m| m.as_str())
            .collect();
        assert_eq!(found, vec!["@p", "@p1", "@p_x"]);
    }

    #[test]
    fn numeric_suffix_is_stripped() {
        assert_eq!(strip_numeric_suffix("@p12"), "@p");
        assert_eq!(strip_numeric_suffix("@p"), "@p");
        assert_eq!(strip_numeric_suffix("@12"), "@12");
    }
}
