//! Pattern module: name patterns used by search opcodes and string conditions.
//!
//! Query text is classified by its lexical shape: `/.../` is a regular expression, text with an
//! unescaped `*` or `?` is a glob, anything else is an exact name.

use crate::SyntaxFlowError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Bit mask selecting what a match primitive compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchMode(u8);

impl MatchMode {
    pub const NAME: MatchMode = MatchMode(1);
    pub const KEY: MatchMode = MatchMode(2);
    pub const BOTH: MatchMode = MatchMode(3);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has_name(self) -> bool {
        self.0 & Self::NAME.0 != 0
    }

    pub fn has_key(self) -> bool {
        self.0 & Self::KEY.0 != 0
    }
}

impl BitOr for MatchMode {
    type Output = MatchMode;

    fn bitor(self, rhs: MatchMode) -> MatchMode {
        MatchMode(self.0 | rhs.0)
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.has_name(), self.has_key()) {
            (true, true) => write!(f, "name|key"),
            (true, false) => write!(f, "name"),
            (false, true) => write!(f, "key"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// A classified search pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NamePattern {
    Exact(String),
    Glob(GlobPattern),
    Regexp(String),
}

impl NamePattern {
    /// Classify raw query text.
    pub fn classify(raw: &str) -> Result<NamePattern, SyntaxFlowError> {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let inner = &raw[1..raw.len() - 1];
            Regex::new(inner)
                .map_err(|e| SyntaxFlowError::Syntax(format!("invalid regexp /{}/: {}", inner, e)))?;
            return Ok(NamePattern::Regexp(inner.to_string()));
        }
        if has_glob_meta(raw) {
            Ok(NamePattern::Glob(GlobPattern::new(raw)))
        } else {
            Ok(NamePattern::Exact(unescape(raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NamePattern::Exact(s) => s,
            NamePattern::Glob(g) => g.as_str(),
            NamePattern::Regexp(s) => s,
        }
    }
}

fn has_glob_meta(raw: &str) -> bool {
    let mut escaped = false;
    for c in raw.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '*' | '?' => return true,
            _ => {}
        }
    }
    false
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum GlobToken {
    Literal(char),
    AnyChar,
    AnySequence,
}

/// A compiled glob: `*` matches any sequence, `?` any single character, `\` escapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobPattern {
    raw: String,
    tokens: Vec<GlobToken>,
}

impl GlobPattern {
    pub fn new(raw: &str) -> Self {
        let mut tokens = Vec::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => tokens.push(GlobToken::Literal(chars.next().unwrap_or('\\'))),
                '*' => {
                    if tokens.last() != Some(&GlobToken::AnySequence) {
                        tokens.push(GlobToken::AnySequence);
                    }
                }
                '?' => tokens.push(GlobToken::AnyChar),
                other => tokens.push(GlobToken::Literal(other)),
            }
        }
        Self { raw: raw.to_string(), tokens }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Case-sensitive match of the whole input.
    pub fn matches(&self, input: &str) -> bool {
        let s: Vec<char> = input.chars().collect();
        let pat = &self.tokens;
        let (mut si, mut pi) = (0usize, 0usize);
        let mut backtrack: Option<(usize, usize)> = None;
        while si < s.len() {
            match pat.get(pi) {
                Some(GlobToken::AnySequence) => {
                    backtrack = Some((pi, si));
                    pi += 1;
                }
                Some(GlobToken::AnyChar) => {
                    si += 1;
                    pi += 1;
                }
                Some(GlobToken::Literal(c)) if *c == s[si] => {
                    si += 1;
                    pi += 1;
                }
                _ => match backtrack {
                    Some((star_pi, star_si)) => {
                        pi = star_pi + 1;
                        si = star_si + 1;
                        backtrack = Some((star_pi, star_si + 1));
                    }
                    None => return false,
                },
            }
        }
        pat[pi..].iter().all(|t| *t == GlobToken::AnySequence)
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Compile a regexp that already passed compile-time validation.
pub(crate) fn compile_regex(pattern: &str) -> Result<Regex, SyntaxFlowError> {
    Regex::new(pattern).map_err(|e| SyntaxFlowError::Critical(format!("regexp /{}/ rejected at run time: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exact_glob_regexp() {
        assert_eq!(NamePattern::classify("aaa").unwrap(), NamePattern::Exact("aaa".into()));
        assert!(matches!(NamePattern::classify("a*").unwrap(), NamePattern::Glob(_)));
        assert!(matches!(NamePattern::classify("ge?").unwrap(), NamePattern::Glob(_)));
        assert_eq!(NamePattern::classify("/^a.c$/").unwrap(), NamePattern::Regexp("^a.c$".into()));
    }

    #[test]
    fn test_classify_escaped_star_is_exact() {
        assert_eq!(NamePattern::classify(r"a\*b").unwrap(), NamePattern::Exact("a*b".into()));
    }

    #[test]
    fn test_classify_invalid_regexp() {
        let err = NamePattern::classify("/a(/").unwrap_err();
        assert!(matches!(err, SyntaxFlowError::Syntax(_)));
    }

    #[test]
    fn test_glob_matching() {
        let g = GlobPattern::new("b*r");
        assert!(g.matches("bar"));
        assert!(g.matches("bxxr"));
        assert!(g.matches("br"));
        assert!(!g.matches("BAR"));
        assert!(!g.matches("bxxz"));

        let g = GlobPattern::new("*");
        assert!(g.matches(""));
        assert!(g.matches("anything"));

        let g = GlobPattern::new("get?ame*");
        assert!(g.matches("getName"));
        assert!(g.matches("getNameOrDefault"));
        assert!(!g.matches("getame"));
    }

    #[test]
    fn test_glob_escape() {
        let g = GlobPattern::new(r"a\*");
        assert!(g.matches("a*"));
        assert!(!g.matches("ab"));
    }

    #[test]
    fn test_match_mode_bits() {
        assert_eq!((MatchMode::NAME | MatchMode::KEY), MatchMode::BOTH);
        assert_eq!(MatchMode::BOTH.bits(), 3);
        assert!(MatchMode::KEY.has_key());
        assert!(!MatchMode::KEY.has_name());
    }
}
