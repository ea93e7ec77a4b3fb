//! Entry name patterns.
//!
//! Patterns select archive entries by name. A pattern is written as a glob
//! (`*`, `?`) or as a regular expression and is compiled once into four
//! anchored regex variants, one per [`PatternMatchMode`]. Compiled patterns
//! are immutable and safe to share across worker threads.

mod list;

pub use list::{EntryFilter, EntryFilterKind, EntryList, PatternList};

use regex::{Regex, RegexBuilder};

use crate::{Error, Result};

/// How a pattern text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternType {
    /// `*` and `?` wildcards; everything else is literal.
    #[default]
    Glob,
    /// Regular expression.
    Regex,
    /// Extended regular expression.
    ExtendedRegex,
}

impl PatternType {
    /// Parses a pattern type name (`glob`, `regex`, `extended_regex`).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "glob" => Some(Self::Glob),
            "regex" => Some(Self::Regex),
            "extended_regex" => Some(Self::ExtendedRegex),
            _ => None,
        }
    }
}

/// Where a pattern must match within the candidate name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMatchMode {
    /// Anchored at the start of the name.
    Begin,
    /// Anchored at the end of the name.
    End,
    /// Anchored at both ends.
    Exact,
    /// Anywhere within the name.
    Any,
}

/// A compiled entry-name pattern.
///
/// Four regex variants are pre-built at compile time so matching never
/// re-parses the pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    text: String,
    pattern_type: PatternType,
    regex_begin: Regex,
    regex_end: Regex,
    regex_exact: Regex,
    regex_any: Regex,
}

impl Pattern {
    /// Compiles a pattern. Matching is case-insensitive by default; pass
    /// `ignore_case = false` for case-sensitive matching.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] carrying the regex library's
    /// diagnostic when the pattern does not compile.
    pub fn compile(text: &str, pattern_type: PatternType, ignore_case: bool) -> Result<Self> {
        let body = match pattern_type {
            PatternType::Glob => glob_to_regex(text),
            PatternType::Regex | PatternType::ExtendedRegex => text.to_string(),
        };

        let build = |variant: String| -> Result<Regex> {
            RegexBuilder::new(&variant)
                .case_insensitive(ignore_case)
                .build()
                .map_err(|e| Error::InvalidPattern {
                    pattern: text.to_string(),
                    reason: e.to_string(),
                })
        };

        Ok(Self {
            text: text.to_string(),
            pattern_type,
            regex_begin: build(format!("^(?:{body})"))?,
            regex_end: build(format!("(?:{body})$"))?,
            regex_exact: build(format!("^(?:{body})$"))?,
            regex_any: build(body)?,
        })
    }

    /// The original pattern text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The type the pattern was compiled as.
    pub fn pattern_type(&self) -> PatternType {
        self.pattern_type
    }

    /// Matches `name` against the variant selected by `mode`.
    pub fn matches(&self, name: &str, mode: PatternMatchMode) -> bool {
        match mode {
            PatternMatchMode::Begin => self.regex_begin.is_match(name),
            PatternMatchMode::End => self.regex_end.is_match(name),
            PatternMatchMode::Exact => self.regex_exact.is_match(name),
            PatternMatchMode::Any => self.regex_any.is_match(name),
        }
    }
}

/// Translates a glob into a regex body.
///
/// `*` becomes `.*`, `?` becomes `.`; `.` and `\` and the regex
/// metacharacters `[]^$(){}+|` are escaped.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' => out.push_str("\\."),
            '\\' => out.push_str("\\\\"),
            '[' | ']' | '^' | '$' | '(' | ')' | '{' | '}' | '+' | '|' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
