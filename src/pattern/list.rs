//! Ordered pattern lists for include/exclude filtering.

use super::{Pattern, PatternMatchMode, PatternType};
use crate::Result;

/// An ordered list of untagged patterns (excludes, delta sources).
///
/// A name matches the list iff any pattern matches. The empty list matches
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct PatternList {
    patterns: Vec<Pattern>,
}

impl PatternList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and appends a pattern.
    pub fn append(&mut self, text: &str, pattern_type: PatternType) -> Result<()> {
        self.patterns.push(Pattern::compile(text, pattern_type, true)?);
        Ok(())
    }

    /// Number of patterns in the list.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns `true` if the list holds no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns `true` iff any pattern matches `name` under `mode`.
    pub fn matches(&self, name: &str, mode: PatternMatchMode) -> bool {
        self.patterns.iter().any(|p| p.matches(name, mode))
    }

    /// Iterates the compiled patterns in order.
    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }
}

/// The entry kind an include filter selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryFilterKind {
    /// Regular filesystem entries (files, directories, links, specials).
    #[default]
    File,
    /// Block-device images.
    Image,
}

/// One include filter: a pattern tagged with the entry kind it selects.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    /// The kind of entry this filter selects.
    pub kind: EntryFilterKind,
    /// The compiled name pattern.
    pub pattern: Pattern,
}

/// An ordered list of include filters.
///
/// A name matches the list iff the list is empty *or* any filter matches;
/// an empty include list means "everything".
#[derive(Debug, Clone, Default)]
pub struct EntryList {
    entries: Vec<EntryFilter>,
}

impl EntryList {
    /// Creates an empty list (which includes everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and appends an include filter.
    pub fn append(
        &mut self,
        kind: EntryFilterKind,
        text: &str,
        pattern_type: PatternType,
    ) -> Result<()> {
        self.entries.push(EntryFilter {
            kind,
            pattern: Pattern::compile(text, pattern_type, true)?,
        });
        Ok(())
    }

    /// Number of filters in the list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the list holds no filters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` iff the list is empty or any filter matches.
    pub fn matches(&self, name: &str, mode: PatternMatchMode) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|e| e.pattern.matches(name, mode))
    }

    /// Like [`matches`](Self::matches) but only filters of `kind` count.
    pub fn matches_kind(&self, kind: EntryFilterKind, name: &str, mode: PatternMatchMode) -> bool {
        self.entries.is_empty()
            || self
                .entries
                .iter()
                .any(|e| e.kind == kind && e.pattern.matches(name, mode))
    }

    /// Iterates the filters in order.
    pub fn iter(&self) -> impl Iterator<Item = &EntryFilter> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_include_list_matches_everything() {
        let list = EntryList::new();
        assert!(list.matches("anything/at/all", PatternMatchMode::Exact));
    }

    #[test]
    fn empty_exclude_list_matches_nothing() {
        let list = PatternList::new();
        assert!(!list.matches("anything", PatternMatchMode::Any));
    }

    #[test]
    fn include_list_any_filter_wins() {
        let mut list = EntryList::new();
        list.append(EntryFilterKind::File, "*.txt", PatternType::Glob)
            .unwrap();
        list.append(EntryFilterKind::File, "docs/*", PatternType::Glob)
            .unwrap();
        assert!(list.matches("notes.txt", PatternMatchMode::Exact));
        assert!(list.matches("docs/readme", PatternMatchMode::Exact));
        assert!(!list.matches("image.png", PatternMatchMode::Exact));
    }

    #[test]
    fn exclude_list_matches_any() {
        let mut list = PatternList::new();
        list.append("*.tmp", PatternType::Glob).unwrap();
        list.append("cache/*", PatternType::Glob).unwrap();
        assert!(list.matches("a.tmp", PatternMatchMode::Exact));
        assert!(list.matches("cache/blob", PatternMatchMode::Exact));
        assert!(!list.matches("kept.dat", PatternMatchMode::Exact));
        assert_eq!(list.len(), 2);
    }
}
