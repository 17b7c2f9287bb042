//! Ordered pattern sets for expect calls.

use regex::{Regex, RegexBuilder};

/// Ordered list of regex sources an expect call waits for.
///
/// Index 0 is conventionally the success outcome. When several patterns
/// match the same output, the lowest index wins. An empty set waits for
/// end-of-stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet {
    patterns: Vec<String>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set with one pattern.
    pub fn single(pattern: impl Into<String>) -> Self {
        Self {
            patterns: vec![pattern.into()],
        }
    }

    /// Append a pattern; its index is the previous length.
    pub fn push(&mut self, pattern: impl Into<String>) -> usize {
        self.patterns.push(pattern.into());
        self.patterns.len() - 1
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, pattern: impl Into<String>) -> Self {
        self.push(pattern);
        self
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.patterns.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.patterns.clone()
    }

    /// Compile every pattern with `prefix` prepended.
    pub fn compile(&self, prefix: &str) -> Result<CompiledMatchSet, regex::Error> {
        let regexes = self
            .patterns
            .iter()
            .map(|p| compile_pattern(&format!("{prefix}{p}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledMatchSet { regexes })
    }
}

impl<S: Into<String>> FromIterator<S> for MatchSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            patterns: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&str> for MatchSet {
    fn from(pattern: &str) -> Self {
        Self::single(pattern)
    }
}

impl From<String> for MatchSet {
    fn from(pattern: String) -> Self {
        Self::single(pattern)
    }
}

impl<S: Into<String>> From<Vec<S>> for MatchSet {
    fn from(patterns: Vec<S>) -> Self {
        patterns.into_iter().collect()
    }
}

impl<S: Into<String> + Clone> From<&[S]> for MatchSet {
    fn from(patterns: &[S]) -> Self {
        patterns.iter().cloned().collect()
    }
}

/// A [`MatchSet`] ready for searching.
#[derive(Debug, Clone)]
pub struct CompiledMatchSet {
    regexes: Vec<Regex>,
}

impl CompiledMatchSet {
    /// Lowest index whose pattern occurs anywhere in `text`.
    pub fn first_match(&self, text: &str) -> Option<usize> {
        self.regexes.iter().position(|re| re.is_match(text))
    }
}

/// Compile a pattern the way expect matches it: `.` also matches newlines,
/// and `^`/`$` refer to the whole buffer rather than individual lines.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).dot_matches_new_line(true).build()
}
