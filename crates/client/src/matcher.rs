//! Pattern matching over accumulated output.
//!
//! A read accumulates output into a window and, after every new chunk,
//! asks [`Patterns::find`] whether any pattern matches the window under a
//! [`MatchMode`]. When several patterns match, the lowest index wins.
//! Empty patterns keep their index but never match.

use regex::Regex;

use crate::error::{ExpectError, Result};

/// Which part of the window a pattern is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Any complete (newline-terminated) line.
    AnyLine,
    /// The last non-empty line, complete or not.
    LastLine,
    /// The final whitespace-delimited token of the last non-empty line.
    LastWord,
    /// Anywhere in the window.
    #[default]
    FreeText,
}

/// An ordered list of compiled regular expressions.
#[derive(Debug, Clone)]
pub struct Patterns {
    sources: Vec<String>,
    compiled: Vec<Option<Regex>>,
}

impl Patterns {
    /// Compile patterns in order.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sources = Vec::new();
        let mut compiled = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = if pattern.is_empty() {
                None
            } else {
                Some(Regex::new(pattern).map_err(|e| ExpectError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?)
            };
            sources.push(pattern.to_string());
            compiled.push(regex);
        }
        Ok(Self { sources, compiled })
    }

    /// Patterns matching the given strings literally.
    pub fn literal<I, S>(strings: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(strings.into_iter().map(|s| regex::escape(s.as_ref())))
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Index of the first pattern matching `text` under `mode`.
    pub fn find(&self, text: &str, mode: MatchMode) -> Option<usize> {
        match mode {
            MatchMode::FreeText => self.first_match(text),
            MatchMode::LastLine => self.first_match(last_nonempty_line(text)?),
            MatchMode::LastWord => self.first_match(last_word(text)?),
            MatchMode::AnyLine => {
                let lines: Vec<&str> = complete_lines(text).collect();
                self.regexes()
                    .find(|(_, re)| lines.iter().any(|line| re.is_match(line)))
                    .map(|(index, _)| index)
            }
        }
    }

    fn first_match(&self, text: &str) -> Option<usize> {
        self.regexes()
            .find(|(_, re)| re.is_match(text))
            .map(|(index, _)| index)
    }

    fn regexes(&self) -> impl Iterator<Item = (usize, &Regex)> {
        self.compiled
            .iter()
            .enumerate()
            .filter_map(|(index, re)| re.as_ref().map(|re| (index, re)))
    }
}

/// Lines terminated by a newline, without the terminator.
pub fn complete_lines(text: &str) -> impl Iterator<Item = &str> {
    let end = text.rfind('\n').map_or(0, |i| i + 1);
    text[..end].lines()
}

/// The last line holding anything but whitespace.
pub fn last_nonempty_line(text: &str) -> Option<&str> {
    text.lines().rev().find(|line| !line.trim().is_empty())
}

/// The final whitespace-delimited token of the last non-empty line.
pub fn last_word(text: &str) -> Option<&str> {
    last_nonempty_line(text)?.split_whitespace().next_back()
}
