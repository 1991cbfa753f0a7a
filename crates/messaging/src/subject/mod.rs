mod error;

pub use error::Error;

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Single-level wildcard token.
pub const WILDCARD_ONE: &str = "*";

/// Multi-level (terminal) wildcard token.
pub const WILDCARD_ALL: &str = ">";

const INVALID_CHARACTERS: &[char] = &[',', '?', ' ', '\r', '\n', '\t', '$', '\u{8}'];

/// A dot-delimited subject. Used both as a concrete address and as a
/// subscription pattern when it carries `*` or `>` tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Builds a subject from a prefix and suffix parts. Every part is trimmed
    /// and empty parts are dropped.
    pub fn new<P, I, S>(prefix: P, suffixes: I) -> Self
    where
        P: AsRef<str>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = Vec::new();
        let prefix = prefix.as_ref().trim();
        if !prefix.is_empty() {
            parts.push(prefix.to_string());
        }
        for suffix in suffixes {
            let suffix = suffix.as_ref().trim();
            if !suffix.is_empty() {
                parts.push(suffix.to_string());
            }
        }

        Self(parts.join("."))
    }

    /// Builds a subject from already-split tokens.
    pub fn join<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new("", tokens)
    }

    /// The subject as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dot-separated tokens.
    #[must_use]
    pub fn tokens(&self) -> Vec<&str> {
        if self.0.is_empty() {
            return Vec::new();
        }
        self.0.split('.').collect()
    }

    /// Whether the subject has no tokens.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any token is a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.tokens()
            .iter()
            .any(|token| *token == WILDCARD_ONE || *token == WILDCARD_ALL)
    }

    /// Checks that the subject is usable on the bus.
    ///
    /// # Errors
    /// Returns an error for empty subjects, empty tokens, reserved characters
    /// or a `>` that is not the last token.
    pub fn validate(&self) -> Result<(), Error> {
        if self.0.is_empty() {
            return Err(Error::Empty);
        }
        if self.0.contains(INVALID_CHARACTERS) {
            return Err(Error::InvalidCharacters(self.0.clone()));
        }

        let tokens = self.tokens();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(Error::EmptyToken(self.0.clone()));
            }
            if *token == WILDCARD_ALL && i != last {
                return Err(Error::NonTerminalWildcard(self.0.clone()));
            }
        }

        Ok(())
    }

    /// Matches `other` against `self` used as a pattern.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let pattern = self.tokens();
        let subject = other.tokens();

        for (i, token) in pattern.iter().enumerate() {
            if *token == WILDCARD_ALL {
                return subject.len() > i;
            }
            match subject.get(i) {
                None => return false,
                Some(candidate) if *token != WILDCARD_ONE && token != candidate => return false,
                Some(_) => {}
            }
        }

        pattern.len() == subject.len()
    }

    /// Matches in either direction.
    #[must_use]
    pub fn symmetric_matches(&self, other: &Self) -> bool {
        self.matches(other) || other.matches(self)
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Subject {
    fn from(subject: &str) -> Self {
        Self(subject.to_string())
    }
}

impl From<String> for Subject {
    fn from(subject: String) -> Self {
        Self(subject)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

/// Subjects mapped to integer indices.
#[derive(Clone, Debug, Default)]
pub struct SubjectMap {
    entries: HashMap<Subject, usize>,
}

impl SubjectMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and inserts a subject.
    ///
    /// # Errors
    /// Returns an error if the subject is invalid or already mapped.
    pub fn add(&mut self, subject: Subject, index: usize) -> Result<(), Error> {
        subject.validate()?;
        if self.entries.contains_key(&subject) {
            return Err(Error::Duplicate(subject.into()));
        }
        self.entries.insert(subject, index);
        Ok(())
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, subject: &Subject) -> Option<usize> {
        self.entries.get(subject).copied()
    }

    /// First key that, used as a pattern, matches `subject`.
    #[must_use]
    pub fn search(&self, subject: &Subject) -> Option<(&Subject, usize)> {
        self.entries
            .iter()
            .find(|(key, _)| key.matches(subject))
            .map(|(key, index)| (key, *index))
    }

    /// First key matching `subject` in either direction.
    #[must_use]
    pub fn symmetric_search(&self, subject: &Subject) -> Option<(&Subject, usize)> {
        self.entries
            .iter()
            .find(|(key, _)| key.symmetric_matches(subject))
            .map(|(key, index)| (key, *index))
    }

    /// Number of mapped subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
