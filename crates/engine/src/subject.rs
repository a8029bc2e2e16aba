//! Subject types and pattern matching
//!
//! Subjects are dot-separated hierarchical names used for routing
//! messages, e.g. "orders.created" or "metrics.cpu". Patterns may use
//! `*` to match exactly one token, or a trailing `>` to match the
//! remainder of the subject.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur with subject validation
#[derive(Debug, Error)]
pub enum SubjectError {
    /// Subject is empty
    #[error("subject cannot be empty")]
    Empty,

    /// Subject contains an empty token (leading, trailing or doubled dot)
    #[error("subject contains an empty token: {0}")]
    EmptyToken(String),

    /// Subject contains wildcards where they're not allowed
    #[error("subject cannot contain wildcards: {0}")]
    ContainsWildcards(String),

    /// Invalid token in subject
    #[error("invalid token in subject: {0}")]
    InvalidToken(String),

    /// Invalid wildcard usage
    #[error("invalid wildcard usage: {0}")]
    InvalidWildcard(String),
}

fn check_tokens(value: &str, allow_wildcards: bool) -> Result<(), SubjectError> {
    if value.is_empty() {
        return Err(SubjectError::Empty);
    }

    let tokens: Vec<&str> = value.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(SubjectError::EmptyToken(value.to_string()));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(SubjectError::InvalidToken(value.to_string()));
        }
        match *token {
            "*" => {
                if !allow_wildcards {
                    return Err(SubjectError::ContainsWildcards(value.to_string()));
                }
            }
            ">" => {
                if !allow_wildcards {
                    return Err(SubjectError::ContainsWildcards(value.to_string()));
                }
                if i != tokens.len() - 1 {
                    return Err(SubjectError::InvalidWildcard(format!(
                        "'>' must be the final token: {value}"
                    )));
                }
            }
            other => {
                if other.contains('*') || other.contains('>') {
                    return Err(SubjectError::InvalidWildcard(value.to_string()));
                }
            }
        }
    }

    Ok(())
}

/// A validated concrete subject (no wildcards)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject(String);

impl Subject {
    /// Create a new subject after validation
    pub fn new(subject: impl Into<String>) -> Result<Self, SubjectError> {
        let subject = subject.into();
        check_tokens(&subject, false)?;
        Ok(Self(subject))
    }

    /// Get the subject as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the dot-separated tokens
    pub fn tokens(&self) -> Vec<&str> {
        self.0.split('.').collect()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A subject pattern (may contain wildcards)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectPattern(String);

impl SubjectPattern {
    /// Create a new subject pattern after validation
    pub fn new(pattern: impl Into<String>) -> Result<Self, SubjectError> {
        let pattern = pattern.into();
        check_tokens(&pattern, true)?;
        Ok(Self(pattern))
    }

    /// Get the pattern as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a concrete subject matches this pattern
    pub fn matches(&self, subject: &Subject) -> bool {
        subject_matches(subject.as_str(), &self.0)
    }

    /// Whether two patterns can both match some subject
    ///
    /// Used to detect overlapping work-queue consumer filters and
    /// overlapping stream subject sets.
    pub fn overlaps(&self, other: &Self) -> bool {
        let a: Vec<&str> = self.0.split('.').collect();
        let b: Vec<&str> = other.0.split('.').collect();

        let mut i = 0;
        loop {
            match (a.get(i), b.get(i)) {
                (Some(&">"), _) | (_, Some(&">")) => return true,
                (Some(&ta), Some(&tb)) => {
                    if ta != tb && ta != "*" && tb != "*" {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
            i += 1;
        }
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SubjectPattern {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Check if a concrete subject matches a pattern
///
/// `*` matches exactly one token, a trailing `>` matches one or more
/// remaining tokens, and any other token must match literally.
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut si = 0;
    let mut pi = 0;

    while si < subject_tokens.len() && pi < pattern_tokens.len() {
        match pattern_tokens[pi] {
            "*" => {
                si += 1;
                pi += 1;
            }
            ">" => {
                // Matches the rest of the subject
                return true;
            }
            token => {
                if subject_tokens[si] != token {
                    return false;
                }
                si += 1;
                pi += 1;
            }
        }
    }

    si == subject_tokens.len() && pi == pattern_tokens.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_validation() {
        assert!(Subject::new("orders.created").is_ok());
        assert!(Subject::new("a").is_ok());
        assert!(Subject::new("").is_err());
        assert!(Subject::new("orders..created").is_err());
        assert!(Subject::new(".orders").is_err());
        assert!(Subject::new("orders.*").is_err());
        assert!(Subject::new("orders.>").is_err());
        assert!(Subject::new("orders. created").is_err());
    }

    #[test]
    fn test_pattern_validation() {
        assert!(SubjectPattern::new("orders.*").is_ok());
        assert!(SubjectPattern::new("orders.>").is_ok());
        assert!(SubjectPattern::new("*.created").is_ok());
        assert!(SubjectPattern::new(">.orders").is_err());
        assert!(SubjectPattern::new("orders.cre*ted").is_err());
        assert!(SubjectPattern::new("").is_err());
    }

    #[test]
    fn test_literal_matching() {
        assert!(subject_matches("orders.created", "orders.created"));
        assert!(!subject_matches("orders.created", "orders.updated"));
        assert!(!subject_matches("orders.created", "orders"));
        assert!(!subject_matches("orders", "orders.created"));
    }

    #[test]
    fn test_single_token_wildcard() {
        assert!(subject_matches("orders.created", "orders.*"));
        assert!(subject_matches("orders.created", "*.created"));
        assert!(!subject_matches("orders.created.v2", "orders.*"));
        assert!(!subject_matches("orders", "orders.*"));
        assert!(subject_matches("a.b.c", "a.*.c"));
    }

    #[test]
    fn test_rest_wildcard() {
        assert!(subject_matches("orders.created", "orders.>"));
        assert!(subject_matches("orders.created.v2", "orders.>"));
        assert!(!subject_matches("orders", "orders.>"));
        assert!(subject_matches("a.b.c.d", ">"));
    }

    #[test]
    fn test_pattern_overlap() {
        let p = |s: &str| SubjectPattern::new(s).unwrap();

        assert!(p("orders.*").overlaps(&p("orders.created")));
        assert!(p("orders.*").overlaps(&p("*.created")));
        assert!(p("orders.>").overlaps(&p("orders.created.v2")));
        assert!(!p("orders.created").overlaps(&p("orders.updated")));
        assert!(!p("orders.*").overlaps(&p("invoices.*")));
        assert!(!p("orders.*").overlaps(&p("orders.*.v2")));
    }
}
