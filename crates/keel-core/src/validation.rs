//! Shared validation utilities for identifiers across the codebase
//!
//! This module provides consistent validation logic for string-based identifiers
//! like tool names, handle ids, memory namespaces and keys.

use thiserror::Error;

/// Validation rules for string identifiers
#[derive(Debug, Clone, Copy)]
pub struct IdentifierRules {
    /// Maximum allowed length in characters
    pub max_length: usize,
    /// Whether to allow dots (.) in the identifier
    pub allow_dots: bool,
    /// Whether to allow colons (:) in the identifier
    pub allow_colons: bool,
    /// Whether to allow forward slashes (/) in the identifier
    pub allow_slashes: bool,
    /// Whether to check for path traversal sequences (../ and ./)
    pub check_path_traversal: bool,
}

impl IdentifierRules {
    /// Rules for tool names: `[A-Za-z0-9_-]`, at most 64 characters.
    pub const TOOL_NAME: Self = Self {
        max_length: 64,
        allow_dots: false,
        allow_colons: false,
        allow_slashes: false,
        check_path_traversal: true,
    };

    /// Rules for handle and request identifiers.
    ///
    /// Dots are allowed so ids like `weather.v2` stay readable.
    pub const IDENTIFIER: Self = Self {
        max_length: 128,
        allow_dots: true,
        allow_colons: false,
        allow_slashes: false,
        check_path_traversal: true,
    };

    /// Rules for memory namespaces.
    pub const NAMESPACE: Self = Self {
        max_length: 64,
        allow_dots: true,
        allow_colons: false,
        allow_slashes: false,
        check_path_traversal: true,
    };

    /// Rules for memory keys.
    ///
    /// Colons, dots and slashes enable hierarchical keys such as
    /// `session:42/summary`, which is what prefix scans are built around.
    pub const MEMORY_KEY: Self = Self {
        max_length: 256,
        allow_dots: true,
        allow_colons: true,
        allow_slashes: true,
        check_path_traversal: true,
    };

    /// Validate a string against these rules, returning the owned value.
    pub fn validate(&self, input: &str) -> Result<String, ValidationError> {
        if input.is_empty() {
            return Err(ValidationError::Empty);
        }

        if input.trim().is_empty() {
            return Err(ValidationError::WhitespaceOnly);
        }

        if input != input.trim() {
            return Err(ValidationError::LeadingTrailingWhitespace);
        }

        if input.len() > self.max_length {
            return Err(ValidationError::TooLong {
                length: input.len(),
                max: self.max_length,
            });
        }

        if self.check_path_traversal && (input.contains("../") || input.starts_with("./")) {
            return Err(ValidationError::PathTraversal);
        }

        for ch in input.chars() {
            let is_valid = ch.is_ascii_alphanumeric()
                || ch == '_'
                || ch == '-'
                || (ch == '.' && self.allow_dots)
                || (ch == ':' && self.allow_colons)
                || (ch == '/' && self.allow_slashes);

            if !is_valid {
                return Err(ValidationError::InvalidChar {
                    char: ch,
                    input: input.to_string(),
                });
            }
        }

        Ok(input.to_string())
    }
}

/// Errors that can occur during identifier validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("identifier cannot be empty")]
    Empty,

    #[error("identifier cannot be whitespace-only")]
    WhitespaceOnly,

    #[error("identifier cannot have leading or trailing whitespace")]
    LeadingTrailingWhitespace,

    #[error("identifier too long: {length} characters (max {max})")]
    TooLong { length: usize, max: usize },

    #[error("identifier '{input}' contains invalid character '{char}'")]
    InvalidChar { char: char, input: String },

    #[error("identifier cannot contain path traversal sequences")]
    PathTraversal,
}
