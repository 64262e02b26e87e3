//! Error types for Turnstile.

use thiserror::Error;

/// Rejection raised when a caller has used up its quota for an endpoint.
///
/// Carries everything a well-behaved client needs to back off: the
/// normalized endpoint that was limited, the rule that applied, and how
/// long to wait before the current window rolls over.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Rate limit exceeded for {endpoint}: {limit} per {window_seconds}s, retry in {retry_after_seconds}s"
)]
pub struct RateLimitExceeded {
    /// Normalized endpoint in `METHOD:/path` form
    pub endpoint: String,
    /// Configured request limit for the window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Seconds until the caller's window resets (at least 1)
    pub retry_after_seconds: u64,
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule pattern or normalizer anchor failed to compile
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
