// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The closed taxonomy of errors the pipeline can observe, and how each
//! kind propagates to its caller (§7 of the enforcement design).

use std::fmt;
use std::time::Duration;

/// Closed set of error kinds produced anywhere in the pipeline.
///
/// Every I/O boundary (facade call, store read/write, event decode)
/// classifies its failure into one of these before handing it back,
/// so the Dispatcher and Executor never have to interpret raw
/// transport errors themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Facade 5xx, connection reset, store throttling. Retry with backoff.
    Transient,
    /// Facade 429. Retry after `Retry-After`, does not count against `maxRetries`.
    RateLimited { retry_after: Option<Duration> },
    /// Facade 404 on an existing ruleId. Treated as success for DELETE,
    /// falls back to create for MIGRATE.
    NotFound,
    /// Facade 409 (duplicate rule). Adopt the existing rule id.
    Conflict,
    /// Missing field or unparseable JSON. Routed to dead-letter.
    Malformed,
    /// Auth failure or missing policy table. Halts the pipeline.
    Fatal,
}

impl ErrorKind {
    /// Transient and RateLimited bubble to the Dispatcher as retryable;
    /// everything else is absorbed at the layer that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Malformed => "MALFORMED",
            Self::Fatal => "FATAL",
        }
    }

    /// Classify an HTTP status code returned by the rule facade.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::RateLimited { retry_after },
            401 | 403 => Self::Fatal,
            500..=599 => Self::Transient,
            _ => Self::Transient,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carrying both its classification and a human-readable cause.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PipelineError {}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::new(ErrorKind::from_status(status.as_u16(), None), e.to_string())
        } else if e.is_timeout() || e.is_connect() {
            Self::new(ErrorKind::Transient, e.to_string())
        } else {
            Self::new(ErrorKind::Fatal, e.to_string())
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed(e.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
