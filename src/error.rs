//! Error types for invoice-sync.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid pattern for portal rule {name}: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Mailbox (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP login failed for {username}")]
    AuthFailed { username: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IMAP connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Typed failure of a single network retrieval.
///
/// Never fatal: the resolver converts these into per-reference outcomes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Payload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Extraction collaborator (document sink) errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction service unavailable: {0}")]
    Unavailable(String),

    #[error("Extraction rejected {filename}: {reason}")]
    Rejected { filename: String, reason: String },
}

/// Pipeline-fatal errors. Only upstream collaborator outages end up here;
/// everything per-reference is converted into a diagnostic outcome.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox unreachable: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Extraction collaborator unreachable: {0}")]
    Extraction(SinkError),
}

/// Why a reference did not produce a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Transport-level problem: timeout, connection error, non-2xx, oversize.
    Network,
    /// Got a response, but it was not a document (or failed the sanity check).
    UnexpectedContent,
    /// A page was searched and no candidate produced a document.
    NoDocumentFound,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::UnexpectedContent => "unexpected_content",
            Self::NoDocumentFound => "no_document_found",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-reference resolution failure with the URLs that were tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct ResolutionFailure {
    pub reason: FailureReason,
    pub detail: String,
    /// URLs (or attachment name) visited before giving up.
    pub traversed: Vec<String>,
}

impl ResolutionFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
            traversed: Vec::new(),
        }
    }

    pub fn with_traversed(mut self, traversed: Vec<String>) -> Self {
        self.traversed = traversed;
        self
    }

    /// Map a fetch failure onto the closed reason set.
    pub fn from_fetch(err: &FetchError, url: &str) -> Self {
        Self::new(FailureReason::Network, format!("{url}: {err}")).with_traversed(vec![url.into()])
    }
}
