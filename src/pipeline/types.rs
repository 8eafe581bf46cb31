//! Shared types for the invoice discovery pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ResolutionFailure;

// ── Inbound mail ────────────────────────────────────────────────────

/// A raw RFC 5322 message as handed over by the mailbox collaborator.
#[derive(Debug, Clone)]
pub struct RawMail {
    /// Mailbox-native id (IMAP UID, file name, ...).
    pub mailbox_id: String,
    /// Full message bytes.
    pub raw: Vec<u8>,
}

impl RawMail {
    pub fn new(mailbox_id: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            mailbox_id: mailbox_id.into(),
            raw: raw.into(),
        }
    }
}

/// Decoded header metadata of a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailEnvelope {
    /// Message-ID header, or the mailbox id when the header is missing.
    pub message_id: String,
    pub mailbox_id: String,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
}

// ── Document references ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Attachment,
    Uri,
}

/// An attachment whose declared type or filename marks it as a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A link found in the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriRef {
    pub url: Url,
    /// Visible anchor text, case preserved. Empty for bare URLs.
    pub anchor_text: String,
}

impl UriRef {
    pub fn new(url: Url, anchor_text: impl Into<String>) -> Self {
        Self {
            url,
            anchor_text: anchor_text.into(),
        }
    }
}

/// A candidate pointer to an invoice document, prior to any fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentReference {
    Attachment(AttachmentRef),
    Uri(UriRef),
}

impl DocumentReference {
    pub fn kind(&self) -> ReferenceKind {
        match self {
            Self::Attachment(_) => ReferenceKind::Attachment,
            Self::Uri(_) => ReferenceKind::Uri,
        }
    }

    /// Attachment filename or URL, for diagnostics.
    pub fn target(&self) -> String {
        match self {
            Self::Attachment(a) => a.filename.clone(),
            Self::Uri(u) => u.url.to_string(),
        }
    }
}

/// Result of running the extractor over one message.
#[derive(Debug, Clone)]
pub struct ExtractedMail {
    pub envelope: MailEnvelope,
    /// References in appearance order; duplicates allowed.
    pub references: Vec<DocumentReference>,
    /// Set when MIME parsing failed and the raw bytes were scanned instead.
    pub degraded: bool,
}

// ── Classification ──────────────────────────────────────────────────

/// Identifier pair pulled verbatim out of a portal URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortalIds {
    /// Name of the portal rule that matched (used as filename prefix).
    pub portal: String,
    /// Taxpayer identifier (e.g. RUC).
    pub tax_id: String,
    /// Document control code (e.g. CDC).
    pub control_code: String,
}

/// Offline triage decision for a URI reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    DirectDocument,
    PortalEndpoint(PortalIds),
    UnclassifiedPage,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    DirectDocument,
    PortalEndpoint,
    UnclassifiedPage,
    Rejected,
}

impl Classification {
    pub fn kind(&self) -> ClassificationKind {
        match self {
            Self::DirectDocument => ClassificationKind::DirectDocument,
            Self::PortalEndpoint(_) => ClassificationKind::PortalEndpoint,
            Self::UnclassifiedPage => ClassificationKind::UnclassifiedPage,
            Self::Rejected => ClassificationKind::Rejected,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }

    pub fn portal_ids(&self) -> Option<&PortalIds> {
        match self {
            Self::PortalEndpoint(ids) => Some(ids),
            _ => None,
        }
    }
}

// ── Resolved document ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Attachment,
    DirectLink,
    PortalLink,
}

/// A validated document payload plus provenance, ready for extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedDocument {
    pub source_message_id: String,
    pub origin: Origin,
    /// Attachment filename, or every URL traversed to obtain the bytes.
    pub provenance: Vec<String>,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub content_type: String,
    pub suggested_filename: String,
    /// Hex SHA-256 of `content`.
    pub content_hash: String,
}

impl ResolvedDocument {
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

// ── Diagnostics ─────────────────────────────────────────────────────

/// What happened to one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Resolved { filename: String },
    /// Resolved, but an earlier reference already produced the same document.
    Duplicate { filename: String },
    Rejected,
    Failed { failure: ResolutionFailure },
}

impl OutcomeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected => "rejected",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceOutcome {
    /// Position in extraction order.
    pub index: usize,
    pub kind: ReferenceKind,
    pub target: String,
    /// `None` for attachments (never classified).
    pub classification: Option<ClassificationKind>,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// Per-message diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageReport {
    pub envelope: MailEnvelope,
    pub degraded: bool,
    /// Outcomes in extraction order.
    pub outcomes: Vec<ReferenceOutcome>,
}

impl MessageReport {
    fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.label() == label)
            .count()
    }

    pub fn resolved(&self) -> usize {
        self.count("resolved")
    }

    pub fn duplicates(&self) -> usize {
        self.count("duplicate")
    }

    pub fn rejected(&self) -> usize {
        self.count("rejected")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }
}

/// Output of the coordinator for one message.
#[derive(Debug, Clone)]
pub struct ProcessedMail {
    pub documents: Vec<ResolvedDocument>,
    pub report: MessageReport,
}
