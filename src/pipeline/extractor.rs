//! Reference extractor: raw message to ordered document references.
//!
//! Pure parsing, no network. Walks MIME parts in order:
//! - binary parts with a document type or extension → attachment reference
//! - text/plain → bare URLs that look like a document or portal endpoint
//! - text/html → every `<a href>` with its visible text
//!
//! Never fails: an unparseable message is scanned as raw text instead.

use std::sync::LazyLock;

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::pipeline::classifier::ClassifierRules;
use crate::pipeline::content::{classify_content_type, ContentClass};
use crate::pipeline::types::{
    AttachmentRef, DocumentReference, ExtractedMail, MailEnvelope, RawMail, UriRef,
};

/// Forwarded-message nesting we are willing to follow.
const MAX_NESTED_MESSAGES: usize = 4;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>"'`\[\]{}|\\^]+"#).unwrap());

static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").unwrap());

static BASE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("base[href]").unwrap());

/// Extract envelope metadata and document references from a raw message.
pub fn extract(mail: &RawMail, rules: &ClassifierRules) -> ExtractedMail {
    let Some(parsed) = MessageParser::default().parse(&mail.raw) else {
        warn!(
            mailbox_id = %mail.mailbox_id,
            "Message could not be parsed as MIME, scanning raw text"
        );
        let text = String::from_utf8_lossy(&mail.raw);
        return ExtractedMail {
            envelope: MailEnvelope {
                message_id: mail.mailbox_id.clone(),
                mailbox_id: mail.mailbox_id.clone(),
                ..MailEnvelope::default()
            },
            references: scan_text(&text, rules)
                .into_iter()
                .map(DocumentReference::Uri)
                .collect(),
            degraded: true,
        };
    };

    let envelope = envelope(&parsed, &mail.mailbox_id);
    let mut references = Vec::new();
    walk_parts(&parsed, rules, &mut references, 0);

    debug!(
        message_id = %envelope.message_id,
        references = references.len(),
        "Extracted document references"
    );

    ExtractedMail {
        envelope,
        references,
        degraded: false,
    }
}

fn envelope(parsed: &Message<'_>, mailbox_id: &str) -> MailEnvelope {
    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .unwrap_or("unknown")
        .to_string();

    MailEnvelope {
        message_id: parsed
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| mailbox_id.to_string()),
        mailbox_id: mailbox_id.to_string(),
        subject: parsed.subject().unwrap_or("").to_string(),
        sender,
        date: parsed
            .date()
            .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0)),
    }
}

fn walk_parts(
    message: &Message<'_>,
    rules: &ClassifierRules,
    out: &mut Vec<DocumentReference>,
    depth: usize,
) {
    for part in &message.parts {
        match &part.body {
            PartType::Text(text) => {
                out.extend(scan_text(text, rules).into_iter().map(DocumentReference::Uri));
            }
            PartType::Html(html) => {
                out.extend(
                    extract_html_links(html, None, rules)
                        .into_iter()
                        .map(DocumentReference::Uri),
                );
            }
            PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
                if let Some(attachment) = attachment_ref(part, bytes, rules) {
                    out.push(DocumentReference::Attachment(attachment));
                }
            }
            PartType::Message(nested) => {
                if depth < MAX_NESTED_MESSAGES {
                    walk_parts(nested, rules, out, depth + 1);
                } else {
                    debug!("Skipping deeply nested forwarded message");
                }
            }
            PartType::Multipart(_) => {}
        }
    }
}

fn attachment_ref(
    part: &MessagePart<'_>,
    bytes: &[u8],
    rules: &ClassifierRules,
) -> Option<AttachmentRef> {
    let mime_type = MimeHeaders::content_type(part)
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_default()
        .to_ascii_lowercase();
    let filename = MimeHeaders::attachment_name(part).unwrap_or("").to_string();

    let lower = filename.to_lowercase();
    let by_extension = rules
        .document_extensions
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")));
    let by_type = classify_content_type(&mime_type) == ContentClass::Document;

    if !(by_extension || by_type) {
        return None;
    }

    Some(AttachmentRef {
        filename,
        mime_type,
        bytes: bytes.to_vec(),
    })
}

/// Bare URLs in free text that match a portal or document shape.
pub fn scan_text(text: &str, rules: &ClassifierRules) -> Vec<UriRef> {
    URL_PATTERN
        .find_iter(text)
        .filter_map(|m| {
            let candidate = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
            let candidate = html_unescape_amp(candidate);
            Url::parse(&candidate).ok()
        })
        .filter(|url| rules.is_document_shaped(url))
        .map(|url| UriRef::new(url, ""))
        .collect()
}

/// Every anchor in an HTML document, in document order.
///
/// `base` is the URL the page was fetched from; a `<base href>` element
/// takes precedence. Anchors whose href cannot be made absolute are dropped.
/// When the markup yields no anchors at all the raw string is scanned for
/// document-shaped URLs instead.
pub fn extract_html_links(html: &str, base: Option<&Url>, rules: &ClassifierRules) -> Vec<UriRef> {
    let links = parse_anchors(html, base);
    if links.is_empty() && URL_PATTERN.is_match(html) {
        debug!("No anchors parsed from HTML, falling back to text scan");
        return scan_text(html, rules);
    }
    links
}

/// Parse `<a href>` elements. Sync on purpose: the parsed tree is not `Send`
/// and must not live across an await point.
pub fn parse_anchors(html: &str, base: Option<&Url>) -> Vec<UriRef> {
    let document = Html::parse_document(html);

    let declared_base = document
        .select(&BASE_SELECTOR)
        .next()
        .and_then(|b| b.value().attr("href"))
        .and_then(|href| resolve_href(href.trim(), base));
    let base = declared_base.as_ref().or(base);

    document
        .select(&ANCHOR_SELECTOR)
        .filter_map(|a| {
            let href = a.value().attr("href")?.trim();
            if href.is_empty() || href.starts_with('#') {
                return None;
            }
            let url = resolve_href(href, base)?;
            let text = a
                .text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            Some(UriRef::new(url, text))
        })
        .collect()
}

fn resolve_href(href: &str, base: Option<&Url>) -> Option<Url> {
    match Url::parse(href) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base.and_then(|b| b.join(href).ok()),
        Err(_) => None,
    }
}

/// URLs copied out of HTML source keep their `&amp;` entities.
fn html_unescape_amp(s: &str) -> String {
    s.replace("&amp;", "&")
}
