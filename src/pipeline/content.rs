//! Document payload checks and naming helpers.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

pub const PDF_MIME: &str = "application/pdf";

/// MIME types accepted as an invoice document.
pub const DOCUMENT_MIME_TYPES: &[&str] = &[PDF_MIME, "application/x-pdf", "application/acrobat"];

const PDF_MAGIC: &[u8] = b"%PDF-";

/// How a fetched body should be treated, judged by its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Document,
    Html,
    Other,
}

/// Media type without parameters, lowercased (`"Text/HTML; charset=x"` → `"text/html"`).
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn classify_content_type(content_type: &str) -> ContentClass {
    let ct = essence(content_type);
    if DOCUMENT_MIME_TYPES.contains(&ct.as_str()) {
        ContentClass::Document
    } else if ct == "text/html" || ct == "application/xhtml+xml" {
        ContentClass::Html
    } else {
        ContentClass::Other
    }
}

/// True when the bytes carry the PDF signature. Leading whitespace and a
/// BOM are tolerated, as some generators emit them.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .take(1024)
        .position(|b| !b.is_ascii_whitespace() && !matches!(b, 0xEF | 0xBB | 0xBF))
        .unwrap_or(0);
    bytes[start..].starts_with(PDF_MAGIC)
}

/// Sanity check before a payload may become a resolved document.
///
/// Returns the normalized content type to record, or `None` if the payload
/// is empty or not a document. `application/octet-stream` (and missing
/// types) are accepted when the bytes sniff as PDF.
pub fn validate_document(content_type: &str, bytes: &[u8]) -> Option<&'static str> {
    if bytes.is_empty() || !looks_like_pdf(bytes) {
        return None;
    }
    match classify_content_type(content_type) {
        ContentClass::Document => Some(PDF_MIME),
        ContentClass::Other => {
            let ct = essence(content_type);
            (ct.is_empty() || ct == "application/octet-stream" || ct == "binary/octet-stream")
                .then_some(PDF_MIME)
        }
        ContentClass::Html => None,
    }
}

/// Hex SHA-256 of the payload.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\-. ]").unwrap());

/// Replace anything outside `[A-Za-z0-9_-. ]` (Unicode word chars allowed)
/// and strip path components.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned = UNSAFE_CHARS.replace_all(base, "_");
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Filename for a document obtained through a portal identifier pair.
/// Same pair, same name.
pub fn portal_filename(portal: &str, tax_id: &str, control_code: &str) -> String {
    sanitize_filename(&format!("factura_{portal}_{tax_id}_{control_code}.pdf"))
}

/// Filename derived from the payload hash.
pub fn hashed_filename(hash: &str) -> String {
    let short = &hash[..hash.len().min(16)];
    format!("factura_{short}.pdf")
}
