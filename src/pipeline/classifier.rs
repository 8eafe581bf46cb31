//! Offline link classifier.
//!
//! Decides, from the URL and anchor text alone, what a link probably points
//! at. First match wins:
//! 1. Known portal endpoint (path pattern + required id params) → PortalEndpoint
//! 2. Path ends in a document extension → DirectDocument
//! 3. Anchor text contains an invoice keyword → UnclassifiedPage
//! 4. Anything else → Rejected
//!
//! Only non-rejected links ever reach the network.

use regex::Regex;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::error::ConfigError;
use crate::pipeline::types::{Classification, PortalIds, UriRef};

/// One known invoicing portal endpoint signature.
#[derive(Debug, Clone)]
pub struct PortalRule {
    /// Short name, used as filename prefix.
    pub name: String,
    /// Human-readable description of what a match means.
    pub meaning: String,
    /// Matched against the URL path.
    pub path_pattern: Regex,
    /// Query parameter holding the taxpayer id.
    pub id_param: String,
    /// Query parameter holding the document control code.
    pub code_param: String,
}

impl PortalRule {
    pub fn new(
        name: &str,
        meaning: &str,
        path_pattern: &str,
        id_param: &str,
        code_param: &str,
    ) -> Result<Self, ConfigError> {
        let path_pattern = Regex::new(path_pattern).map_err(|source| ConfigError::InvalidPattern {
            name: name.into(),
            source,
        })?;
        Ok(Self {
            name: name.into(),
            meaning: meaning.into(),
            path_pattern,
            id_param: id_param.into(),
            code_param: code_param.into(),
        })
    }

    /// SIGA electronic invoice viewer (`/FacturaE/printDE?ruc=..&cdc=..`), any host.
    pub fn siga() -> Self {
        Self {
            name: "siga".into(),
            meaning: "SIGA electronic invoice (DE) print endpoint".into(),
            path_pattern: Regex::new(r"(?i)/FacturaE/printDE/?$").unwrap(),
            id_param: "ruc".into(),
            code_param: "cdc".into(),
        }
    }

    /// Returns the identifier pair if the URL matches this portal's signature.
    pub fn match_url(&self, url: &Url) -> Option<PortalIds> {
        if !self.path_pattern.is_match(url.path()) {
            return None;
        }
        let tax_id = raw_query_param(url, &self.id_param)?;
        let control_code = raw_query_param(url, &self.code_param)?;
        Some(PortalIds {
            portal: self.name.clone(),
            tax_id,
            control_code,
        })
    }
}

/// Query parameter value exactly as written in the URL (not percent-decoded).
fn raw_query_param(url: &Url, name: &str) -> Option<String> {
    url.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Immutable classification configuration.
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    pub portals: Vec<PortalRule>,
    /// Lowercase extensions without the dot.
    pub document_extensions: Vec<String>,
    /// Invoice keywords, stored folded (lowercase, no diacritics).
    invoice_keywords: Vec<String>,
    /// Final-hop download hints, stored folded.
    download_keywords: Vec<String>,
}

pub const DEFAULT_INVOICE_KEYWORDS: &[&str] = &[
    "visualizar documento",
    "ver factura",
    "descargar factura",
    "factura electronica",
    "visualizar",
    "descargar xml",
    "ver documento",
];

pub const DEFAULT_DOWNLOAD_KEYWORDS: &[&str] = &[
    "descargar",
    "pdf",
    "imprimir",
    "download",
    "print",
    "generar pdf",
    "exportar pdf",
    "ver pdf",
];

impl ClassifierRules {
    pub fn new(
        portals: Vec<PortalRule>,
        document_extensions: Vec<String>,
        invoice_keywords: &[String],
        download_keywords: &[String],
    ) -> Self {
        Self {
            portals,
            document_extensions: document_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            invoice_keywords: invoice_keywords.iter().map(|k| fold(k)).collect(),
            download_keywords: download_keywords.iter().map(|k| fold(k)).collect(),
        }
    }

    /// SIGA portal, `.pdf`, and the Spanish keyword sets.
    pub fn default_rules() -> Self {
        Self::new(
            vec![PortalRule::siga()],
            vec!["pdf".into()],
            &to_owned(DEFAULT_INVOICE_KEYWORDS),
            &to_owned(DEFAULT_DOWNLOAD_KEYWORDS),
        )
    }

    /// Replace the invoice keyword set.
    pub fn with_invoice_keywords(mut self, keywords: &[String]) -> Self {
        self.invoice_keywords = keywords.iter().map(|k| fold(k)).collect();
        self
    }

    /// Classify a link found in a message body.
    pub fn classify(&self, reference: &UriRef) -> Classification {
        let classification = self.classify_structural(&reference.url).unwrap_or_else(|| {
            if self.has_invoice_keyword(&reference.anchor_text) {
                Classification::UnclassifiedPage
            } else {
                Classification::Rejected
            }
        });
        debug!(
            url = %reference.url,
            anchor = %reference.anchor_text,
            classification = ?classification.kind(),
            "Classified link"
        );
        classification
    }

    /// Classify a link found inside a fetched page.
    ///
    /// Never returns `UnclassifiedPage`: the keyword rule is not applied, so a
    /// page-search can only lead to terminal fetches or a portal endpoint.
    /// Download hints (`pdf` in the href, "descargar" in the text, ...) count
    /// as direct documents here.
    pub fn classify_page_link(&self, reference: &UriRef) -> Classification {
        if let Some(c) = self.classify_structural(&reference.url) {
            return c;
        }
        if reference.url.as_str().to_lowercase().contains("pdf")
            || self.has_download_keyword(&reference.anchor_text)
        {
            return Classification::DirectDocument;
        }
        Classification::Rejected
    }

    /// Rules 1 and 2. `None` when neither applies.
    fn classify_structural(&self, url: &Url) -> Option<Classification> {
        if !matches!(url.scheme(), "http" | "https") {
            return Some(Classification::Rejected);
        }
        if let Some(ids) = self.portals.iter().find_map(|p| p.match_url(url)) {
            return Some(Classification::PortalEndpoint(ids));
        }
        if self.is_document_path(url) {
            return Some(Classification::DirectDocument);
        }
        None
    }

    /// True if the URL path ends in a known document extension.
    pub fn is_document_path(&self, url: &Url) -> bool {
        let path = url.path().to_lowercase();
        self.document_extensions
            .iter()
            .any(|ext| path.ends_with(&format!(".{ext}")))
    }

    /// True if the URL could be a document or portal link, judged by shape only.
    /// Used to pick bare URLs out of plain text.
    pub fn is_document_shaped(&self, url: &Url) -> bool {
        matches!(
            self.classify_structural(url),
            Some(Classification::PortalEndpoint(_) | Classification::DirectDocument)
        )
    }

    pub fn has_invoice_keyword(&self, text: &str) -> bool {
        contains_any(&self.invoice_keywords, text)
    }

    fn has_download_keyword(&self, text: &str) -> bool {
        contains_any(&self.download_keywords, text)
    }
}

fn contains_any(folded_keywords: &[String], text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    let folded = fold(text);
    folded_keywords.iter().any(|k| folded.contains(k.as_str()))
}

fn to_owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// Lowercase, strip diacritics, collapse whitespace.
pub fn fold(text: &str) -> String {
    let stripped: String = text
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
