//! Resolver: turns one classified reference into a validated document.
//!
//! Attachments resolve in memory. Direct links are fetched once. Portal
//! endpoints and unclassified pages are fetched once and, if they return
//! HTML, searched for a download link. The page-search follows at most
//! [`MAX_PAGE_HOPS`] further hop and tries candidates in anchor order; the
//! first one that yields a document wins.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::{FailureReason, ResolutionFailure};
use crate::pipeline::classifier::ClassifierRules;
use crate::pipeline::content::{
    content_hash, hashed_filename, portal_filename, sanitize_filename, validate_document,
    ContentClass,
};
use crate::pipeline::extractor::parse_anchors;
use crate::pipeline::fetch::{DocumentFetcher, FetchedBody};
use crate::pipeline::types::{
    AttachmentRef, Classification, DocumentReference, Origin, PortalIds, ResolvedDocument, UriRef,
};

/// Upper bound on page-search hops below the first fetched page.
pub const MAX_PAGE_HOPS: usize = 1;

pub struct Resolver {
    fetcher: Arc<dyn DocumentFetcher>,
    rules: Arc<ClassifierRules>,
    page_hops: usize,
}

impl Resolver {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, rules: Arc<ClassifierRules>) -> Self {
        Self {
            fetcher,
            rules,
            page_hops: MAX_PAGE_HOPS,
        }
    }

    /// Limit page-search depth. `0` disables page-search; values above
    /// [`MAX_PAGE_HOPS`] are clamped.
    pub fn with_page_hops(mut self, hops: usize) -> Self {
        self.page_hops = hops.min(MAX_PAGE_HOPS);
        self
    }

    /// Resolve one reference. `classification` is ignored for attachments.
    pub async fn resolve(
        &self,
        message_id: &str,
        reference: &DocumentReference,
        classification: &Classification,
    ) -> Result<ResolvedDocument, ResolutionFailure> {
        match reference {
            DocumentReference::Attachment(attachment) => {
                resolve_attachment(message_id, attachment)
            }
            DocumentReference::Uri(uri) => self.resolve_uri(message_id, uri, classification).await,
        }
    }

    async fn resolve_uri(
        &self,
        message_id: &str,
        uri: &UriRef,
        classification: &Classification,
    ) -> Result<ResolvedDocument, ResolutionFailure> {
        let url = uri.url.as_str();
        let trail = vec![url.to_string()];

        let portal_ids = match classification {
            Classification::Rejected => {
                return Err(ResolutionFailure::new(
                    FailureReason::NoDocumentFound,
                    "reference rejected by classifier",
                ));
            }
            Classification::DirectDocument => {
                let body = self.fetch(&uri.url).await?;
                return match finish(message_id, Origin::DirectLink, &body, None, trail.clone()) {
                    Some(doc) => Ok(doc),
                    None => Err(unexpected(&body, trail)),
                };
            }
            Classification::PortalEndpoint(ids) => Some(ids),
            Classification::UnclassifiedPage => None,
        };

        let body = self.fetch(&uri.url).await?;
        if let Some(doc) = finish(message_id, Origin::PortalLink, &body, portal_ids, trail.clone()) {
            return Ok(doc);
        }
        if body.class() != ContentClass::Html {
            return Err(unexpected(&body, trail));
        }
        if self.page_hops == 0 {
            return Err(ResolutionFailure::new(
                FailureReason::NoDocumentFound,
                "page-search disabled",
            )
            .with_traversed(trail));
        }

        self.search_page(message_id, &body, portal_ids, trail).await
    }

    /// Search a fetched page for a download link and resolve the first one
    /// that works. Candidates that return another page are not searched.
    ///
    /// The document's provenance is the path that produced it (`path` plus
    /// the winning candidate). Every attempted candidate is kept only in the
    /// failure's `traversed` list.
    async fn search_page(
        &self,
        message_id: &str,
        page: &FetchedBody,
        parent_ids: Option<&PortalIds>,
        path: Vec<String>,
    ) -> Result<ResolvedDocument, ResolutionFailure> {
        let candidates = self.page_candidates(page, &path);
        let mut attempted = path.clone();
        debug!(
            page = %page.final_url,
            candidates = candidates.len(),
            "Searching page for document links"
        );

        for (candidate, classification) in candidates {
            attempted.push(candidate.url.to_string());

            let body = match self.fetcher.fetch(&candidate.url).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(url = %candidate.url, error = %e, "Candidate fetch failed, trying next");
                    continue;
                }
            };

            let ids = classification.portal_ids().or(parent_ids);
            let mut provenance = path.clone();
            provenance.push(candidate.url.to_string());
            if let Some(doc) = finish(message_id, Origin::PortalLink, &body, ids, provenance) {
                info!(
                    page = %page.final_url,
                    document = %candidate.url,
                    "Resolved document through page-search"
                );
                return Ok(doc);
            }
            debug!(url = %candidate.url, content_type = %body.content_type, "Candidate is not a document");
        }

        Err(ResolutionFailure::new(
            FailureReason::NoDocumentFound,
            format!("no document link found on {}", page.final_url),
        )
        .with_traversed(attempted))
    }

    /// Parse and classify the page's anchors. Rejected links, links already
    /// visited and repeats are dropped; anchor order is kept.
    fn page_candidates(&self, page: &FetchedBody, visited: &[String]) -> Vec<(UriRef, Classification)> {
        let mut seen: HashSet<String> = visited.iter().cloned().collect();
        seen.insert(page.final_url.to_string());

        parse_anchors(&page.text(), Some(&page.final_url))
            .into_iter()
            .filter(|a| seen.insert(a.url.to_string()))
            .filter_map(|a| {
                let classification = self.rules.classify_page_link(&a);
                (!classification.is_rejected()).then_some((a, classification))
            })
            .collect()
    }

    async fn fetch(&self, url: &Url) -> Result<FetchedBody, ResolutionFailure> {
        self.fetcher.fetch(url).await.map_err(|e| {
            warn!(url = %url, error = %e, "Fetch failed");
            ResolutionFailure::from_fetch(&e, url.as_str())
        })
    }
}

fn resolve_attachment(
    message_id: &str,
    attachment: &AttachmentRef,
) -> Result<ResolvedDocument, ResolutionFailure> {
    let Some(content_type) = validate_document(&attachment.mime_type, &attachment.bytes) else {
        return Err(ResolutionFailure::new(
            FailureReason::UnexpectedContent,
            format!(
                "attachment {:?} ({}) is not a valid document",
                attachment.filename, attachment.mime_type
            ),
        )
        .with_traversed(vec![attachment.filename.clone()]));
    };

    let hash = content_hash(&attachment.bytes);
    let suggested_filename = if attachment.filename.trim().is_empty() {
        hashed_filename(&hash)
    } else {
        sanitize_filename(&attachment.filename)
    };

    Ok(ResolvedDocument {
        source_message_id: message_id.to_string(),
        origin: Origin::Attachment,
        provenance: vec![attachment.filename.clone()],
        content: attachment.bytes.clone(),
        content_type: content_type.to_string(),
        suggested_filename,
        content_hash: hash,
    })
}

/// Build the resolved document if `body` passes the document check.
fn finish(
    message_id: &str,
    origin: Origin,
    body: &FetchedBody,
    ids: Option<&PortalIds>,
    provenance: Vec<String>,
) -> Option<ResolvedDocument> {
    let content_type = validate_document(&body.content_type, &body.bytes)?;
    let hash = content_hash(&body.bytes);
    let suggested_filename = match ids {
        Some(ids) => portal_filename(&ids.portal, &ids.tax_id, &ids.control_code),
        None => hashed_filename(&hash),
    };
    Some(ResolvedDocument {
        source_message_id: message_id.to_string(),
        origin,
        provenance,
        content: body.bytes.clone(),
        content_type: content_type.to_string(),
        suggested_filename,
        content_hash: hash,
    })
}

fn unexpected(body: &FetchedBody, trail: Vec<String>) -> ResolutionFailure {
    let content_type = if body.content_type.is_empty() {
        "no content type"
    } else {
        body.content_type.as_str()
    };
    ResolutionFailure::new(
        FailureReason::UnexpectedContent,
        format!("{} returned {content_type} ({} bytes)", body.final_url, body.bytes.len()),
    )
    .with_traversed(trail)
}
