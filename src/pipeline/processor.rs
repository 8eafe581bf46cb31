//! Pipeline coordinator: one message through extract → classify → resolve.
//!
//! References inside a message are resolved concurrently on a bounded pool,
//! but outcomes are kept in extraction order so dedup is deterministic:
//! the first occurrence of a document wins, later ones are counted as
//! duplicates. Per-reference failures never escape; they become outcomes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ResolutionFailure;
use crate::pipeline::classifier::ClassifierRules;
use crate::pipeline::extractor::extract;
use crate::pipeline::resolver::Resolver;
use crate::pipeline::types::{
    Classification, DocumentReference, MessageReport, Origin, OutcomeStatus, ProcessedMail,
    RawMail, ReferenceOutcome, ResolvedDocument,
};

/// Default number of references resolved at once within a message.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Dedup identities already emitted. Shared across a batch.
///
/// Attachments are identified by content hash only: senders reuse names
/// like `factura.pdf` for unrelated invoices. Fetched documents carry a
/// derived filename (portal ids or hash), so either key identifies them.
#[derive(Debug, Clone, Default)]
pub struct SeenDocuments {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl SeenDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the document. Returns false if one of its identity keys was
    /// already seen.
    async fn claim(&self, doc: &ResolvedDocument) -> bool {
        let identity = identity_keys(doc);
        let mut keys = self.keys.lock().await;
        if identity.iter().any(|k| keys.contains(k)) {
            return false;
        }
        keys.extend(identity);
        true
    }

    /// Number of identity keys held.
    pub async fn len(&self) -> usize {
        self.keys.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.lock().await.is_empty()
    }
}

fn identity_keys(doc: &ResolvedDocument) -> Vec<String> {
    let hash = format!("sha256:{}", doc.content_hash);
    match doc.origin {
        Origin::Attachment => vec![hash],
        Origin::DirectLink | Origin::PortalLink => {
            vec![format!("name:{}", doc.suggested_filename), hash]
        }
    }
}

enum Attempt {
    Rejected,
    Resolved(ResolvedDocument),
    Failed(ResolutionFailure),
}

struct Planned<'a> {
    index: usize,
    reference: &'a DocumentReference,
    classification: Option<Classification>,
    /// Earlier reference with the same URL; this one is not fetched again.
    repeat_of: Option<usize>,
}

pub struct InvoiceProcessor {
    rules: Arc<ClassifierRules>,
    resolver: Arc<Resolver>,
    concurrency: usize,
}

impl InvoiceProcessor {
    pub fn new(rules: Arc<ClassifierRules>, resolver: Arc<Resolver>) -> Self {
        Self {
            rules,
            resolver,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Set the per-message worker pool size (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process one message with its own dedup scope.
    pub async fn process(&self, mail: &RawMail) -> ProcessedMail {
        self.process_with(mail, &SeenDocuments::new()).await
    }

    /// Process one message, deduplicating against `seen`.
    pub async fn process_with(&self, mail: &RawMail, seen: &SeenDocuments) -> ProcessedMail {
        let extracted = extract(mail, &self.rules);
        let message_id = extracted.envelope.message_id.as_str();

        info!(
            message_id = %message_id,
            subject = %extracted.envelope.subject,
            references = extracted.references.len(),
            degraded = extracted.degraded,
            "Processing message"
        );

        let plan = self.plan(&extracted.references);

        // Boxed up front so the stream's futures are `Send` for any borrow.
        let pending: Vec<BoxFuture<'_, Attempt>> = plan
            .iter()
            .filter(|p| p.repeat_of.is_none())
            .map(|p| {
                let reference = p.reference;
                let classification = p.classification.clone();
                async move {
                    match classification {
                        Some(c) if c.is_rejected() => Attempt::Rejected,
                        Some(c) => self.attempt(message_id, reference, &c).await,
                        // Attachments are never classified; the resolver ignores it.
                        None => {
                            self.attempt(message_id, reference, &Classification::DirectDocument)
                                .await
                        }
                    }
                }
                .boxed()
            })
            .collect();

        // `buffered` yields in input order regardless of completion order.
        let mut attempts = stream::iter(pending)
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter();

        let mut documents = Vec::new();
        let mut outcomes: Vec<ReferenceOutcome> = Vec::with_capacity(plan.len());
        for planned in plan {
            let status = match planned.repeat_of {
                Some(first) => {
                    debug!(
                        message_id = %message_id,
                        target = %planned.reference.target(),
                        "Repeated link, reusing earlier outcome"
                    );
                    repeat_status(&outcomes[first].status)
                }
                None => match attempts.next() {
                    Some(Attempt::Rejected) | None => OutcomeStatus::Rejected,
                    Some(Attempt::Failed(failure)) => OutcomeStatus::Failed { failure },
                    Some(Attempt::Resolved(doc)) => {
                        let filename = doc.suggested_filename.clone();
                        if seen.claim(&doc).await {
                            documents.push(doc);
                            OutcomeStatus::Resolved { filename }
                        } else {
                            debug!(message_id = %message_id, filename = %filename, "Dropping duplicate document");
                            OutcomeStatus::Duplicate { filename }
                        }
                    }
                },
            };
            outcomes.push(ReferenceOutcome {
                index: planned.index,
                kind: planned.reference.kind(),
                target: planned.reference.target(),
                classification: planned.classification.as_ref().map(Classification::kind),
                status,
            });
        }

        let report = MessageReport {
            envelope: extracted.envelope.clone(),
            degraded: extracted.degraded,
            outcomes,
        };

        info!(
            message_id = %message_id,
            resolved = report.resolved(),
            duplicates = report.duplicates(),
            rejected = report.rejected(),
            failed = report.failed(),
            "Message processed"
        );

        ProcessedMail { documents, report }
    }

    /// Process messages one after another with a shared dedup scope.
    pub async fn process_batch(&self, mails: &[RawMail]) -> Vec<ProcessedMail> {
        let count = mails.len();
        info!(count, "Processing message batch");

        let seen = SeenDocuments::new();
        let mut results = Vec::with_capacity(count);
        for mail in mails {
            results.push(self.process_with(mail, &seen).await);
        }

        info!(
            documents = results.iter().map(|r| r.documents.len()).sum::<usize>(),
            total = count,
            "Batch processing complete"
        );
        results
    }

    /// Classify every reference and mark links that repeat an earlier URL.
    fn plan<'a>(&self, references: &'a [DocumentReference]) -> Vec<Planned<'a>> {
        let mut first_by_url: HashMap<&'a str, usize> = HashMap::new();
        references
            .iter()
            .enumerate()
            .map(|(index, reference)| match reference {
                DocumentReference::Attachment(_) => Planned {
                    index,
                    reference,
                    classification: None,
                    repeat_of: None,
                },
                DocumentReference::Uri(uri) => Planned {
                    index,
                    reference,
                    classification: Some(self.rules.classify(uri)),
                    repeat_of: match first_by_url.get(uri.url.as_str()) {
                        Some(&first) => Some(first),
                        None => {
                            first_by_url.insert(uri.url.as_str(), index);
                            None
                        }
                    },
                },
            })
            .collect()
    }

    async fn attempt(
        &self,
        message_id: &str,
        reference: &DocumentReference,
        classification: &Classification,
    ) -> Attempt {
        match self
            .resolver
            .resolve(message_id, reference, classification)
            .await
        {
            Ok(doc) => Attempt::Resolved(doc),
            Err(failure) => {
                debug!(
                    message_id = %message_id,
                    target = %reference.target(),
                    reason = failure.reason.label(),
                    "Reference did not resolve"
                );
                Attempt::Failed(failure)
            }
        }
    }
}

/// Outcome for a link that repeats an earlier one in the same message.
fn repeat_status(first: &OutcomeStatus) -> OutcomeStatus {
    match first {
        OutcomeStatus::Resolved { filename } | OutcomeStatus::Duplicate { filename } => {
            OutcomeStatus::Duplicate {
                filename: filename.clone(),
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use url::Url;

    use crate::error::{FailureReason, FetchError};
    use crate::pipeline::fetch::{DocumentFetcher, FetchedBody};
    use crate::pipeline::types::ClassificationKind;

    const PDF: &[u8] = b"%PDF-1.4\n%invoice\n";

    /// Serves `PDF` for any `.pdf` path and for the portal; counts calls.
    #[derive(Default)]
    struct PdfEverywhere {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentFetcher for PdfEverywhere {
        async fn fetch(&self, url: &Url) -> Result<FetchedBody, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.path().ends_with("slow.pdf") {
                return Err(FetchError::Timeout);
            }
            Ok(FetchedBody {
                final_url: url.clone(),
                content_type: "application/pdf".into(),
                bytes: PDF.to_vec(),
            })
        }
    }

    fn processor(fetcher: Arc<PdfEverywhere>) -> InvoiceProcessor {
        let rules = Arc::new(ClassifierRules::default_rules());
        let resolver = Arc::new(Resolver::new(fetcher, rules.clone()));
        InvoiceProcessor::new(rules, resolver).with_concurrency(2)
    }

    fn html_mail(id: &str, html: &str) -> RawMail {
        RawMail::new(
            id,
            format!(
                "Message-ID: <{id}@test>\r\nSubject: Factura\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}\r\n"
            ),
        )
    }

    fn attachment_mail(id: &str, filename: &str, body: &str) -> RawMail {
        RawMail::new(
            id,
            format!(
                concat!(
                    "Message-ID: <{id}@test>\r\n",
                    "Subject: Factura\r\n",
                    "MIME-Version: 1.0\r\n",
                    "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                    "\r\n",
                    "--b\r\n",
                    "Content-Type: text/plain\r\n",
                    "\r\n",
                    "Adjunto su factura.\r\n",
                    "--b\r\n",
                    "Content-Type: application/pdf; name=\"{name}\"\r\n",
                    "Content-Disposition: attachment; filename=\"{name}\"\r\n",
                    "\r\n",
                    "{body}\r\n",
                    "--b--\r\n",
                ),
                id = id,
                name = filename,
                body = body,
            ),
        )
    }

    #[tokio::test]
    async fn no_references_no_fetches() {
        let fetcher = Arc::new(PdfEverywhere::default());
        let out = processor(fetcher.clone())
            .process(&RawMail::new("1", "Subject: hola\r\n\r\nSin enlaces.\r\n"))
            .await;
        assert!(out.documents.is_empty());
        assert!(out.report.outcomes.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_links_never_fetched() {
        let fetcher = Arc::new(PdfEverywhere::default());
        let out = processor(fetcher.clone())
            .process(&html_mail("d", r#"<a href="https://news.example/promo">click here</a>"#))
            .await;
        assert!(out.documents.is_empty());
        assert_eq!(out.report.rejected(), 1);
        assert_eq!(
            out.report.outcomes[0].classification,
            Some(ClassificationKind::Rejected)
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn direct_and_portal_with_same_bytes_dedup() {
        let html = r#"
            <a href="https://cdn.example/F-001.pdf">PDF</a>
            <a href="https://portal.example/FacturaE/printDE?ruc=80124544-3&amp;cdc=0180">VISUALIZAR DOCUMENTO</a>
        "#;
        let out = processor(Arc::new(PdfEverywhere::default()))
            .process(&html_mail("dup", html))
            .await;
        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.report.resolved(), 1);
        assert_eq!(out.report.duplicates(), 1);
        assert_eq!(out.report.outcomes[0].status.label(), "resolved");
        assert_eq!(out.report.outcomes[1].status.label(), "duplicate");
    }

    #[tokio::test]
    async fn failure_does_not_block_siblings() {
        let html = r#"
            <a href="https://cdn.example/slow.pdf">PDF</a>
            <a href="https://cdn.example/ok.pdf">PDF</a>
        "#;
        let out = processor(Arc::new(PdfEverywhere::default()))
            .process(&html_mail("e", html))
            .await;
        assert_eq!(out.documents.len(), 1);
        match &out.report.outcomes[0].status {
            OutcomeStatus::Failed { failure } => assert_eq!(failure.reason, FailureReason::Network),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(out.report.outcomes[1].status.label(), "resolved");
    }

    #[tokio::test]
    async fn outcomes_follow_extraction_order() {
        let html = r#"
            <a href="https://a.example/1.pdf">1</a>
            <a href="https://news.example/x">x</a>
            <a href="https://a.example/slow.pdf">2</a>
        "#;
        let out = processor(Arc::new(PdfEverywhere::default()))
            .process(&html_mail("o", html))
            .await;
        let indices: Vec<_> = out.report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let labels: Vec<_> = out.report.outcomes.iter().map(|o| o.status.label()).collect();
        assert_eq!(labels, vec!["resolved", "rejected", "failed"]);
    }

    #[tokio::test]
    async fn batch_dedups_across_messages() {
        let mail = html_mail("b1", r#"<a href="https://cdn.example/F-001.pdf">PDF</a>"#);
        let again = html_mail("b2", r#"<a href="https://cdn.example/F-001.pdf">PDF</a>"#);
        let results = processor(Arc::new(PdfEverywhere::default()))
            .process_batch(&[mail, again])
            .await;
        assert_eq!(results[0].documents.len(), 1);
        assert!(results[1].documents.is_empty());
        assert_eq!(results[1].report.duplicates(), 1);
    }

    #[tokio::test]
    async fn same_attachment_name_different_invoices_both_kept() {
        let results = processor(Arc::new(PdfEverywhere::default()))
            .process_batch(&[
                attachment_mail("a", "factura.pdf", "%PDF-1.4 AAA"),
                attachment_mail("b", "factura.pdf", "%PDF-1.4 BBB"),
            ])
            .await;
        assert_eq!(results[0].documents.len(), 1);
        assert_eq!(results[1].documents.len(), 1);
        assert_eq!(results[1].report.duplicates(), 0);
    }

    #[tokio::test]
    async fn same_attachment_bytes_dedup_across_batch() {
        let results = processor(Arc::new(PdfEverywhere::default()))
            .process_batch(&[
                attachment_mail("a", "factura.pdf", "%PDF-1.4 AAA"),
                attachment_mail("b", "copia.pdf", "%PDF-1.4 AAA"),
            ])
            .await;
        assert_eq!(results[0].documents.len(), 1);
        assert!(results[1].documents.is_empty());
        assert_eq!(results[1].report.duplicates(), 1);
    }

    #[tokio::test]
    async fn repeated_link_fetched_once() {
        let mail = RawMail::new(
            "alt",
            concat!(
                "Message-ID: <alt@test>\r\n",
                "Subject: Factura\r\n",
                "MIME-Version: 1.0\r\n",
                "Content-Type: multipart/alternative; boundary=\"alt\"\r\n",
                "\r\n",
                "--alt\r\n",
                "Content-Type: text/plain; charset=utf-8\r\n",
                "\r\n",
                "Descargue: https://cdn.example/F-001.pdf\r\n",
                "--alt\r\n",
                "Content-Type: text/html; charset=utf-8\r\n",
                "\r\n",
                "<a href=\"https://cdn.example/F-001.pdf\">Descargar</a>\r\n",
                "--alt--\r\n",
            ),
        );
        let fetcher = Arc::new(PdfEverywhere::default());
        let out = processor(fetcher.clone()).process(&mail).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.report.outcomes.len(), 2);
        assert_eq!(out.report.resolved(), 1);
        assert_eq!(out.report.duplicates(), 1);
    }

    #[tokio::test]
    async fn repeated_failing_link_reports_same_failure() {
        let html = r#"
            <a href="https://cdn.example/slow.pdf">PDF</a>
            <a href="https://cdn.example/slow.pdf">Descargar</a>
        "#;
        let fetcher = Arc::new(PdfEverywhere::default());
        let out = processor(fetcher.clone())
            .process(&html_mail("rf", html))
            .await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.report.failed(), 2);
    }

    #[tokio::test]
    async fn processing_runs_on_a_spawned_task() {
        let p = Arc::new(processor(Arc::new(PdfEverywhere::default())));
        let mail = html_mail("sp", r#"<a href="https://cdn.example/F-001.pdf">PDF</a>"#);
        let seen = SeenDocuments::new();
        let handle = tokio::spawn(async move { p.process_with(&mail, &seen).await });
        assert_eq!(handle.await.unwrap().documents.len(), 1);
    }

    #[tokio::test]
    async fn separate_process_calls_do_not_share_dedup() {
        let p = processor(Arc::new(PdfEverywhere::default()));
        let mail = html_mail("s", r#"<a href="https://cdn.example/F-001.pdf">PDF</a>"#);
        assert_eq!(p.process(&mail).await.documents.len(), 1);
        assert_eq!(p.process(&mail).await.documents.len(), 1);
    }

    #[tokio::test]
    async fn seen_documents_tracks_both_keys() {
        let seen = SeenDocuments::new();
        let doc = ResolvedDocument {
            source_message_id: "m".into(),
            origin: crate::pipeline::types::Origin::DirectLink,
            provenance: vec![],
            content: PDF.to_vec(),
            content_type: "application/pdf".into(),
            suggested_filename: "a.pdf".into(),
            content_hash: "h".into(),
        };
        assert!(seen.claim(&doc).await);
        assert!(!seen.claim(&doc).await);
        assert_eq!(seen.len().await, 2);

        let renamed = ResolvedDocument {
            suggested_filename: "b.pdf".into(),
            ..doc.clone()
        };
        assert!(!seen.claim(&renamed).await);
    }

    #[tokio::test]
    async fn attachments_are_identified_by_hash_only() {
        let seen = SeenDocuments::new();
        let first = ResolvedDocument {
            source_message_id: "m".into(),
            origin: crate::pipeline::types::Origin::Attachment,
            provenance: vec!["factura.pdf".into()],
            content: PDF.to_vec(),
            content_type: "application/pdf".into(),
            suggested_filename: "factura.pdf".into(),
            content_hash: "h1".into(),
        };
        let other = ResolvedDocument {
            content_hash: "h2".into(),
            ..first.clone()
        };
        assert!(seen.claim(&first).await);
        assert!(seen.claim(&other).await);
        assert_eq!(seen.len().await, 2);
    }
}
