//! End-to-end pipeline tests against a local HTTP mock.
//!
//! Each test builds a real `HttpFetcher` pointed at a wiremock server and
//! pushes a raw RFC 5322 message through `InvoiceProcessor`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use invoice_sync::error::{FailureReason, FetchError};
use invoice_sync::pipeline::classifier::ClassifierRules;
use invoice_sync::pipeline::fetch::{DocumentFetcher, FetchConfig, FetchedBody, HttpFetcher};
use invoice_sync::pipeline::processor::InvoiceProcessor;
use invoice_sync::pipeline::resolver::Resolver;
use invoice_sync::pipeline::types::{Origin, OutcomeStatus, RawMail};

const PDF: &[u8] = b"%PDF-1.4\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n";
const RUC: &str = "80124544-3";
const CDC: &str = "01801245443001001000012322024010914567890123";

fn processor_with(fetcher: Arc<dyn DocumentFetcher>) -> InvoiceProcessor {
    let rules = Arc::new(ClassifierRules::default_rules());
    let resolver = Arc::new(Resolver::new(fetcher, Arc::clone(&rules)));
    InvoiceProcessor::new(rules, resolver)
}

fn http_processor(timeout: Duration) -> InvoiceProcessor {
    let fetcher = HttpFetcher::new(&FetchConfig {
        timeout,
        ..FetchConfig::default()
    })
    .unwrap();
    processor_with(Arc::new(fetcher))
}

fn html_mail(html: &str) -> RawMail {
    RawMail::new(
        "1",
        format!(
            "Message-ID: <inv-1@billing.test>\r\n\
             From: Billing <billing@acme.test>\r\n\
             Subject: Factura electronica\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             {html}\r\n"
        ),
    )
}

fn portal_url(server: &MockServer) -> String {
    format!("{}/FacturaE/printDE?ruc={RUC}&cdc={CDC}", server.uri())
}

async fn mount_portal(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/FacturaE/printDE"))
        .and(query_param("ruc", RUC))
        .and(query_param("cdc", CDC))
        .respond_with(response)
        .expect(1)
        .mount(server)
        .await;
}

/// Fetcher that must never be called.
#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl DocumentFetcher for CountingFetcher {
    async fn fetch(&self, _url: &Url) -> Result<FetchedBody, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Connection("network disabled in this test".into()))
    }
}

// ── Scenario A: attachment ──────────────────────────────────────────

#[tokio::test]
async fn attachment_resolves_without_fetch() {
    let fetcher = Arc::new(CountingFetcher::default());
    let mail = RawMail::new(
        "5",
        concat!(
            "Message-ID: <att@billing.test>\r\n",
            "Subject: Factura 001-001-0000123\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Adjuntamos la factura del mes.\r\n",
            "--b1\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"factura.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQKJcOkw7zDtsOf\r\n",
            "--b1--\r\n",
        ),
    );

    let out = processor_with(fetcher.clone()).process(&mail).await;

    assert_eq!(out.documents.len(), 1);
    let doc = &out.documents[0];
    assert_eq!(doc.origin, Origin::Attachment);
    assert_eq!(doc.suggested_filename, "factura.pdf");
    assert_eq!(doc.source_message_id, "att@billing.test");
    assert_eq!(doc.content_type, "application/pdf");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

// ── Scenario B: portal returns the PDF ──────────────────────────────

#[tokio::test]
async fn portal_link_returning_pdf() {
    let server = MockServer::start().await;
    mount_portal(
        &server,
        ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/pdf"),
    )
    .await;

    let html = format!(
        r#"<p>Su comprobante:</p><a href="{}">VISUALIZAR DOCUMENTO</a>"#,
        portal_url(&server).replace('&', "&amp;")
    );
    let out = http_processor(Duration::from_secs(5))
        .process(&html_mail(&html))
        .await;

    assert_eq!(out.documents.len(), 1);
    let doc = &out.documents[0];
    assert_eq!(doc.origin, Origin::PortalLink);
    assert_eq!(doc.suggested_filename, format!("factura_siga_{RUC}_{CDC}.pdf"));
    assert_eq!(doc.content, PDF);
}

// ── Scenario C: portal returns a page with a download link ──────────

#[tokio::test]
async fn portal_page_with_nested_download_link() {
    let server = MockServer::start().await;
    let page = r#"<html><body>
        <h1>Documento Electronico</h1>
        <a href="/ayuda">Ayuda</a>
        <a href="/files/DE-0123.pdf">Descargar XML</a>
    </body></html>"#;
    mount_portal(
        &server,
        ResponseTemplate::new(200).set_body_raw(page.as_bytes().to_vec(), "text/html; charset=utf-8"),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/files/DE-0123.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/pdf"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ayuda"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let portal = portal_url(&server);
    let html = format!(
        r#"<a href="{}">VISUALIZAR DOCUMENTO</a>"#,
        portal.replace('&', "&amp;")
    );
    let out = http_processor(Duration::from_secs(5))
        .process(&html_mail(&html))
        .await;

    assert_eq!(out.documents.len(), 1);
    let doc = &out.documents[0];
    assert_eq!(doc.origin, Origin::PortalLink);
    assert_eq!(
        doc.provenance,
        vec![portal, format!("{}/files/DE-0123.pdf", server.uri())]
    );
    assert_eq!(doc.suggested_filename, format!("factura_siga_{RUC}_{CDC}.pdf"));
}

// ── Scenario D: irrelevant link ─────────────────────────────────────

#[tokio::test]
async fn irrelevant_link_rejected_without_fetch() {
    let fetcher = Arc::new(CountingFetcher::default());
    let out = processor_with(fetcher.clone())
        .process(&html_mail(r#"<a href="https://news.example/promo">click here</a>"#))
        .await;

    assert!(out.documents.is_empty());
    assert_eq!(out.report.outcomes.len(), 1);
    assert_eq!(out.report.outcomes[0].status, OutcomeStatus::Rejected);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

// ── Scenario E: timeout on one link, sibling still resolves ─────────

#[tokio::test]
async fn timeout_isolated_to_one_reference() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(PDF.to_vec(), "application/pdf")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fast.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/pdf"))
        .expect(1)
        .mount(&server)
        .await;

    let html = format!(
        r#"<a href="{0}/slow.pdf">PDF 1</a> <a href="{0}/fast.pdf">PDF 2</a>"#,
        server.uri()
    );
    let out = http_processor(Duration::from_millis(300))
        .process(&html_mail(&html))
        .await;

    assert_eq!(out.documents.len(), 1);
    assert_eq!(out.documents[0].origin, Origin::DirectLink);
    match &out.report.outcomes[0].status {
        OutcomeStatus::Failed { failure } => assert_eq!(failure.reason, FailureReason::Network),
        other => panic!("expected network failure, got {other:?}"),
    }
    assert_eq!(out.report.outcomes[1].status.label(), "resolved");
}

// ── Properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn message_without_references_makes_no_requests() {
    let fetcher = Arc::new(CountingFetcher::default());
    let mail = RawMail::new(
        "9",
        "Subject: Reunion\r\nContent-Type: text/plain\r\n\r\nNos vemos el martes.\r\n",
    );
    let out = processor_with(fetcher.clone()).process(&mail).await;
    assert!(out.documents.is_empty());
    assert_eq!(out.report.failed(), 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn direct_and_portal_links_to_same_bytes_dedup() {
    let server = MockServer::start().await;
    mount_portal(
        &server,
        ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/pdf"),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/F-123.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/pdf"))
        .mount(&server)
        .await;

    let html = format!(
        r#"<a href="{}/F-123.pdf">Descargar PDF</a>
           <a href="{}">VISUALIZAR DOCUMENTO</a>"#,
        server.uri(),
        portal_url(&server).replace('&', "&amp;")
    );
    let out = http_processor(Duration::from_secs(5))
        .process(&html_mail(&html))
        .await;

    assert_eq!(out.documents.len(), 1);
    assert_eq!(out.documents[0].origin, Origin::DirectLink);
    assert_eq!(out.report.duplicates(), 1);
}

#[tokio::test]
async fn portal_filename_is_idempotent_across_runs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/FacturaE/printDE"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/pdf"))
        .expect(2)
        .mount(&server)
        .await;

    let html = format!(
        r#"<a href="{}">VISUALIZAR DOCUMENTO</a>"#,
        portal_url(&server).replace('&', "&amp;")
    );
    let processor = http_processor(Duration::from_secs(5));
    let first = processor.process(&html_mail(&html)).await;
    let second = processor.process(&html_mail(&html)).await;

    assert_eq!(
        first.documents[0].suggested_filename,
        second.documents[0].suggested_filename
    );
}

#[tokio::test]
async fn unclassified_page_without_links_is_no_document_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ver/123"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            b"<html><body><p>Gracias por su compra</p><a href='/ver/124'>ver factura</a></body></html>".to_vec(),
            "text/html",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let html = format!(r#"<a href="{}/ver/123">Ver factura</a>"#, server.uri());
    let out = http_processor(Duration::from_secs(5))
        .process(&html_mail(&html))
        .await;

    assert!(out.documents.is_empty());
    match &out.report.outcomes[0].status {
        OutcomeStatus::Failed { failure } => {
            assert_eq!(failure.reason, FailureReason::NoDocumentFound)
        }
        other => panic!("expected no_document_found, got {other:?}"),
    }
}

#[tokio::test]
async fn html_where_pdf_expected_is_unexpected_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/f.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(b"<html>login required</html>".to_vec(), "text/html"),
        )
        .mount(&server)
        .await;

    let html = format!(r#"<a href="{}/f.pdf">PDF</a>"#, server.uri());
    let out = http_processor(Duration::from_secs(5))
        .process(&html_mail(&html))
        .await;

    match &out.report.outcomes[0].status {
        OutcomeStatus::Failed { failure } => {
            assert_eq!(failure.reason, FailureReason::UnexpectedContent)
        }
        other => panic!("expected unexpected_content, got {other:?}"),
    }
}

#[tokio::test]
async fn octet_stream_pdf_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dl/7.pdf"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(PDF.to_vec(), "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let html = format!(r#"<a href="{}/dl/7.pdf">PDF</a>"#, server.uri());
    let out = http_processor(Duration::from_secs(5))
        .process(&html_mail(&html))
        .await;

    assert_eq!(out.documents.len(), 1);
    assert_eq!(out.documents[0].content_type, "application/pdf");
}
