use std::sync::Arc;

use anyhow::{Context, anyhow};
use tower_http::cors::CorsLayer;

use invoice_sync::api::control_routes;
use invoice_sync::channels::ImapMailbox;
use invoice_sync::config::AppConfig;
use invoice_sync::pipeline::fetch::HttpFetcher;
use invoice_sync::pipeline::processor::InvoiceProcessor;
use invoice_sync::pipeline::resolver::Resolver;
use invoice_sync::pipeline::runner::PipelineRunner;
use invoice_sync::sink::{DocumentSink, SpoolSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    let Some(mailbox_config) = config.mailbox.clone() else {
        eprintln!("Error: EMAIL_HOST not set");
        eprintln!("  export EMAIL_HOST=imap.example.com EMAIL_USERNAME=... EMAIL_PASSWORD=...");
        std::process::exit(1);
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mailbox = %format!("{}@{}:{}", mailbox_config.username, mailbox_config.host, mailbox_config.port),
        search_terms = %mailbox_config.search_terms.join(", "),
        spool = %config.spool_dir.display(),
        interval_minutes = config.job_interval.as_secs() / 60,
        "Starting invoice-sync"
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let rules = Arc::new(config.classifier_rules());
    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let resolver = Arc::new(Resolver::new(fetcher, Arc::clone(&rules)));
    let processor =
        Arc::new(InvoiceProcessor::new(rules, resolver).with_concurrency(config.concurrency));

    let spool = SpoolSink::new(&config.spool_dir);
    spool
        .ensure_dir()
        .await
        .with_context(|| format!("Cannot create spool dir {}", config.spool_dir.display()))?;
    let sink: Arc<dyn DocumentSink> = Arc::new(spool);

    let runner = Arc::new(PipelineRunner::new(
        Arc::new(ImapMailbox::new(mailbox_config)),
        processor,
        Arc::clone(&sink),
        config.job_interval,
    ));

    // ── Scheduler ────────────────────────────────────────────────────────
    runner.start_scheduler().await;

    // ── Control API ──────────────────────────────────────────────────────
    let app = control_routes(Arc::clone(&runner), sink).layer(CorsLayer::permissive());
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Control API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    runner.stop_scheduler().await;
    Ok(())
}
