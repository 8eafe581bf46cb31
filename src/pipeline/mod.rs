//! Invoice document discovery and resolution pipeline.
//!
//! Every message flows through:
//! 1. `extractor::extract()`: MIME walk, attachments and links (no network)
//! 2. `ClassifierRules::classify()`: offline triage of each link
//! 3. `Resolver::resolve()`: fetch, page-search, validate
//! 4. `InvoiceProcessor`: dedup and per-reference diagnostics
//!
//! `runner::PipelineRunner` wraps the coordinator for scheduled runs.

pub mod classifier;
pub mod content;
pub mod extractor;
pub mod fetch;
pub mod processor;
pub mod resolver;
pub mod runner;
pub mod types;
