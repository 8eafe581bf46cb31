//! Invoice Sync: finds invoice documents in email and resolves them to PDFs.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sink;
