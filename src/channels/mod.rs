//! Mail sources for the pipeline.

pub mod email;

pub use email::{ImapMailbox, Mailbox, MailboxConfig};
