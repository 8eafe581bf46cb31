//! Mailbox collaborator: raw IMAP over rustls.
//!
//! Every call opens its own session (LOGIN → SELECT INBOX → work → LOGOUT).
//! The protocol code is blocking and runs on `spawn_blocking`.
//!
//! Messages are addressed by UID, which survives across sessions; sequence
//! numbers do not. Search runs once per subject term
//! (`UID SEARCH <criteria> SUBJECT "<term>"`) and the UID sets are unioned;
//! messages are then pulled with `UID FETCH <uid> RFC822`, reading the
//! literal byte-exact. Flags are only stored while the mailbox's
//! UIDVALIDITY still matches the one seen at fetch time.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::MailboxError;
use crate::pipeline::types::RawMail;

/// Subject terms searched when `EMAIL_SEARCH_TERMS` is unset.
pub const DEFAULT_SEARCH_TERMS: &[&str] = &[
    "factura",
    "facturacion",
    "factura electronica",
    "comprobante",
    "documento electrónico",
    "documento electronico",
];

// ── Configuration ───────────────────────────────────────────────────

/// IMAP mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Base criteria prepended to every search, e.g. `UNSEEN`.
    pub search_criteria: String,
    /// Subject terms; a message matching any of them is fetched.
    pub search_terms: Vec<String>,
    pub timeout: Duration,
}

impl MailboxConfig {
    /// Returns `None` if `EMAIL_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_HOST").ok()?;

        let port: u16 = std::env::var("EMAIL_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());

        let search_criteria =
            std::env::var("EMAIL_SEARCH_CRITERIA").unwrap_or_else(|_| "UNSEEN".to_string());

        let search_terms = std::env::var("EMAIL_SEARCH_TERMS")
            .map(|raw| parse_term_list(&raw))
            .unwrap_or_else(|_| DEFAULT_SEARCH_TERMS.iter().map(|t| t.to_string()).collect());

        Some(Self {
            host,
            port,
            username,
            password,
            search_criteria,
            search_terms,
            timeout: Duration::from_secs(30),
        })
    }
}

/// Accepts a JSON array (`["a","b"]`) or a comma-separated list.
pub fn parse_term_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[')
        && let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed)
    {
        return list
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }
    trimmed
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

// ── Mailbox trait ───────────────────────────────────────────────────

/// Source of raw messages for the pipeline.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// All messages matching the configured filter, in mailbox order.
    async fn fetch_matching(&self) -> Result<Vec<RawMail>, MailboxError>;

    /// Flag messages as handled so the next search skips them.
    async fn mark_processed(&self, mailbox_ids: &[String]) -> Result<(), MailboxError>;
}

/// IMAP implementation of [`Mailbox`].
pub struct ImapMailbox {
    config: Arc<MailboxConfig>,
    /// UIDVALIDITY reported by the last `fetch_matching` session.
    uid_validity: Mutex<Option<u32>>,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config: Arc::new(config),
            uid_validity: Mutex::new(None),
        }
    }

    fn remembered_validity(&self) -> Option<u32> {
        self.uid_validity.lock().ok().and_then(|v| *v)
    }

    fn remember_validity(&self, validity: Option<u32>) {
        if let Ok(mut slot) = self.uid_validity.lock() {
            *slot = validity;
        }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_matching(&self) -> Result<Vec<RawMail>, MailboxError> {
        let config = Arc::clone(&self.config);
        let (mails, validity) = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            let uids = session.search_union(&config.search_criteria, &config.search_terms)?;
            info!(count = uids.len(), "IMAP search matched messages");

            let mut mails = Vec::with_capacity(uids.len());
            for uid in uids {
                match session.fetch_rfc822(&uid) {
                    Ok(raw) => mails.push(RawMail::new(uid, raw)),
                    Err(e) => warn!(uid = %uid, error = %e, "Failed to fetch message, skipping"),
                }
            }
            let validity = session.uid_validity();
            session.logout();
            Ok::<_, MailboxError>((mails, validity))
        })
        .await
        .map_err(|e| MailboxError::Io(std::io::Error::other(e.to_string())))??;

        self.remember_validity(validity);
        Ok(mails)
    }

    async fn mark_processed(&self, mailbox_ids: &[String]) -> Result<(), MailboxError> {
        if mailbox_ids.is_empty() {
            return Ok(());
        }
        let config = Arc::clone(&self.config);
        let uids = mailbox_ids.to_vec();
        let expected = self.remembered_validity();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            if let Err(e) = session.ensure_uid_validity(expected) {
                session.logout();
                return Err(e);
            }
            for uid in &uids {
                session.mark_seen(uid)?;
            }
            session.logout();
            debug!(count = uids.len(), "Marked messages as seen");
            Ok::<_, MailboxError>(())
        })
        .await
        .map_err(|e| MailboxError::Io(std::io::Error::other(e.to_string())))?
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One logged-in IMAP conversation over any byte stream.
pub struct ImapSession<S: Read + Write> {
    stream: S,
    tag_counter: u32,
    uid_validity: Option<u32>,
}

impl ImapSession<TlsStream> {
    /// TCP + TLS + LOGIN + SELECT INBOX.
    pub fn connect(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
            MailboxError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: e.to_string(),
            }
        })?;
        tcp.set_read_timeout(Some(config.timeout))?;
        tcp.set_write_timeout(Some(config.timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;

        let mut session = ImapSession::new(rustls::StreamOwned::new(conn, tcp));
        session.greeting()?;
        session.login(&config.username, &config.password)?;
        session.select("INBOX")?;
        Ok(session)
    }
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            tag_counter: 0,
            uid_validity: None,
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{}", self.tag_counter)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte)? {
                0 => return Err(MailboxError::Closed),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, MailboxError> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = self.read_line()?;
        if line.starts_with(b"* OK") || line.starts_with(b"* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Command {
                command: "greeting".into(),
                reason: String::from_utf8_lossy(&line).trim().to_string(),
            })
        }
    }

    /// Send a command and collect the response. Literals (`{n}`) are read
    /// byte-exact and returned alongside the untagged lines.
    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = self.next_tag();
        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if line.starts_with(tag.as_bytes()) && line.get(tag.len()) == Some(&b' ') {
                let status = String::from_utf8_lossy(&line[tag.len() + 1..]).trim().to_string();
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(MailboxError::Command {
                    command: command_name(cmd),
                    reason: status,
                });
            }
            if let Some(len) = literal_len(&line) {
                response.literals.push(self.read_exact(len)?);
            }
            response
                .lines
                .push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
    }

    fn login(&mut self, username: &str, password: &SecretString) -> Result<(), MailboxError> {
        let cmd = format!(
            "LOGIN {} {}",
            quote(username),
            quote(password.expose_secret())
        );
        self.command(&cmd).map(|_| ()).map_err(|e| match e {
            MailboxError::Command { .. } => MailboxError::AuthFailed {
                username: username.to_string(),
            },
            other => other,
        })
    }

    fn select(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        let response = self.command(&format!("SELECT {}", quote(mailbox)))?;
        self.uid_validity = parse_uid_validity(&response.lines);
        Ok(())
    }

    /// UIDVALIDITY of the selected mailbox, if the server reported one.
    pub fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    /// UIDs from an earlier session are only meaningful while UIDVALIDITY
    /// is unchanged.
    pub fn ensure_uid_validity(&self, expected: Option<u32>) -> Result<(), MailboxError> {
        match (expected, self.uid_validity) {
            (Some(expected), Some(current)) if expected != current => {
                Err(MailboxError::Command {
                    command: "SELECT".into(),
                    reason: format!("UIDVALIDITY changed from {expected} to {current}"),
                })
            }
            _ => Ok(()),
        }
    }

    /// Union of UIDs matching any term, ascending. No terms means the base
    /// criteria alone.
    pub fn search_union(
        &mut self,
        criteria: &str,
        terms: &[String],
    ) -> Result<Vec<String>, MailboxError> {
        let mut ids = BTreeSet::new();
        for query in search_queries(criteria, terms) {
            debug!(query = %query, "IMAP search");
            let response = self.command(&query)?;
            ids.extend(parse_search_ids(&response.lines));
        }
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    pub fn fetch_rfc822(&mut self, uid: &str) -> Result<Vec<u8>, MailboxError> {
        let mut response = self.command(&format!("UID FETCH {uid} RFC822"))?;
        if response.literals.is_empty() {
            return Err(MailboxError::Command {
                command: "UID FETCH".into(),
                reason: format!("no message body returned for UID {uid}"),
            });
        }
        Ok(response.literals.swap_remove(0))
    }

    pub fn mark_seen(&mut self, uid: &str) -> Result<(), MailboxError> {
        self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)")).map(|_| ())
    }

    /// Best effort; the server closes the connection either way.
    pub fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// `{123}\r\n` at the end of a line announces a literal of that many bytes.
fn literal_len(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?.trim_end();
    let open = line.rfind('{')?;
    let inner = line.strip_suffix('}')?.get(open + 1..)?;
    inner.parse().ok()
}

/// `UID FETCH` for UID commands, the bare verb otherwise.
fn command_name(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match (words.next(), words.next()) {
        (Some("UID"), Some(verb)) => format!("UID {verb}"),
        (Some(verb), _) => verb.to_string(),
        _ => cmd.to_string(),
    }
}

/// `* OK [UIDVALIDITY 3857529045] UIDs valid`
fn parse_uid_validity(lines: &[String]) -> Option<u32> {
    lines.iter().find_map(|line| {
        let rest = line.split("[UIDVALIDITY ").nth(1)?;
        rest.split(']').next()?.trim().parse().ok()
    })
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// One UID SEARCH command per term. Non-ASCII terms declare UTF-8.
fn search_queries(criteria: &str, terms: &[String]) -> Vec<String> {
    let criteria = criteria.trim();
    let base = if criteria.is_empty() { "ALL" } else { criteria };
    if terms.is_empty() {
        return vec![format!("UID SEARCH {base}")];
    }
    terms
        .iter()
        .map(|term| {
            let charset = if term.is_ascii() { "" } else { "CHARSET UTF-8 " };
            format!("UID SEARCH {charset}{base} SUBJECT {}", quote(term))
        })
        .collect()
}

fn parse_search_ids(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|id| id.parse().ok()))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────
