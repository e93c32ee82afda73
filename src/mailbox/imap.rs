//! Raw IMAP over TLS (rustls) for locating and fetching order messages.
//!
//! The mailbox is opened with `EXAMINE` and bodies are fetched with
//! `BODY.PEEK[]`, so searching and fetching never change message flags.
//! All network I/O is blocking and runs inside `spawn_blocking`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::{MailSource, MailboxLocator, MessageHandle, SearchCriteria};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// IMAP-backed mailbox.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxLocator for ImapMailbox {
    async fn locate(&self, criteria: &SearchCriteria) -> Result<Vec<MessageHandle>, MailboxError> {
        let config = self.config.clone();
        let command = search_command(criteria, Utc::now().date_naive());
        let handles = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&config)?;
            let lines = session.command(&command)?;
            session.logout();
            Ok::<_, MailboxError>(parse_search_response(&lines))
        })
        .await
        .map_err(|e| MailboxError::Search(format!("search task panicked: {e}")))??;

        info!(count = handles.len(), folder = %self.config.folder, "Located order messages");
        Ok(handles)
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_raw(&self, handle: &MessageHandle) -> Result<Vec<u8>, MailboxError> {
        check_uid(handle)?;
        let config = self.config.clone();
        let uid = handle.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&config)?;
            let raw = session.fetch_body(&uid)?;
            session.logout();
            Ok(raw)
        })
        .await
        .map_err(|e| MailboxError::Fetch {
            handle: handle.to_string(),
            reason: format!("fetch task panicked: {e}"),
        })?
    }
}

// ── Search command ──────────────────────────────────────────────────

/// Quote a string for an IMAP command.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Build the `UID SEARCH` command for the criteria. The upper bound is
/// inclusive, so `BEFORE` gets the following day.
pub fn search_command(criteria: &SearchCriteria, today: NaiveDate) -> String {
    let mut parts = vec!["UID SEARCH".to_string()];
    if !criteria.sender.is_empty() {
        parts.push(format!("FROM {}", quote(&criteria.sender)));
    }
    if !criteria.subject_filter.is_empty() {
        parts.push(format!("SUBJECT {}", quote(&criteria.subject_filter)));
    }
    parts.push(format!("SINCE {}", imap_date(criteria.effective_from(today))));
    if let Some(to) = criteria.date_to
        && let Some(next) = to.checked_add_days(Days::new(1))
    {
        parts.push(format!("BEFORE {}", imap_date(next)));
    }
    parts.join(" ")
}

/// Collect UIDs from `* SEARCH` lines, preserving server order.
pub fn parse_search_response(lines: &[String]) -> Vec<MessageHandle> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter(|uid| uid.chars().all(|c| c.is_ascii_digit()))
        .map(MessageHandle::new)
        .collect()
}

/// Handles reach the session from stored candidates; only UIDs are sent.
fn check_uid(handle: &MessageHandle) -> Result<&str, MailboxError> {
    let uid = handle.as_str();
    if uid.is_empty() || !uid.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MailboxError::Fetch {
            handle: uid.escape_debug().to_string(),
            reason: "invalid message handle".into(),
        });
    }
    Ok(uid)
}

/// Build the `UID FETCH` command for a full message without setting `\Seen`.
pub fn fetch_command(tag: &str, handle: &MessageHandle) -> Result<String, MailboxError> {
    let uid = check_uid(handle)?;
    Ok(format!("{tag} UID FETCH {uid} BODY.PEEK[]\r\n"))
}

/// Parse a `{n}` literal marker at the end of a response line.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let open = trimmed.rfind('{')?;
    trimmed
        .strip_suffix('}')
        .and_then(|s| s.get(open + 1..))
        .and_then(|n| n.parse().ok())
}

// ── Session ─────────────────────────────────────────────────────────

struct ImapSession {
    stream: TlsStream,
    tag: u32,
}

impl ImapSession {
    fn open(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let connect_err = |reason: String| MailboxError::Connect {
            host: config.imap_host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.imap_host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };

        let _greeting = session.read_line()?;

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        let resp = session.command(&login).map_err(|_| MailboxError::Auth {
            user: config.username.clone(),
        })?;
        debug!(lines = resp.len(), "IMAP login complete");

        session.command(&format!("EXAMINE {}", quote(&config.folder)))?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte)? {
                0 => return Err(MailboxError::Protocol("IMAP connection closed".into())),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
            }
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{}", self.tag)
    }

    /// Send a command and collect untagged lines until the tagged completion.
    /// Literal payloads are appended to the returned list as their own entry.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailboxError> {
        let tag = self.next_tag();
        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                return Err(MailboxError::Protocol(format!(
                    "{} failed: {}",
                    cmd.split_whitespace().next().unwrap_or("command"),
                    status.trim()
                )));
            }
            let literal = literal_len(&line);
            lines.push(line);
            if let Some(len) = literal {
                let mut payload = vec![0u8; len];
                self.stream.read_exact(&mut payload)?;
                lines.push(String::from_utf8_lossy(&payload).to_string());
            }
        }
    }

    fn fetch_body(&mut self, uid: &MessageHandle) -> Result<Vec<u8>, MailboxError> {
        let tag = self.next_tag();
        let cmd = fetch_command(&tag, uid)?;
        self.stream.write_all(cmd.as_bytes())?;
        self.stream.flush()?;

        let mut body: Option<Vec<u8>> = None;
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if !status.starts_with("OK") {
                    return Err(MailboxError::Fetch {
                        handle: uid.to_string(),
                        reason: status.trim().to_string(),
                    });
                }
                break;
            }
            if let Some(len) = literal_len(&line) {
                let mut payload = vec![0u8; len];
                self.stream.read_exact(&mut payload)?;
                body.get_or_insert(payload);
            }
        }

        body.ok_or_else(|| MailboxError::Fetch {
            handle: uid.to_string(),
            reason: "no message body in FETCH response".into(),
        })
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}
