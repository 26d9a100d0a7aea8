//! IMAP mailbox provider — raw IMAP4rev1 over rustls.
//!
//! Only a handful of commands are needed (LOGIN, SELECT, UID SEARCH,
//! UID FETCH, UID STORE, LOGOUT), so the protocol is spoken directly over a
//! blocking TLS stream. Every call runs on `spawn_blocking`; the socket read
//! timeout bounds each one.
//!
//! Bodies are fetched with `BODY.PEEK[]` so reading a message never sets
//! `\Seen`. Only [`MailboxSession::mark_processed`] sets it.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use super::{MailboxProvider, MailboxSession, MessageId, RawMessage};
use crate::config::MailboxSettings;
use crate::error::MailboxError;

/// Default socket read/write timeout.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Provider ────────────────────────────────────────────────────────

/// Connects to an IMAP server over implicit TLS (port 993).
#[derive(Debug, Clone)]
pub struct ImapProvider {
    io_timeout: Duration,
}

impl ImapProvider {
    pub fn new() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

impl Default for ImapProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxProvider for ImapProvider {
    async fn connect(
        &self,
        settings: &MailboxSettings,
    ) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let settings = settings.clone();
        let timeout = self.io_timeout;
        let host = settings.host.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let stream = open_tls(&settings.host, settings.port, timeout)?;
            let mut conn = ImapConnection::new(stream);
            conn.read_greeting()?;
            conn.login(&settings.username, settings.password.expose_secret())?;
            conn.select(&settings.folder)?;
            Ok::<_, MailboxError>(conn)
        })
        .await
        .map_err(|e| MailboxError::Connection {
            host,
            reason: format!("IMAP connect task panicked: {e}"),
        })??;

        Ok(Box::new(ImapSession::new(conn)))
    }
}

/// Try each resolved address in turn, bounded by `timeout` per attempt.
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{host} resolved to no addresses"),
        )
    }))
}

/// Open a TCP connection and wrap it in TLS, verified against webpki roots.
fn open_tls(host: &str, port: u16, timeout: Duration) -> Result<TlsStream, MailboxError> {
    let connection_error = |reason: String| MailboxError::Connection {
        host: host.to_string(),
        reason,
    };

    let tcp = connect_tcp(host, port, timeout).map_err(|e| connection_error(e.to_string()))?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| connection_error(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| connection_error(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|e| connection_error(e.to_string()))?;

    Ok(rustls::StreamOwned::new(conn, tcp))
}

// ── Session ─────────────────────────────────────────────────────────

/// An open, authenticated IMAP session with a folder selected.
///
/// The connection is moved onto a blocking thread for each call and
/// handed back afterwards. If that thread panics, or the call fails with an
/// I/O error, the connection is dropped and later calls return
/// [`MailboxError::SessionClosed`].
pub struct ImapSession<S> {
    conn: Option<ImapConnection<S>>,
}

impl<S> ImapSession<S>
where
    S: Read + Write + Send + 'static,
{
    pub fn new(conn: ImapConnection<S>) -> Self {
        Self { conn: Some(conn) }
    }

    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, MailboxError>
    where
        F: FnOnce(&mut ImapConnection<S>) -> Result<T, MailboxError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(MailboxError::SessionClosed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol {
            command: "session".into(),
            reason: format!("IMAP task panicked: {e}"),
        })?;
        // After an I/O failure the stream position is unknown; drop it.
        match result {
            Err(MailboxError::Io(_)) => {
                warn!("IMAP connection lost — session closed");
            }
            _ => self.conn = Some(conn),
        }
        result
    }
}

#[async_trait]
impl<S> MailboxSession for ImapSession<S>
where
    S: Read + Write + Send + 'static,
{
    async fn list_unread(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        self.with_conn(|conn| conn.search_unseen()).await
    }

    async fn fetch(&mut self, id: &MessageId) -> Result<RawMessage, MailboxError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let content = conn.fetch_body(id.as_str())?;
            Ok(RawMessage { id, content })
        })
        .await
    }

    async fn mark_processed(&mut self, id: &MessageId) -> Result<(), MailboxError> {
        let id = id.clone();
        self.with_conn(move |conn| conn.mark_seen(id.as_str())).await
    }

    async fn close(self: Box<Self>) -> Result<(), MailboxError> {
        let mut session = self;
        session.with_conn(|conn| conn.logout()).await
    }
}

// ── Protocol ────────────────────────────────────────────────────────

/// One untagged server response, with any `{N}` literals it carried.
#[derive(Debug, Clone)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// A command finished with something other than a tagged `OK`.
#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("{status} {detail}")]
    Rejected { status: String, detail: String },
}

impl CommandError {
    fn into_protocol(self, command: &str) -> MailboxError {
        match self {
            CommandError::Io(e) => MailboxError::Io(e),
            other => MailboxError::Protocol {
                command: command.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Blocking IMAP client state over any byte stream.
pub struct ImapConnection<S> {
    reader: BufReader<S>,
    tag_counter: u32,
}

impl<S: Read + Write> ImapConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
            tag_counter: 0,
        }
    }

    fn read_greeting(&mut self) -> Result<(), MailboxError> {
        let greeting = self
            .read_response()
            .map_err(|e| e.into_protocol("greeting"))?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol {
                command: "greeting".into(),
                reason: format!("unexpected greeting: {}", greeting.text),
            })
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        match self.command(&cmd) {
            Ok(_) => {
                debug!(username, "IMAP login accepted");
                Ok(())
            }
            Err(CommandError::Rejected { status, detail }) => Err(MailboxError::Auth {
                username: username.to_string(),
                reason: format!("{status} {detail}").trim().to_string(),
            }),
            Err(e) => Err(e.into_protocol("LOGIN")),
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        self.command(&format!("SELECT {}", quote(folder)))
            .map(|_| ())
            .map_err(|e| e.into_protocol("SELECT"))
    }

    fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        let responses = self
            .command("UID SEARCH UNSEEN")
            .map_err(|e| e.into_protocol("UID SEARCH"))?;

        Ok(responses
            .iter()
            .filter_map(|r| r.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .map(MessageId::new)
            .collect())
    }

    fn fetch_body(&mut self, uid: &str) -> Result<Vec<u8>, MailboxError> {
        let fetch_error = |reason: String| MailboxError::Fetch {
            id: uid.to_string(),
            reason,
        };

        let responses = self
            .command(&format!("UID FETCH {uid} BODY.PEEK[]"))
            .map_err(|e| match e {
                CommandError::Io(e) => MailboxError::Io(e),
                other => fetch_error(other.to_string()),
            })?;

        responses
            .into_iter()
            .filter(|r| r.text.contains("FETCH"))
            .find_map(|r| r.literals.into_iter().next())
            .ok_or_else(|| fetch_error("no message body in FETCH response".into()))
    }

    fn mark_seen(&mut self, uid: &str) -> Result<(), MailboxError> {
        self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))
            .map(|_| ())
            .map_err(|e| match e {
                CommandError::Io(e) => MailboxError::Io(e),
                other => MailboxError::Mark {
                    id: uid.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        match self.command("LOGOUT") {
            // Some servers hang up right after BYE without a tagged OK.
            Ok(_) | Err(CommandError::Closed) => Ok(()),
            Err(e) => Err(e.into_protocol("LOGOUT")),
        }
    }

    /// Send a tagged command and collect untagged responses until its
    /// tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<Untagged>, CommandError> {
        self.tag_counter += 1;
        let tag = format!("A{}", self.tag_counter);

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(rest) = response
                .text
                .strip_prefix(tag.as_str())
                .and_then(|r| r.strip_prefix(' '))
            {
                let (status, detail) = rest.split_once(' ').unwrap_or((rest, ""));
                if status.eq_ignore_ascii_case("OK") {
                    return Ok(untagged);
                }
                return Err(CommandError::Rejected {
                    status: status.to_string(),
                    detail: detail.to_string(),
                });
            }
            untagged.push(response);
        }
    }

    /// Read one logical response line, pulling in `{N}` literals inline.
    fn read_response(&mut self) -> Result<Untagged, CommandError> {
        let mut text = String::new();
        let mut literals = Vec::new();

        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                return Err(CommandError::Closed);
            }
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            text.push_str(line);

            match literal_length(line) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.reader.read_exact(&mut literal)?;
                    literals.push(literal);
                }
                None => return Ok(Untagged { text, literals }),
            }
        }
    }
}

/// Length of a trailing `{N}` literal marker, if the line ends with one.
fn literal_length(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Render an IMAP quoted string.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
