//! Minimal blocking IMAP4rev1 client over rustls.
//!
//! Only the handful of commands the pipeline needs: LOGIN, SELECT,
//! UID SEARCH UNSEEN, UID FETCH BODY.PEEK[] and UID STORE +FLAGS (\Seen).
//! Fetching with `BODY.PEEK[]` leaves `\Seen` untouched so a message is only
//! flagged once its record has been stored.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::{Encryption, FetchBatch, MailFetcher, parse};
use crate::error::MailError;

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub encryption: Encryption,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Socket connect/read/write timeout.
    pub timeout: Duration,
}

/// Largest `{n}` literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

/// Socket round-trips every session spends outside the operation itself:
/// connect, greeting, LOGIN, SELECT and LOGOUT.
const SESSION_OVERHEAD_STEPS: usize = 5;

/// Byte stream an IMAP session can run over (plain TCP or TLS).
pub trait ImapStream: Read + Write + Send {}
impl<T: Read + Write + Send> ImapStream for T {}

/// One line of a server response, with any `{n}` literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// A synchronous IMAP session over any byte stream.
pub struct ImapSession<S: Read + Write> {
    stream: S,
    next_tag: u32,
    server: String,
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S, server: impl Into<String>) -> Self {
        Self {
            stream,
            next_tag: 1,
            server: server.into(),
        }
    }

    /// Consume the untagged `* OK` greeting.
    pub fn read_greeting(&mut self) -> Result<(), MailError> {
        let greeting = self.read_response_line()?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailError::Connect {
                server: self.server.clone(),
                reason: format!("unexpected greeting: {}", greeting.text.trim_end()),
            })
        }
    }

    pub fn login(&mut self, username: &str, password: &SecretString) -> Result<(), MailError> {
        let cmd = format!(
            "LOGIN {} {}",
            quote(username),
            quote(password.expose_secret())
        );
        match self.command(&cmd) {
            Ok(_) => Ok(()),
            Err(MailError::Protocol(reason)) => Err(MailError::AuthFailed {
                server: self.server.clone(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    pub fn starttls(&mut self) -> Result<(), MailError> {
        self.command("STARTTLS").map(|_| ())
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), MailError> {
        self.command(&format!("SELECT {}", quote(mailbox)))
            .map(|_| ())
    }

    /// UIDs of unseen messages, ascending.
    pub fn search_unseen(&mut self) -> Result<Vec<u32>, MailError> {
        let lines = self.command("UID SEARCH UNSEEN")?;
        let mut uids: Vec<u32> = lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    /// Raw RFC 822 bytes of one message, without setting `\Seen`.
    pub fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, MailError> {
        let lines = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        lines
            .into_iter()
            .filter(|l| l.text.starts_with('*') && l.text.contains("FETCH"))
            .find_map(|l| l.literals.into_iter().next())
            .ok_or_else(|| MailError::Protocol(format!("no message body returned for UID {uid}")))
    }

    pub fn mark_seen(&mut self, uids: &[u32]) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.command(&format!("UID STORE {set} +FLAGS.SILENT (\\Seen)"))
            .map(|_| ())
    }

    pub fn logout(&mut self) -> Result<(), MailError> {
        self.command("LOGOUT").map(|_| ())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send a tagged command and collect untagged lines until its completion.
    ///
    /// `NO`/`BAD` completions become `MailError::Protocol`.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let words = if cmd.starts_with("UID ") { 2 } else { 1 };
        let verb = cmd.split_whitespace().take(words).collect::<Vec<_>>().join(" ");
        debug!(tag = %tag, command = %verb, "IMAP command");

        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let prefix = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(status) = line.text.strip_prefix(&prefix) {
                let status = status.trim_end();
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                return Err(MailError::Protocol(format!("{verb}: {status}")));
            }
            lines.push(line);
        }
    }

    /// Read one logical response line, following `{n}` literals.
    fn read_response_line(&mut self) -> Result<ResponseLine, MailError> {
        let mut out = ResponseLine::default();
        loop {
            let raw = self.read_line()?;
            let text = String::from_utf8_lossy(&raw).into_owned();
            let literal_len = literal_length(&text);
            out.text.push_str(&text);
            match literal_len {
                Some(n) if n > MAX_LITERAL_BYTES => {
                    return Err(MailError::Protocol(format!(
                        "literal of {n} bytes exceeds {MAX_LITERAL_BYTES} byte limit"
                    )));
                }
                Some(n) => {
                    let mut literal = vec![0u8; n];
                    self.stream.read_exact(&mut literal)?;
                    out.literals.push(literal);
                }
                None => return Ok(out),
            }
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte)? {
                0 => return Err(MailError::Protocol("IMAP connection closed".into())),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
            }
        }
    }
}

/// Size of a trailing `{n}` literal marker, if the line ends with one.
fn literal_length(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote a string argument, escaping `\` and `"`.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

// ── Connection ──────────────────────────────────────────────────────

fn tls_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

fn wrap_tls(tcp: TcpStream, host: &str) -> Result<Box<dyn ImapStream>, MailError> {
    let server_name = rustls_pki_types::ServerName::try_from(host.to_string()).map_err(|e| {
        MailError::Connect {
            server: host.to_string(),
            reason: format!("invalid server name: {e}"),
        }
    })?;
    let conn = rustls::ClientConnection::new(tls_config(), server_name).map_err(|e| {
        MailError::Connect {
            server: host.to_string(),
            reason: format!("TLS setup failed: {e}"),
        }
    })?;
    Ok(Box::new(rustls::StreamOwned::new(conn, tcp)))
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, MailError> {
    let connect_err = |reason: String| MailError::Connect {
        server: format!("{host}:{port}"),
        reason,
    };
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("resolve failed: {e}")))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(timeout))?;
                tcp.set_write_timeout(Some(timeout))?;
                return Ok(tcp);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(connect_err(
        last_err.map_or_else(|| "no addresses".to_string(), |e| e.to_string()),
    ))
}

/// Open a session, log in, and select the configured mailbox.
fn open_session(config: &ImapConfig) -> Result<ImapSession<Box<dyn ImapStream>>, MailError> {
    let tcp = connect_tcp(&config.host, config.port, config.timeout)?;
    let server = config.host.clone();

    let mut session = match config.encryption {
        Encryption::Tls => {
            let mut session = ImapSession::new(wrap_tls(tcp, &config.host)?, server);
            session.read_greeting()?;
            session
        }
        Encryption::StartTls => {
            let mut plain = ImapSession::new(tcp, server.clone());
            plain.read_greeting()?;
            plain.starttls()?;
            let next_tag = plain.next_tag;
            let mut session = ImapSession::new(wrap_tls(plain.into_inner(), &config.host)?, server);
            session.next_tag = next_tag;
            session
        }
        Encryption::None => {
            let stream: Box<dyn ImapStream> = Box::new(tcp);
            let mut session = ImapSession::new(stream, server);
            session.read_greeting()?;
            session
        }
    };

    session.login(&config.username, &config.password)?;
    session.select(&config.mailbox)?;
    Ok(session)
}

/// Fetch up to `limit` unseen messages over an already-selected session.
///
/// Parse failures and per-message protocol errors are collected as failed
/// UIDs; I/O errors abort the whole fetch.
pub fn fetch_unread_with<S: Read + Write>(
    session: &mut ImapSession<S>,
    limit: usize,
) -> Result<FetchBatch, MailError> {
    let uids = session.search_unseen()?;
    debug!(unseen = uids.len(), limit, "IMAP search complete");

    let mut batch = FetchBatch::default();
    for uid in uids.into_iter().take(limit) {
        let raw = match session.fetch_raw(uid) {
            Ok(raw) => raw,
            Err(MailError::Protocol(reason)) => {
                warn!(uid, reason = %reason, "Failed to fetch message");
                batch.failed_uids.push(uid);
                continue;
            }
            Err(e) => return Err(e),
        };
        match parse::parse_message(uid, &raw) {
            Ok(email) => batch.emails.push(email),
            Err(e) => {
                warn!(uid, error = %e, "Failed to parse message");
                batch.failed_uids.push(uid);
            }
        }
    }
    Ok(batch)
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// Overall deadline for a session making `commands` round-trips.
fn session_deadline(timeout: Duration, commands: usize) -> Duration {
    let steps = SESSION_OVERHEAD_STEPS.saturating_add(commands);
    timeout.saturating_mul(u32::try_from(steps).unwrap_or(u32::MAX))
}

/// [`MailFetcher`] backed by a real IMAP server.
///
/// Each call opens its own connection on the blocking pool.
pub struct ImapFetcher {
    config: ImapConfig,
}

impl ImapFetcher {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    /// Run `op` on a fresh session with an overall deadline.
    ///
    /// `commands` is the number of round-trips `op` makes; each one, plus the
    /// session setup and teardown, gets one socket timeout.
    async fn with_session<T, F>(
        &self,
        operation: &'static str,
        commands: usize,
        op: F,
    ) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession<Box<dyn ImapStream>>) -> Result<T, MailError> + Send + 'static,
    {
        let config = self.config.clone();
        let deadline = session_deadline(self.config.timeout, commands);

        let task = tokio::task::spawn_blocking(move || {
            let mut session = open_session(&config)?;
            let result = op(&mut session);
            if let Err(e) = session.logout() {
                debug!(error = %e, "IMAP logout failed");
            }
            result
        });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(MailError::Protocol(format!(
                "{operation} task failed: {join_err}"
            ))),
            Err(_) => Err(MailError::Timeout {
                operation,
                timeout: deadline,
            }),
        }
    }
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn fetch_unread(&self, limit: usize) -> Result<FetchBatch, MailError> {
        let batch = self
            .with_session("IMAP fetch", limit.saturating_add(1), move |session| {
                fetch_unread_with(session, limit)
            })
            .await?;
        info!(
            host = %self.config.host,
            fetched = batch.emails.len(),
            failed = batch.failed_uids.len(),
            "Fetched unread mail"
        );
        Ok(batch)
    }

    async fn mark_seen(&self, uids: &[u32]) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        let uids = uids.to_vec();
        let count = uids.len();
        self.with_session("IMAP mark seen", 1, move |session| session.mark_seen(&uids))
            .await?;
        debug!(count, "Marked messages as seen");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), MailError> {
        super::probe_tcp("imap", &self.config.host, self.config.port, self.config.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Replays canned server output and records what the client wrote.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(script: impl Into<Vec<u8>>) -> Self {
            Self {
                input: Cursor::new(script.into()),
                written: Vec::new(),
            }
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn message(subject: &str) -> String {
        format!(
            "From: Alice <alice@example.com>\r\n\
             Subject: {subject}\r\n\
             Message-ID: <{subject}@example.com>\r\n\
             \r\n\
             Hello about {subject}\r\n"
        )
    }

    fn fetch_reply(tag: u32, seq: u32, uid: u32, raw: &str) -> String {
        format!(
            "* {seq} FETCH (UID {uid} BODY[] {{{}}}\r\n{raw})\r\nA{tag} OK FETCH completed\r\n",
            raw.len()
        )
    }

    #[test]
    fn literal_length_detection() {
        assert_eq!(literal_length("* 1 FETCH (BODY[] {42}\r\n"), Some(42));
        assert_eq!(literal_length("* 1 FETCH (BODY[] {7+}\r\n"), Some(7));
        assert_eq!(literal_length("* OK ready\r\n"), None);
    }

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("pa\"ss\\word"), "\"pa\\\"ss\\\\word\"");
    }

    #[test]
    fn login_select_search_fetch_flow() {
        let raw_a = message("budget");
        let raw_b = message("offsite");
        let script = format!(
            "* OK IMAP ready\r\n\
             A1 OK LOGIN completed\r\n\
             * 2 EXISTS\r\n\
             A2 OK [READ-WRITE] SELECT completed\r\n\
             * SEARCH 9 4\r\n\
             A3 OK SEARCH completed\r\n\
             {}{}",
            fetch_reply(4, 1, 4, &raw_a),
            fetch_reply(5, 2, 9, &raw_b),
        );
        let mut session = ImapSession::new(ScriptedStream::new(script), "test");
        session.read_greeting().unwrap();
        session
            .login("me@example.com", &SecretString::from("s3cret"))
            .unwrap();
        session.select("INBOX").unwrap();

        let batch = fetch_unread_with(&mut session, 10).unwrap();
        assert_eq!(batch.emails.len(), 2);
        assert!(batch.failed_uids.is_empty());
        assert_eq!(batch.emails[0].uid, 4);
        assert_eq!(batch.emails[0].subject, "budget");
        assert_eq!(batch.emails[1].uid, 9);
        assert_eq!(batch.emails[1].message_id, "offsite@example.com");

        let written = session.into_inner().written();
        assert!(written.contains("A1 LOGIN \"me@example.com\" \"s3cret\"\r\n"));
        assert!(written.contains("A3 UID SEARCH UNSEEN\r\n"));
        assert!(written.contains("A4 UID FETCH 4 BODY.PEEK[]\r\n"));
        assert!(!written.contains("STORE"));
    }

    #[test]
    fn fetch_respects_limit() {
        let raw = message("first");
        let script = format!(
            "* SEARCH 1 2 3\r\nA1 OK SEARCH completed\r\n{}",
            fetch_reply(2, 1, 1, &raw)
        );
        let mut session = ImapSession::new(ScriptedStream::new(script), "test");
        let batch = fetch_unread_with(&mut session, 1).unwrap();
        assert_eq!(batch.emails.len(), 1);
        assert_eq!(batch.emails[0].uid, 1);
    }

    #[test]
    fn failed_fetch_is_recorded_not_fatal() {
        let raw = message("ok");
        let script = format!(
            "* SEARCH 5 6\r\nA1 OK SEARCH completed\r\n\
             A2 NO [UNAVAILABLE] message gone\r\n{}",
            fetch_reply(3, 2, 6, &raw)
        );
        let mut session = ImapSession::new(ScriptedStream::new(script), "test");
        let batch = fetch_unread_with(&mut session, 10).unwrap();
        assert_eq!(batch.failed_uids, vec![5]);
        assert_eq!(batch.emails.len(), 1);
        assert_eq!(batch.emails[0].uid, 6);
    }

    #[test]
    fn rejected_login_is_auth_error() {
        let script = "* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n";
        let mut session = ImapSession::new(ScriptedStream::new(script), "imap.test");
        session.read_greeting().unwrap();
        let err = session
            .login("me", &SecretString::from("wrong"))
            .unwrap_err();
        assert!(matches!(err, MailError::AuthFailed { .. }));
    }

    #[test]
    fn mark_seen_uses_uid_store() {
        let script = "A1 OK STORE completed\r\n";
        let mut session = ImapSession::new(ScriptedStream::new(script), "test");
        session.mark_seen(&[3, 8]).unwrap();
        let written = session.into_inner().written();
        assert_eq!(written, "A1 UID STORE 3,8 +FLAGS.SILENT (\\Seen)\r\n");
    }

    #[test]
    fn closed_connection_is_protocol_error() {
        let mut session = ImapSession::new(ScriptedStream::new(""), "test");
        assert!(matches!(
            session.read_greeting(),
            Err(MailError::Protocol(_))
        ));
    }
    #[test]
    fn oversized_literal_is_rejected() {
        let script = "* 1 FETCH (UID 1 BODY[] {104857601}\r\n";
        let mut session = ImapSession::new(ScriptedStream::new(script), "test");
        let err = session.read_response_line().unwrap_err();
        assert!(matches!(err, MailError::Protocol(reason) if reason.contains("limit")));
    }

    #[test]
    fn session_deadline_scales_with_commands() {
        let timeout = Duration::from_millis(500);
        assert_eq!(session_deadline(timeout, 1), Duration::from_secs(3));
        assert_eq!(session_deadline(timeout, 51), Duration::from_secs(28));
        assert_eq!(session_deadline(timeout, usize::MAX), timeout.saturating_mul(u32::MAX));
    }

    /// Plain-TCP IMAP server that answers every `UID FETCH` after `delay`.
    fn spawn_slow_server(messages: u32, delay: Duration) -> u16 {
        use std::io::{BufRead, BufReader};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut out = stream;
            out.write_all(b"* OK IMAP ready\r\n").unwrap();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let (tag, cmd) = line.trim_end().split_once(' ').unwrap();
                let reply = if cmd.starts_with("UID SEARCH") {
                    let uids: Vec<String> = (1..=messages).map(|u| u.to_string()).collect();
                    format!("* SEARCH {}\r\n{tag} OK SEARCH completed\r\n", uids.join(" "))
                } else if let Some(rest) = cmd.strip_prefix("UID FETCH ") {
                    std::thread::sleep(delay);
                    let uid: u32 = rest.split_whitespace().next().unwrap().parse().unwrap();
                    let raw = message(&format!("m{uid}"));
                    format!(
                        "* {uid} FETCH (UID {uid} BODY[] {{{}}}\r\n{raw})\r\n{tag} OK FETCH completed\r\n",
                        raw.len()
                    )
                } else if cmd.starts_with("LOGOUT") {
                    out.write_all(format!("* BYE\r\n{tag} OK LOGOUT completed\r\n").as_bytes())
                        .unwrap();
                    break;
                } else {
                    format!("{tag} OK completed\r\n")
                };
                out.write_all(reply.as_bytes()).unwrap();
                line.clear();
            }
        });
        port
    }

    #[tokio::test]
    async fn slow_but_responsive_server_fetches_whole_batch() {
        let port = spawn_slow_server(10, Duration::from_millis(300));
        let fetcher = ImapFetcher::new(ImapConfig {
            host: "127.0.0.1".into(),
            port,
            encryption: Encryption::None,
            username: "me@example.com".into(),
            password: SecretString::from("s3cret"),
            mailbox: "INBOX".into(),
            timeout: Duration::from_millis(500),
        });

        let batch = fetcher.fetch_unread(10).await.unwrap();
        assert_eq!(batch.emails.len(), 10);
        assert!(batch.failed_uids.is_empty());
        assert_eq!(batch.emails[9].uid, 10);
    }
}
