//! IMAP session construction and the session capability set.
//!
//! TLS mode is derived from the configured port: 993 is implicit TLS,
//! 587 upgrades via STARTTLS, anything else stays plaintext. The session
//! is generic over the stream, so the two encrypted/plain shapes are
//! collapsed behind one enum.

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_native_tls::TlsStream;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::types::{IngestError, Mailbox, TlsMode};

pub type TlsSession = Session<TlsStream<TcpStream>>;
pub type PlainSession = Session<TcpStream>;

/// Fields requested for the message range fetch: envelope + UID + raw source.
const FETCH_QUERY: &str = "(UID ENVELOPE INTERNALDATE BODY.PEEK[])";

/// References is not part of the IMAP ENVELOPE, so it needs a header fetch.
const REFERENCES_QUERY: &str = "(UID BODY.PEEK[HEADER.FIELDS (References)])";

pub enum ImapSession {
    Tls(TlsSession),
    Plain(PlainSession),
}

/// A live IMAP connection bound to one mailbox.
///
/// The session slot is `Option` because IDLE consumes the session and hands
/// it back when the round ends; a `None` slot after a failed round marks the
/// connection dead.
pub struct ImapConnection {
    session: Option<ImapSession>,
    pub host: String,
    pub supports_idle: bool,
}

impl ImapConnection {
    pub fn is_alive(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn take_session(&mut self) -> Result<ImapSession, IngestError> {
        self.session
            .take()
            .ok_or_else(|| IngestError::NoSession(self.host.clone()))
    }

    pub(crate) fn restore_session(&mut self, session: ImapSession) {
        self.session = Some(session);
    }

    fn session_mut(&mut self) -> Result<&mut ImapSession, IngestError> {
        self.session
            .as_mut()
            .ok_or_else(|| IngestError::NoSession(self.host.clone()))
    }

    /// Fast liveness probe.
    pub async fn noop(&mut self) -> Result<(), IngestError> {
        match self.session_mut()? {
            ImapSession::Tls(s) => s.noop().await?,
            ImapSession::Plain(s) => s.noop().await?,
        }
        Ok(())
    }

    /// Open INBOX read-only and return the current EXISTS count.
    pub async fn examine_inbox(&mut self) -> Result<u32, IngestError> {
        let mailbox = match self.session_mut()? {
            ImapSession::Tls(s) => s.examine("INBOX").await,
            ImapSession::Plain(s) => s.examine("INBOX").await,
        }
        .map_err(|e| IngestError::Imap(format!("EXAMINE failed: {}", e)))?;
        Ok(mailbox.exists)
    }

    /// Fetch a contiguous sequence range with envelope + UID + raw source.
    pub async fn fetch_range(&mut self, start: u32, end: u32) -> Result<Vec<Fetch>, IngestError> {
        let set = format!("{}:{}", start, end);
        debug!(range = %set, "fetching message range");
        let fetches: Vec<Fetch> = match self.session_mut()? {
            ImapSession::Tls(s) => {
                s.fetch(&set, FETCH_QUERY)
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH failed: {}", e)))?
                    .try_collect()
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH collect failed: {}", e)))?
            }
            ImapSession::Plain(s) => {
                s.fetch(&set, FETCH_QUERY)
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH failed: {}", e)))?
                    .try_collect()
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH collect failed: {}", e)))?
            }
        };
        Ok(fetches)
    }

    /// Fetch just the References header for a sequence range.
    pub async fn fetch_reference_headers(
        &mut self,
        start: u32,
        end: u32,
    ) -> Result<Vec<Fetch>, IngestError> {
        let set = format!("{}:{}", start, end);
        let fetches: Vec<Fetch> = match self.session_mut()? {
            ImapSession::Tls(s) => {
                s.fetch(&set, REFERENCES_QUERY)
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH refs failed: {}", e)))?
                    .try_collect()
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH refs collect failed: {}", e)))?
            }
            ImapSession::Plain(s) => {
                s.fetch(&set, REFERENCES_QUERY)
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH refs failed: {}", e)))?
                    .try_collect()
                    .await
                    .map_err(|e| IngestError::Imap(format!("FETCH refs collect failed: {}", e)))?
            }
        };
        Ok(fetches)
    }

    async fn probe_idle_capability(&mut self) -> Result<bool, IngestError> {
        let caps = match self.session_mut()? {
            ImapSession::Tls(s) => s.capabilities().await?,
            ImapSession::Plain(s) => s.capabilities().await?,
        };
        Ok(caps.has_str("IDLE"))
    }

    /// Polite close. Errors are ignored; the connection is going away.
    pub async fn logout(mut self) {
        if let Some(session) = self.session.take() {
            match session {
                ImapSession::Tls(mut s) => {
                    let _ = s.logout().await;
                }
                ImapSession::Plain(mut s) => {
                    let _ = s.logout().await;
                }
            }
        }
    }
}

#[cfg(test)]
impl ImapConnection {
    /// Session-less connection for pool bookkeeping tests.
    pub(crate) fn stub(host: &str) -> Self {
        Self {
            session: None,
            host: host.to_string(),
            supports_idle: false,
        }
    }
}

/// Connect, upgrade TLS as the port dictates, authenticate, and probe
/// capabilities. One attempt; the pool owns retries.
pub async fn connect(mailbox: &Mailbox) -> Result<ImapConnection, IngestError> {
    let host = mailbox.imap_host.clone();
    let port = mailbox.imap_port;
    info!(host = %host, port = port, mailbox_id = %mailbox.id, "connecting to IMAP server");

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| IngestError::Network(format!("TCP connection failed: {}", e)))?;

    let session = match mailbox.tls_mode() {
        TlsMode::Implicit => {
            let tls = async_native_tls::TlsConnector::new();
            let stream = tls
                .connect(host.as_str(), tcp)
                .await
                .map_err(|e| IngestError::Network(format!("TLS handshake failed: {}", e)))?;
            let mut client = Client::new(stream);
            read_greeting(&mut client).await?;
            ImapSession::Tls(login(client, mailbox).await?)
        }
        TlsMode::StartTls => {
            let mut client = Client::new(tcp);
            read_greeting(&mut client).await?;
            client
                .run_command_and_check_ok("STARTTLS", None)
                .await
                .map_err(|e| IngestError::Imap(format!("STARTTLS rejected: {}", e)))?;
            let plain = client.into_inner();
            let tls = async_native_tls::TlsConnector::new();
            let stream = tls
                .connect(host.as_str(), plain)
                .await
                .map_err(|e| IngestError::Network(format!("TLS upgrade failed: {}", e)))?;
            // Greeting was consumed before the upgrade; log in directly.
            ImapSession::Tls(login(Client::new(stream), mailbox).await?)
        }
        TlsMode::Plain => {
            let mut client = Client::new(tcp);
            read_greeting(&mut client).await?;
            ImapSession::Plain(login(client, mailbox).await?)
        }
    };

    let mut conn = ImapConnection {
        session: Some(session),
        host,
        supports_idle: false,
    };
    conn.supports_idle = conn.probe_idle_capability().await.unwrap_or(false);

    Ok(conn)
}

async fn read_greeting<S>(client: &mut Client<S>) -> Result<(), IngestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    client
        .read_response()
        .await
        .ok_or_else(|| IngestError::Imap("server sent no greeting".into()))??;
    Ok(())
}

async fn login<S>(client: Client<S>, mailbox: &Mailbox) -> Result<Session<S>, IngestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    client
        .login(&mailbox.username, &mailbox.password)
        .await
        .map_err(|(e, _)| match e {
            async_imap::error::Error::No(msg) => IngestError::Auth(msg.to_string()),
            async_imap::error::Error::Bad(msg) => IngestError::Auth(msg.to_string()),
            other => IngestError::Imap(format!("LOGIN failed: {}", other)),
        })
}
